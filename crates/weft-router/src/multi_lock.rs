//! Deadlock-free acquisition of several router mutexes at once.
//!
//! Operations that span routers (local peers, bridges, bypass) need two to
//! four mutexes held together. Acquisition is ordered by mutex address, so
//! any two such operations contend in the same order regardless of which
//! router they started from.

use parking_lot::{Mutex, MutexGuard};

fn address<T>(mutex: &Mutex<T>) -> usize {
    mutex as *const Mutex<T> as usize
}

/// Lock two mutexes in address order; guards are returned in argument order.
pub fn lock_two<'a, T>(
    first: &'a Mutex<T>,
    second: &'a Mutex<T>,
) -> (MutexGuard<'a, T>, MutexGuard<'a, T>) {
    debug_assert_ne!(address(first), address(second));
    if address(first) < address(second) {
        let a = first.lock();
        let b = second.lock();
        (a, b)
    } else {
        let b = second.lock();
        let a = first.lock();
        (a, b)
    }
}

/// Lock three mutexes in address order; guards in argument order.
pub fn lock_three<'a, T>(
    first: &'a Mutex<T>,
    second: &'a Mutex<T>,
    third: &'a Mutex<T>,
) -> (MutexGuard<'a, T>, MutexGuard<'a, T>, MutexGuard<'a, T>) {
    let mut guards = lock_in_address_order([first, second, third]);
    let c = take_guard(&mut guards, 2);
    let b = take_guard(&mut guards, 1);
    let a = take_guard(&mut guards, 0);
    (a, b, c)
}

/// Lock four mutexes in address order; guards in argument order.
pub fn lock_four<'a, T>(
    first: &'a Mutex<T>,
    second: &'a Mutex<T>,
    third: &'a Mutex<T>,
    fourth: &'a Mutex<T>,
) -> (
    MutexGuard<'a, T>,
    MutexGuard<'a, T>,
    MutexGuard<'a, T>,
    MutexGuard<'a, T>,
) {
    let mut guards = lock_in_address_order([first, second, third, fourth]);
    let d = take_guard(&mut guards, 3);
    let c = take_guard(&mut guards, 2);
    let b = take_guard(&mut guards, 1);
    let a = take_guard(&mut guards, 0);
    (a, b, c, d)
}

fn lock_in_address_order<'a, T, const N: usize>(
    mutexes: [&'a Mutex<T>; N],
) -> [Option<MutexGuard<'a, T>>; N] {
    let mut order: [usize; N] = std::array::from_fn(|i| i);
    order.sort_unstable_by_key(|&i| address(mutexes[i]));
    for pair in order.windows(2) {
        debug_assert_ne!(address(mutexes[pair[0]]), address(mutexes[pair[1]]));
    }

    let mut guards: [Option<MutexGuard<'a, T>>; N] = std::array::from_fn(|_| None);
    for &i in &order {
        guards[i] = Some(mutexes[i].lock());
    }
    guards
}

fn take_guard<'a, T, const N: usize>(
    guards: &mut [Option<MutexGuard<'a, T>>; N],
    index: usize,
) -> MutexGuard<'a, T> {
    match guards[index].take() {
        Some(guard) => guard,
        // Every slot is filled by lock_in_address_order.
        None => unreachable!("multi-lock guard already taken"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guards_come_back_in_argument_order() {
        let x = Mutex::new(1);
        let y = Mutex::new(2);
        let (gx, gy) = lock_two(&x, &y);
        assert_eq!((*gx, *gy), (1, 2));
        drop((gx, gy));
        let (gy, gx) = lock_two(&y, &x);
        assert_eq!((*gy, *gx), (2, 1));
    }

    #[test]
    fn three_and_four_way_ordering() {
        let m: Vec<Mutex<usize>> = (0..4).map(Mutex::new).collect();
        let (a, b, c) = lock_three(&m[2], &m[0], &m[1]);
        assert_eq!((*a, *b, *c), (2, 0, 1));
        drop((a, b, c));
        let (a, b, c, d) = lock_four(&m[3], &m[1], &m[0], &m[2]);
        assert_eq!((*a, *b, *c, *d), (3, 1, 0, 2));
    }

    /// Two threads repeatedly taking the same pair from opposite directions
    /// must never deadlock.
    #[test]
    fn opposite_direction_acquisition_does_not_deadlock() {
        let x = Arc::new(Mutex::new(0u64));
        let y = Arc::new(Mutex::new(0u64));

        let mut handles = Vec::new();
        for flip in [false, true] {
            let x = x.clone();
            let y = y.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let (mut a, mut b) = if flip {
                        lock_two(&y, &x)
                    } else {
                        lock_two(&x, &y)
                    };
                    *a += 1;
                    *b += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().expect("locking thread panicked");
        }
        assert_eq!(*x.lock() + *y.lock(), 4000);
    }
}
