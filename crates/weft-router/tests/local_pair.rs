//! End-to-end behavior of router pairs connected by local central links.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use weft_core::ApiError;
use weft_router::trap::{TRAP_BELOW_MAX_REMOTE_PARCELS, TRAP_PEER_CLOSED, TRAP_REMOVED};
use weft_router::{Parcel, Router, TrapConditions, TrapHandler};

fn parcel(data: &'static [u8]) -> Parcel {
    Parcel::new(Bytes::from_static(data))
}

fn get_all(router: &Arc<Router>) -> (Bytes, usize) {
    let (data, objects) = router
        .get_next_inbound_parcel(usize::MAX, usize::MAX, false)
        .expect("parcel should be available");
    (data, objects.len())
}

#[test]
fn basic_pair_delivery() {
    let (p, q) = Router::new_pair();
    p.send_outbound_parcel(parcel(b"hello")).expect("send");

    let status = q.query_status();
    assert_eq!(status.num_local_parcels, 1);
    assert_eq!(status.num_local_bytes, 5);

    let (data, num_objects) = get_all(&q);
    assert_eq!(data.as_ref(), b"hello");
    assert_eq!(num_objects, 0);
    assert_eq!(q.query_status().num_local_parcels, 0);
}

#[test]
fn close_before_drain_delivers_then_reports_dead() {
    let (p, q) = Router::new_pair();
    p.send_outbound_parcel(parcel(b"a")).expect("send a");
    p.send_outbound_parcel(parcel(b"b")).expect("send b");
    p.close_route();

    assert!(q.is_peer_closed());
    assert!(!q.is_route_dead());

    assert_eq!(get_all(&q).0.as_ref(), b"a");
    assert_eq!(get_all(&q).0.as_ref(), b"b");
    assert_eq!(
        q.get_next_inbound_parcel(usize::MAX, usize::MAX, false)
            .unwrap_err(),
        ApiError::NotFound
    );
    assert!(q.is_route_dead());
}

#[test]
fn send_after_peer_close_fails_not_found() {
    let (p, q) = Router::new_pair();
    q.close_route();
    assert_eq!(
        p.send_outbound_parcel(parcel(b"late")).unwrap_err(),
        ApiError::NotFound
    );
}

#[test]
fn send_after_own_close_fails_not_found() {
    let (p, _q) = Router::new_pair();
    p.close_route();
    assert_eq!(
        p.send_outbound_parcel(parcel(b"x")).unwrap_err(),
        ApiError::NotFound
    );
}

#[test]
fn receive_before_get_returns_unavailable() {
    let (_p, q) = Router::new_pair();
    assert_eq!(
        q.get_next_inbound_parcel(usize::MAX, usize::MAX, false)
            .unwrap_err(),
        ApiError::Unavailable
    );
}

#[test]
fn parcels_arrive_in_send_order() {
    let (p, q) = Router::new_pair();
    for i in 0..32u8 {
        p.send_outbound_parcel(Parcel::new(Bytes::from(vec![i])))
            .expect("send");
    }
    for i in 0..32u8 {
        let (data, _) = get_all(&q);
        assert_eq!(data.as_ref(), &[i]);
    }
}

#[test]
fn send_without_link_is_retained_until_linked() {
    use weft_core::LinkType;
    use weft_router::link::InitialStability;
    use weft_router::LocalRouterLink;

    // A singleton router queues outbound parcels until it is wired up.
    let a = Router::new();
    let b = Router::new();
    a.send_outbound_parcel(parcel(b"early")).expect("send");

    let (link_a, link_b) = LocalRouterLink::create_pair(
        LinkType::Central,
        (a.clone(), b.clone()),
        InitialStability::Stable,
    );
    a.set_outward_link(link_a);
    b.set_outward_link(link_b);

    assert_eq!(get_all(&b).0.as_ref(), b"early");
}

#[test]
fn undersized_buffer_fails_resource_exhausted() {
    let (p, q) = Router::new_pair();
    p.send_outbound_parcel(parcel(b"abcdef")).expect("send");
    assert_eq!(
        q.get_next_inbound_parcel(3, usize::MAX, false).unwrap_err(),
        ApiError::ResourceExhausted
    );
    // The parcel is untouched and a partial get drains it in pieces.
    let (data, _) = q
        .get_next_inbound_parcel(3, usize::MAX, true)
        .expect("partial get");
    assert_eq!(data.as_ref(), b"abc");
    let (data, _) = q
        .get_next_inbound_parcel(usize::MAX, usize::MAX, false)
        .expect("rest of parcel");
    assert_eq!(data.as_ref(), b"def");
}

#[test]
fn two_phase_get_commits_what_was_consumed() {
    let (p, q) = Router::new_pair();
    p.send_outbound_parcel(parcel(b"abcd")).expect("send");

    let (view, num_objects) = q.begin_get_next_inbound_parcel().expect("begin");
    assert_eq!(view.as_ref(), b"abcd");
    assert_eq!(num_objects, 0);

    assert_eq!(
        q.commit_get_next_inbound_parcel(9, 0).unwrap_err(),
        ApiError::OutOfRange
    );
    q.commit_get_next_inbound_parcel(4, 0).expect("commit");
    assert_eq!(
        q.begin_get_next_inbound_parcel().unwrap_err(),
        ApiError::Unavailable
    );
}

#[test]
fn trap_fires_once_on_peer_close() {
    let (p, q) = Router::new_pair();
    let fired = Arc::new(AtomicU32::new(0));
    let seen_flags = Arc::new(AtomicU32::new(0));
    let handler: TrapHandler = {
        let fired = fired.clone();
        let seen_flags = seen_flags.clone();
        Arc::new(move |event| {
            fired.fetch_add(1, Ordering::SeqCst);
            seen_flags.store(event.condition_flags, Ordering::SeqCst);
        })
    };
    q.trap(
        TrapConditions {
            flags: TRAP_PEER_CLOSED,
            ..Default::default()
        },
        handler,
        11,
    )
    .expect("trap installs");

    p.close_route();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(seen_flags.load(Ordering::SeqCst) & TRAP_PEER_CLOSED, TRAP_PEER_CLOSED);

    // Nothing further fires, even as the route dies completely.
    q.close_route();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn trap_rejected_when_condition_already_met() {
    let (p, q) = Router::new_pair();
    p.close_route();

    let handler: TrapHandler = Arc::new(|_event| {});
    let rejection = q
        .trap(
            TrapConditions {
                flags: TRAP_PEER_CLOSED,
                ..Default::default()
            },
            handler,
            0,
        )
        .unwrap_err();
    assert_eq!(rejection.error, ApiError::FailedPrecondition);
    assert_eq!(rejection.satisfied_flags & TRAP_PEER_CLOSED, TRAP_PEER_CLOSED);
    assert!(rejection.status.is_peer_closed());
}

#[test]
fn remote_queue_trap_fires_when_peer_consumes() {
    let (p, q) = Router::new_pair();
    p.send_outbound_parcel(parcel(b"a")).expect("send a");
    p.send_outbound_parcel(parcel(b"b")).expect("send b");

    // Watch for the peer's queue to drop below two parcels.
    let fired = Arc::new(AtomicU32::new(0));
    let handler: TrapHandler = {
        let fired = fired.clone();
        Arc::new(move |event| {
            assert_ne!(event.condition_flags & TRAP_BELOW_MAX_REMOTE_PARCELS, 0);
            assert_eq!(event.status.num_remote_parcels, 1);
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    p.trap(
        TrapConditions {
            flags: TRAP_BELOW_MAX_REMOTE_PARCELS,
            max_remote_parcels: 2,
            ..Default::default()
        },
        handler,
        0,
    )
    .expect("trap installs");

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    let _ = get_all(&q);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn close_route_removes_pending_traps() {
    let (_p, q) = Router::new_pair();
    let seen_flags = Arc::new(AtomicU32::new(0));
    let handler: TrapHandler = {
        let seen_flags = seen_flags.clone();
        Arc::new(move |event| {
            seen_flags.store(event.condition_flags, Ordering::SeqCst);
        })
    };
    q.trap(
        TrapConditions {
            flags: TRAP_PEER_CLOSED,
            ..Default::default()
        },
        handler,
        0,
    )
    .expect("trap installs");

    q.close_route();
    assert_eq!(seen_flags.load(Ordering::SeqCst), TRAP_REMOVED);
}

#[test]
fn merged_routes_connect_outward_peers() {
    let (p1, q1) = Router::new_pair();
    let (p2, q2) = Router::new_pair();

    q1.merge_route(&q2).expect("merge");

    p1.send_outbound_parcel(parcel(b"x")).expect("send x");
    p2.send_outbound_parcel(parcel(b"y")).expect("send y");

    assert_eq!(get_all(&p2).0.as_ref(), b"x");
    assert_eq!(get_all(&p1).0.as_ref(), b"y");

    // Closure propagates across the merged route.
    p1.close_route();
    assert!(p2.is_peer_closed());
    assert!(p2.is_route_dead());
}

#[test]
fn merge_rejects_local_peers_and_self() {
    let (p, q) = Router::new_pair();
    assert_eq!(p.merge_route(&q).unwrap_err(), ApiError::InvalidArgument);
    assert_eq!(p.merge_route(&p).unwrap_err(), ApiError::InvalidArgument);
    p.close_route();
    q.close_route();
}

#[test]
fn merge_rejects_routers_with_traffic() {
    let (p1, q1) = Router::new_pair();
    let (_p2, q2) = Router::new_pair();
    p1.send_outbound_parcel(parcel(b"x")).expect("send");
    let _ = get_all(&q1);
    assert_eq!(
        q1.merge_route(&q2).unwrap_err(),
        ApiError::FailedPrecondition
    );
}

#[test]
fn merge_survives_traffic_sent_before_merge_from_outside() {
    // Parcels sent by the outward peers before the merge still arrive.
    let (p1, q1) = Router::new_pair();
    let (p2, q2) = Router::new_pair();
    p1.send_outbound_parcel(parcel(b"early")).expect("send");
    // q1 has a queued inbound parcel it has not consumed; the merge is
    // still legal because q1 itself never sent or retrieved anything.
    q1.merge_route(&q2).expect("merge");
    assert_eq!(get_all(&p2).0.as_ref(), b"early");
}

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any interleaving of sends from both ends is delivered in order
        /// on each direction independently.
        #[test]
        fn interleaved_sends_deliver_in_order(
            schedule in proptest::collection::vec(any::<bool>(), 1..64)
        ) {
            let (p, q) = Router::new_pair();
            let mut sent_p = 0u8;
            let mut sent_q = 0u8;
            for from_p in schedule {
                if from_p {
                    p.send_outbound_parcel(Parcel::new(Bytes::from(vec![sent_p])))
                        .expect("send");
                    sent_p += 1;
                } else {
                    q.send_outbound_parcel(Parcel::new(Bytes::from(vec![sent_q])))
                        .expect("send");
                    sent_q += 1;
                }
            }
            for i in 0..sent_p {
                let (data, _) = q
                    .get_next_inbound_parcel(usize::MAX, usize::MAX, false)
                    .expect("in order");
                prop_assert_eq!(data.as_ref(), &[i]);
            }
            for i in 0..sent_q {
                let (data, _) = p
                    .get_next_inbound_parcel(usize::MAX, usize::MAX, false)
                    .expect("in order");
                prop_assert_eq!(data.as_ref(), &[i]);
            }
        }
    }
}
