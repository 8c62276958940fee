//! Traps: deferred notification of portal status changes.
//!
//! A trap is a (conditions, handler, context) triple installed on a router.
//! Every status mutation runs the trap set against the new status; triggered
//! traps are removed and their handlers queued on a
//! [`TrapEventDispatcher`], which fires them only after the router mutex is
//! released so a handler can freely call back into the portal.

use std::sync::Arc;

use weft_core::{ApiError, ApiResult};

/// Portal status flag: the other end closed its route.
pub const STATUS_PEER_CLOSED: u32 = 1 << 0;
/// Portal status flag: peer closed and every parcel it sent was consumed.
pub const STATUS_DEAD: u32 = 1 << 1;

/// Observable state of a portal, as reported to traps and status queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortalStatus {
    pub flags: u32,
    pub num_local_parcels: u64,
    pub num_local_bytes: u64,
    pub num_remote_parcels: u64,
    pub num_remote_bytes: u64,
}

impl PortalStatus {
    pub fn is_peer_closed(&self) -> bool {
        self.flags & STATUS_PEER_CLOSED != 0
    }

    pub fn is_dead(&self) -> bool {
        self.flags & STATUS_DEAD != 0
    }
}

/// Trap condition: the peer closed its end.
pub const TRAP_PEER_CLOSED: u32 = 1 << 0;
/// Trap condition: the route is dead (peer closed and drained).
pub const TRAP_DEAD: u32 = 1 << 1;
/// Trap condition: a new inbound parcel arrived.
pub const TRAP_NEW_LOCAL_PARCEL: u32 = 1 << 2;
/// Trap condition: more than `min_local_parcels` parcels are queued.
pub const TRAP_ABOVE_MIN_LOCAL_PARCELS: u32 = 1 << 3;
/// Trap condition: the peer's queue fell below `max_remote_parcels`.
pub const TRAP_BELOW_MAX_REMOTE_PARCELS: u32 = 1 << 4;
/// Trap condition: the peer's queued bytes fell below `max_remote_bytes`.
pub const TRAP_BELOW_MAX_REMOTE_BYTES: u32 = 1 << 5;
/// Event flag: the trap was removed without firing (portal closed or
/// serialized away).
pub const TRAP_REMOVED: u32 = 1 << 6;

const REMOTE_CONDITIONS: u32 = TRAP_BELOW_MAX_REMOTE_PARCELS | TRAP_BELOW_MAX_REMOTE_BYTES;

/// What to watch for, with thresholds for the counting conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapConditions {
    pub flags: u32,
    pub min_local_parcels: u64,
    pub max_remote_parcels: u64,
    pub max_remote_bytes: u64,
}

impl TrapConditions {
    /// Whether any condition needs visibility into the peer's queue state.
    pub fn need_remote_state(&self) -> bool {
        self.flags & REMOTE_CONDITIONS != 0
    }
}

/// Why the trap set is being re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    NewLocalParcel,
    LocalParcelConsumed,
    PeerClosed,
    RemoteActivity,
}

/// Payload delivered to a fired trap handler.
#[derive(Debug, Clone, Copy)]
pub struct TrapEvent {
    /// The conditions that fired (or [`TRAP_REMOVED`]).
    pub condition_flags: u32,
    pub status: PortalStatus,
    /// Caller-chosen value from installation.
    pub context: u64,
}

pub type TrapHandler = Arc<dyn Fn(&TrapEvent) + Send + Sync>;

struct Trap {
    conditions: TrapConditions,
    handler: TrapHandler,
    context: u64,
}

/// Evaluate `conditions` against `status`. `reason` is present on status
/// updates and absent for the installation-time probe; the edge-triggered
/// new-parcel condition fires on the matching reason, or at install time
/// when parcels are already waiting.
fn satisfied_conditions(
    conditions: &TrapConditions,
    status: &PortalStatus,
    reason: Option<UpdateReason>,
) -> u32 {
    let mut fired = 0;
    if conditions.flags & TRAP_PEER_CLOSED != 0 && status.is_peer_closed() {
        fired |= TRAP_PEER_CLOSED;
    }
    if conditions.flags & TRAP_DEAD != 0 && status.is_dead() {
        fired |= TRAP_DEAD;
    }
    if conditions.flags & TRAP_NEW_LOCAL_PARCEL != 0 {
        let hit = match reason {
            Some(reason) => reason == UpdateReason::NewLocalParcel,
            None => status.num_local_parcels > 0,
        };
        if hit {
            fired |= TRAP_NEW_LOCAL_PARCEL;
        }
    }
    if conditions.flags & TRAP_ABOVE_MIN_LOCAL_PARCELS != 0
        && status.num_local_parcels > conditions.min_local_parcels
    {
        fired |= TRAP_ABOVE_MIN_LOCAL_PARCELS;
    }
    if conditions.flags & TRAP_BELOW_MAX_REMOTE_PARCELS != 0
        && status.num_remote_parcels < conditions.max_remote_parcels
    {
        fired |= TRAP_BELOW_MAX_REMOTE_PARCELS;
    }
    if conditions.flags & TRAP_BELOW_MAX_REMOTE_BYTES != 0
        && status.num_remote_bytes < conditions.max_remote_bytes
    {
        fired |= TRAP_BELOW_MAX_REMOTE_BYTES;
    }
    fired
}

/// Handlers queued for execution once the router mutex is released.
///
/// Dropping the dispatcher runs every queued handler, so it must be
/// declared *before* any lock guard in the same scope.
#[derive(Default)]
pub struct TrapEventDispatcher {
    pending: Vec<(TrapHandler, TrapEvent)>,
}

impl TrapEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, handler: TrapHandler, event: TrapEvent) {
        self.pending.push((handler, event));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Drop for TrapEventDispatcher {
    fn drop(&mut self) {
        for (handler, event) in self.pending.drain(..) {
            handler(&event);
        }
    }
}

/// The set of traps installed on one router.
#[derive(Default)]
pub struct TrapSet {
    traps: Vec<Trap>,
}

impl TrapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.traps.is_empty()
    }

    /// Whether any installed trap watches the peer's queue state.
    pub fn need_remote_state(&self) -> bool {
        self.traps
            .iter()
            .any(|trap| trap.conditions.need_remote_state())
    }

    /// Install a trap, unless a condition is already satisfied: in that
    /// case nothing is installed and the satisfied flags are returned as a
    /// `FailedPrecondition` payload for the caller to surface.
    pub fn add(
        &mut self,
        conditions: TrapConditions,
        handler: TrapHandler,
        context: u64,
        status: &PortalStatus,
    ) -> ApiResult<()> {
        let satisfied = satisfied_conditions(&conditions, status, None);
        if satisfied != 0 {
            return Err(ApiError::FailedPrecondition);
        }
        self.traps.push(Trap {
            conditions,
            handler,
            context,
        });
        Ok(())
    }

    /// Probe which conditions are satisfied right now, without installing.
    pub fn probe(conditions: &TrapConditions, status: &PortalStatus) -> u32 {
        satisfied_conditions(conditions, status, None)
    }

    /// Re-evaluate every trap against `status`; triggered traps are removed
    /// and queued on `dispatcher`.
    pub fn update_portal_status(
        &mut self,
        status: &PortalStatus,
        reason: UpdateReason,
        dispatcher: &mut TrapEventDispatcher,
    ) {
        self.traps.retain(|trap| {
            let fired = satisfied_conditions(&trap.conditions, status, Some(reason));
            if fired == 0 {
                return true;
            }
            tracing::trace!(flags = fired, context = trap.context, "trap fired");
            dispatcher.queue(
                trap.handler.clone(),
                TrapEvent {
                    condition_flags: fired,
                    status: *status,
                    context: trap.context,
                },
            );
            false
        });
    }

    /// Remove every trap, notifying each handler once with [`TRAP_REMOVED`].
    pub fn remove_all(&mut self, status: &PortalStatus, dispatcher: &mut TrapEventDispatcher) {
        for trap in self.traps.drain(..) {
            dispatcher.queue(
                trap.handler,
                TrapEvent {
                    condition_flags: TRAP_REMOVED,
                    status: *status,
                    context: trap.context,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_handler() -> (TrapHandler, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        let handler: TrapHandler = Arc::new(move |_event| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    #[test]
    fn add_rejects_already_satisfied() {
        let mut set = TrapSet::new();
        let status = PortalStatus {
            flags: STATUS_PEER_CLOSED,
            ..Default::default()
        };
        let (handler, count) = counting_handler();
        let conditions = TrapConditions {
            flags: TRAP_PEER_CLOSED,
            ..Default::default()
        };
        assert_eq!(
            set.add(conditions, handler, 1, &status),
            Err(ApiError::FailedPrecondition)
        );
        assert_eq!(TrapSet::probe(&conditions, &status), TRAP_PEER_CLOSED);
        assert!(set.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn trap_fires_once_and_is_removed() {
        let mut set = TrapSet::new();
        let (handler, count) = counting_handler();
        let conditions = TrapConditions {
            flags: TRAP_PEER_CLOSED,
            ..Default::default()
        };
        assert!(set
            .add(conditions, handler, 7, &PortalStatus::default())
            .is_ok());

        let closed = PortalStatus {
            flags: STATUS_PEER_CLOSED,
            ..Default::default()
        };
        {
            let mut dispatcher = TrapEventDispatcher::new();
            set.update_portal_status(&closed, UpdateReason::PeerClosed, &mut dispatcher);
            assert_eq!(count.load(Ordering::SeqCst), 0); // not yet dispatched
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());

        // Further updates fire nothing.
        let mut dispatcher = TrapEventDispatcher::new();
        set.update_portal_status(&closed, UpdateReason::PeerClosed, &mut dispatcher);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn new_parcel_is_edge_triggered_on_updates() {
        let mut set = TrapSet::new();
        let (handler, count) = counting_handler();
        let conditions = TrapConditions {
            flags: TRAP_NEW_LOCAL_PARCEL,
            ..Default::default()
        };
        assert!(set
            .add(conditions, handler, 0, &PortalStatus::default())
            .is_ok());

        let one_queued = PortalStatus {
            num_local_parcels: 1,
            ..Default::default()
        };
        // A consumption update does not fire the new-parcel trap.
        let mut dispatcher = TrapEventDispatcher::new();
        set.update_portal_status(
            &one_queued,
            UpdateReason::LocalParcelConsumed,
            &mut dispatcher,
        );
        assert!(dispatcher.is_empty());
        set.update_portal_status(&one_queued, UpdateReason::NewLocalParcel, &mut dispatcher);
        assert!(!dispatcher.is_empty());
        drop(dispatcher);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn install_probe_sees_waiting_parcels() {
        let status = PortalStatus {
            num_local_parcels: 2,
            ..Default::default()
        };
        let conditions = TrapConditions {
            flags: TRAP_NEW_LOCAL_PARCEL,
            ..Default::default()
        };
        assert_eq!(TrapSet::probe(&conditions, &status), TRAP_NEW_LOCAL_PARCEL);
    }

    #[test]
    fn threshold_conditions() {
        let status = PortalStatus {
            num_local_parcels: 3,
            num_remote_parcels: 1,
            num_remote_bytes: 10,
            ..Default::default()
        };
        let conditions = TrapConditions {
            flags: TRAP_ABOVE_MIN_LOCAL_PARCELS
                | TRAP_BELOW_MAX_REMOTE_PARCELS
                | TRAP_BELOW_MAX_REMOTE_BYTES,
            min_local_parcels: 2,
            max_remote_parcels: 2,
            max_remote_bytes: 10,
        };
        let fired = satisfied_conditions(&conditions, &status, Some(UpdateReason::RemoteActivity));
        assert_ne!(fired & TRAP_ABOVE_MIN_LOCAL_PARCELS, 0);
        assert_ne!(fired & TRAP_BELOW_MAX_REMOTE_PARCELS, 0);
        // 10 bytes is not below the 10-byte threshold.
        assert_eq!(fired & TRAP_BELOW_MAX_REMOTE_BYTES, 0);
    }

    #[test]
    fn remove_all_notifies_with_removed_flag() {
        let mut set = TrapSet::new();
        let fired_flags = Arc::new(AtomicU32::new(0));
        let seen = fired_flags.clone();
        let handler: TrapHandler = Arc::new(move |event| {
            seen.store(event.condition_flags, Ordering::SeqCst);
        });
        let conditions = TrapConditions {
            flags: TRAP_PEER_CLOSED,
            ..Default::default()
        };
        assert!(set
            .add(conditions, handler, 0, &PortalStatus::default())
            .is_ok());
        {
            let mut dispatcher = TrapEventDispatcher::new();
            set.remove_all(&PortalStatus::default(), &mut dispatcher);
        }
        assert_eq!(fired_flags.load(Ordering::SeqCst), TRAP_REMOVED);
        assert!(set.is_empty());
    }

    #[test]
    fn need_remote_state_tracks_conditions() {
        let mut set = TrapSet::new();
        assert!(!set.need_remote_state());
        let (handler, _count) = counting_handler();
        let conditions = TrapConditions {
            flags: TRAP_BELOW_MAX_REMOTE_PARCELS,
            max_remote_parcels: 0,
            ..Default::default()
        };
        // max_remote_parcels == 0 can never be satisfied at install time.
        assert!(set
            .add(conditions, handler, 0, &PortalStatus::default())
            .is_ok());
        assert!(set.need_remote_state());
    }
}
