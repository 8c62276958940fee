//! The shared memory pool behind one node link.
//!
//! Both ends of a link share one [`LinkMemory`], the way two processes would
//! share a mapped buffer: sublink ids come from one atomic generator so
//! either side can allocate without coordination, and link-state fragments
//! are slots addressed by [`FragmentDescriptor`] offsets that travel on the
//! wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use weft_core::{BufferId, SublinkId};
use weft_router::node_link::{LinkStateCallback, NodeLinkMemory};
use weft_router::{FragmentDescriptor, LinkStateFragment, RouterLinkState};

/// Sublinks reserved for the initial portals created at connection time.
pub const MAX_INITIAL_PORTALS: u64 = 4;

/// Nominal slot size; fragment offsets advance by this much.
const FRAGMENT_SLOT_SIZE: u64 = 64;

/// Extra fragment capacity granted per growth request.
const CAPACITY_GROWTH_STEP: u64 = 256;

/// Every fragment lives in the one primary buffer of this in-process model.
const PRIMARY_BUFFER: BufferId = BufferId(0);

pub struct LinkMemory {
    next_sublink_id: AtomicU64,
    next_fragment_offset: AtomicU64,
    fragments_allocated: AtomicU64,
    fragment_capacity: AtomicU64,
    fragments: Mutex<HashMap<u64, Arc<RouterLinkState>>>,
}

impl LinkMemory {
    pub fn new(link_state_capacity: u64) -> Arc<LinkMemory> {
        Arc::new(LinkMemory {
            next_sublink_id: AtomicU64::new(MAX_INITIAL_PORTALS),
            next_fragment_offset: AtomicU64::new(MAX_INITIAL_PORTALS * FRAGMENT_SLOT_SIZE),
            fragments_allocated: AtomicU64::new(0),
            fragment_capacity: AtomicU64::new(link_state_capacity),
            fragments: Mutex::new(HashMap::new()),
        })
    }

    /// The fixed link-state slot for initial portal `i`. Created stable:
    /// an initial portal pair has nothing decaying on either side.
    pub fn initial_router_link_state(&self, i: u64) -> Option<LinkStateFragment> {
        if i >= MAX_INITIAL_PORTALS {
            return None;
        }
        let offset = i * FRAGMENT_SLOT_SIZE;
        let state = self
            .fragments
            .lock()
            .entry(offset)
            .or_insert_with(|| Arc::new(RouterLinkState::new_stable()))
            .clone();
        Some(LinkStateFragment::new(
            FragmentDescriptor {
                buffer: PRIMARY_BUFFER,
                offset,
            },
            state,
        ))
    }

    fn allocate_fragment(&self) -> LinkStateFragment {
        let offset = self
            .next_fragment_offset
            .fetch_add(FRAGMENT_SLOT_SIZE, Ordering::Relaxed);
        let state = Arc::new(RouterLinkState::new());
        self.fragments.lock().insert(offset, state.clone());
        LinkStateFragment::new(
            FragmentDescriptor {
                buffer: PRIMARY_BUFFER,
                offset,
            },
            state,
        )
    }
}

impl NodeLinkMemory for LinkMemory {
    fn allocate_sublink_ids(&self, count: u64) -> SublinkId {
        SublinkId(self.next_sublink_id.fetch_add(count, Ordering::Relaxed))
    }

    fn try_allocate_router_link_state(&self) -> Option<LinkStateFragment> {
        let capacity = self.fragment_capacity.load(Ordering::Relaxed);
        let claimed = self.fragments_allocated.fetch_add(1, Ordering::Relaxed);
        if claimed >= capacity {
            self.fragments_allocated.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        Some(self.allocate_fragment())
    }

    fn allocate_router_link_state(&self, callback: LinkStateCallback) {
        // Growth is immediate in-process; the callback still runs as if the
        // capacity had arrived asynchronously, possibly reentrantly.
        if let Some(fragment) = self.try_allocate_router_link_state() {
            callback(Some(fragment));
            return;
        }
        self.fragment_capacity
            .fetch_add(CAPACITY_GROWTH_STEP, Ordering::Relaxed);
        tracing::debug!(step = CAPACITY_GROWTH_STEP, "grew link-state capacity");
        callback(self.try_allocate_router_link_state());
    }

    fn adopt_router_link_state(
        &self,
        descriptor: FragmentDescriptor,
    ) -> Option<LinkStateFragment> {
        if descriptor.buffer != PRIMARY_BUFFER {
            return None;
        }
        let state = self.fragments.lock().get(&descriptor.offset)?.clone();
        Some(LinkStateFragment::new(descriptor, state))
    }
}
