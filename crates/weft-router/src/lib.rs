//! Router and route-reduction state machines for the weft messaging fabric.
//!
//! A *route* connects two user-visible portals through one or more links.
//! Each portal (and each proxy hop left behind by a portal transfer) is
//! represented by a [`Router`]. Routers exchange ordered [`Parcel`]s over
//! polymorphic [`RouterLink`]s, and cooperate to collapse proxy hops back
//! into a single direct link (the *bypass* protocol) without losing,
//! duplicating, or reordering any parcel in flight.
//!
//! This crate contains only the route core. Node-to-node transports, shared
//! memory pools, and the portal API live behind the [`NodeLink`] and
//! [`NodeLinkMemory`] collaborator traits, implemented elsewhere.

pub mod edge;
pub mod link;
pub mod link_state;
pub mod message;
pub mod multi_lock;
pub mod node_link;
pub mod parcel;
pub mod parcel_queue;
pub mod router;
pub mod trap;

pub use edge::RouteEdge;
pub use link::{LocalRouterLink, RemoteRouterLink, RouterLink};
pub use link_state::{FragmentDescriptor, LinkStateFragment, QueueState, RouterLinkState};
pub use message::{Message, RouterDescriptor, WireObject};
pub use node_link::{NodeLink, NodeLinkMemory};
pub use parcel::{Parcel, ParcelObject};
pub use parcel_queue::ParcelQueue;
pub use router::{FlushBehavior, Router, TrapRejected};
pub use trap::{
    PortalStatus, TrapConditions, TrapEvent, TrapEventDispatcher, TrapHandler, TrapSet,
};
