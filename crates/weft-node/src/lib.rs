//! Node assembly for the weft messaging fabric.
//!
//! This crate supplies everything the route core consumes through its
//! collaborator traits (a concrete node link with an in-process transport
//! and msgpack codec, and the shared link-memory pool) plus the user-facing
//! [`Portal`] API, node configuration, and logging setup.

pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod node;
pub mod node_link;
pub mod portal;
pub mod transport;

pub use config::NodeConfig;
pub use error::NodeError;
pub use memory::LinkMemory;
pub use node::{Connection, Node};
pub use portal::{Attachment, Portal, PutBuffer};
pub use transport::MemoryTransport;
