//! Core types for the weft messaging fabric.
//!
//! This crate holds the plain data types shared across the workspace:
//! sequence numbers, node and sublink identifiers, link classification
//! enums, and the API-facing error taxonomy. It has no state machines and
//! performs no I/O.

pub mod error;
pub mod ids;
pub mod link;
pub mod sequence;

pub use error::{ApiError, ApiResult};
pub use ids::{BufferId, NodeName, SublinkId};
pub use link::{LinkSide, LinkType};
pub use sequence::SequenceNumber;
