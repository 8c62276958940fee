//! Parcels: the unit of ordered application payload.
//!
//! A parcel carries opaque data bytes plus zero or more attached objects
//! (portals being transferred, or opaque driver blobs). Parcels are
//! move-only: they travel along a route, are consumed exactly once, and are
//! never duplicated.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use weft_core::SequenceNumber;

use crate::router::Router;

/// An object attached to a parcel.
pub enum ParcelObject {
    /// A portal in transit, represented by its router.
    Portal(Arc<Router>),
    /// An opaque boxed driver object.
    Blob(Bytes),
}

impl fmt::Debug for ParcelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParcelObject::Portal(_) => f.write_str("Portal"),
            ParcelObject::Blob(data) => write!(f, "Blob({} bytes)", data.len()),
        }
    }
}

/// One in-order unit of application payload.
///
/// The sequence number is assigned by the sending terminal router when the
/// parcel enters the route, and is never renumbered by proxies.
#[derive(Debug, Default)]
pub struct Parcel {
    sequence_number: SequenceNumber,
    data: Bytes,
    objects: Vec<ParcelObject>,
}

impl Parcel {
    pub fn new(data: Bytes) -> Self {
        Self {
            sequence_number: SequenceNumber::ZERO,
            data,
            objects: Vec::new(),
        }
    }

    pub fn with_objects(data: Bytes, objects: Vec<ParcelObject>) -> Self {
        Self {
            sequence_number: SequenceNumber::ZERO,
            data,
            objects,
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, sequence_number: SequenceNumber) {
        self.sequence_number = sequence_number;
    }

    /// Remaining (unconsumed) data bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn objects(&self) -> &[ParcelObject] {
        &self.objects
    }

    pub fn set_objects(&mut self, objects: Vec<ParcelObject>) {
        self.objects = objects;
    }

    pub fn take_objects(&mut self) -> Vec<ParcelObject> {
        std::mem::take(&mut self.objects)
    }

    /// Drop `num_bytes` from the front of the data, after a partial read.
    pub fn consume_data(&mut self, num_bytes: usize) {
        let _ = self.data.split_to(num_bytes.min(self.data.len()));
    }

    /// Take up to `count` attached objects from the front.
    pub fn take_front_objects(&mut self, count: usize) -> Vec<ParcelObject> {
        let count = count.min(self.objects.len());
        self.objects.drain(..count).collect()
    }

    /// Whether every byte and every object has been consumed.
    pub fn is_fully_consumed(&self) -> bool {
        self.data.is_empty() && self.objects.is_empty()
    }

    /// Short form for log lines.
    pub fn describe(&self) -> String {
        format!(
            "parcel {} ({} bytes, {} objects)",
            self.sequence_number,
            self.data.len(),
            self.objects.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_parcel_is_unsequenced() {
        let p = Parcel::new(Bytes::from_static(b"hello"));
        assert_eq!(p.sequence_number(), SequenceNumber::ZERO);
        assert_eq!(p.data_len(), 5);
        assert_eq!(p.num_objects(), 0);
    }

    #[test]
    fn consume_data_advances_front() {
        let mut p = Parcel::new(Bytes::from_static(b"abcdef"));
        p.consume_data(2);
        assert_eq!(p.data().as_ref(), b"cdef");
        p.consume_data(100);
        assert!(p.data().is_empty());
        assert!(p.is_fully_consumed());
    }

    #[test]
    fn take_front_objects_preserves_order() {
        let mut p = Parcel::with_objects(
            Bytes::new(),
            vec![
                ParcelObject::Blob(Bytes::from_static(b"a")),
                ParcelObject::Blob(Bytes::from_static(b"bb")),
                ParcelObject::Blob(Bytes::from_static(b"ccc")),
            ],
        );
        let taken = p.take_front_objects(2);
        assert_eq!(taken.len(), 2);
        assert_eq!(p.num_objects(), 1);
        match &p.objects()[0] {
            ParcelObject::Blob(data) => assert_eq!(data.len(), 3),
            other => panic!("unexpected object {other:?}"),
        }
    }

    #[test]
    fn describe_mentions_shape() {
        let mut p = Parcel::new(Bytes::from_static(b"xy"));
        p.set_sequence_number(SequenceNumber(9));
        assert_eq!(p.describe(), "parcel 9 (2 bytes, 0 objects)");
    }
}
