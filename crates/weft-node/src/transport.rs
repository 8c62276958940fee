//! In-process duplex transport between two node links.
//!
//! Messages are encoded to MessagePack on transmit and decoded at the peer,
//! so the full wire path is exercised even though delivery is a synchronous
//! call on the sending thread. The route core tolerates that because it
//! never holds a router mutex across link operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use weft_router::Message;

use crate::node_link::NodeLink;

pub struct MemoryTransport {
    severed: AtomicBool,
    peer: Mutex<Option<Weak<MemoryTransport>>>,
    /// The node link that receives what the peer transmits.
    receiver: Mutex<Option<Weak<NodeLink>>>,
}

impl MemoryTransport {
    /// Create both halves of a duplex channel.
    pub fn pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let a = Arc::new(MemoryTransport {
            severed: AtomicBool::new(false),
            peer: Mutex::new(None),
            receiver: Mutex::new(None),
        });
        let b = Arc::new(MemoryTransport {
            severed: AtomicBool::new(false),
            peer: Mutex::new(Some(Arc::downgrade(&a))),
            receiver: Mutex::new(None),
        });
        *a.peer.lock() = Some(Arc::downgrade(&b));
        (a, b)
    }

    pub(crate) fn set_receiver(&self, link: &Arc<NodeLink>) {
        *self.receiver.lock() = Some(Arc::downgrade(link));
    }

    /// Encode and deliver one message to the peer's receiver.
    pub(crate) fn transmit(&self, message: &Message) {
        if self.severed.load(Ordering::Acquire) {
            tracing::trace!(kind = message.kind(), "dropping message on severed transport");
            return;
        }
        let bytes = match rmp_serde::to_vec(message) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(%error, kind = message.kind(), "message encoding failed");
                self.sever();
                return;
            }
        };
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(peer) = peer {
            peer.deliver(bytes);
        }
    }

    fn deliver(&self, bytes: Vec<u8>) {
        if self.severed.load(Ordering::Acquire) {
            return;
        }
        let receiver = self.receiver.lock().as_ref().and_then(Weak::upgrade);
        let Some(receiver) = receiver else {
            return;
        };
        match rmp_serde::from_slice::<Message>(&bytes) {
            Ok(message) => receiver.deliver(message),
            Err(error) => {
                // Garbage on the wire: tear the link down rather than
                // guess.
                tracing::error!(%error, "message decoding failed; severing transport");
                self.sever();
            }
        }
    }

    /// Simulate transport failure: both ends stop carrying traffic and
    /// report disconnection to their node links.
    pub fn sever(&self) {
        if self.severed.swap(true, Ordering::AcqRel) {
            return;
        }
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        let receiver = self.receiver.lock().as_ref().and_then(Weak::upgrade);
        if let Some(receiver) = receiver {
            receiver.on_transport_error();
        }
        if let Some(peer) = peer {
            peer.sever();
        }
    }

    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::Acquire)
    }
}
