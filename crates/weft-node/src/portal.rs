//! The user-facing endpoint of a route.
//!
//! A portal is a thin veneer over its [`Router`]: puts assign payloads to
//! the outbound sequence, gets drain the inbound queue, and traps observe
//! status changes. Two-phase puts stage a buffer keyed by its address until
//! committed; two-phase gets pin the head parcel until committed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use weft_core::{ApiError, ApiResult};
use weft_router::{
    Parcel, ParcelObject, PortalStatus, Router, TrapConditions, TrapHandler, TrapRejected,
};

/// An object attached to a parcel at the API surface.
pub enum Attachment {
    /// A portal to transfer; sending consumes it.
    Portal(Portal),
    /// An opaque blob standing in for a boxed driver object.
    Blob(Bytes),
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attachment::Portal(_) => f.write_str("Attachment::Portal(..)"),
            Attachment::Blob(data) => f.debug_tuple("Attachment::Blob").field(data).finish(),
        }
    }
}

/// A staged two-phase put buffer. Write into [`PutBuffer::data_mut`], then
/// commit or abort through the owning portal.
pub struct PutBuffer {
    key: usize,
    requested: usize,
    data: BytesMut,
}

impl PutBuffer {
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.requested]
    }

    pub fn capacity(&self) -> usize {
        self.requested
    }
}

pub struct Portal {
    router: Arc<Router>,
    /// Set when the router moved elsewhere (transfer, merge); suppresses
    /// the close-on-drop.
    detached: AtomicBool,
    staged_puts: Mutex<HashSet<usize>>,
    in_two_phase_get: Mutex<bool>,
}

impl Portal {
    pub(crate) fn from_router(router: Arc<Router>) -> Portal {
        Portal {
            router,
            detached: AtomicBool::new(false),
            staged_puts: Mutex::new(HashSet::new()),
            in_two_phase_get: Mutex::new(false),
        }
    }

    /// The underlying router. Exposed for composition and diagnostics.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    fn into_router(self) -> Arc<Router> {
        self.detached.store(true, Ordering::Release);
        self.router.clone()
    }

    // ------------------------------------------------------------------ //
    // Status
    // ------------------------------------------------------------------ //

    pub fn query_status(&self) -> PortalStatus {
        self.router.query_status()
    }

    pub fn is_peer_closed(&self) -> bool {
        self.router.is_peer_closed()
    }

    pub fn is_route_dead(&self) -> bool {
        self.router.is_route_dead()
    }

    /// Close this end of the route. Parcels already sent remain
    /// deliverable; the peer then observes closure and, once drained,
    /// death.
    pub fn close(self) {
        self.detached.store(true, Ordering::Release);
        self.router.close_route();
    }

    // ------------------------------------------------------------------ //
    // Put
    // ------------------------------------------------------------------ //

    pub fn put(&self, data: &[u8]) -> ApiResult<()> {
        self.put_with_attachments(data, Vec::new())
    }

    pub fn put_with_attachments(
        &self,
        data: &[u8],
        attachments: Vec<Attachment>,
    ) -> ApiResult<()> {
        self.validate_attachments(&attachments)?;
        if self.router.is_peer_closed() {
            return Err(ApiError::NotFound);
        }
        let parcel = Parcel::with_objects(
            Bytes::copy_from_slice(data),
            attachments.into_iter().map(Attachment::into_object).collect(),
        );
        self.router.send_outbound_parcel(parcel)
    }

    /// Stage a buffer for a two-phase put.
    pub fn begin_put(&self, num_data_bytes: usize) -> ApiResult<PutBuffer> {
        if self.router.is_peer_closed() {
            return Err(ApiError::NotFound);
        }
        // Allocate at least one byte so every staged buffer has a distinct
        // address to key on.
        let data = BytesMut::zeroed(num_data_bytes.max(1));
        let key = data.as_ptr() as usize;
        self.staged_puts.lock().insert(key);
        Ok(PutBuffer {
            key,
            requested: num_data_bytes,
            data,
        })
    }

    /// Commit a staged put with the number of bytes actually produced.
    pub fn commit_put(
        &self,
        buffer: PutBuffer,
        num_bytes_produced: usize,
        attachments: Vec<Attachment>,
    ) -> ApiResult<()> {
        if !self.staged_puts.lock().remove(&buffer.key) {
            return Err(ApiError::InvalidArgument);
        }
        if num_bytes_produced > buffer.requested {
            return Err(ApiError::InvalidArgument);
        }
        self.validate_attachments(&attachments)?;

        let mut data = buffer.data;
        data.truncate(num_bytes_produced);
        let parcel = Parcel::with_objects(
            data.freeze(),
            attachments.into_iter().map(Attachment::into_object).collect(),
        );
        self.router.send_outbound_parcel(parcel)
    }

    /// Abandon a staged put.
    pub fn abort_put(&self, buffer: PutBuffer) -> ApiResult<()> {
        if !self.staged_puts.lock().remove(&buffer.key) {
            return Err(ApiError::InvalidArgument);
        }
        Ok(())
    }

    fn validate_attachments(&self, attachments: &[Attachment]) -> ApiResult<()> {
        for attachment in attachments {
            if let Attachment::Portal(portal) = attachment {
                // A portal cannot travel over itself or over its own peer.
                if Arc::ptr_eq(&portal.router, &self.router)
                    || self.router.has_local_peer(&portal.router)
                {
                    return Err(ApiError::InvalidArgument);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------ //
    // Get
    // ------------------------------------------------------------------ //

    /// Retrieve the next parcel whole.
    pub fn get(&self) -> ApiResult<(Bytes, Vec<Attachment>)> {
        self.get_with_limits(usize::MAX, usize::MAX, false)
    }

    pub fn get_with_limits(
        &self,
        data_capacity: usize,
        object_capacity: usize,
        allow_partial: bool,
    ) -> ApiResult<(Bytes, Vec<Attachment>)> {
        let (data, objects) =
            self.router
                .get_next_inbound_parcel(data_capacity, object_capacity, allow_partial)?;
        Ok((data, objects.into_iter().map(Attachment::from_object).collect()))
    }

    /// Start a two-phase get: a zero-copy view of the next parcel's data
    /// and its attachment count.
    pub fn begin_get(&self) -> ApiResult<(Bytes, usize)> {
        let mut staged = self.in_two_phase_get.lock();
        if *staged {
            return Err(ApiError::FailedPrecondition);
        }
        if self.router.is_route_dead() {
            return Err(ApiError::NotFound);
        }
        let result = self.router.begin_get_next_inbound_parcel()?;
        *staged = true;
        Ok(result)
    }

    /// Finish a two-phase get, consuming what was actually used.
    pub fn commit_get(
        &self,
        num_data_bytes_consumed: usize,
        num_objects: usize,
    ) -> ApiResult<Vec<Attachment>> {
        let mut staged = self.in_two_phase_get.lock();
        if !*staged {
            return Err(ApiError::FailedPrecondition);
        }
        let objects = self
            .router
            .commit_get_next_inbound_parcel(num_data_bytes_consumed, num_objects)?;
        *staged = false;
        Ok(objects.into_iter().map(Attachment::from_object).collect())
    }

    /// Abandon a two-phase get without consuming anything.
    pub fn abort_get(&self) -> ApiResult<()> {
        let mut staged = self.in_two_phase_get.lock();
        if !*staged {
            return Err(ApiError::FailedPrecondition);
        }
        *staged = false;
        Ok(())
    }

    // ------------------------------------------------------------------ //
    // Traps and merging
    // ------------------------------------------------------------------ //

    pub fn trap(
        &self,
        conditions: TrapConditions,
        handler: TrapHandler,
        context: u64,
    ) -> Result<(), TrapRejected> {
        self.router.trap(conditions, handler, context)
    }

    /// Merge this portal's route with `other`'s, so the two far peers talk
    /// directly. Consumes both portals; on failure both are closed.
    pub fn merge(self, other: Portal) -> ApiResult<()> {
        let result = self.router.merge_route(&other.router);
        if result.is_ok() {
            self.detached.store(true, Ordering::Release);
            other.detached.store(true, Ordering::Release);
        }
        result
    }
}

impl Attachment {
    fn into_object(self) -> ParcelObject {
        match self {
            Attachment::Portal(portal) => ParcelObject::Portal(portal.into_router()),
            Attachment::Blob(data) => ParcelObject::Blob(data),
        }
    }

    fn from_object(object: ParcelObject) -> Attachment {
        match object {
            ParcelObject::Portal(router) => Attachment::Portal(Portal::from_router(router)),
            ParcelObject::Blob(data) => Attachment::Blob(data),
        }
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::Acquire) {
            self.router.close_route();
        }
    }
}
