//! Delivery resolver seam
//!
//! The dispatcher knows nothing about peers, logical devices or the upper
//! stack. The embedding system injects a `DeliveryResolver` at init; rx
//! threads use it for each dequeued batch: peer id → peer → device →
//! delivery callback.

use std::fmt;
use std::sync::Arc;

use crate::buffer::BufferChain;

/// Upper-stack entry point. Takes ownership of the chain.
pub type DeliveryFn<H> = Arc<dyn Fn(&H, BufferChain) + Send + Sync>;

/// A device's delivery callback together with the opaque handle it expects.
pub struct Delivery<H> {
    pub deliver: DeliveryFn<H>,
    pub handle: H,
}

impl<H> Delivery<H> {
    pub fn new(deliver: DeliveryFn<H>, handle: H) -> Self {
        Self { deliver, handle }
    }

    pub(crate) fn invoke(self, chain: BufferChain) {
        (self.deliver)(&self.handle, chain);
    }
}

impl<H: fmt::Debug> fmt::Debug for Delivery<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Lookups the rx threads perform per batch.
///
/// Called concurrently from every rx thread. Returning `None` at any step
/// drops the batch and bumps the matching drop counter.
pub trait DeliveryResolver: Send + Sync + 'static {
    type Peer;
    type Device;
    type Handle;

    fn resolve_peer(&self, peer_local_id: u32) -> Option<Self::Peer>;

    fn resolve_device(&self, peer: &Self::Peer) -> Option<Self::Device>;

    fn resolve_delivery(&self, device: &Self::Device) -> Option<Delivery<Self::Handle>>;
}
