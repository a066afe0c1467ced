//! Test utilities for driving the dispatcher
//!
//! `StaticResolver` is an in-memory peer/device table whose delivery
//! callbacks report every chain they receive over a channel, so tests can
//! check what arrived, in which order and on which thread.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::RwLock;

use crate::buffer::{BufferChain, PacketBuffer};
use crate::resolver::{Delivery, DeliveryFn, DeliveryResolver};

// ============================================================================
// Tagged packets
// ============================================================================

/// Packet whose payload is `tag` in big endian
pub fn tagged(tag: u64) -> PacketBuffer {
    PacketBuffer::new(tag.to_be_bytes().to_vec())
}

/// Tagged packet carrying tagged fragments
pub fn tagged_with_fragments(tag: u64, fragments: &[u64]) -> PacketBuffer {
    PacketBuffer::with_fragments(
        tag.to_be_bytes().to_vec(),
        fragments.iter().copied().map(tagged).collect(),
    )
}

pub fn tag_of(buf: &PacketBuffer) -> Option<u64> {
    let bytes: [u8; 8] = buf.data().try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Chain of tagged packets, one per value in `tags`
pub fn chain_of(tags: Range<u64>) -> BufferChain {
    tags.map(tagged).collect()
}

/// Tags of every packet in `chain`, each followed by its fragments' tags
pub fn chain_tags(chain: &BufferChain) -> Vec<u64> {
    let mut tags = Vec::new();
    for buf in chain {
        tags.extend(tag_of(buf));
        tags.extend(buf.fragments().filter_map(tag_of));
    }
    tags
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// One chain handed to a delivery callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredChain {
    pub device: u32,
    /// Name of the thread the callback ran on
    pub thread: Option<String>,
    /// Top-level packets in the chain
    pub packets: usize,
    pub tags: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceKind {
    Attached,
    Detached,
    Panicking,
    /// Callback sleeps this long before reporting
    Slow(Duration),
}

/// Opaque handle passed back to the delivery callback
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    device: u32,
    panics: bool,
    delay: Option<Duration>,
    tx: Sender<DeliveredChain>,
}

/// Peer id → device id → callback, all held in memory.
pub struct StaticResolver {
    peers: RwLock<HashMap<u32, u32>>,
    devices: RwLock<HashMap<u32, DeviceKind>>,
    deliver: DeliveryFn<DeviceHandle>,
    tx: Sender<DeliveredChain>,
    rx: Receiver<DeliveredChain>,
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticResolver {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let deliver: DeliveryFn<DeviceHandle> =
            Arc::new(|handle: &DeviceHandle, chain: BufferChain| {
                if handle.panics {
                    panic!("delivery to device {} failed", handle.device);
                }
                if let Some(delay) = handle.delay {
                    std::thread::sleep(delay);
                }
                let delivered = DeliveredChain {
                    device: handle.device,
                    thread: std::thread::current().name().map(str::to_string),
                    packets: chain.len(),
                    tags: chain_tags(&chain),
                };
                let _ = handle.tx.send(delivered);
            });

        Self {
            peers: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            deliver,
            tx,
            rx,
        }
    }

    /// Map `peer` to `device` and register the device with a callback
    pub fn with_peer(self, peer: u32, device: u32) -> Self {
        self.peers.write().insert(peer, device);
        self.devices
            .write()
            .entry(device)
            .or_insert(DeviceKind::Attached);
        self
    }

    /// Map `peer` to `device` without registering the device
    pub fn with_orphan_peer(self, peer: u32, device: u32) -> Self {
        self.peers.write().insert(peer, device);
        self
    }

    /// Register `device` without a delivery callback
    pub fn with_detached_device(self, device: u32) -> Self {
        self.devices.write().insert(device, DeviceKind::Detached);
        self
    }

    /// Register `device` with a callback that panics
    pub fn with_panicking_device(self, device: u32) -> Self {
        self.devices.write().insert(device, DeviceKind::Panicking);
        self
    }

    /// Map `peer` to a device whose callback takes `delay` to return
    pub fn with_slow_peer(self, peer: u32, device: u32, delay: Duration) -> Self {
        self.peers.write().insert(peer, device);
        self.devices.write().insert(device, DeviceKind::Slow(delay));
        self
    }

    /// Forget `peer`; later batches for it resolve to no peer
    pub fn remove_peer(&self, peer: u32) {
        self.peers.write().remove(&peer);
    }

    pub fn receiver(&self) -> Receiver<DeliveredChain> {
        self.rx.clone()
    }

    /// Every chain delivered so far
    pub fn drain(&self) -> Vec<DeliveredChain> {
        self.rx.try_iter().collect()
    }
}

impl DeliveryResolver for StaticResolver {
    type Peer = u32;
    type Device = u32;
    type Handle = DeviceHandle;

    fn resolve_peer(&self, peer_local_id: u32) -> Option<u32> {
        self.peers.read().get(&peer_local_id).copied()
    }

    fn resolve_device(&self, device: &u32) -> Option<u32> {
        self.devices.read().contains_key(device).then_some(*device)
    }

    fn resolve_delivery(&self, device: &u32) -> Option<Delivery<DeviceHandle>> {
        let kind = *self.devices.read().get(device)?;
        if kind == DeviceKind::Detached {
            return None;
        }
        Some(Delivery::new(
            self.deliver.clone(),
            DeviceHandle {
                device: *device,
                panics: kind == DeviceKind::Panicking,
                delay: match kind {
                    DeviceKind::Slow(delay) => Some(delay),
                    _ => None,
                },
                tx: self.tx.clone(),
            },
        ))
    }
}
