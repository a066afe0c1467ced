//! Per-thread rx statistics
//!
//! Counters are plain relaxed atomics: producers bump the queue counters,
//! the owning rx thread bumps everything else. `snapshot` gives a
//! serializable copy for dumping.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::Serialize;

use crate::config::MAX_RINGS;
use crate::error::DropReason;

/// Lifecycle state of an rx thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Suspended,
    ShuttingDown,
    Terminated,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Running,
            1 => WorkerState::Suspended,
            2 => WorkerState::ShuttingDown,
            _ => WorkerState::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Running => 0,
            WorkerState::Suspended => 1,
            WorkerState::ShuttingDown => 2,
            WorkerState::Terminated => 3,
        }
    }
}

#[derive(Default)]
pub(crate) struct ThreadStats {
    queued: [AtomicU64; MAX_RINGS],
    dequeued: AtomicU64,
    delivered: AtomicU64,
    max_queue_len: AtomicU64,
    drop_no_peer: AtomicU64,
    drop_no_device: AtomicU64,
    drop_no_callback: AtomicU64,
    drop_other: AtomicU64,
    invalid_ring: AtomicU64,
    enqueue_rejected: AtomicU64,
    flushed: AtomicU64,
    state: AtomicU8,
}

impl ThreadStats {
    /// Count packets queued from `ring_id`; rings past MAX_RINGS aren't tracked
    pub fn record_queued(&self, ring_id: u8, elements: u32, queue_len: usize) {
        if let Some(counter) = self.queued.get(usize::from(ring_id)) {
            counter.fetch_add(u64::from(elements), Ordering::Relaxed);
        }
        self.max_queue_len
            .fetch_max(queue_len as u64, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self, elements: u32) {
        self.dequeued
            .fetch_add(u64::from(elements), Ordering::Relaxed);
    }

    pub fn record_delivered(&self, elements: u32) {
        self.delivered
            .fetch_add(u64::from(elements), Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason, elements: u32) {
        let counter = match reason {
            DropReason::NoPeer => &self.drop_no_peer,
            DropReason::NoDevice => &self.drop_no_device,
            DropReason::NoDeliveryCallback => &self.drop_no_callback,
            DropReason::Other => &self.drop_other,
        };
        counter.fetch_add(u64::from(elements), Ordering::Relaxed);
    }

    pub fn record_invalid_ring(&self) {
        self.invalid_ring.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueue_rejected(&self, elements: u32) {
        self.enqueue_rejected
            .fetch_add(u64::from(elements), Ordering::Relaxed);
    }

    pub fn record_flushed(&self, elements: u64) {
        self.flushed.fetch_add(elements, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self, id: u8, queue_len: usize) -> ThreadStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ThreadStatsSnapshot {
            id,
            state: self.state(),
            queue_len,
            queued: self.queued.iter().map(load).collect(),
            dequeued: load(&self.dequeued),
            delivered: load(&self.delivered),
            max_queue_len: load(&self.max_queue_len),
            drop_no_peer: load(&self.drop_no_peer),
            drop_no_device: load(&self.drop_no_device),
            drop_no_callback: load(&self.drop_no_callback),
            drop_other: load(&self.drop_other),
            invalid_ring: load(&self.invalid_ring),
            enqueue_rejected: load(&self.enqueue_rejected),
            flushed: load(&self.flushed),
        }
    }
}

/// Point-in-time copy of one rx thread's counters.
///
/// Packet counters count elements (packets), not queue entries;
/// `queue_len` and `max_queue_len` count entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadStatsSnapshot {
    pub id: u8,
    pub state: WorkerState,
    pub queue_len: usize,
    /// Packets queued, indexed by ring id
    pub queued: Vec<u64>,
    pub dequeued: u64,
    /// Packets handed to the delivery callback
    pub delivered: u64,
    pub max_queue_len: u64,
    pub drop_no_peer: u64,
    pub drop_no_device: u64,
    pub drop_no_callback: u64,
    pub drop_other: u64,
    /// Enqueues that named an out-of-range ring and were rerouted here
    pub invalid_ring: u64,
    /// Packets refused because the thread was already shut down
    pub enqueue_rejected: u64,
    /// Packets removed from the queue without being processed, either by
    /// `flush_by_peer` or at shutdown. Not part of `total_dropped`.
    pub flushed: u64,
}

impl ThreadStatsSnapshot {
    pub fn total_queued(&self) -> u64 {
        self.queued.iter().sum()
    }

    /// Packets dropped after dequeue because delivery failed
    pub fn total_dropped(&self) -> u64 {
        self.drop_no_peer + self.drop_no_device + self.drop_no_callback + self.drop_other
    }

    /// Packets with a final outcome: delivered, dropped or flushed.
    ///
    /// Equals `total_queued` once the thread has shut down.
    pub fn total_accounted(&self) -> u64 {
        self.delivered + self.total_dropped() + self.flushed
    }
}
