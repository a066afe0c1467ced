//! Per-ring rx worker threads
//!
//! Each receive ring gets its own worker thread that:
//! - sleeps until batches are posted or a suspend is requested
//! - drains its whole queue on every wake
//! - resolves each batch's peer and hands the chain to the upper stack
//!
//! Suspend is only honoured between full drains, never in the middle of one.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::affinity;
use crate::buffer::PacketBatch;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, DropReason, Result};
use crate::event::{Event, EventFlags, RX_POST_EVENT, RX_SHUTDOWN_EVENT, RX_SUSPEND_EVENT};
use crate::queue::BatchQueue;
use crate::resolver::DeliveryResolver;
use crate::stats::{ThreadStats, ThreadStatsSnapshot, WorkerState};

/// State shared between a worker thread and its handle
struct WorkerShared {
    id: u8,
    name: String,
    queue: BatchQueue,
    flags: EventFlags,
    started: Event,
    suspended: Event,
    resumed: Event,
    shutdown: Event,
    stats: ThreadStats,
}

/// Handle to a running rx thread
pub(crate) struct WorkerHandle {
    shared: Arc<WorkerShared>,
    /// Taken on teardown; `None` once the thread has been joined
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn id(&self) -> u8 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue a batch and wake the thread. Never waits for the thread.
    pub fn enqueue(&self, batch: PacketBatch) {
        let ring_id = batch.ring_id();
        match self.shared.queue.push(batch) {
            Ok(info) => {
                self.shared
                    .stats
                    .record_queued(ring_id, info.elements, info.queue_len);
                self.shared.flags.set(RX_POST_EVENT);
                self.shared.flags.wake();
            }
            Err(batch) => {
                warn!(
                    thread = %self.shared.name,
                    ring_id,
                    elements = batch.element_count(),
                    "Rx thread is shut down, dropping batch"
                );
                self.shared
                    .stats
                    .record_enqueue_rejected(batch.element_count());
            }
        }
    }

    pub fn record_invalid_ring(&self) {
        self.shared.stats.record_invalid_ring();
    }

    /// Ask the thread to park after its current drain
    pub fn request_suspend(&self) {
        self.shared.resumed.reset();
        self.shared.suspended.reset();
        self.shared.flags.set(RX_SUSPEND_EVENT);
        self.shared.flags.wake();
    }

    /// Wait for the suspend acknowledgment; false on timeout
    pub fn wait_suspended(&self, timeout: Duration) -> bool {
        self.shared.suspended.wait_timeout(timeout)
    }

    pub fn resume(&self) {
        self.shared.resumed.set();
    }

    /// Ask the thread to exit. Also releases it if it is parked in suspend.
    pub fn request_shutdown(&self) {
        if !self.is_alive() {
            return;
        }
        self.shared.flags.set(RX_SHUTDOWN_EVENT);
        self.shared.flags.set(RX_POST_EVENT);
        self.shared.flags.wake();
        self.shared.resumed.set();
    }

    /// Wait for the thread to exit, then close and flush its queue.
    ///
    /// Waits without a timeout. Returns false if the thread was already
    /// torn down.
    pub fn finish(&self) -> bool {
        let Some(thread) = self.thread.lock().take() else {
            return false;
        };

        self.shared.shutdown.wait();
        if thread.join().is_err() {
            error!(thread = %self.shared.name, "Rx thread panicked");
        }

        let flushed = self.shared.queue.close_and_flush();
        if flushed > 0 {
            info!(thread = %self.shared.name, flushed, "Flushed pending rx packets");
            self.shared.stats.record_flushed(flushed);
        }
        self.shared.stats.set_state(WorkerState::Terminated);
        true
    }

    pub fn is_alive(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Drop queued batches for one peer; returns packets flushed
    pub fn flush_peer(&self, peer_local_id: u32) -> u64 {
        let flushed = self.shared.queue.flush_peer(peer_local_id);
        self.shared.stats.record_flushed(flushed);
        flushed
    }

    pub fn snapshot(&self) -> ThreadStatsSnapshot {
        self.shared
            .stats
            .snapshot(self.shared.id, self.shared.queue.len())
    }
}

/// Spawn rx thread `id` and wait for it to report that it is running
pub(crate) fn spawn_worker<R: DeliveryResolver>(
    config: &DispatcherConfig,
    id: u8,
    resolver: Arc<R>,
) -> Result<WorkerHandle> {
    let shared = Arc::new(WorkerShared {
        id,
        name: config.thread_name(id),
        queue: BatchQueue::new(),
        flags: EventFlags::new(),
        started: Event::new(),
        suspended: Event::new(),
        resumed: Event::new(),
        shutdown: Event::new(),
        stats: ThreadStats::default(),
    });

    let thread_shared = shared.clone();
    let affinity_mask = config.cpu_affinity_mask;
    let thread = thread::Builder::new()
        .name(shared.name.clone())
        .spawn(move || run_worker(thread_shared, resolver, affinity_mask))
        .map_err(|e| DispatchError::InitFailure {
            id,
            reason: format!("failed to spawn thread: {e}"),
        })?;

    let handle = WorkerHandle {
        shared,
        thread: Mutex::new(Some(thread)),
    };

    if !handle.shared.started.wait_timeout(config.start_timeout()) {
        // The caller rolls back the rest of the pool; this one goes too.
        handle.request_shutdown();
        handle.finish();
        return Err(DispatchError::InitFailure {
            id,
            reason: format!(
                "no start acknowledgment within {}ms",
                config.start_timeout_ms
            ),
        });
    }

    debug!(thread = %handle.shared.name, "Rx thread has started");
    Ok(handle)
}

/// Sets the shutdown event when the thread function returns or unwinds
struct ShutdownAck<'a>(&'a Event);

impl Drop for ShutdownAck<'_> {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// Main rx thread loop
fn run_worker<R: DeliveryResolver>(shared: Arc<WorkerShared>, resolver: Arc<R>, affinity_mask: u8) {
    let _ack = ShutdownAck(&shared.shutdown);

    affinity::pin_current_thread(&shared.name, affinity_mask, usize::from(shared.id));
    shared.started.set();
    info!(thread = %shared.name, "Rx thread started");

    loop {
        shared.flags.wait_any(RX_POST_EVENT | RX_SUSPEND_EVENT);
        shared.flags.clear(RX_POST_EVENT);

        if shared.flags.test_and_clear(RX_SHUTDOWN_EVENT) {
            shared.stats.set_state(WorkerState::ShuttingDown);
            // Release a concurrent suspend waiter before exiting.
            if shared.flags.test_and_clear(RX_SUSPEND_EVENT) {
                shared.suspended.set();
            }
            info!(thread = %shared.name, "Shutting down rx thread");
            break;
        }

        drain_queue(&shared, resolver.as_ref());

        if shared.flags.test_and_clear(RX_SUSPEND_EVENT) {
            shared.stats.set_state(WorkerState::Suspended);
            shared.suspended.set();
            debug!(thread = %shared.name, "Rx thread suspended, waiting for resume");
            shared.resumed.wait();
            shared.stats.set_state(WorkerState::Running);
            debug!(thread = %shared.name, "Rx thread resumed");
        }
    }

    info!(thread = %shared.name, "Exiting rx thread");
}

/// Process every batch currently queued
fn drain_queue<R: DeliveryResolver>(shared: &WorkerShared, resolver: &R) {
    while let Some(batch) = shared.queue.pop() {
        let elements = batch.element_count();
        let peer_local_id = batch.peer_local_id();
        shared.stats.record_dequeued(elements);

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| deliver_batch(resolver, batch)))
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(thread = %shared.name, peer_local_id, elements, "Rx delivery panicked");
                Err(DropReason::Other)
            }
        };

        match outcome {
            Ok(()) => shared.stats.record_delivered(elements),
            Err(reason) => {
                debug!(
                    thread = %shared.name,
                    peer_local_id,
                    elements,
                    %reason,
                    "Dropping rx batch"
                );
                shared.stats.record_drop(reason, elements);
            }
        }
    }
}

/// Resolve peer → device → callback and deliver. On failure the batch is
/// freed here.
fn deliver_batch<R: DeliveryResolver>(
    resolver: &R,
    batch: PacketBatch,
) -> std::result::Result<(), DropReason> {
    let peer = resolver
        .resolve_peer(batch.peer_local_id())
        .ok_or(DropReason::NoPeer)?;
    let device = resolver
        .resolve_device(&peer)
        .ok_or(DropReason::NoDevice)?;
    let delivery = resolver
        .resolve_delivery(&device)
        .ok_or(DropReason::NoDeliveryCallback)?;
    delivery.invoke(batch.into_chain());
    Ok(())
}
