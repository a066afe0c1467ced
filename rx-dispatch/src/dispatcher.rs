//! Rx thread pool
//!
//! The `Dispatcher` owns one rx thread per receive ring, routes producer
//! batches to the thread of their ring and coordinates suspend, resume and
//! shutdown across the pool.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffer::PacketBatch;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::resolver::DeliveryResolver;
use crate::stats::ThreadStatsSnapshot;
use crate::worker::{WorkerHandle, spawn_worker};

/// Pool-wide state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    Suspended,
    ShutDown,
}

/// Per-thread poll context handed to an external event loop.
///
/// Inert: the dispatcher never schedules anything through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    ring_id: u8,
    thread_name: String,
}

impl DeliveryContext {
    pub fn ring_id(&self) -> u8 {
        self.ring_id
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }
}

/// Fixed pool of rx threads, one per ring.
pub struct Dispatcher<R: DeliveryResolver> {
    config: DispatcherConfig,
    threads: Vec<WorkerHandle>,
    state: Mutex<PoolState>,
    _resolver: PhantomData<R>,
}

impl<R: DeliveryResolver> Dispatcher<R> {
    /// Start `config.thread_count` rx threads.
    ///
    /// All or nothing: if any thread fails to start, the ones already running
    /// are shut down and `InitFailure` is returned.
    pub fn init(config: DispatcherConfig, resolver: Arc<R>) -> Result<Self> {
        Self::init_with(config, resolver, spawn_worker::<R>)
    }

    fn init_with<F>(config: DispatcherConfig, resolver: Arc<R>, mut spawn: F) -> Result<Self>
    where
        F: FnMut(&DispatcherConfig, u8, Arc<R>) -> Result<WorkerHandle>,
    {
        config.validate()?;

        let mut threads = Vec::with_capacity(usize::from(config.thread_count));
        for id in 0..config.thread_count {
            match spawn(&config, id, resolver.clone()) {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    error!(id, error = %e, "Failed to start rx thread, rolling back");
                    teardown(&threads);
                    return Err(e);
                }
            }
        }

        info!(
            threads = config.thread_count,
            affinity_mask = config.cpu_affinity_mask,
            "Rx threads started"
        );

        Ok(Self {
            config,
            threads,
            state: Mutex::new(PoolState::Running),
            _resolver: PhantomData,
        })
    }

    pub fn thread_count(&self) -> u8 {
        self.config.thread_count
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    /// Thread that owns `ring_id`
    pub fn select_thread(&self, ring_id: u8) -> Result<usize> {
        if ring_id < self.config.thread_count {
            Ok(usize::from(ring_id))
        } else {
            Err(DispatchError::InvalidRing {
                ring_id,
                thread_count: self.config.thread_count,
            })
        }
    }

    /// Hand a batch to its ring's thread.
    ///
    /// Safe to call from many producers at once. An out-of-range ring is a
    /// caller/hardware desync: it is logged, counted on thread 0 and the
    /// batch is processed there.
    pub fn enqueue(&self, batch: PacketBatch) {
        let index = self.select_thread(batch.ring_id()).unwrap_or_else(|e| {
            error!(error = %e, peer_local_id = batch.peer_local_id(), "Rerouting batch to rx thread 0");
            self.threads[0].record_invalid_ring();
            0
        });
        self.threads[index].enqueue(batch);
    }

    /// Park every thread after its current drain.
    ///
    /// Best effort: a thread that doesn't acknowledge within the suspend
    /// timeout is logged and the pool is marked suspended anyway.
    pub fn suspend_all(&self) {
        let mut state = self.state.lock();
        match *state {
            PoolState::ShutDown => {
                warn!("Suspend requested after shutdown, ignoring");
                return;
            }
            PoolState::Suspended => {
                debug!("Rx threads already suspended");
                return;
            }
            PoolState::Running => {}
        }

        for thread in &self.threads {
            thread.request_suspend();
        }

        let timeout = self.config.suspend_timeout();
        for thread in &self.threads {
            if thread.wait_suspended(timeout) {
                debug!(thread = %thread.name(), "Rx thread suspended");
            } else {
                let e = DispatchError::SuspendTimeout { id: thread.id() };
                warn!(thread = %thread.name(), error = %e, "Suspend not acknowledged");
            }
        }

        *state = PoolState::Suspended;
        info!("Rx threads suspended");
    }

    /// Release suspended threads. Doesn't wait for them to run again.
    pub fn resume_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != PoolState::Suspended {
            return Err(DispatchError::NotSuspended);
        }

        for thread in &self.threads {
            thread.resume();
        }

        *state = PoolState::Running;
        info!("Rx threads resumed");
        Ok(())
    }

    /// Stop every thread and flush what is still queued.
    ///
    /// Waits for each thread without a timeout; a delivery callback that
    /// never returns blocks this call. Safe to call more than once.
    pub fn shutdown_all(&self) {
        let mut state = self.state.lock();
        if teardown(&self.threads) {
            info!("Rx threads shut down");
        }
        *state = PoolState::ShutDown;
    }

    /// Shut down and release the pool
    pub fn deinit(self) {
        self.shutdown_all();
    }

    /// Drop every queued batch for `peer_local_id` on all threads.
    ///
    /// Batches already dequeued are not affected. Returns packets flushed.
    pub fn flush_by_peer(&self, peer_local_id: u32) -> u64 {
        let flushed: u64 = self
            .threads
            .iter()
            .map(|thread| thread.flush_peer(peer_local_id))
            .sum();
        debug!(peer_local_id, flushed, "Flushed queued rx batches for peer");
        flushed
    }

    pub fn get_delivery_context(&self, ring_id: u8) -> Result<DeliveryContext> {
        let index = self.select_thread(ring_id)?;
        Ok(DeliveryContext {
            ring_id,
            thread_name: self.threads[index].name().to_string(),
        })
    }

    pub fn dump_stats(&self) -> Vec<ThreadStatsSnapshot> {
        self.threads.iter().map(WorkerHandle::snapshot).collect()
    }

    /// Log one line of counters per thread
    pub fn log_stats(&self) {
        for (thread, stats) in self.threads.iter().zip(self.dump_stats()) {
            info!(
                thread = %thread.name(),
                state = ?stats.state,
                queue_len = stats.queue_len,
                max_queue_len = stats.max_queue_len,
                queued = ?stats.queued,
                dequeued = stats.dequeued,
                delivered = stats.delivered,
                drop_no_peer = stats.drop_no_peer,
                drop_no_device = stats.drop_no_device,
                drop_no_callback = stats.drop_no_callback,
                drop_other = stats.drop_other,
                invalid_ring = stats.invalid_ring,
                enqueue_rejected = stats.enqueue_rejected,
                flushed = stats.flushed,
                "Rx thread stats"
            );
        }
    }
}

impl<R: DeliveryResolver> Drop for Dispatcher<R> {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

/// Signal every live thread, then wait for each in turn.
/// Returns true if any thread was still running.
fn teardown(threads: &[WorkerHandle]) -> bool {
    for thread in threads {
        thread.request_shutdown();
    }
    let mut stopped = false;
    for thread in threads {
        stopped |= thread.finish();
    }
    stopped
}
