//! Receive-side packet dispatch
//!
//! Producers hand batches of received packets to a fixed pool of rx threads,
//! one per receive ring. Each thread queues its batches, drains them in FIFO
//! order and delivers every chain through a `DeliveryResolver` supplied by
//! the embedding system.

pub mod affinity;
pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub(crate) mod event;
pub(crate) mod queue;
pub mod resolver;
pub mod stats;
pub mod test_util;
pub(crate) mod worker;

pub use buffer::{BufferChain, PacketBatch, PacketBuffer};
pub use config::{DispatcherConfig, MAX_RINGS, MAX_THREADS};
pub use dispatcher::{DeliveryContext, Dispatcher, PoolState};
pub use error::{DispatchError, DropReason, Result};
pub use resolver::{Delivery, DeliveryFn, DeliveryResolver};
pub use stats::{ThreadStatsSnapshot, WorkerState};
