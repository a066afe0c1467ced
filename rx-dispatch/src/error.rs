//! Error types for the rx dispatch engine.

use std::io;
use thiserror::Error;

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Configuration rejected before any thread was created.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A worker failed to spawn or acknowledge start; the pool was rolled back.
    #[error("rx thread {id} failed to start: {reason}")]
    InitFailure { id: u8, reason: String },

    /// Ring id outside the configured thread range.
    #[error("ring {ring_id} out of range (thread count {thread_count})")]
    InvalidRing { ring_id: u8, thread_count: u8 },

    /// A worker did not acknowledge suspend in time. Logged, never returned.
    #[error("rx thread {id} timed out waiting for suspend")]
    SuspendTimeout { id: u8 },

    /// Resume requested while the pool is not suspended.
    #[error("rx threads are not suspended")]
    NotSuspended,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Why a dequeued batch was freed instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("no such peer")]
    NoPeer,

    #[error("peer has no device")]
    NoDevice,

    #[error("device has no delivery callback")]
    NoDeliveryCallback,

    #[error("delivery panicked")]
    Other,
}
