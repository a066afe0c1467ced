use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Upper bound on rx threads (one per receive ring).
pub const MAX_THREADS: usize = 4;

/// Number of receive rings tracked in per-thread queue statistics.
pub const MAX_RINGS: usize = 4;

const DEFAULT_START_TIMEOUT_MS: u64 = 1000;
const DEFAULT_SUSPEND_TIMEOUT_MS: u64 = 200;
const DEFAULT_THREAD_NAME_PREFIX: &str = "rx-thread";

/// Rx thread pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of rx threads, one per ring (1..=MAX_THREADS)
    pub thread_count: u8,
    /// How long init waits for each thread to report it has started
    pub start_timeout_ms: u64,
    /// How long suspend waits for each thread's acknowledgment
    pub suspend_timeout_ms: u64,
    /// CPUs the rx threads may be pinned to; 0 leaves scheduling alone
    pub cpu_affinity_mask: u8,
    /// Thread names are `<prefix>-<id>`
    pub thread_name_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            suspend_timeout_ms: DEFAULT_SUSPEND_TIMEOUT_MS,
            cpu_affinity_mask: 0,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Default configuration with `thread_count` threads
    pub fn with_threads(thread_count: u8) -> Self {
        Self {
            thread_count,
            ..Self::default()
        }
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(DispatchError::InvalidConfig(
                "thread_count must be at least 1".to_string(),
            ));
        }
        if usize::from(self.thread_count) > MAX_THREADS {
            return Err(DispatchError::InvalidConfig(format!(
                "thread_count {} exceeds maximum {MAX_THREADS}",
                self.thread_count
            )));
        }
        if self.start_timeout_ms == 0 {
            return Err(DispatchError::InvalidConfig(
                "start_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() || self.thread_name_prefix.contains('\0') {
            return Err(DispatchError::InvalidConfig(format!(
                "invalid thread_name_prefix {:?}",
                self.thread_name_prefix
            )));
        }
        Ok(())
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_timeout_ms)
    }

    pub(crate) fn thread_name(&self, id: u8) -> String {
        format!("{}-{id}", self.thread_name_prefix)
    }
}
