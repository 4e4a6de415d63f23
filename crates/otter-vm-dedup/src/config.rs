//! Dedup pipeline configuration

use crate::error::{DedupError, Result};
use std::num::NonZeroUsize;
use std::thread;

/// Default pool cap multiplier: the free-list keeps at most
/// `free_list_factor * workers` chunks
pub const DEFAULT_FREE_LIST_FACTOR: usize = 2;

/// Default name of the consumer thread
pub const DEFAULT_THREAD_NAME: &str = "otter-dedup";

/// Dedup pipeline configuration
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Number of producer (marking worker) queues (default: available parallelism)
    pub workers: usize,
    /// Free-list cap multiplier (default: 2)
    pub free_list_factor: usize,
    /// Consumer thread name (default: "otter-dedup")
    pub thread_name: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            free_list_factor: DEFAULT_FREE_LIST_FACTOR,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl DedupConfig {
    /// Default configuration for a fixed number of workers
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Maximum number of chunks kept on the free-list
    pub fn max_free_chunks(&self) -> usize {
        self.workers.saturating_mul(self.free_list_factor)
    }

    /// Check the configuration before building a pipeline from it
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(DedupError::InvalidConfig("at least one worker is required"));
        }
        if self.free_list_factor == 0 {
            return Err(DedupError::InvalidConfig(
                "free_list_factor must be at least 1",
            ));
        }
        if self.thread_name.contains('\0') {
            return Err(DedupError::InvalidConfig(
                "thread_name must not contain NUL bytes",
            ));
        }
        Ok(())
    }
}
