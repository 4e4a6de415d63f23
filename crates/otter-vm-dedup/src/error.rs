//! Dedup queue error types

use thiserror::Error;

/// Errors raised while setting up or tearing down the dedup pipeline.
///
/// The push/publish/drain hot paths never fail; these only cover lifecycle
/// and attachment.
#[derive(Debug, Error)]
pub enum DedupError {
    /// Rejected configuration
    #[error("invalid dedup configuration: {0}")]
    InvalidConfig(&'static str),

    /// Worker id past the hub's worker count
    #[error("worker {worker_id} is out of range (hub has {worker_count} workers)")]
    WorkerOutOfRange {
        /// Requested worker id
        worker_id: usize,
        /// Number of workers the hub was built for
        worker_count: usize,
    },

    /// Another queue is already attached to this worker
    #[error("worker {0} already has an attached queue")]
    WorkerAttached(usize),

    /// The consumer thread could not be spawned
    #[error("failed to spawn dedup consumer thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The consumer thread panicked (usually inside the processor)
    #[error("dedup consumer thread panicked")]
    ConsumerPanicked,
}

/// Result alias for dedup operations
pub type Result<T> = std::result::Result<T, DedupError>;
