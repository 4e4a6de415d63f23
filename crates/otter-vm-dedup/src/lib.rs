//! # Otter VM Dedup Queue
//!
//! Hands deduplication candidates found by parallel marking workers to a
//! single background consumer thread.
//!
//! ## Design
//!
//! - **Chunks**: candidates travel in fixed-capacity chunks, each owned by
//!   exactly one party at a time
//! - **Worker queues**: one write cursor per marking worker, never blocking
//!   beyond a short pool lock
//! - **Hub**: lock-free per-worker stacks of published chunks plus a capped
//!   chunk pool
//! - **Consumer**: one thread drains the stacks and runs the processor,
//!   parking for safepoints between candidates
//! - **Root visits**: every still-queued candidate can be visited (and
//!   rewritten) at a safepoint
//!
//! Candidates are processed in no particular order.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod chunk;
pub mod config;
pub mod consumer;
pub mod error;
pub mod hub;
pub mod processor;
pub mod safepoint;
pub mod service;
pub mod stats;
pub mod worker_queue;

pub use chunk::{CHUNK_CAPACITY, Chunk};
pub use config::{DEFAULT_FREE_LIST_FACTOR, DedupConfig};
pub use consumer::{ConsumerState, ConsumerThread};
pub use error::{DedupError, Result};
pub use hub::{ChunkCensus, Hub, PoolStats};
pub use processor::{DedupProcessor, ProcessOutcome};
pub use safepoint::{SafepointGuard, SafepointState, SuspendibleSet};
pub use service::DedupService;
pub use stats::{DedupStats, DedupStatsSnapshot};
pub use worker_queue::WorkerQueue;
