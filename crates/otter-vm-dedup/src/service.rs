//! Dedup pipeline owned by a collector
//!
//! Bundles the hub, the consumer thread, the suspendible set and the
//! statistics into one instance that lives exactly as long as the collector.

use crate::config::DedupConfig;
use crate::consumer::{ConsumerState, ConsumerThread};
use crate::error::Result;
use crate::hub::{Hub, PoolStats};
use crate::processor::DedupProcessor;
use crate::safepoint::{SafepointGuard, SuspendibleSet};
use crate::stats::{DedupStats, DedupStatsSnapshot};
use crate::worker_queue::WorkerQueue;
use std::sync::Arc;

/// Running dedup pipeline. Dropping it stops the consumer thread.
pub struct DedupService<T: Send + 'static> {
    config: DedupConfig,
    hub: Arc<Hub<T>>,
    consumer: ConsumerThread<T>,
    stats: Arc<DedupStats>,
    suspendible: Arc<SuspendibleSet>,
}

impl<T: Send + 'static> DedupService<T> {
    /// Validate `config`, build the hub and start the consumer thread
    pub fn new<P>(config: DedupConfig, processor: P) -> Result<Self>
    where
        P: DedupProcessor<T> + 'static,
    {
        config.validate()?;
        let hub = Hub::with_config(&config);
        let stats = Arc::new(DedupStats::new());
        let suspendible = Arc::new(SuspendibleSet::new());
        let consumer = ConsumerThread::start(
            hub.clone(),
            processor,
            stats.clone(),
            suspendible.clone(),
            &config.thread_name,
        )?;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc::dedup",
            workers = config.workers,
            max_free_chunks = config.max_free_chunks(),
            "Dedup service initialized"
        );

        Ok(Self {
            config,
            hub,
            consumer,
            stats,
            suspendible,
        })
    }

    /// Configuration the service was built with
    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Shared hub
    pub fn hub(&self) -> &Arc<Hub<T>> {
        &self.hub
    }

    /// Attach the write queue for `worker_id`
    pub fn worker_queue(&self, worker_id: usize) -> Result<WorkerQueue<T>> {
        WorkerQueue::attach(self.hub.clone(), worker_id)
    }

    /// Park the consumer for a safepoint
    pub fn synchronize(&self) -> SafepointGuard<'_> {
        self.suspendible.synchronize()
    }

    /// Reset both claim counters; call once per safepoint before
    /// [`DedupService::parallel_visit`]
    pub fn clear_claimed(&self) {
        self.hub.clear_claim();
        self.consumer.clear_claim();
    }

    /// Visit every still-queued candidate, sharing the work with other GC
    /// threads calling this within the same safepoint
    ///
    /// # Safety
    /// Every producer must be quiescent (no push, flush or queue drop) for
    /// the duration of the call. `safepoint` must come from this service.
    pub unsafe fn parallel_visit(
        &self,
        safepoint: &SafepointGuard<'_>,
        visitor: &mut dyn FnMut(&mut T),
    ) {
        self.debug_check_safepoint(safepoint);
        // SAFETY: producers are quiescent per the caller, and the guard keeps
        // the consumer parked.
        unsafe {
            self.hub.parallel_visit(visitor);
            self.consumer.parallel_visit(visitor);
        }
    }

    /// Single-threaded [`DedupService::parallel_visit`]
    ///
    /// # Safety
    /// Same contract as [`DedupService::parallel_visit`].
    pub unsafe fn serial_visit(
        &self,
        safepoint: &SafepointGuard<'_>,
        visitor: &mut dyn FnMut(&mut T),
    ) {
        self.debug_check_safepoint(safepoint);
        // SAFETY: see `parallel_visit`
        unsafe {
            self.hub.serial_visit(visitor);
            self.consumer.serial_visit(visitor);
        }
    }

    /// Clear queued candidates `is_alive` rejects and visit the rest.
    ///
    /// Returns the number of entries this thread cleared.
    ///
    /// # Safety
    /// Same contract as [`DedupService::parallel_visit`].
    pub unsafe fn parallel_unlink_or_visit(
        &self,
        safepoint: &SafepointGuard<'_>,
        is_alive: &mut dyn FnMut(&mut T) -> bool,
    ) -> usize {
        self.debug_check_safepoint(safepoint);
        // SAFETY: see `parallel_visit`
        unsafe {
            self.hub.parallel_unlink_or_visit(is_alive)
                + self.consumer.parallel_unlink_or_visit(is_alive)
        }
    }

    fn debug_check_safepoint(&self, safepoint: &SafepointGuard<'_>) {
        debug_assert!(
            std::ptr::eq(safepoint.set(), &*self.suspendible),
            "safepoint guard belongs to another dedup service"
        );
    }

    /// Processing statistics
    pub fn stats(&self) -> DedupStatsSnapshot {
        self.stats.snapshot()
    }

    /// Chunk pool counters
    pub fn pool_stats(&self) -> PoolStats {
        self.hub.pool_stats()
    }

    /// Consumer thread state
    pub fn consumer_state(&self) -> ConsumerState {
        self.consumer.state()
    }

    /// Whether the hub was terminated
    pub fn has_terminated(&self) -> bool {
        self.hub.has_terminated()
    }

    /// Terminate, wait for the consumer to finish all published work, and
    /// return the final statistics. Idempotent.
    pub fn stop(&self) -> Result<DedupStatsSnapshot> {
        self.consumer.stop()?;
        Ok(self.stats.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DedupError;
    use crate::processor::ProcessOutcome;

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = DedupService::<u32>::new(DedupConfig::with_workers(0), |_: u32| {
            ProcessOutcome::Skipped
        });
        assert!(matches!(result, Err(DedupError::InvalidConfig(_))));
    }

    #[test]
    fn test_lifecycle() {
        let service =
            DedupService::<u32>::new(DedupConfig::with_workers(2), |_: u32| ProcessOutcome::Deduplicated)
                .unwrap();
        assert!(!service.has_terminated());
        {
            let mut queue = service.worker_queue(1).unwrap();
            queue.push(1);
            queue.push(2);
        }

        let stats = service.stop().unwrap();
        assert!(service.has_terminated());
        assert_eq!(service.consumer_state(), ConsumerState::Done);
        assert_eq!(stats.inspected, 2);
        assert_eq!(stats.deduplicated, 2);

        // Second stop is a no-op
        assert_eq!(service.stop().unwrap().inspected, 2);
    }

    #[test]
    fn test_serial_visit_with_idle_consumer() {
        let service =
            DedupService::<u32>::new(DedupConfig::with_workers(1), |_: u32| ProcessOutcome::Skipped)
                .unwrap();
        let mut queue = service.worker_queue(0).unwrap();
        queue.push(3);
        queue.push(4);

        let mut seen = Vec::new();
        {
            let safepoint = service.synchronize();
            // SAFETY: the only producer is this thread, which is not pushing
            unsafe { service.serial_visit(&safepoint, &mut |v| seen.push(*v)) };
        }
        assert_eq!(seen, vec![3, 4]);

        drop(queue);
        service.stop().unwrap();
    }
}
