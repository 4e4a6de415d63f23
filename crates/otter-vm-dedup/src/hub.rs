//! Shared hub between marking workers and the dedup consumer
//!
//! ## Design
//!
//! - **Per-worker stacks**: each worker publishes full chunks onto its own
//!   lock-free stack. Only the consumer clears a stack (by swapping it to
//!   null), so the push CAS has no ABA hazard.
//! - **Chunk pool**: recycled chunks live on a free-list guarded by the
//!   monitor mutex, capped at `free_list_factor * workers`.
//! - **Monitor**: the same mutex plus a condvar wakes the consumer on publish
//!   and on termination.
//! - **Root visits**: current chunks and published stacks can be visited at a
//!   safepoint, when no producer or consumer is running.

use crate::chunk::Chunk;
use crate::config::DedupConfig;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashSet;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Per-worker state
struct WorkerSlot<T> {
    /// Head of the published chunk stack
    stack: AtomicPtr<Chunk<T>>,
    /// Chunk the attached queue is filling.
    /// Touched only by the attached `WorkerQueue`, or at a safepoint.
    current: UnsafeCell<Option<Box<Chunk<T>>>>,
    /// Whether a `WorkerQueue` is attached
    attached: AtomicBool,
}

impl<T> WorkerSlot<T> {
    fn new() -> Self {
        Self {
            stack: AtomicPtr::new(ptr::null_mut()),
            current: UnsafeCell::new(None),
            attached: AtomicBool::new(false),
        }
    }
}

/// Recycled chunks plus allocation counters. Guarded by the hub monitor.
pub(crate) struct ChunkPool<T> {
    free: Vec<Box<Chunk<T>>>,
    max_free: usize,
    /// Chunks currently alive (free or in use)
    live: usize,
    created: u64,
    destroyed: u64,
}

impl<T> ChunkPool<T> {
    fn new(max_free: usize) -> Self {
        Self {
            free: Vec::with_capacity(max_free),
            max_free,
            live: 0,
            created: 0,
            destroyed: 0,
        }
    }

    fn take(&mut self) -> Box<Chunk<T>> {
        match self.free.pop() {
            Some(chunk) => {
                debug_assert!(chunk.is_empty() && !chunk.has_next());
                chunk
            }
            None => {
                self.live += 1;
                self.created += 1;
                Chunk::new()
            }
        }
    }

    fn give(&mut self, mut chunk: Box<Chunk<T>>) {
        chunk.reset();
        if self.free.len() < self.max_free {
            self.free.push(chunk);
        } else {
            self.live -= 1;
            self.destroyed += 1;
            #[cfg(feature = "gc_logging")]
            tracing::trace!(
                target: "otter::gc::dedup",
                free = self.free.len(),
                live = self.live,
                "Destroyed surplus dedup chunk"
            );
        }
    }
}

/// Chunk pool counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Chunks currently on the free-list
    pub free_chunks: usize,
    /// Free-list cap
    pub max_free_chunks: usize,
    /// Chunks alive anywhere in the pipeline
    pub live_chunks: usize,
    /// Chunks ever allocated
    pub created: u64,
    /// Chunks destroyed because the free-list was full
    pub destroyed: u64,
}

/// Where the chunks of a hub are, as found by [`Hub::verify`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCensus {
    /// Chunks held as workers' current chunks
    pub current: usize,
    /// Chunks published on worker stacks
    pub published: usize,
    /// Chunks on the free-list
    pub free: usize,
    /// Live entries in current and published chunks
    pub entries: usize,
}

/// Hand-off hub shared by all worker queues and the consumer
pub struct Hub<T> {
    workers: Box<[CachePadded<WorkerSlot<T>>]>,
    /// Pool and monitor lock
    pool: Mutex<ChunkPool<T>>,
    /// Wakes the consumer
    monitor: Condvar,
    terminated: AtomicBool,
    /// Next worker to hand out in `claim`
    claimed: AtomicUsize,
}

// SAFETY: stack heads are atomics, the pool is behind a mutex, and each
// `current` cell is touched only by its single attached queue (or at a
// safepoint, when that queue is quiescent). Chunks only move between threads
// as whole owned values.
unsafe impl<T: Send> Send for Hub<T> {}
unsafe impl<T: Send> Sync for Hub<T> {}

impl<T> Hub<T> {
    /// Create a hub for `worker_count` workers with default tuning
    pub fn new(worker_count: usize) -> Arc<Self> {
        Self::with_config(&DedupConfig::with_workers(worker_count))
    }

    /// Create a hub from a configuration
    pub fn with_config(config: &DedupConfig) -> Arc<Self> {
        let workers = (0..config.workers)
            .map(|_| CachePadded::new(WorkerSlot::new()))
            .collect();
        Arc::new(Self {
            workers,
            pool: Mutex::new(ChunkPool::new(config.max_free_chunks())),
            monitor: Condvar::new(),
            terminated: AtomicBool::new(false),
            claimed: AtomicUsize::new(0),
        })
    }

    /// Number of worker queues
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Get a chunk from the free-list, or allocate a new one
    pub fn allocate(&self) -> Box<Chunk<T>> {
        self.pool.lock().take()
    }

    /// Return an emptied chunk to the pool, destroying it if the pool is full
    pub fn release(&self, chunk: Box<Chunk<T>>) {
        debug_assert!(!chunk.has_next(), "released dedup chunk is still linked");
        let mut pool = self.pool.lock();
        pool.give(chunk);
        self.monitor.notify_one();
    }

    /// Push a full chunk onto `worker_id`'s stack and return a fresh one
    pub fn publish(&self, chunk: Box<Chunk<T>>, worker_id: usize) -> Box<Chunk<T>> {
        self.link(chunk, worker_id);
        let mut pool = self.pool.lock();
        let fresh = pool.take();
        self.monitor.notify_one();
        fresh
    }

    /// Push a chunk onto `worker_id`'s stack without taking a replacement
    pub fn publish_last(&self, chunk: Box<Chunk<T>>, worker_id: usize) {
        self.link(chunk, worker_id);
        let _pool = self.pool.lock();
        self.monitor.notify_one();
    }

    fn link(&self, chunk: Box<Chunk<T>>, worker_id: usize) {
        let stack = &self.workers[worker_id].stack;
        let chunk = Box::into_raw(chunk);
        let backoff = Backoff::new();
        let mut head = stack.load(Ordering::Relaxed);
        loop {
            // SAFETY: `chunk` is not visible to anyone else until the CAS
            // succeeds; `head` becomes owned by `chunk` only on success.
            unsafe { (*chunk).next = head };
            match stack.compare_exchange_weak(head, chunk, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Detach `worker_id`'s whole published chain
    pub fn drain(&self, worker_id: usize) -> Option<Box<Chunk<T>>> {
        let head = self.workers[worker_id]
            .stack
            .swap(ptr::null_mut(), Ordering::Acquire);
        if head.is_null() {
            None
        } else {
            // SAFETY: the swap removed the chain from the stack, so this is now
            // its only owner. Every pushed node came from `Box::into_raw`.
            Some(unsafe { Box::from_raw(head) })
        }
    }

    /// Whether anything is published on `worker_id`'s stack
    pub fn has_published(&self, worker_id: usize) -> bool {
        !self.workers[worker_id].stack.load(Ordering::Acquire).is_null()
    }

    /// Stop the consumer once it has drained everything. Idempotent.
    pub fn terminate(&self) {
        let _pool = self.pool.lock();
        #[cfg(feature = "gc_logging")]
        if !self.terminated.load(Ordering::Relaxed) {
            tracing::debug!(target: "otter::gc::dedup", "Dedup hub terminated");
        }
        self.terminated.store(true, Ordering::Release);
        self.monitor.notify_all();
    }

    /// Whether `terminate` has been called
    pub fn has_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Pool counters
    pub fn pool_stats(&self) -> PoolStats {
        let pool = self.pool.lock();
        PoolStats {
            free_chunks: pool.free.len(),
            max_free_chunks: pool.max_free,
            live_chunks: pool.live,
            created: pool.created,
            destroyed: pool.destroyed,
        }
    }

    /// Claim the next unvisited worker for parallel root visiting
    pub fn claim(&self) -> Option<usize> {
        let worker_id = self.claimed.fetch_add(1, Ordering::AcqRel);
        (worker_id < self.workers.len()).then_some(worker_id)
    }

    /// Reset the claim counter before the next parallel visit
    pub fn clear_claim(&self) {
        self.claimed.store(0, Ordering::Release);
    }

    /// Visit every queued entry of the workers this thread manages to claim.
    ///
    /// Several GC threads may call this concurrently within one safepoint;
    /// each worker is visited by exactly one of them. Call [`Hub::clear_claim`]
    /// once per safepoint before the first call.
    ///
    /// # Safety
    /// No worker queue may push, flush or be dropped, and no thread may drain,
    /// for the duration of the call.
    pub unsafe fn parallel_visit(&self, visitor: &mut dyn FnMut(&mut T)) {
        while let Some(worker_id) = self.claim() {
            // SAFETY: forwarded from the caller
            unsafe { self.visit_worker(worker_id, visitor) };
        }
    }

    /// Visit every queued entry of every worker, in worker order
    ///
    /// # Safety
    /// Same contract as [`Hub::parallel_visit`].
    pub unsafe fn serial_visit(&self, visitor: &mut dyn FnMut(&mut T)) {
        for worker_id in 0..self.workers.len() {
            // SAFETY: forwarded from the caller
            unsafe { self.visit_worker(worker_id, visitor) };
        }
    }

    /// Parallel cleanup: clear entries `is_alive` rejects, visit the rest.
    ///
    /// Returns the number of entries this thread cleared.
    ///
    /// # Safety
    /// Same contract as [`Hub::parallel_visit`].
    pub unsafe fn parallel_unlink_or_visit(
        &self,
        is_alive: &mut dyn FnMut(&mut T) -> bool,
    ) -> usize {
        let mut unlinked = 0;
        while let Some(worker_id) = self.claim() {
            let slot = &self.workers[worker_id];
            // SAFETY: the caller guarantees quiescence, so nothing else holds
            // the current chunk or any published chunk.
            unsafe {
                if let Some(chunk) = (*slot.current.get()).as_mut() {
                    unlinked += chunk.unlink_or_visit(is_alive);
                }
                if let Some(chain) = slot.stack.load(Ordering::Acquire).as_mut() {
                    unlinked += chain.unlink_or_visit_chain(is_alive);
                }
            }
        }
        unlinked
    }

    unsafe fn visit_worker(&self, worker_id: usize, visitor: &mut dyn FnMut(&mut T)) {
        let slot = &self.workers[worker_id];
        // SAFETY: the caller guarantees quiescence, so nothing else holds the
        // current chunk or any published chunk.
        unsafe {
            if let Some(chunk) = (*slot.current.get()).as_mut() {
                chunk.visit(visitor);
            }
            if let Some(chain) = slot.stack.load(Ordering::Acquire).as_mut() {
                chain.visit_chain(visitor);
            }
        }
    }

    /// Check that no chunk is reachable twice and the pool respects its cap.
    ///
    /// Panics on a violated invariant.
    ///
    /// # Safety
    /// Same contract as [`Hub::parallel_visit`].
    pub unsafe fn verify(&self) -> ChunkCensus {
        let mut census = ChunkCensus::default();
        let mut seen: FxHashSet<*const Chunk<T>> = FxHashSet::default();
        let mut record = |chunk: &Chunk<T>| {
            assert!(
                seen.insert(chunk as *const Chunk<T>),
                "dedup chunk reachable from two owners"
            );
        };

        for slot in self.workers.iter() {
            // SAFETY: forwarded from the caller
            unsafe {
                if let Some(chunk) = (*slot.current.get()).as_ref() {
                    assert!(!chunk.has_next(), "current dedup chunk is linked");
                    record(chunk);
                    census.current += 1;
                    census.entries += chunk.len();
                }
                let mut cursor = slot.stack.load(Ordering::Acquire);
                while let Some(chunk) = cursor.as_ref() {
                    record(chunk);
                    census.published += 1;
                    census.entries += chunk.len();
                    cursor = chunk.next;
                }
            }
        }

        let pool = self.pool.lock();
        assert!(pool.free.len() <= pool.max_free, "dedup free-list over its cap");
        for chunk in &pool.free {
            assert!(chunk.is_empty() && !chunk.has_next(), "dirty chunk on free-list");
            record(chunk);
        }
        census.free = pool.free.len();
        census
    }

    /// Attach the single writer for `worker_id`. Returns false if one is
    /// already attached.
    pub(crate) fn try_attach(&self, worker_id: usize) -> bool {
        self.workers[worker_id]
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn detach(&self, worker_id: usize) {
        self.workers[worker_id]
            .attached
            .store(false, Ordering::Release);
    }

    /// Cell holding `worker_id`'s current chunk. Only the attached queue may
    /// dereference it outside a safepoint.
    pub(crate) fn current_chunk(&self, worker_id: usize) -> *mut Option<Box<Chunk<T>>> {
        self.workers[worker_id].current.get()
    }

    pub(crate) fn lock_monitor(&self) -> MutexGuard<'_, ChunkPool<T>> {
        self.pool.lock()
    }

    pub(crate) fn wait(&self, guard: &mut MutexGuard<'_, ChunkPool<T>>) {
        self.monitor.wait(guard);
    }
}

impl<T> Drop for Hub<T> {
    fn drop(&mut self) {
        let mut dropped = 0usize;
        for worker_id in 0..self.workers.len() {
            let mut chain = self.drain(worker_id);
            while let Some(mut chunk) = chain {
                chain = chunk.take_next();
                dropped += chunk.len();
            }
            if let Some(chunk) = self.workers[worker_id].current.get_mut().take() {
                dropped += chunk.len();
            }
        }
        #[cfg(feature = "gc_logging")]
        if dropped > 0 {
            tracing::debug!(
                target: "otter::gc::dedup",
                entries = dropped,
                "Dedup hub dropped with unprocessed candidates"
            );
        }
        let _ = dropped;
    }
}
