//! Dedup consumer thread
//!
//! A single background thread drains every worker's published stack and feeds
//! each candidate to the [`DedupProcessor`].
//!
//! ## Design
//!
//! - **Idle**: under the hub monitor, detach every worker's chain; wait on the
//!   monitor when nothing was published and termination was not requested.
//! - **Processing**: pop each chunk to empty before advancing to `next` and
//!   releasing it, so a safepoint root scan mid-drain still sees every queued
//!   candidate through the consumer's held chains.
//! - **Safepoints**: the thread is in a [`SuspendibleSet`] while it touches
//!   chunks and parks between candidates when a safepoint is requested. It
//!   leaves the set while idle.
//! - **Termination**: drain-to-completion. Already published work is always
//!   processed before the thread exits.

use crate::chunk::Chunk;
use crate::error::{DedupError, Result};
use crate::hub::Hub;
use crate::processor::{DedupProcessor, ProcessOutcome};
use crate::safepoint::SuspendibleSet;
use crate::stats::{DedupStats, PhaseClock};
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

/// Consumer thread state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Waiting for published chunks
    Idle = 0,
    /// Chains detached from the hub, about to be processed
    Draining = 1,
    /// Feeding candidates to the processor
    Processing = 2,
    /// Exited (terminal)
    Done = 3,
}

impl From<u8> for ConsumerState {
    fn from(v: u8) -> Self {
        match v {
            0 => ConsumerState::Idle,
            1 => ConsumerState::Draining,
            2 => ConsumerState::Processing,
            _ => ConsumerState::Done,
        }
    }
}

/// Drained chain held for one worker
type HeldChain<T> = CachePadded<UnsafeCell<Option<Box<Chunk<T>>>>>;

/// State shared between the consumer thread and safepoint visitors
struct ConsumerShared<T> {
    /// Per-worker drained chains. Touched only by the consumer thread, or at
    /// a safepoint while it is parked.
    chains: Box<[HeldChain<T>]>,
    /// Next chain to hand out in `claim`
    claimed: AtomicUsize,
    state: AtomicU8,
}

// SAFETY: the chain cells are only accessed by the consumer thread outside of
// safepoints, and by visitors only while the consumer is parked or gone.
unsafe impl<T: Send> Send for ConsumerShared<T> {}
unsafe impl<T: Send> Sync for ConsumerShared<T> {}

impl<T> ConsumerShared<T> {
    fn new(workers: usize) -> Self {
        Self {
            chains: (0..workers)
                .map(|_| CachePadded::new(UnsafeCell::new(None)))
                .collect(),
            claimed: AtomicUsize::new(0),
            state: AtomicU8::new(ConsumerState::Idle as u8),
        }
    }

    fn chain(&self, worker_id: usize) -> *mut Option<Box<Chunk<T>>> {
        self.chains[worker_id].get()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Handle to the running consumer thread
pub struct ConsumerThread<T: Send + 'static> {
    hub: Arc<Hub<T>>,
    shared: Arc<ConsumerShared<T>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ConsumerThread<T> {
    /// Spawn the consumer for `hub`.
    ///
    /// There must be at most one consumer per hub.
    pub fn start<P>(
        hub: Arc<Hub<T>>,
        processor: P,
        stats: Arc<DedupStats>,
        suspendible: Arc<SuspendibleSet>,
        name: &str,
    ) -> Result<Self>
    where
        P: DedupProcessor<T> + 'static,
    {
        let shared = Arc::new(ConsumerShared::new(hub.worker_count()));
        let consumer = Consumer {
            hub: hub.clone(),
            shared: shared.clone(),
            processor,
            stats,
            suspendible,
            clock: PhaseClock::start(),
            joined: false,
        };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || consumer.run())?;

        Ok(Self {
            hub,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Current state
    pub fn state(&self) -> ConsumerState {
        ConsumerState::from(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether the thread has exited
    pub fn is_done(&self) -> bool {
        self.state() == ConsumerState::Done
    }

    /// Terminate the hub and wait for the consumer to drain everything and
    /// exit. Idempotent.
    ///
    /// Must not be called while holding a safepoint guard of the consumer's
    /// suspendible set.
    pub fn stop(&self) -> Result<()> {
        self.hub.terminate();
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        handle.join().map_err(|_| DedupError::ConsumerPanicked)
    }

    /// Claim the next held chain for parallel root visiting
    pub fn claim(&self) -> Option<usize> {
        let worker_id = self.shared.claimed.fetch_add(1, Ordering::AcqRel);
        (worker_id < self.shared.chains.len()).then_some(worker_id)
    }

    /// Reset the claim counter before the next parallel visit
    pub fn clear_claim(&self) {
        self.shared.claimed.store(0, Ordering::Release);
    }

    /// Visit the held chains this thread manages to claim
    ///
    /// # Safety
    /// The consumer must be parked at a safepoint of its suspendible set, or
    /// have exited.
    pub unsafe fn parallel_visit(&self, visitor: &mut dyn FnMut(&mut T)) {
        while let Some(worker_id) = self.claim() {
            // SAFETY: the consumer is parked, so nothing else holds the chain
            if let Some(chain) = unsafe { (*self.shared.chain(worker_id)).as_mut() } {
                chain.visit_chain(visitor);
            }
        }
    }

    /// Visit every held chain, in worker order
    ///
    /// # Safety
    /// Same contract as [`ConsumerThread::parallel_visit`].
    pub unsafe fn serial_visit(&self, visitor: &mut dyn FnMut(&mut T)) {
        for worker_id in 0..self.shared.chains.len() {
            // SAFETY: forwarded from the caller
            if let Some(chain) = unsafe { (*self.shared.chain(worker_id)).as_mut() } {
                chain.visit_chain(visitor);
            }
        }
    }

    /// Clear held entries `is_alive` rejects and visit the rest
    ///
    /// # Safety
    /// Same contract as [`ConsumerThread::parallel_visit`].
    pub unsafe fn parallel_unlink_or_visit(
        &self,
        is_alive: &mut dyn FnMut(&mut T) -> bool,
    ) -> usize {
        let mut unlinked = 0;
        while let Some(worker_id) = self.claim() {
            // SAFETY: forwarded from the caller
            if let Some(chain) = unsafe { (*self.shared.chain(worker_id)).as_mut() } {
                unlinked += chain.unlink_or_visit_chain(is_alive);
            }
        }
        unlinked
    }
}

impl<T: Send + 'static> Drop for ConsumerThread<T> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// State owned by the consumer thread
struct Consumer<T, P> {
    hub: Arc<Hub<T>>,
    shared: Arc<ConsumerShared<T>>,
    processor: P,
    stats: Arc<DedupStats>,
    suspendible: Arc<SuspendibleSet>,
    clock: PhaseClock,
    /// Whether this thread is currently in the suspendible set
    joined: bool,
}

impl<T, P> Consumer<T, P>
where
    T: Send,
    P: DedupProcessor<T>,
{
    fn run(mut self) {
        self.suspendible.join();
        self.joined = true;

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "otter::gc::dedup",
            workers = self.shared.chains.len(),
            "Dedup consumer started"
        );

        while self.wait_for_work() {
            self.process_chains();
        }
        self.clock.mark_done(&self.stats);

        #[cfg(feature = "gc_logging")]
        {
            let stats = self.stats.snapshot();
            tracing::info!(
                target: "otter::gc::dedup",
                inspected = stats.inspected,
                deduplicated = stats.deduplicated,
                known = stats.known,
                skipped = stats.skipped,
                idle_ms = stats.idle_time.as_millis() as u64,
                exec_ms = stats.exec_time.as_millis() as u64,
                block_ms = stats.block_time.as_millis() as u64,
                "Dedup consumer stopped"
            );
        }
    }

    /// Block until chains were drained (true) or the hub terminated with
    /// nothing left (false)
    fn wait_for_work(&mut self) -> bool {
        self.shared.set_state(ConsumerState::Idle);
        let hub = Arc::clone(&self.hub);
        let mut guard = hub.lock_monitor();
        loop {
            let drained = self.drain_all();
            if drained > 0 {
                self.shared.set_state(ConsumerState::Draining);
                #[cfg(feature = "gc_logging")]
                tracing::debug!(
                    target: "otter::gc::dedup",
                    chains = drained,
                    "Dedup consumer drained published chunks"
                );
                return true;
            }
            if hub.has_terminated() {
                return false;
            }

            self.clock.mark_idle(&self.stats);
            self.suspendible.leave();
            self.joined = false;
            hub.wait(&mut guard);
            // Rejoin without the monitor so producers are never stuck
            // behind a safepoint
            MutexGuard::unlocked(&mut guard, || self.suspendible.join());
            self.joined = true;
            self.clock.mark_exec(&self.stats);
        }
    }

    /// Detach every worker's published chain. Returns how many were non-empty.
    fn drain_all(&self) -> usize {
        let mut drained = 0;
        for worker_id in 0..self.shared.chains.len() {
            if let Some(chain) = self.hub.drain(worker_id) {
                // SAFETY: only the consumer thread writes held chains, and
                // it is joined, so no safepoint visitor is running.
                let held = unsafe { &mut *self.shared.chain(worker_id) };
                debug_assert!(held.is_none(), "held chain not fully processed");
                *held = Some(chain);
                drained += 1;
            }
        }
        drained
    }

    fn process_chains(&mut self) {
        self.shared.set_state(ConsumerState::Processing);
        for worker_id in 0..self.shared.chains.len() {
            while let Some(candidate) = self.next_candidate(worker_id) {
                let outcome = match candidate {
                    Some(candidate) => self.processor.process(candidate),
                    None => ProcessOutcome::Skipped,
                };
                self.stats.record(outcome);

                if self.suspendible.should_yield() {
                    self.clock.mark_block(&self.stats);
                    self.suspendible.yield_now();
                    self.clock.mark_unblock(&self.stats);
                }
            }
        }
    }

    /// Pop the next entry of `worker_id`'s held chain, releasing each chunk
    /// only once it is empty.
    ///
    /// `None` when the chain is exhausted; `Some(None)` for an unlinked entry.
    fn next_candidate(&mut self, worker_id: usize) -> Option<Option<T>> {
        // SAFETY: see `drain_all`. The reference does not outlive this call,
        // so it is never held across a yield point.
        let held = unsafe { &mut *self.shared.chain(worker_id) };
        loop {
            let head = held.as_mut()?;
            if !head.is_empty() {
                return Some(head.pop());
            }
            let mut emptied = held.take()?;
            *held = emptied.take_next();
            self.hub.release(emptied);
        }
    }
}

impl<T, P> Drop for Consumer<T, P> {
    fn drop(&mut self) {
        if self.joined {
            self.suspendible.leave();
        }
        self.shared.set_state(ConsumerState::Done);
    }
}
