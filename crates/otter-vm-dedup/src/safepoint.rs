//! Suspendible thread set
//!
//! Background threads that touch GC-visible data join the set. A GC thread
//! that needs them quiescent calls [`SuspendibleSet::synchronize`], which
//! waits until every joined thread is parked at a yield point (or has left
//! the set). Dropping the returned guard resumes them.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// Safepoint state of the set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafepointState {
    /// Normal execution
    Running,
    /// A safepoint was requested, joined threads are still running
    Requested,
    /// Every joined thread is parked
    Synchronized,
}

#[derive(Debug, Default)]
struct SetState {
    /// Threads currently in the set
    joined: usize,
    /// Joined threads parked at a yield point
    parked: usize,
    /// A safepoint is requested or in progress
    synchronizing: bool,
}

/// Set of threads that yield to safepoints
#[derive(Debug, Default)]
pub struct SuspendibleSet {
    /// Fast-path flag polled by joined threads
    should_yield: AtomicBool,
    state: Mutex<SetState>,
    condvar: Condvar,
}

impl SuspendibleSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the set. Blocks while a safepoint is in progress.
    pub fn join(&self) {
        let mut state = self.state.lock();
        while state.synchronizing {
            self.condvar.wait(&mut state);
        }
        state.joined += 1;
    }

    /// Leave the set. A pending safepoint no longer waits for this thread.
    pub fn leave(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.joined > 0, "leave without join");
        state.joined -= 1;
        if state.synchronizing {
            self.condvar.notify_all();
        }
    }

    /// Whether a joined thread should call [`SuspendibleSet::yield_now`]
    #[inline]
    pub fn should_yield(&self) -> bool {
        self.should_yield.load(Ordering::Acquire)
    }

    /// Park until the current safepoint is over. Returns immediately when no
    /// safepoint is requested.
    pub fn yield_now(&self) {
        let mut state = self.state.lock();
        if !state.synchronizing {
            return;
        }
        state.parked += 1;
        self.condvar.notify_all();
        while state.synchronizing {
            self.condvar.wait(&mut state);
        }
        state.parked -= 1;
    }

    /// Request a safepoint and wait until all joined threads are parked
    pub fn synchronize(&self) -> SafepointGuard<'_> {
        let mut state = self.state.lock();
        // One safepoint at a time
        while state.synchronizing {
            self.condvar.wait(&mut state);
        }
        state.synchronizing = true;
        self.should_yield.store(true, Ordering::Release);
        while state.parked < state.joined {
            self.condvar.wait(&mut state);
        }
        SafepointGuard { set: self }
    }

    /// Current safepoint state
    pub fn state(&self) -> SafepointState {
        let state = self.state.lock();
        if !state.synchronizing {
            SafepointState::Running
        } else if state.parked < state.joined {
            SafepointState::Requested
        } else {
            SafepointState::Synchronized
        }
    }

    /// Number of threads currently in the set
    pub fn joined(&self) -> usize {
        self.state.lock().joined
    }

    fn desynchronize(&self) {
        let mut state = self.state.lock();
        state.synchronizing = false;
        self.should_yield.store(false, Ordering::Release);
        self.condvar.notify_all();
    }
}

/// Proof that a safepoint is in progress. Resumes the set on drop.
#[must_use = "the safepoint ends when the guard is dropped"]
#[derive(Debug)]
pub struct SafepointGuard<'a> {
    set: &'a SuspendibleSet,
}

impl SafepointGuard<'_> {
    /// The set this safepoint suspended
    pub fn set(&self) -> &SuspendibleSet {
        self.set
    }
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.set.desynchronize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_synchronize_with_no_threads() {
        let set = SuspendibleSet::new();
        assert_eq!(set.state(), SafepointState::Running);
        {
            let _guard = set.synchronize();
            assert!(set.should_yield());
            assert_eq!(set.state(), SafepointState::Synchronized);
        }
        assert!(!set.should_yield());
        assert_eq!(set.state(), SafepointState::Running);
    }

    #[test]
    fn test_yield_without_request_returns() {
        let set = SuspendibleSet::new();
        set.join();
        assert!(!set.should_yield());
        set.yield_now();
        set.leave();
        assert_eq!(set.joined(), 0);
    }

    #[test]
    fn test_synchronize_waits_for_joined_thread() {
        let set = Arc::new(SuspendibleSet::new());
        let progress = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        set.join();
        let handle = {
            let set = set.clone();
            let progress = progress.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                // Joined on behalf of this thread above
                while !stop.load(Ordering::Acquire) {
                    progress.fetch_add(1, Ordering::Relaxed);
                    if set.should_yield() {
                        set.yield_now();
                    }
                    thread::yield_now();
                }
                set.leave();
            })
        };

        {
            let _guard = set.synchronize();
            assert_eq!(set.state(), SafepointState::Synchronized);
            let before = progress.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(20));
            assert_eq!(progress.load(Ordering::Relaxed), before);
        }

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
        assert_eq!(set.joined(), 0);
    }

    #[test]
    fn test_join_blocks_during_safepoint() {
        let set = Arc::new(SuspendibleSet::new());
        let joined = Arc::new(AtomicBool::new(false));

        let guard = set.synchronize();
        let handle = {
            let set = set.clone();
            let joined = joined.clone();
            thread::spawn(move || {
                set.join();
                joined.store(true, Ordering::Release);
                set.leave();
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!joined.load(Ordering::Acquire));
        drop(guard);

        handle.join().unwrap();
        assert!(joined.load(Ordering::Acquire));
    }
}
