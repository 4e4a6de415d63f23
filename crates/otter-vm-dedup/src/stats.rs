//! Dedup statistics

use crate::processor::ProcessOutcome;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic counters updated by the consumer thread
#[derive(Debug, Default)]
pub struct DedupStats {
    inspected: AtomicU64,
    deduplicated: AtomicU64,
    known: AtomicU64,
    skipped: AtomicU64,
    idle: AtomicU64,
    exec: AtomicU64,
    block: AtomicU64,
    idle_nanos: AtomicU64,
    exec_nanos: AtomicU64,
    block_nanos: AtomicU64,
}

impl DedupStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one processed candidate
    pub fn record(&self, outcome: ProcessOutcome) {
        self.inspected.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            ProcessOutcome::Deduplicated => &self.deduplicated,
            ProcessOutcome::AlreadyKnown => &self.known,
            ProcessOutcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters out
    pub fn snapshot(&self) -> DedupStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DedupStatsSnapshot {
            inspected: load(&self.inspected),
            deduplicated: load(&self.deduplicated),
            known: load(&self.known),
            skipped: load(&self.skipped),
            idle_count: load(&self.idle),
            exec_count: load(&self.exec),
            block_count: load(&self.block),
            idle_time: Duration::from_nanos(load(&self.idle_nanos)),
            exec_time: Duration::from_nanos(load(&self.exec_nanos)),
            block_time: Duration::from_nanos(load(&self.block_nanos)),
        }
    }
}

/// Point-in-time copy of [`DedupStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupStatsSnapshot {
    /// Candidates taken off the queue
    pub inspected: u64,
    /// Candidates replaced by a known equal payload
    pub deduplicated: u64,
    /// Candidates recorded as the canonical copy
    pub known: u64,
    /// Stale, unlinked or ineligible candidates
    pub skipped: u64,
    /// Times the consumer went idle
    pub idle_count: u64,
    /// Times the consumer woke up to work
    pub exec_count: u64,
    /// Times the consumer parked for a safepoint
    pub block_count: u64,
    /// Time spent waiting for work
    pub idle_time: Duration,
    /// Time spent processing
    pub exec_time: Duration,
    /// Time spent parked for safepoints
    pub block_time: Duration,
}

impl fmt::Display for DedupStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Inspected: {:>12}", self.inspected)?;
        writeln!(f, "    Skipped: {:>12}", self.skipped)?;
        writeln!(f, "    Deduped: {:>12}", self.deduplicated)?;
        writeln!(f, "      Known: {:>12}", self.known)?;
        write!(
            f,
            " Idle: {:.3}ms Exec: {:.3}ms Block: {:.3}ms",
            self.idle_time.as_secs_f64() * 1000.0,
            self.exec_time.as_secs_f64() * 1000.0,
            self.block_time.as_secs_f64() * 1000.0,
        )
    }
}

/// Attributes consumer wall time to idle / exec / block phases.
///
/// Owned by the consumer thread only.
#[derive(Debug)]
pub(crate) struct PhaseClock {
    start: Instant,
}

impl PhaseClock {
    pub(crate) fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    fn lap(&mut self) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.start).as_nanos() as u64;
        self.start = now;
        elapsed
    }

    /// Going idle: close the exec phase
    pub(crate) fn mark_idle(&mut self, stats: &DedupStats) {
        stats.exec_nanos.fetch_add(self.lap(), Ordering::Relaxed);
        stats.idle.fetch_add(1, Ordering::Relaxed);
    }

    /// Woke up: close the idle phase
    pub(crate) fn mark_exec(&mut self, stats: &DedupStats) {
        stats.idle_nanos.fetch_add(self.lap(), Ordering::Relaxed);
        stats.exec.fetch_add(1, Ordering::Relaxed);
    }

    /// Parking for a safepoint: close the exec phase
    pub(crate) fn mark_block(&mut self, stats: &DedupStats) {
        stats.exec_nanos.fetch_add(self.lap(), Ordering::Relaxed);
        stats.block.fetch_add(1, Ordering::Relaxed);
    }

    /// Resumed after a safepoint
    pub(crate) fn mark_unblock(&mut self, stats: &DedupStats) {
        stats.block_nanos.fetch_add(self.lap(), Ordering::Relaxed);
    }

    /// Exiting
    pub(crate) fn mark_done(&mut self, stats: &DedupStats) {
        stats.exec_nanos.fetch_add(self.lap(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_record_outcomes() {
        let stats = DedupStats::new();
        stats.record(ProcessOutcome::Deduplicated);
        stats.record(ProcessOutcome::AlreadyKnown);
        stats.record(ProcessOutcome::AlreadyKnown);
        stats.record(ProcessOutcome::Skipped);

        let snap = stats.snapshot();
        assert_eq!(snap.inspected, 4);
        assert_eq!(snap.deduplicated, 1);
        assert_eq!(snap.known, 2);
        assert_eq!(snap.skipped, 1);
    }

    #[test]
    fn test_phase_clock() {
        let stats = DedupStats::new();
        let mut clock = PhaseClock::start();
        clock.mark_idle(&stats);
        thread::sleep(Duration::from_millis(5));
        clock.mark_exec(&stats);
        clock.mark_block(&stats);
        clock.mark_unblock(&stats);
        clock.mark_done(&stats);

        let snap = stats.snapshot();
        assert_eq!(snap.idle_count, 1);
        assert_eq!(snap.exec_count, 1);
        assert_eq!(snap.block_count, 1);
        assert!(snap.idle_time >= Duration::from_millis(5));
    }

    #[test]
    fn test_display() {
        let stats = DedupStats::new();
        stats.record(ProcessOutcome::Deduplicated);
        let text = stats.snapshot().to_string();
        assert!(text.contains("Inspected:"));
        assert!(text.contains("Deduped:"));
        assert!(text.contains("Idle:"));
    }
}
