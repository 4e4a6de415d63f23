//! Processing callback invoked by the consumer thread

/// Result of processing one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The payload was replaced by an equal, already-known one
    Deduplicated,
    /// The payload was recorded as the canonical copy
    AlreadyKnown,
    /// The candidate was stale or not eligible
    Skipped,
}

/// Consumer-side processing engine.
///
/// Called once per drained candidate on the consumer thread. It may block
/// briefly on its own structures but must not block indefinitely, since the
/// consumer only parks for safepoints between candidates.
pub trait DedupProcessor<T>: Send {
    /// Process one candidate
    fn process(&mut self, candidate: T) -> ProcessOutcome;
}

impl<T, F> DedupProcessor<T> for F
where
    F: FnMut(T) -> ProcessOutcome + Send,
{
    fn process(&mut self, candidate: T) -> ProcessOutcome {
        self(candidate)
    }
}
