//! # Fibonacci Backoff
//!
//! Retry delays for failed reconciliations. The delay grows along the
//! Fibonacci sequence, which ramps up more gently than doubling, and is capped.
//!
//! This only applies to *errors* (list or update failures, timeouts). The
//! 30 second readiness recheck is a fixed interval and never goes through here.
//!
//! Default sequence: 1s, 1s, 2s, 3s, 5s, 8s, ... 233s, 300s (max).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Smallest retry delay in seconds
pub const DEFAULT_MIN_SECONDS: u64 = 1;
/// Largest retry delay in seconds
pub const DEFAULT_MAX_SECONDS: u64 = 300;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Previous backoff value in seconds
    prev_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SECONDS, DEFAULT_MAX_SECONDS)
    }
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with minimum and maximum values in seconds
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;

        let next = self.prev_seconds.saturating_add(self.current_seconds);
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        Duration::from_secs(result)
    }
}

/// Per-node error backoff, shared by all reconciliations.
///
/// A node's sequence advances on every failed reconciliation and is dropped
/// on the next successful one or when the node is deleted.
#[derive(Debug, Default)]
pub struct ErrorBackoffs {
    states: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl ErrorBackoffs {
    /// Delay before retrying `node` after another failure
    pub fn next_delay(&self, node: &str) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.entry(node.to_string()).or_default().next_backoff()
    }

    /// Forget the failure history of `node`
    pub fn reset(&self, node: &str) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(backoff: &mut FibonacciBackoff) -> u64 {
        backoff.next_backoff().as_secs()
    }

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 300);

        assert_eq!(secs(&mut backoff), 1);
        assert_eq!(secs(&mut backoff), 1);
        assert_eq!(secs(&mut backoff), 2);
        assert_eq!(secs(&mut backoff), 3);
        assert_eq!(secs(&mut backoff), 5);
        assert_eq!(secs(&mut backoff), 8);
        assert_eq!(secs(&mut backoff), 13);
    }

    #[test]
    fn test_fibonacci_backoff_max_cap() {
        let mut backoff = FibonacciBackoff::new(1, 10);

        assert_eq!(secs(&mut backoff), 1);
        assert_eq!(secs(&mut backoff), 1);
        assert_eq!(secs(&mut backoff), 2);
        assert_eq!(secs(&mut backoff), 3);
        assert_eq!(secs(&mut backoff), 5);
        assert_eq!(secs(&mut backoff), 8);
        // Next would be 13 (8+5), capped at 10
        assert_eq!(secs(&mut backoff), 10);
        assert_eq!(secs(&mut backoff), 10);
    }

    #[test]
    fn test_error_backoffs_are_per_node() {
        let backoffs = ErrorBackoffs::default();

        assert_eq!(backoffs.next_delay("node-a"), Duration::from_secs(1));
        assert_eq!(backoffs.next_delay("node-a"), Duration::from_secs(1));
        assert_eq!(backoffs.next_delay("node-a"), Duration::from_secs(2));
        // Another node starts from the beginning
        assert_eq!(backoffs.next_delay("node-b"), Duration::from_secs(1));

        backoffs.reset("node-a");
        assert_eq!(backoffs.next_delay("node-a"), Duration::from_secs(1));
    }
}
