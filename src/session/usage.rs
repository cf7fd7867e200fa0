//! Usage tracking for managed sessions
//!
//! Token counts arrive as per-turn deltas and are accumulated; cost arrives as
//! the CLI's running total and is assigned.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::TokenUsage;

/// Thread-safe usage counters for one session
#[derive(Debug, Default)]
pub struct SessionUsage {
    /// Messages sent by the user
    message_count: AtomicU64,
    /// Total input tokens consumed
    input_tokens: AtomicU64,
    /// Total output tokens generated
    output_tokens: AtomicU64,
    /// `f64` bits of the running cost in USD
    cost_bits: AtomicU64,
}

/// Serializable copy of [`SessionUsage`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct UsageSnapshot {
    pub message_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
}

impl SessionUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one user message
    pub fn record_message(&self) -> u64 {
        self.message_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fold in one turn's result
    pub fn record_turn(&self, total_cost_usd: f64, usage: &TokenUsage) {
        self.cost_bits
            .store(total_cost_usd.to_bits(), Ordering::Relaxed);
        self.input_tokens
            .fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    pub fn total_cost_usd(&self) -> f64 {
        f64::from_bits(self.cost_bits.load(Ordering::Relaxed))
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Get total tokens (input + output)
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.load(Ordering::Relaxed) + self.output_tokens.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            message_count: self.message_count(),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            total_cost_usd: self.total_cost_usd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_is_zeroed() {
        let tracker = SessionUsage::new();
        assert_eq!(tracker.snapshot(), UsageSnapshot::default());
    }

    #[test]
    fn test_cost_is_assigned_tokens_accumulate() {
        let tracker = SessionUsage::new();
        tracker.record_turn(0.10, &usage(100, 50));
        tracker.record_turn(0.25, &usage(200, 100));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.input_tokens, 300);
        assert_eq!(snapshot.output_tokens, 150);
        assert!((snapshot.total_cost_usd - 0.25).abs() < f64::EPSILON);
        assert_eq!(tracker.total_tokens(), 450);
    }

    #[test]
    fn test_message_count() {
        let tracker = SessionUsage::new();
        assert_eq!(tracker.record_message(), 1);
        assert_eq!(tracker.record_message(), 2);
        assert_eq!(tracker.message_count(), 2);
    }
}
