// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Merging per-batch counts into totals for the run.

use instance_metadata::BatchTotals;
use std::{ops::AddAssign, time::Duration};

/// Counts and timing for a batch attempt, a group of tests, or a whole run.
///
/// Summaries merge additively with `+=`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// The number of tests with a final outcome.
    pub total: usize,

    /// The number of tests that failed.
    pub failed: usize,

    /// The number of tests that were skipped.
    pub skipped: usize,

    /// Time spent running tests.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Summarizes an attempt from the totals reported by the host.
    ///
    /// `retried` is the number of failures that were reported as skips because they will run
    /// again. They are removed from both `total` and `failed`, so that a test that is retried and
    /// then passes is counted once.
    pub fn from_attempt(totals: BatchTotals, retried: usize) -> Self {
        Self {
            total: totals.total.saturating_sub(retried),
            failed: totals.failed.saturating_sub(retried),
            skipped: totals.skipped,
            elapsed: totals.elapsed,
        }
    }

    /// A summary for `count` tests that all failed without running.
    pub fn all_failed(count: usize) -> Self {
        Self {
            total: count,
            failed: count,
            ..Self::default()
        }
    }

    /// A summary for `count` tests that were all skipped.
    pub fn all_skipped(count: usize) -> Self {
        Self {
            total: count,
            skipped: count,
            ..Self::default()
        }
    }

    /// Returns the number of tests that passed.
    pub fn passed(&self) -> usize {
        self.total
            .saturating_sub(self.failed)
            .saturating_sub(self.skipped)
    }

    /// Returns true if no test failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

impl AddAssign for RunSummary {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.elapsed += other.elapsed;
    }
}
