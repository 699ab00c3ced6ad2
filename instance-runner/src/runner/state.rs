// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-test state tracking.

use std::fmt;

/// The state of a single test case within a run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum TestState {
    /// Waiting to run, either for the first time or after a retryable failure.
    #[default]
    Pending,

    /// Currently running.
    Running,

    /// Failed on an attempt that was not the last one. Reported as a skip.
    FailedRetryable,

    /// Failed on the last attempt, or could not run at all.
    FailedFinal,

    /// Passed.
    Passed,

    /// Skipped by the host, or not run because the run was cancelled.
    Skipped,
}

impl TestState {
    /// Returns true if no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::FailedFinal | Self::Passed | Self::Skipped)
    }

    /// Returns the state after `transition`, or `None` if the transition is not valid from this
    /// state.
    pub fn apply(self, transition: TestTransition) -> Option<Self> {
        use TestTransition::*;

        match (self, transition) {
            (Self::Pending, Start) => Some(Self::Running),
            (Self::Running, Pass) => Some(Self::Passed),
            (Self::Running, FailRetryable) => Some(Self::FailedRetryable),
            (Self::Running, FailFinal) => Some(Self::FailedFinal),
            (Self::Running, Skip) => Some(Self::Skipped),
            (Self::FailedRetryable, Requeue) => Some(Self::Pending),
            _ => None,
        }
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::FailedRetryable => "failed (will retry)",
            Self::FailedFinal => "failed",
            Self::Passed => "passed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// A transition between [`TestState`]s.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TestTransition {
    /// The test started running.
    Start,

    /// The test passed.
    Pass,

    /// The test failed and will be retried.
    FailRetryable,

    /// The test failed for the last time.
    FailFinal,

    /// The test was skipped.
    Skip,

    /// A test that failed earlier is queued for another attempt.
    Requeue,
}
