// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::RunSummary;
use crate::{
    errors::{HarnessFailure, InfrastructureFault},
    key::InstanceKey,
    test_case::TestCase,
};
use chrono::{DateTime, FixedOffset};
use std::{fmt, sync::Arc, time::Duration};

/// A test event.
///
/// Events are produced by a [`TestRunner`](crate::runner::TestRunner) and passed to the callback
/// given to [`TestRunner::execute`](crate::runner::TestRunner::execute).
#[derive(Clone, Debug)]
pub struct TestEvent {
    /// The time at which the event was generated, including the offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The amount of time elapsed since the start of the test run.
    pub elapsed: Duration,

    /// The kind of test event this is.
    pub kind: TestEventKind,
}

/// The kind of test event this is.
///
/// For each test case, events arrive in the order `TestStarted`, then exactly one of
/// `TestPassed`, `TestFailed` or `TestSkipped`, then `TestFinished`. A skip with
/// [`SkipReason::WillRetry`] is followed by another `TestStarted` on a later attempt.
#[derive(Clone, Debug)]
pub enum TestEventKind {
    /// The test run started.
    RunStarted {
        /// The number of test cases in the run.
        test_count: usize,
    },

    /// A batch attempt started.
    BatchStarted {
        /// The key of the batch, or `None` for tests that run locally.
        key: Option<InstanceKey>,

        /// The zero-based attempt number.
        attempt: usize,

        /// The number of attempts the batch may take.
        max_attempts: usize,

        /// The number of tests in this attempt.
        test_count: usize,
    },

    /// A test started running.
    TestStarted {
        /// The test case.
        test_case: Arc<TestCase>,
    },

    /// A test passed.
    TestPassed {
        /// The test case.
        test_case: Arc<TestCase>,

        /// How long the test took.
        elapsed: Duration,
    },

    /// A test failed. This is always the test's final outcome.
    TestFailed {
        /// The test case.
        test_case: Arc<TestCase>,

        /// Why the test failed.
        failure: TestFailure,

        /// How long the test took.
        elapsed: Duration,
    },

    /// A test was skipped.
    TestSkipped {
        /// The test case.
        test_case: Arc<TestCase>,

        /// Why the test was skipped.
        reason: SkipReason,
    },

    /// A test finished running.
    TestFinished {
        /// The test case.
        test_case: Arc<TestCase>,

        /// How long the test took.
        elapsed: Duration,
    },

    /// A batch attempt finished.
    BatchFinished {
        /// The key of the batch, or `None` for tests that run locally.
        key: Option<InstanceKey>,

        /// The zero-based attempt number.
        attempt: usize,

        /// Counts for this attempt, excluding failures that will be retried.
        summary: RunSummary,

        /// The test cases the batch reported, in the order reported.
        ///
        /// Tests the runner submitted are the same objects as in the other events for this run.
        /// Tests it did not submit are rebuilt from the host's description.
        reported: Vec<Arc<TestCase>>,
    },

    /// An infrastructure fault occurred. Every test that has not completed is reported as failed
    /// after this event.
    InfrastructureFault {
        /// The fault.
        fault: Arc<InfrastructureFault>,

        /// The number of tests that will be reported as failed.
        incomplete: usize,
    },

    /// A cancellation notice was received.
    RunBeginCancel {
        /// The reason the run is being cancelled.
        reason: CancelReason,
    },

    /// The test run finished.
    RunFinished {
        /// The time at which the run was started.
        start_time: DateTime<FixedOffset>,

        /// The amount of time it took for the run to finish.
        elapsed: Duration,

        /// Totals for the whole run.
        summary: RunSummary,
    },
}

/// Why a test failed.
#[derive(Clone, Debug)]
pub enum TestFailure {
    /// The test itself failed.
    Assertion {
        /// The failure message reported by the host or the local runner.
        message: String,
    },

    /// The test did not run because of an infrastructure fault.
    Harness(HarnessFailure),

    /// The host finished the batch without ever reporting this test.
    NotReported,
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assertion { message } => write!(f, "{message}"),
            Self::Harness(failure) => write!(f, "{failure}"),
            Self::NotReported => write!(f, "test was not reported by the host"),
        }
    }
}

/// Why a test was skipped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// The test failed on an attempt that was not the last one, and will run again.
    WillRetry {
        /// The failure message of this attempt.
        message: String,
    },

    /// The host skipped the test.
    Host {
        /// The reason reported by the host.
        reason: String,
    },

    /// The run was cancelled before the test could run.
    Cancelled,
}

impl SkipReason {
    /// Returns true if the test will run again.
    pub fn will_retry(&self) -> bool {
        matches!(self, Self::WillRetry { .. })
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WillRetry { message } => write!(f, "will retry: {message}"),
            Self::Host { reason } => write!(f, "{reason}"),
            Self::Cancelled => write!(f, "run was cancelled"),
        }
    }
}

/// The reason why a test run is being cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CancelReason {
    /// The caller cancelled the run.
    Requested,

    /// An error occurred while reporting results.
    ReportError,
}
