// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::test_case::TestCase;
use std::time::Duration;

/// Runs tests that do not need an instance.
pub trait LocalRunner: Send + Sync {
    /// Runs a single test case in the current process.
    fn run_test(&self, test_case: &TestCase) -> LocalTestResult;
}

/// The outcome of a test run by a [`LocalRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LocalTestResult {
    /// The test passed.
    Passed {
        /// How long the test took.
        elapsed: Duration,
    },

    /// The test failed.
    Failed {
        /// The failure message.
        message: String,

        /// How long the test took.
        elapsed: Duration,
    },

    /// The test was skipped.
    Skipped {
        /// Why the test was skipped.
        reason: String,
    },
}

/// The local runner used when none is configured. Every local test is skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLocalRunner;

impl LocalRunner for NoLocalRunner {
    fn run_test(&self, _test_case: &TestCase) -> LocalTestResult {
        LocalTestResult::Skipped {
            reason: "no local runner is configured".to_owned(),
        }
    }
}
