// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{MessageError, RemoteTestCase};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// A lifecycle or result message sent by the test host while it runs a batch.
///
/// For each test case, the host sends `TestCaseStarting`, then `TestStarting`, one of
/// `TestPassed`, `TestFailed` or `TestSkipped`, then `TestFinished` and `TestCaseFinished`.
/// The batch is bracketed by `BatchStarting` and `BatchFinished`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RemoteMessage {
    /// The host is about to start running the batch.
    BatchStarting,

    /// A test case is about to start.
    TestCaseStarting {
        /// The test case.
        test_case: RemoteTestCase,
    },

    /// The test body of a test case is about to run.
    TestStarting {
        /// The ID of the test case.
        unique_id: SmolStr,
    },

    /// The test passed.
    TestPassed {
        /// The ID of the test case.
        unique_id: SmolStr,

        /// How long the test took.
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },

    /// The test failed.
    TestFailed {
        /// The ID of the test case.
        unique_id: SmolStr,

        /// The failure message.
        message: String,

        /// How long the test took.
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },

    /// The test was skipped by the host.
    TestSkipped {
        /// The ID of the test case.
        unique_id: SmolStr,

        /// Why the test was skipped.
        reason: String,
    },

    /// The test body finished.
    TestFinished {
        /// The ID of the test case.
        unique_id: SmolStr,

        /// How long the test took.
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },

    /// A test case finished.
    TestCaseFinished {
        /// The test case.
        test_case: RemoteTestCase,

        /// Totals for this test case.
        totals: BatchTotals,
    },

    /// The host finished running the batch.
    BatchFinished {
        /// Every test case the host ran, in the order it ran them.
        test_cases: Vec<RemoteTestCase>,

        /// Totals for the whole batch.
        totals: BatchTotals,
    },
}

impl RemoteMessage {
    /// Returns the ID of the test case this message is about, if any.
    pub fn unique_id(&self) -> Option<&str> {
        match self {
            Self::BatchStarting | Self::BatchFinished { .. } => None,
            Self::TestCaseStarting { test_case } | Self::TestCaseFinished { test_case, .. } => {
                Some(&test_case.unique_id)
            }
            Self::TestStarting { unique_id }
            | Self::TestPassed { unique_id, .. }
            | Self::TestFailed { unique_id, .. }
            | Self::TestSkipped { unique_id, .. }
            | Self::TestFinished { unique_id, .. } => Some(unique_id),
        }
    }

    /// Parses a message from a single line of JSON.
    pub fn from_json_line(line: &str) -> Result<Self, MessageError> {
        let line = line.trim_end_matches(['\r', '\n']);
        serde_json::from_str(line).map_err(|error| MessageError::Decode {
            line: line.to_owned(),
            error,
        })
    }

    /// Serializes this message as a single line of JSON, including the trailing newline.
    pub fn to_json_line(&self) -> Result<String, MessageError> {
        let mut line = serde_json::to_string(self).map_err(MessageError::Encode)?;
        line.push('\n');
        Ok(line)
    }
}

/// Counts and timing reported for a test case or a batch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchTotals {
    /// The number of tests that ran.
    pub total: usize,

    /// The number of tests that failed.
    pub failed: usize,

    /// The number of tests that were skipped.
    pub skipped: usize,

    /// The time spent running tests.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl BatchTotals {
    /// Totals for a single test with the given outcome.
    pub fn single(failed: bool, skipped: bool, elapsed: Duration) -> Self {
        Self {
            total: 1,
            failed: usize::from(failed),
            skipped: usize::from(skipped),
            elapsed,
        }
    }
}
