// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Code to generate JUnit XML reports from test events.

use super::{SkipReason, TestEvent, TestEventKind, TestFailure};
use crate::{
    errors::DisplayErrorChain,
    key::InstanceKey,
    test_case::{TestCase as RunnerTestCase, TestCaseId},
};
use chrono::{DateTime, FixedOffset};
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestRerun, TestSuite};
use std::{collections::HashMap, fmt, time::Duration};

/// Collects test events into a JUnit report.
///
/// Tests are grouped into one suite per instance key, plus one suite for tests that ran locally.
/// Attempts that failed and were retried are recorded as reruns of the final outcome, so a test
/// that eventually passed shows up as flaky.
#[derive(Clone, Debug)]
pub struct JunitCollector {
    report_name: String,
    test_suites: DebugIgnore<IndexMap<SuiteKey, TestSuite>>,
    running: HashMap<TestCaseId, RunningTest>,
    run_timing: Option<(DateTime<FixedOffset>, Duration)>,
}

impl JunitCollector {
    /// Creates a new collector. `report_name` becomes the name of the report.
    pub fn new(report_name: impl Into<String>) -> Self {
        Self {
            report_name: report_name.into(),
            test_suites: DebugIgnore(IndexMap::new()),
            running: HashMap::new(),
            run_timing: None,
        }
    }

    /// Records an event.
    pub fn write_event(&mut self, event: &TestEvent) {
        match &event.kind {
            TestEventKind::RunStarted { .. }
            | TestEventKind::BatchStarted { .. }
            | TestEventKind::BatchFinished { .. }
            | TestEventKind::InfrastructureFault { .. }
            | TestEventKind::RunBeginCancel { .. } => {}
            TestEventKind::TestStarted { test_case } => {
                let running = self
                    .running
                    .entry(test_case.id().clone())
                    .or_insert_with(RunningTest::default);
                running.started_at = Some(event.timestamp);
            }
            TestEventKind::TestPassed { test_case, elapsed } => {
                self.set_status(test_case, TestCaseStatus::success(), *elapsed);
            }
            TestEventKind::TestFailed {
                test_case,
                failure,
                elapsed,
            } => {
                let (kind, ty) = match failure {
                    TestFailure::Assertion { .. } => (NonSuccessKind::Failure, "test failure"),
                    TestFailure::Harness(_) => (NonSuccessKind::Error, "harness failure"),
                    TestFailure::NotReported => (NonSuccessKind::Error, "test not reported"),
                };
                let mut status = TestCaseStatus::non_success(kind);
                status.set_type(ty).set_message(failure.to_string());
                if let TestFailure::Harness(harness) = failure {
                    status.set_description(DisplayErrorChain::new(harness).to_string());
                }
                self.set_status(test_case, status, *elapsed);
            }
            TestEventKind::TestSkipped {
                test_case,
                reason: SkipReason::WillRetry { message },
            } => {
                let running = self
                    .running
                    .entry(test_case.id().clone())
                    .or_insert_with(RunningTest::default);
                let mut rerun = TestRerun::new(NonSuccessKind::Failure);
                rerun.set_type("test failure").set_message(message.as_str());
                if let Some(started_at) = running.started_at {
                    rerun.set_timestamp(started_at);
                    if let Ok(time) = (event.timestamp - started_at).to_std() {
                        rerun.set_time(time);
                    }
                }
                running.reruns.push(rerun);
            }
            TestEventKind::TestSkipped { test_case, reason } => {
                let mut status = TestCaseStatus::skipped();
                status.set_message(reason.to_string());
                self.set_status(test_case, status, Duration::ZERO);
            }
            TestEventKind::TestFinished { test_case, .. } => {
                let Some(running) = self.running.remove(test_case.id()) else {
                    return;
                };
                let Some((mut status, time)) = running.outcome else {
                    // Finished after a will-retry skip; the next attempt reports the outcome.
                    self.running.insert(
                        test_case.id().clone(),
                        RunningTest {
                            started_at: None,
                            reruns: running.reruns,
                            outcome: None,
                        },
                    );
                    return;
                };

                status.add_reruns(running.reruns);
                let key = SuiteKey::for_test_case(test_case);
                let suite_name = key.to_string();
                let mut testcase = TestCase::new(test_case.display_name(), status);
                testcase.set_classname(suite_name.as_str()).set_time(time);
                if let Some(started_at) = running.started_at {
                    testcase.set_timestamp(started_at);
                }

                self.test_suites
                    .entry(key)
                    .or_insert_with(|| TestSuite::new(suite_name))
                    .add_test_case(testcase);
            }
            TestEventKind::RunFinished {
                start_time,
                elapsed,
                ..
            } => {
                self.run_timing = Some((*start_time, *elapsed));
            }
        }
    }

    /// Builds the report from the events recorded so far.
    pub fn finish(mut self) -> Report {
        let mut report = Report::new(self.report_name.as_str());
        if let Some((start_time, elapsed)) = self.run_timing {
            report.set_timestamp(start_time).set_time(elapsed);
        }
        report.add_test_suites(self.test_suites.drain(..).map(|(_, suite)| suite));
        report
    }

    fn set_status(&mut self, test_case: &RunnerTestCase, status: TestCaseStatus, time: Duration) {
        let running = self
            .running
            .entry(test_case.id().clone())
            .or_insert_with(RunningTest::default);
        running.outcome = Some((status, time));
    }
}

#[derive(Clone, Debug, Default)]
struct RunningTest {
    started_at: Option<DateTime<FixedOffset>>,
    reruns: Vec<TestRerun>,
    outcome: Option<(TestCaseStatus, Duration)>,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
enum SuiteKey {
    Instance(InstanceKey),
    Local,
}

impl SuiteKey {
    fn for_test_case(test_case: &RunnerTestCase) -> Self {
        match test_case.required_key() {
            Some(key) => Self::Instance(key.clone()),
            None => Self::Local,
        }
    }
}

impl fmt::Display for SuiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(key) => write!(f, "instance {key}"),
            Self::Local => write!(f, "@local"),
        }
    }
}
