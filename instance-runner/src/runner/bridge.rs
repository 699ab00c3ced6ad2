// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relays messages from the test host into runner events.

use crate::{
    pool::MessageSink,
    reporter::{RunSummary, SkipReason, TestEventKind, TestFailure},
    test_case::{TestCase, TestCaseId},
};
use instance_metadata::{BatchTotals, RemoteMessage, RemoteTestCase};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// The test case the host is currently running, if any.
///
/// Cloning the handle shares the underlying slot, so diagnostic capture (screenshots, logs) can
/// read it from any thread while a batch runs.
#[derive(Clone, Debug, Default)]
pub struct CurrentTestCase {
    slot: Arc<Mutex<Option<Arc<TestCase>>>>,
}

impl CurrentTestCase {
    /// Returns the test case that is currently running.
    pub fn get(&self) -> Option<Arc<TestCase>> {
        self.lock().clone()
    }

    fn set(&self, test_case: Option<Arc<TestCase>>) {
        *self.lock() = test_case;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<TestCase>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What an attempt achieved, as observed by the bridge.
#[derive(Debug)]
pub(super) struct BridgeOutcome {
    /// Tests that need no further attempts.
    pub(super) completed: HashSet<TestCaseId>,

    /// Counts for the attempt, excluding failures that will be retried.
    pub(super) summary: RunSummary,

    /// The test cases the host reported at the end of the batch, mapped to local objects.
    pub(super) reported: Vec<Arc<TestCase>>,
}

/// Receives messages from the host for one batch attempt.
#[derive(Debug)]
pub(super) struct ExecutionBridge {
    known: Arc<HashMap<TestCaseId, Arc<TestCase>>>,
    // Test cases the host mentioned that are not known locally, so that repeated mentions map to
    // the same object.
    reconstructed: HashMap<TestCaseId, Arc<TestCase>>,
    is_final: bool,
    completed: HashSet<TestCaseId>,
    retried: usize,
    // Tests with a final outcome event, and the counts those events add up to.
    settled: HashSet<TestCaseId>,
    settled_summary: RunSummary,
    reported: Vec<Arc<TestCase>>,
    current: CurrentTestCase,
    cancel: CancellationToken,
    events: UnboundedSender<TestEventKind>,
}

impl ExecutionBridge {
    pub(super) fn new(
        known: Arc<HashMap<TestCaseId, Arc<TestCase>>>,
        is_final: bool,
        current: CurrentTestCase,
        cancel: CancellationToken,
        events: UnboundedSender<TestEventKind>,
    ) -> Self {
        Self {
            known,
            reconstructed: HashMap::new(),
            is_final,
            completed: HashSet::new(),
            retried: 0,
            settled: HashSet::new(),
            settled_summary: RunSummary::default(),
            reported: Vec::new(),
            current,
            cancel,
            events,
        }
    }

    /// Consumes the bridge once the host has returned the totals for the batch.
    pub(super) fn finish(self, totals: BatchTotals) -> BridgeOutcome {
        self.current.set(None);
        BridgeOutcome {
            completed: self.completed,
            summary: RunSummary::from_attempt(totals, self.retried),
            reported: self.reported,
        }
    }

    /// Consumes the bridge after the host failed partway through the batch.
    ///
    /// The host's totals are lost, so the outcome is built from the outcome events already
    /// relayed. Those tests keep their results and need no further attempts.
    pub(super) fn abandon(self) -> BridgeOutcome {
        self.current.set(None);
        let mut completed = self.completed;
        completed.extend(self.settled);
        BridgeOutcome {
            completed,
            summary: self.settled_summary,
            reported: self.reported,
        }
    }

    fn settle(&mut self, test_case: &TestCase, outcome: RunSummary) {
        if self.settled.insert(test_case.id().clone()) {
            self.settled_summary += outcome;
        }
    }

    /// Returns the local object for a test case the host sent back.
    ///
    /// Known IDs map to the exact object the runner sent. Anything else is rebuilt once and
    /// reused for later mentions.
    fn resolve_remote(&mut self, remote: &RemoteTestCase) -> Arc<TestCase> {
        if let Some(local) = self.known.get(remote.unique_id.as_str()) {
            return local.clone();
        }
        self.reconstructed
            .entry(TestCaseId::new(remote.unique_id.clone()))
            .or_insert_with(|| {
                let rebuilt = TestCase::from_remote(remote);
                debug!(
                    id = %rebuilt.id(),
                    kind = ?rebuilt.kind(),
                    "host reported a test case that is not known locally"
                );
                Arc::new(rebuilt)
            })
            .clone()
    }

    fn resolve_id(&mut self, unique_id: &str) -> Arc<TestCase> {
        if let Some(local) = self.known.get(unique_id) {
            return local.clone();
        }
        self.reconstructed
            .entry(TestCaseId::new(unique_id))
            .or_insert_with(|| Arc::new(TestCase::generic(unique_id)))
            .clone()
    }

    fn send(&self, kind: TestEventKind) {
        // The receiver only goes away once the run is over, at which point events from a
        // detached attempt are of no interest.
        let _ = self.events.send(kind);
    }
}

impl MessageSink for ExecutionBridge {
    fn on_message(&mut self, message: RemoteMessage) -> bool {
        trace!(?message, "received message from host");

        match message {
            RemoteMessage::BatchStarting => {}
            RemoteMessage::TestCaseStarting { test_case } => {
                let test_case = self.resolve_remote(&test_case);
                self.current.set(Some(test_case));
            }
            RemoteMessage::TestStarting { unique_id } => {
                let test_case = self.resolve_id(&unique_id);
                self.send(TestEventKind::TestStarted { test_case });
            }
            RemoteMessage::TestPassed { unique_id, elapsed } => {
                let test_case = self.resolve_id(&unique_id);
                self.settle(
                    &test_case,
                    RunSummary {
                        total: 1,
                        elapsed,
                        ..RunSummary::default()
                    },
                );
                self.send(TestEventKind::TestPassed { test_case, elapsed });
            }
            RemoteMessage::TestFailed {
                unique_id,
                message,
                elapsed,
            } => {
                let test_case = self.resolve_id(&unique_id);
                if self.is_final {
                    self.settle(
                        &test_case,
                        RunSummary {
                            elapsed,
                            ..RunSummary::all_failed(1)
                        },
                    );
                    self.send(TestEventKind::TestFailed {
                        test_case,
                        failure: TestFailure::Assertion { message },
                        elapsed,
                    });
                } else {
                    debug!(id = %test_case.id(), "test failed, will retry");
                    self.retried += 1;
                    self.send(TestEventKind::TestSkipped {
                        test_case,
                        reason: SkipReason::WillRetry { message },
                    });
                }
            }
            RemoteMessage::TestSkipped { unique_id, reason } => {
                let test_case = self.resolve_id(&unique_id);
                self.settle(&test_case, RunSummary::all_skipped(1));
                self.send(TestEventKind::TestSkipped {
                    test_case,
                    reason: SkipReason::Host { reason },
                });
            }
            RemoteMessage::TestFinished { unique_id, elapsed } => {
                let test_case = self.resolve_id(&unique_id);
                self.send(TestEventKind::TestFinished { test_case, elapsed });
            }
            RemoteMessage::TestCaseFinished { test_case, totals } => {
                let test_case = self.resolve_remote(&test_case);
                if self.is_final || totals.failed == 0 {
                    self.completed.insert(test_case.id().clone());
                }
                self.current.set(None);
            }
            RemoteMessage::BatchFinished { test_cases, totals } => {
                debug!(
                    total = totals.total,
                    failed = totals.failed,
                    skipped = totals.skipped,
                    "host finished batch"
                );
                self.reported = test_cases
                    .iter()
                    .map(|test_case| self.resolve_remote(test_case))
                    .collect();
            }
        }

        !self.cancel.is_cancelled()
    }
}
