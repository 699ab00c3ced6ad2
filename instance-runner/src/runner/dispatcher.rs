// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for the test runner.
//!
//! This module receives events from the scheduler and the bridge, checks them against the state
//! of each test, and passes them on to the callback.

use super::{TestState, TestTransition};
use crate::{
    reporter::{CancelReason, RunSummary, TestEvent, TestEventKind},
    test_case::{TestCase, TestCaseId},
    time::StopwatchStart,
};
use chrono::Local;
use debug_ignore::DebugIgnore;
use std::collections::HashMap;
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Context for the dispatcher.
#[derive_where::derive_where(Debug)]
pub(super) struct DispatcherContext<F> {
    callback: DebugIgnore<F>,
    stopwatch: StopwatchStart,
    tests: HashMap<TestCaseId, ContextTest>,
    cancel: CancellationToken,
    cancel_state: Option<CancelReason>,
}

impl<F> DispatcherContext<F>
where
    F: FnMut(TestEvent),
{
    pub(super) fn new(callback: F, cancel: CancellationToken) -> Self {
        Self {
            callback: DebugIgnore(callback),
            stopwatch: crate::time::stopwatch(),
            tests: HashMap::new(),
            cancel,
            cancel_state: None,
        }
    }

    pub(super) fn run_started(&mut self, test_count: usize) {
        self.basic_callback(TestEventKind::RunStarted { test_count });
    }

    /// Runs the dispatcher until `done_rx` fires, then delivers any events still queued.
    ///
    /// Waiting for `events_rx` to close is not enough: a wedged affinity thread may hold a sender
    /// indefinitely.
    pub(super) async fn run(
        &mut self,
        mut events_rx: UnboundedReceiver<TestEventKind>,
        done_rx: oneshot::Receiver<()>,
        report_cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut done_rx = std::pin::pin!(done_rx);
        let mut report_cancel_rx = std::pin::pin!(report_cancel_rx);
        let mut report_cancel_done = false;
        let cancel = self.cancel.clone();

        loop {
            let internal_event = tokio::select! {
                biased;

                event = events_rx.recv() => match event {
                    Some(event) => InternalEvent::Event(event),
                    None => break,
                },
                res = &mut report_cancel_rx, if !report_cancel_done => {
                    report_cancel_done = true;
                    match res {
                        Ok(()) => InternalEvent::ReportCancel,
                        // The sender was dropped without an error being reported.
                        Err(_) => continue,
                    }
                }
                () = cancel.cancelled(), if self.cancel_state.is_none() => {
                    InternalEvent::Cancelled
                }
                _ = &mut done_rx => {
                    while let Ok(event) = events_rx.try_recv() {
                        self.handle_event(event);
                    }
                    break;
                }
            };

            match internal_event {
                InternalEvent::Event(event) => self.handle_event(event),
                InternalEvent::ReportCancel => self.begin_cancel(CancelReason::ReportError),
                InternalEvent::Cancelled => self.begin_cancel(CancelReason::Requested),
            }
        }
    }

    pub(super) fn run_finished(&mut self, summary: RunSummary) {
        let snapshot = self.stopwatch.snapshot();
        debug!(ended_at = %snapshot.end_time(), ?summary, "run finished");
        self.basic_callback(TestEventKind::RunFinished {
            start_time: snapshot.start_time.fixed_offset(),
            elapsed: snapshot.duration,
            summary,
        });
    }

    #[inline]
    fn basic_callback(&mut self, kind: TestEventKind) {
        let snapshot = self.stopwatch.snapshot();
        let event = TestEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: snapshot.duration,
            kind,
        };
        (self.callback)(event)
    }

    fn handle_event(&mut self, kind: TestEventKind) {
        let accepted = match &kind {
            TestEventKind::TestStarted { test_case } => {
                self.transition(test_case, TestTransition::Start)
            }
            TestEventKind::TestPassed { test_case, .. } => {
                self.transition(test_case, TestTransition::Pass)
            }
            TestEventKind::TestFailed { test_case, .. } => {
                self.transition(test_case, TestTransition::FailFinal)
            }
            TestEventKind::TestSkipped { test_case, reason } => {
                let transition = if reason.will_retry() {
                    TestTransition::FailRetryable
                } else {
                    TestTransition::Skip
                };
                self.transition(test_case, transition)
            }
            TestEventKind::TestFinished { test_case, .. } => self.finish_test(test_case),
            TestEventKind::RunStarted { .. }
            | TestEventKind::BatchStarted { .. }
            | TestEventKind::BatchFinished { .. }
            | TestEventKind::InfrastructureFault { .. }
            | TestEventKind::RunBeginCancel { .. }
            | TestEventKind::RunFinished { .. } => true,
        };

        if accepted {
            self.basic_callback(kind);
        }
    }

    fn transition(&mut self, test_case: &TestCase, transition: TestTransition) -> bool {
        let test = self.tests.entry(test_case.id().clone()).or_default();
        let next = match (test.state, transition) {
            (TestState::FailedRetryable, TestTransition::Start) => test
                .state
                .apply(TestTransition::Requeue)
                .and_then(|state| state.apply(TestTransition::Start)),
            (state, transition) => state.apply(transition),
        };

        match next {
            Some(next) => {
                test.state = next;
                test.awaiting_finish = next != TestState::Running;
                true
            }
            None => {
                debug!(
                    id = %test_case.id(),
                    state = %test.state,
                    ?transition,
                    "dropping event that is not valid for the test's state"
                );
                false
            }
        }
    }

    fn finish_test(&mut self, test_case: &TestCase) -> bool {
        match self.tests.get_mut(test_case.id()) {
            Some(test) if test.awaiting_finish => {
                test.awaiting_finish = false;
                true
            }
            _ => {
                debug!(id = %test_case.id(), "dropping finish event without an outcome");
                false
            }
        }
    }

    fn begin_cancel(&mut self, reason: CancelReason) {
        if self.cancel_state.is_some() {
            return;
        }
        debug!(?reason, "cancelling run");
        self.cancel_state = Some(reason);
        self.cancel.cancel();
        self.basic_callback(TestEventKind::RunBeginCancel { reason });
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ContextTest {
    state: TestState,
    // An outcome was reported and the matching finish event has not been seen yet.
    awaiting_finish: bool,
}

#[derive(Debug)]
enum InternalEvent {
    Event(TestEventKind),
    ReportCancel,
    Cancelled,
}
