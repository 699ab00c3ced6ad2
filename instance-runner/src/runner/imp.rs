// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{BatchScheduler, CurrentTestCase, DispatcherContext, LocalRunner, NoLocalRunner, RunPlan};
use crate::{
    config::HarnessConfig,
    errors::{LeaseAlreadyOutstanding, RunError, TestRunnerBuildError},
    pool::InstancePool,
    reporter::{RunSummary, TestEvent},
    test_case::TestCase,
};
use debug_ignore::DebugIgnore;
use std::{collections::HashSet, convert::Infallible, fmt, sync::Arc};
use tokio::{
    runtime::Runtime,
    sync::{mpsc::unbounded_channel, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Test runner options.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    config: Option<HarnessConfig>,
    local_runner: Option<DebugIgnore<Arc<dyn LocalRunner>>>,
    leave_running: bool,
}

impl TestRunnerBuilder {
    /// Sets the harness configuration. Defaults to [`HarnessConfig::default`].
    pub fn set_config(&mut self, config: HarnessConfig) -> &mut Self {
        self.config = Some(config);
        self
    }

    /// Sets the runner for tests that do not need an instance.
    ///
    /// Without one, such tests are reported as skipped.
    pub fn set_local_runner(&mut self, local_runner: impl LocalRunner + 'static) -> &mut Self {
        self.local_runner = Some(DebugIgnore(Arc::new(local_runner)));
        self
    }

    /// If true, the instance is left running at the end of the run so that a later run on the
    /// same pool can reuse it.
    ///
    /// The instance is always left running if the last batch of the run was a smoke test.
    pub fn set_leave_running(&mut self, leave_running: bool) -> &mut Self {
        self.leave_running = leave_running;
        self
    }

    /// Creates a new test runner that leases instances from `pool`.
    pub fn build(self, pool: InstancePool) -> Result<TestRunner, TestRunnerBuildError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("instance-runner-worker")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;

        Ok(TestRunner {
            inner: TestRunnerInner {
                config: self.config.unwrap_or_default(),
                local_runner: self
                    .local_runner
                    .unwrap_or_else(|| DebugIgnore(Arc::new(NoLocalRunner))),
                leave_running: self.leave_running,
                pool,
                current: CurrentTestCase::default(),
                runtime,
            },
        })
    }
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner {
    inner: TestRunnerInner,
}

impl TestRunner {
    /// Returns a handle to the test case the host is currently running.
    pub fn current_test_case(&self) -> CurrentTestCase {
        self.inner.current.clone()
    }

    /// Returns the pool this runner leases instances from.
    pub fn pool(&self) -> &InstancePool {
        &self.inner.pool
    }

    /// Runs `tests`.
    ///
    /// Tests without a key run first through the local runner. Tests with a key run in one batch
    /// per key, in the order each key was first seen, retrying failures up to the key's maximum
    /// number of attempts. Smoke tests run last.
    ///
    /// The callback is called with each event as it happens. Cancelling `cancel` stops the run
    /// between attempts; tests that did not get to run are reported as skipped.
    ///
    /// Returns an error only if a lease was not released.
    pub fn execute<F>(
        self,
        tests: Vec<TestCase>,
        cancel: CancellationToken,
        mut callback: F,
    ) -> Result<RunSummary, RunError<Infallible>>
    where
        F: FnMut(TestEvent) + Send,
    {
        self.try_execute::<Infallible, _>(tests, cancel, |test_event| {
            callback(test_event);
            Ok(())
        })
    }

    /// Runs `tests`, with a fallible callback.
    ///
    /// If the callback returns an error, the run is cancelled. The callback keeps receiving
    /// events until the run winds down, and the first error is returned.
    pub fn try_execute<E, F>(
        self,
        tests: Vec<TestCase>,
        cancel: CancellationToken,
        mut callback: F,
    ) -> Result<RunSummary, RunError<E>>
    where
        F: FnMut(TestEvent) -> Result<(), E> + Send,
        E: fmt::Debug + Send,
    {
        let (report_cancel_tx, report_cancel_rx) = oneshot::channel();

        // If report_cancel_tx is None, the callback has failed and the run is winding down.
        let mut report_cancel_tx = Some(report_cancel_tx);
        let mut first_error = None;

        let res = self
            .inner
            .execute(tests, cancel, report_cancel_rx, |event| match callback(event) {
                Ok(()) => {}
                Err(error) => {
                    if let Some(report_cancel_tx) = report_cancel_tx.take() {
                        let _ = report_cancel_tx.send(());
                        first_error = Some(error);
                    }
                }
            });

        // A wedged affinity thread may still hold on to runtime resources. Don't wait for it.
        self.inner.runtime.shutdown_background();

        match (res, first_error) {
            (Ok(summary), None) => Ok(summary),
            (Ok(_), Some(error)) => Err(RunError::Callback(error)),
            (Err(violation), _) => Err(RunError::ContractViolation(violation)),
        }
    }
}

#[derive(Debug)]
struct TestRunnerInner {
    config: HarnessConfig,
    local_runner: DebugIgnore<Arc<dyn LocalRunner>>,
    leave_running: bool,
    pool: InstancePool,
    current: CurrentTestCase,
    runtime: Runtime,
}

impl TestRunnerInner {
    fn execute<F>(
        &self,
        tests: Vec<TestCase>,
        cancel: CancellationToken,
        report_cancel_rx: oneshot::Receiver<()>,
        callback: F,
    ) -> Result<RunSummary, LeaseAlreadyOutstanding>
    where
        F: FnMut(TestEvent) + Send,
    {
        let tests = dedup_tests(tests);

        // A child token, so that a failing callback cancels this run without cancelling the
        // caller's token.
        let cancel = cancel.child_token();
        let mut dispatcher_cx = DispatcherContext::new(callback, cancel.clone());
        dispatcher_cx.run_started(tests.len());

        let (events_tx, events_rx) = unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let mut scheduler = BatchScheduler::new(
            &self.config,
            &self.pool,
            Arc::clone(&self.local_runner.0),
            self.leave_running,
            self.current.clone(),
            &tests,
            events_tx,
            cancel,
        );
        let plan = RunPlan::new(tests);

        let dispatcher_cx_mut = &mut dispatcher_cx;
        let scheduler_mut = &mut scheduler;
        let res = self.runtime.block_on(async move {
            let scheduler_fut = async move {
                let res = scheduler_mut.run(plan).await;
                let _ = done_tx.send(());
                res
            };
            let dispatcher_fut = dispatcher_cx_mut.run(events_rx, done_rx, report_cancel_rx);
            let (res, ()) = tokio::join!(scheduler_fut, dispatcher_fut);
            res
        });

        let summary = scheduler.summary();
        dispatcher_cx.run_finished(summary);
        res.map(|()| summary)
    }
}

fn dedup_tests(tests: Vec<TestCase>) -> Vec<Arc<TestCase>> {
    let mut seen = HashSet::new();
    tests
        .into_iter()
        .filter(|test_case| {
            let inserted = seen.insert(test_case.id().clone());
            if !inserted {
                warn!(id = %test_case.id(), "ignoring duplicate test case");
            }
            inserted
        })
        .map(Arc::new)
        .collect()
}
