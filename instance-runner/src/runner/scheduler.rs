// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Groups tests by instance key and drives the attempts for each group.

use super::{
    AffinityError, AffinityExecutor, BridgeOutcome, CurrentTestCase, ExecutionBridge,
    LocalRunner, LocalTestResult,
};
use crate::{
    config::{ExecutionMode, HarnessConfig},
    errors::{
        AcquireError, DisplayErrorChain, HarnessFailure, InfrastructureFault, InstanceError,
        LeaseAlreadyOutstanding,
    },
    key::InstanceKey,
    pool::InstancePool,
    reporter::{RunSummary, SkipReason, TestEventKind, TestFailure},
    test_case::{TestCase, TestCaseId, TestCaseKind},
};
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use instance_metadata::RemoteTestCase;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tests split by how they run.
#[derive(Debug, Default)]
pub(super) struct RunPlan {
    /// Tests without a key, run by the local runner.
    pub(super) local: Vec<Arc<TestCase>>,

    /// Tests grouped by key, in the order each key was first seen.
    pub(super) groups: IndexMap<InstanceKey, Vec<Arc<TestCase>>>,

    /// Smoke tests, grouped by key. These run after every other group.
    pub(super) smoke: IndexMap<InstanceKey, Vec<Arc<TestCase>>>,
}

impl RunPlan {
    pub(super) fn new(tests: impl IntoIterator<Item = Arc<TestCase>>) -> Self {
        let mut plan = Self::default();
        for test_case in tests {
            match test_case.required_key() {
                None => plan.local.push(test_case),
                Some(key) => {
                    let groups = if test_case.kind() == TestCaseKind::Instance {
                        &mut plan.smoke
                    } else {
                        &mut plan.groups
                    };
                    groups.entry(key.clone()).or_default().push(test_case);
                }
            }
        }
        plan
    }
}

/// Drives a run from start to finish.
#[derive(Debug)]
pub(super) struct BatchScheduler<'a> {
    config: &'a HarnessConfig,
    pool: &'a InstancePool,
    local_runner: DebugIgnore<Arc<dyn LocalRunner>>,
    leave_running: bool,
    executor: AffinityExecutor,
    current: CurrentTestCase,
    events: UnboundedSender<TestEventKind>,
    cancel: CancellationToken,
    known: Arc<HashMap<TestCaseId, Arc<TestCase>>>,
    // Tests without a final outcome yet, in run order.
    incomplete: IndexMap<TestCaseId, Arc<TestCase>>,
    // Keys that an ordinary group ran against in this run.
    used_keys: HashSet<InstanceKey>,
    summary: RunSummary,
    last_was_smoke: bool,
}

impl<'a> BatchScheduler<'a> {
    #[expect(clippy::too_many_arguments)]
    pub(super) fn new(
        config: &'a HarnessConfig,
        pool: &'a InstancePool,
        local_runner: Arc<dyn LocalRunner>,
        leave_running: bool,
        current: CurrentTestCase,
        tests: &[Arc<TestCase>],
        events: UnboundedSender<TestEventKind>,
        cancel: CancellationToken,
    ) -> Self {
        let incomplete: IndexMap<_, _> = tests
            .iter()
            .map(|test_case| (test_case.id().clone(), test_case.clone()))
            .collect();
        let known = incomplete
            .iter()
            .map(|(id, test_case)| (id.clone(), test_case.clone()))
            .collect();

        Self {
            config,
            pool,
            local_runner: DebugIgnore(local_runner),
            leave_running,
            executor: AffinityExecutor::new(
                "instance-runner-affinity",
                config.attempt_timeout(),
                config.hang_timeout(),
            ),
            current,
            events,
            cancel,
            known: Arc::new(known),
            incomplete,
            used_keys: HashSet::new(),
            summary: RunSummary::default(),
            last_was_smoke: false,
        }
    }

    /// Returns the summary of everything run so far.
    pub(super) fn summary(&self) -> RunSummary {
        self.summary
    }

    /// Runs the plan.
    ///
    /// Only a contract violation is returned as an error. Every other failure is reported through
    /// events.
    pub(super) async fn run(&mut self, plan: RunPlan) -> Result<(), LeaseAlreadyOutstanding> {
        let result = match self.run_plan(plan).await {
            Ok(()) => Ok(()),
            Err(Interrupt::Cancelled) => {
                self.skip_incomplete();
                Ok(())
            }
            Err(Interrupt::Fault(fault)) => {
                self.fail_incomplete(fault);
                Ok(())
            }
            Err(Interrupt::ContractViolation(violation)) => Err(violation),
        };

        self.finish_pool().await;
        result
    }

    async fn run_plan(&mut self, plan: RunPlan) -> Result<(), Interrupt> {
        let RunPlan {
            local,
            groups,
            smoke,
        } = plan;

        if !local.is_empty() {
            self.check_cancelled()?;
            self.run_local(local).await?;
        }

        for (key, tests) in groups {
            self.check_cancelled()?;
            self.check_execution_mode()?;
            let max_attempts = key.max_attempts().get();
            self.run_group(&key, tests, max_attempts).await?;
            self.used_keys.insert(key);
            self.last_was_smoke = false;
        }

        for (key, tests) in smoke {
            self.check_cancelled()?;
            if self.used_keys.contains(&key) {
                debug!(%key, "instance already used in this run, passing smoke test");
                self.pass_immediately(tests);
                continue;
            }
            self.check_execution_mode()?;
            self.run_group(&key, tests, 1).await?;
            self.last_was_smoke = true;
        }

        Ok(())
    }

    async fn run_local(&mut self, tests: Vec<Arc<TestCase>>) -> Result<(), Interrupt> {
        self.send(TestEventKind::BatchStarted {
            key: None,
            attempt: 0,
            max_attempts: 1,
            test_count: tests.len(),
        });

        let runner = Arc::clone(&self.local_runner.0);
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let (completed, summary) =
            tokio::task::spawn_blocking(move || run_local_tests(&*runner, tests, &events, &cancel))
                .await
                .map_err(|error| {
                    let message = if error.is_panic() {
                        super::affinity::panic_message(error.into_panic())
                    } else {
                        "local test task was cancelled".to_owned()
                    };
                    Interrupt::fault(InfrastructureFault::LocalRunnerPanicked { message })
                })?;

        for test_case in &completed {
            self.incomplete.shift_remove(test_case.id());
        }
        self.summary += summary;
        self.send(TestEventKind::BatchFinished {
            key: None,
            attempt: 0,
            summary,
            reported: completed,
        });
        self.check_cancelled()
    }

    async fn run_group(
        &mut self,
        key: &InstanceKey,
        tests: Vec<Arc<TestCase>>,
        max_attempts: usize,
    ) -> Result<(), Interrupt> {
        let mut remaining = tests;

        for attempt in 0..max_attempts {
            self.check_cancelled()?;
            let is_final = attempt + 1 == max_attempts;
            info!(
                %key,
                attempt = attempt + 1,
                max_attempts,
                tests = remaining.len(),
                "starting batch attempt"
            );
            self.send(TestEventKind::BatchStarted {
                key: Some(key.clone()),
                attempt,
                max_attempts,
                test_count: remaining.len(),
            });

            let outcome = match self.run_attempt(key, &remaining, is_final).await {
                Ok(outcome) => outcome,
                Err(AffinityError::TimedOut(timeout)) => {
                    return Err(Interrupt::fault(InfrastructureFault::HangTimeout {
                        key: key.clone(),
                        timeout,
                    }));
                }
                Err(AffinityError::Executor(error)) => {
                    return Err(Interrupt::fault(InfrastructureFault::Executor {
                        key: key.clone(),
                        error,
                    }));
                }
            };

            match outcome {
                AttemptOutcome::Finished(BridgeOutcome {
                    completed,
                    summary,
                    reported,
                }) => {
                    debug!(
                        %key,
                        completed = completed.len(),
                        reported = reported.len(),
                        "batch attempt finished"
                    );
                    self.record_attempt(key, attempt, &completed, summary, reported);
                    remaining.retain(|test_case| !completed.contains(test_case.id()));
                    if remaining.is_empty() {
                        return Ok(());
                    }
                }
                AttemptOutcome::Acquire(AcquireError::ContractViolation(violation)) => {
                    return Err(Interrupt::ContractViolation(violation));
                }
                AttemptOutcome::Acquire(AcquireError::Launch { key, error }) => {
                    if is_final {
                        return Err(Interrupt::fault(InfrastructureFault::Launch { key, error }));
                    }
                    warn!(
                        %key,
                        attempt = attempt + 1,
                        error = %DisplayErrorChain::new(&error),
                        "failed to launch instance, retrying"
                    );
                    self.send(TestEventKind::BatchFinished {
                        key: Some(key),
                        attempt,
                        summary: RunSummary::default(),
                        reported: Vec::new(),
                    });
                }
                AttemptOutcome::Host {
                    error,
                    partial:
                        BridgeOutcome {
                            completed,
                            summary,
                            reported,
                        },
                } => {
                    debug!(
                        %key,
                        completed = completed.len(),
                        "host failed partway through the batch"
                    );
                    self.record_attempt(key, attempt, &completed, summary, reported);
                    return Err(Interrupt::fault(InfrastructureFault::Host {
                        key: key.clone(),
                        error,
                    }));
                }
            }
        }

        // The host stops early once it sees cancellation, so unreported tests are not its fault.
        self.check_cancelled()?;
        if !remaining.is_empty() {
            warn!(%key, count = remaining.len(), "host never reported some tests");
            self.fail_not_reported(remaining);
        }
        Ok(())
    }

    async fn run_attempt(
        &self,
        key: &InstanceKey,
        tests: &[Arc<TestCase>],
        is_final: bool,
    ) -> Result<AttemptOutcome, AffinityError> {
        let pool = self.pool.clone();
        let key = key.clone();
        let remote: Vec<RemoteTestCase> = tests.iter().map(|test| test.to_remote()).collect();
        let bridge = ExecutionBridge::new(
            self.known.clone(),
            is_final,
            self.current.clone(),
            self.cancel.clone(),
            self.events.clone(),
        );

        self.executor
            .run(move || async move { run_attempt(pool, key, remote, bridge) })
            .await
    }

    /// Records what an attempt settled. Tests in `completed` need no further attempts.
    fn record_attempt(
        &mut self,
        key: &InstanceKey,
        attempt: usize,
        completed: &HashSet<TestCaseId>,
        summary: RunSummary,
        reported: Vec<Arc<TestCase>>,
    ) {
        self.summary += summary;
        self.send(TestEventKind::BatchFinished {
            key: Some(key.clone()),
            attempt,
            summary,
            reported,
        });
        for id in completed {
            self.incomplete.shift_remove(id);
        }
    }

    fn pass_immediately(&mut self, tests: Vec<Arc<TestCase>>) {
        let count = tests.len();
        for test_case in tests {
            self.incomplete.shift_remove(test_case.id());
            self.send(TestEventKind::TestStarted {
                test_case: test_case.clone(),
            });
            self.send(TestEventKind::TestPassed {
                test_case: test_case.clone(),
                elapsed: Duration::ZERO,
            });
            self.send(TestEventKind::TestFinished {
                test_case,
                elapsed: Duration::ZERO,
            });
        }
        self.summary += RunSummary {
            total: count,
            ..RunSummary::default()
        };
    }

    fn fail_not_reported(&mut self, tests: Vec<Arc<TestCase>>) {
        let count = tests.len();
        for test_case in tests {
            self.incomplete.shift_remove(test_case.id());
            self.send_synthesized(test_case, Outcome::Failed(TestFailure::NotReported));
        }
        self.summary += RunSummary::all_failed(count);
    }

    fn fail_incomplete(&mut self, fault: Arc<InfrastructureFault>) {
        let incomplete: Vec<_> = self.incomplete.drain(..).map(|(_, test)| test).collect();
        warn!(
            fault = %DisplayErrorChain::new(&*fault),
            incomplete = incomplete.len(),
            "infrastructure fault, failing every incomplete test"
        );
        self.send(TestEventKind::InfrastructureFault {
            fault: fault.clone(),
            incomplete: incomplete.len(),
        });

        let failure = HarnessFailure::new(fault);
        self.summary += RunSummary::all_failed(incomplete.len());
        for test_case in incomplete {
            self.send_synthesized(
                test_case,
                Outcome::Failed(TestFailure::Harness(failure.clone())),
            );
        }
    }

    fn skip_incomplete(&mut self) {
        let incomplete: Vec<_> = self.incomplete.drain(..).map(|(_, test)| test).collect();
        info!(count = incomplete.len(), "run cancelled, skipping remaining tests");
        self.summary += RunSummary::all_skipped(incomplete.len());
        for test_case in incomplete {
            self.send_synthesized(test_case, Outcome::Skipped(SkipReason::Cancelled));
        }
    }

    fn send_synthesized(&self, test_case: Arc<TestCase>, outcome: Outcome) {
        self.send(TestEventKind::TestStarted {
            test_case: test_case.clone(),
        });
        let outcome = match outcome {
            Outcome::Failed(failure) => TestEventKind::TestFailed {
                test_case: test_case.clone(),
                failure,
                elapsed: Duration::ZERO,
            },
            Outcome::Skipped(reason) => TestEventKind::TestSkipped {
                test_case: test_case.clone(),
                reason,
            },
        };
        self.send(outcome);
        self.send(TestEventKind::TestFinished {
            test_case,
            elapsed: Duration::ZERO,
        });
    }

    async fn finish_pool(&self) {
        if self.leave_running || self.last_was_smoke {
            debug!(
                leave_running = self.leave_running,
                last_was_smoke = self.last_was_smoke,
                "leaving instance running"
            );
            return;
        }
        if self.pool.idle_instance_id().is_none() {
            return;
        }

        let pool = self.pool.clone();
        if let Err(error) = self
            .executor
            .run(move || async move { pool.shutdown() })
            .await
        {
            warn!(?error, "failed to shut down instance at the end of the run");
        }
    }

    fn check_cancelled(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else {
            Ok(())
        }
    }

    fn check_execution_mode(&self) -> Result<(), Interrupt> {
        match self.config.execution_mode() {
            ExecutionMode::Affinity => Ok(()),
            mode @ ExecutionMode::InProcess => Err(Interrupt::fault(
                InfrastructureFault::UnsupportedExecutionMode { mode },
            )),
        }
    }

    fn send(&self, kind: TestEventKind) {
        // The dispatcher outlives the scheduler.
        let _ = self.events.send(kind);
    }
}

/// Runs one attempt on the affinity thread.
fn run_attempt(
    pool: InstancePool,
    key: InstanceKey,
    tests: Vec<RemoteTestCase>,
    mut bridge: ExecutionBridge,
) -> AttemptOutcome {
    let mut lease = match pool.acquire(&key) {
        Ok(lease) => lease,
        Err(error) => return AttemptOutcome::Acquire(error),
    };
    debug!(
        %key,
        pid = lease.instance().process_id(),
        launched = lease.was_launched(),
        "acquired instance"
    );

    match lease.instance().control().run_batch(&tests, &mut bridge) {
        Ok(totals) => {
            pool.release(lease, true);
            AttemptOutcome::Finished(bridge.finish(totals))
        }
        Err(error) => {
            pool.release(lease, false);
            AttemptOutcome::Host {
                error,
                partial: bridge.abandon(),
            }
        }
    }
}

fn run_local_tests(
    runner: &dyn LocalRunner,
    tests: Vec<Arc<TestCase>>,
    events: &UnboundedSender<TestEventKind>,
    cancel: &CancellationToken,
) -> (Vec<Arc<TestCase>>, RunSummary) {
    let mut completed = Vec::with_capacity(tests.len());
    let mut summary = RunSummary::default();

    for test_case in tests {
        if cancel.is_cancelled() {
            break;
        }

        let _ = events.send(TestEventKind::TestStarted {
            test_case: test_case.clone(),
        });
        let (outcome, elapsed) = match runner.run_test(&test_case) {
            LocalTestResult::Passed { elapsed } => (
                TestEventKind::TestPassed {
                    test_case: test_case.clone(),
                    elapsed,
                },
                elapsed,
            ),
            LocalTestResult::Failed { message, elapsed } => {
                summary.failed += 1;
                (
                    TestEventKind::TestFailed {
                        test_case: test_case.clone(),
                        failure: TestFailure::Assertion { message },
                        elapsed,
                    },
                    elapsed,
                )
            }
            LocalTestResult::Skipped { reason } => {
                summary.skipped += 1;
                (
                    TestEventKind::TestSkipped {
                        test_case: test_case.clone(),
                        reason: SkipReason::Host { reason },
                    },
                    Duration::ZERO,
                )
            }
        };
        summary.total += 1;
        summary.elapsed += elapsed;

        let _ = events.send(outcome);
        let _ = events.send(TestEventKind::TestFinished {
            test_case: test_case.clone(),
            elapsed,
        });
        completed.push(test_case);
    }

    (completed, summary)
}

#[derive(Debug)]
enum AttemptOutcome {
    Finished(BridgeOutcome),
    Acquire(AcquireError),
    Host {
        error: InstanceError,
        partial: BridgeOutcome,
    },
}

enum Outcome {
    Failed(TestFailure),
    Skipped(SkipReason),
}

#[derive(Debug)]
enum Interrupt {
    Cancelled,
    Fault(Arc<InfrastructureFault>),
    ContractViolation(LeaseAlreadyOutstanding),
}

impl Interrupt {
    fn fault(fault: InfrastructureFault) -> Self {
        Self::Fault(Arc::new(fault))
    }
}
