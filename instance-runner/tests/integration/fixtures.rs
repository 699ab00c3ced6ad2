// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use instance_metadata::{BatchTotals, RemoteMessage, RemoteTestCase};
use instance_runner::{
    config::HarnessConfig,
    errors::InstanceError,
    pool::{
        HealthState, InstanceCandidate, InstanceControl, InstanceLauncher, InstanceLocator,
        InstancePool, InstanceProcess, LaunchRequest, LaunchedInstance, MessageSink,
    },
    reporter::{RunSummary, TestEvent, TestEventKind},
    runner::{LocalRunner, LocalTestResult, TestRunnerBuilder},
    test_case::TestCase,
};
use semver::Version;
use smol_str::SmolStr;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::{
    Layer, filter::Targets, layer::SubscriberExt, util::SubscriberInitExt,
};

pub(crate) const START_SERVICE: &str = "Test.IntegrationTestService.Start";
pub(crate) const STOP_SERVICE: &str = "Test.IntegrationTestService.Stop";

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_filter(Targets::new().with_target("instance_runner", Level::DEBUG));
        let _ = tracing_subscriber::registry().with(layer).try_init();
    });
}

/// What the fake host does with a test on a given attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Scripted {
    Pass,
    Fail,
    Skip,
    /// The host never mentions the test.
    Omit,
    /// The host starts the test, then the batch fails with an error.
    Crash,
}

#[derive(Debug, Default)]
pub(crate) struct HostState {
    candidates: Vec<InstanceCandidate>,
    // Per test ID, the outcome of each attempt. Tests without a script pass.
    scripts: HashMap<String, Vec<Scripted>>,
    attempts: HashMap<String, usize>,
    failing_launches: usize,
    host_error: bool,
    wedge: Option<Duration>,
    // Once the first test in a batch has finished, the host waits for this token before
    // reporting the test case as finished.
    hold: Option<CancellationToken>,
    processes: Vec<Arc<AtomicBool>>,
    next_pid: u32,

    pub(crate) launches: Vec<LaunchRequest>,
    pub(crate) batches: Vec<Vec<String>>,
    pub(crate) commands: Vec<String>,
    pub(crate) quits: usize,
    pub(crate) active_batches: usize,
    pub(crate) max_active_batches: usize,
}

/// A scripted stand-in for the locator, launcher and control surface of a real application.
#[derive(Clone, Debug)]
pub(crate) struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        let host = Self {
            state: Arc::new(Mutex::new(HostState {
                next_pid: 1000,
                ..HostState::default()
            })),
        };
        host.add_candidate("/apps/17", Version::new(17, 4, 0));
        host
    }

    pub(crate) fn add_candidate(&self, path: &str, version: Version) {
        self.add_candidate_with_capabilities(path, version, []);
    }

    pub(crate) fn add_candidate_with_capabilities(
        &self,
        path: &str,
        version: Version,
        capabilities: impl IntoIterator<Item = &'static str>,
    ) {
        self.state().candidates.push(InstanceCandidate {
            installation_path: path.into(),
            version,
            capabilities: capabilities.into_iter().map(SmolStr::new).collect(),
            health: HealthState::all(),
        });
    }

    pub(crate) fn script(&self, test_case: &TestCase, outcomes: impl IntoIterator<Item = Scripted>) {
        self.state()
            .scripts
            .insert(test_case.id().to_string(), outcomes.into_iter().collect());
    }

    pub(crate) fn fail_launches(&self, count: usize) {
        self.state().failing_launches = count;
    }

    pub(crate) fn fail_batches(&self) {
        self.state().host_error = true;
    }

    pub(crate) fn wedge_batches(&self, duration: Duration) {
        self.state().wedge = Some(duration);
    }

    /// Makes the host wait after the first test of each batch until `token` is cancelled.
    pub(crate) fn hold_after_first_test(&self, token: CancellationToken) {
        self.state().hold = Some(token);
    }

    /// Makes every launched process exit without being asked to.
    pub(crate) fn exit_all_processes(&self) {
        for running in &self.state().processes {
            running.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("host state is not poisoned")
    }

    pub(crate) fn pool(&self, config: &HarnessConfig) -> InstancePool {
        InstancePool::with_preferred_install_path(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            config,
            None,
        )
    }
}

impl InstanceLocator for FakeHost {
    fn candidates(&self) -> Result<Vec<InstanceCandidate>, InstanceError> {
        Ok(self.state().candidates.clone())
    }
}

impl InstanceLauncher for FakeHost {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedInstance, InstanceError> {
        let mut state = self.state();
        state.launches.push(request.clone());
        if state.failing_launches > 0 {
            state.failing_launches -= 1;
            return Err(InstanceError::new("simulated launch failure"));
        }

        let pid = state.next_pid;
        state.next_pid += 1;
        let running = Arc::new(AtomicBool::new(true));
        state.processes.push(running.clone());
        Ok(LaunchedInstance {
            process: Box::new(FakeProcess {
                pid,
                running: running.clone(),
            }),
            control: Box::new(FakeControl {
                state: self.state.clone(),
                running,
            }),
        })
    }
}

struct FakeProcess {
    pid: u32,
    running: Arc<AtomicBool>,
}

impl InstanceProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn wait_for_exit(&mut self, _timeout: Duration) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    fn kill(&mut self) -> Result<(), InstanceError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeControl {
    state: Arc<Mutex<HostState>>,
    running: Arc<AtomicBool>,
}

impl FakeControl {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("host state is not poisoned")
    }
}

impl InstanceControl for FakeControl {
    fn wait_for_idle(&mut self, _timeout: Duration) -> Result<bool, InstanceError> {
        Ok(true)
    }

    fn run_batch(
        &mut self,
        tests: &[RemoteTestCase],
        sink: &mut dyn MessageSink,
    ) -> Result<BatchTotals, InstanceError> {
        let (host_error, wedge) = {
            let mut state = self.lock();
            state
                .batches
                .push(tests.iter().map(|test| test.unique_id.to_string()).collect());
            state.active_batches += 1;
            state.max_active_batches = state.max_active_batches.max(state.active_batches);
            (state.host_error, state.wedge)
        };
        let result = if host_error {
            Err(InstanceError::new("simulated host failure"))
        } else {
            if let Some(wedge) = wedge {
                std::thread::sleep(wedge);
            }
            self.drive(tests, sink)
        };
        self.lock().active_batches -= 1;
        result
    }

    fn quit(&mut self) -> Result<(), InstanceError> {
        self.lock().quits += 1;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_command_available(&mut self, _name: &str) -> Result<bool, InstanceError> {
        Ok(true)
    }

    fn execute_command(&mut self, name: &str) -> Result<(), InstanceError> {
        self.lock().commands.push(name.to_owned());
        Ok(())
    }
}

impl FakeControl {
    fn drive(
        &mut self,
        tests: &[RemoteTestCase],
        sink: &mut dyn MessageSink,
    ) -> Result<BatchTotals, InstanceError> {
        let elapsed = Duration::from_millis(5);
        let hold = self.lock().hold.clone();
        let mut totals = BatchTotals::default();
        let mut ran = Vec::new();

        sink.on_message(RemoteMessage::BatchStarting);
        for test in tests {
            let scripted = {
                let mut state = self.lock();
                let attempt = state.attempts.entry(test.unique_id.to_string()).or_default();
                let index = *attempt;
                *attempt += 1;
                state
                    .scripts
                    .get(test.unique_id.as_str())
                    .and_then(|script| script.get(index).copied())
                    .unwrap_or(Scripted::Pass)
            };
            if scripted == Scripted::Omit {
                continue;
            }

            let unique_id = test.unique_id.clone();
            let mut keep_going = sink.on_message(RemoteMessage::TestCaseStarting {
                test_case: test.clone(),
            });
            sink.on_message(RemoteMessage::TestStarting {
                unique_id: unique_id.clone(),
            });
            let result = match scripted {
                Scripted::Crash => return Err(InstanceError::new("host crashed mid-batch")),
                Scripted::Pass => RemoteMessage::TestPassed {
                    unique_id: unique_id.clone(),
                    elapsed,
                },
                Scripted::Fail => RemoteMessage::TestFailed {
                    unique_id: unique_id.clone(),
                    message: "assertion failed".to_owned(),
                    elapsed,
                },
                Scripted::Skip => RemoteMessage::TestSkipped {
                    unique_id: unique_id.clone(),
                    reason: "not applicable".to_owned(),
                },
                Scripted::Omit => unreachable!("omitted tests are skipped above"),
            };
            sink.on_message(result);
            sink.on_message(RemoteMessage::TestFinished { unique_id, elapsed });
            if ran.is_empty()
                && let Some(hold) = &hold
            {
                wait_for(hold);
            }

            let test_totals = BatchTotals::single(
                scripted == Scripted::Fail,
                scripted == Scripted::Skip,
                elapsed,
            );
            totals.total += test_totals.total;
            totals.failed += test_totals.failed;
            totals.skipped += test_totals.skipped;
            totals.elapsed += test_totals.elapsed;
            keep_going &= sink.on_message(RemoteMessage::TestCaseFinished {
                test_case: test.clone(),
                totals: test_totals,
            });
            ran.push(test.clone());

            if !keep_going {
                break;
            }
        }
        sink.on_message(RemoteMessage::BatchFinished {
            test_cases: ran,
            totals,
        });

        Ok(totals)
    }
}

fn wait_for(token: &CancellationToken) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !token.is_cancelled() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// A local runner that passes every test whose display name does not contain "fail".
#[derive(Debug)]
pub(crate) struct NameLocalRunner;

impl LocalRunner for NameLocalRunner {
    fn run_test(&self, test_case: &TestCase) -> LocalTestResult {
        if test_case.display_name().contains("fail") {
            LocalTestResult::Failed {
                message: "local failure".to_owned(),
                elapsed: Duration::from_millis(1),
            }
        } else {
            LocalTestResult::Passed {
                elapsed: Duration::from_millis(1),
            }
        }
    }
}

/// A config with short timeouts suitable for tests.
pub(crate) fn test_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config
        .set_idle_timeout(Duration::from_secs(5))
        .set_hang_timeout(Duration::from_secs(5));
    config
}

/// The outcome of a run, with every event the callback saw.
#[derive(Debug)]
pub(crate) struct RunOutput {
    pub(crate) summary: RunSummary,
    pub(crate) events: Vec<TestEvent>,
}

impl RunOutput {
    pub(crate) fn kinds(&self) -> impl Iterator<Item = &TestEventKind> {
        self.events.iter().map(|event| &event.kind)
    }

    /// Returns the IDs of tests with a `TestPassed` event, in order.
    pub(crate) fn passed(&self) -> Vec<String> {
        self.kinds()
            .filter_map(|kind| match kind {
                TestEventKind::TestPassed { test_case, .. } => Some(test_case.id().to_string()),
                _ => None,
            })
            .collect()
    }

    /// Returns the IDs of tests with a `TestFailed` event, in order.
    pub(crate) fn failed(&self) -> Vec<String> {
        self.kinds()
            .filter_map(|kind| match kind {
                TestEventKind::TestFailed { test_case, .. } => Some(test_case.id().to_string()),
                _ => None,
            })
            .collect()
    }
}

pub(crate) fn run(builder: TestRunnerBuilder, pool: InstancePool, tests: Vec<TestCase>) -> RunOutput {
    run_with_cancel(builder, pool, tests, CancellationToken::new())
}

pub(crate) fn run_with_cancel(
    builder: TestRunnerBuilder,
    pool: InstancePool,
    tests: Vec<TestCase>,
    cancel: CancellationToken,
) -> RunOutput {
    let runner = builder.build(pool).expect("runner built");
    let mut events = Vec::new();
    let summary = runner
        .execute(tests, cancel, |event| events.push(event))
        .expect("run completed without a contract violation");
    RunOutput { summary, events }
}
