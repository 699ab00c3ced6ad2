// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use indoc::indoc;
use instance_runner::{
    config::{ExecutionMode, HarnessConfig},
    errors::{InfrastructureFault, LaunchError, RunError},
    key::InstanceKey,
    reporter::{JunitCollector, SkipReason, TestEventKind, TestFailure},
    runner::TestRunnerBuilder,
    test_case::TestCase,
};
use pretty_assertions::assert_eq;
use semver::Version;
use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};
use test_case::test_case;
use tokio_util::sync::CancellationToken;

fn key_17(max_attempts: usize) -> InstanceKey {
    InstanceKey::new(Version::new(17, 0, 0))
        .with_root_suffix("Exp")
        .with_max_attempts(NonZeroUsize::new(max_attempts).expect("max_attempts is non-zero"))
}

fn facts(key: &InstanceKey, names: &[&str]) -> Vec<TestCase> {
    names
        .iter()
        .map(|name| TestCase::fact(&format!("Tests.{name}"), name, key.clone()))
        .collect()
}

fn builder(config: HarnessConfig) -> TestRunnerBuilder {
    let mut builder = TestRunnerBuilder::default();
    builder.set_config(config);
    builder
}

#[test]
fn flaky_test_passes_on_retry() -> Result<()> {
    test_init();

    let host = FakeHost::new();
    let key = key_17(2);
    let tests = facts(&key, &["One", "Two", "Three"]);
    host.script(&tests[1], [Scripted::Fail, Scripted::Pass]);

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.total, 3);
    assert_eq!(output.summary.failed, 0);
    assert_eq!(output.summary.skipped, 0);
    assert!(output.summary.is_success());
    assert_eq!(
        output.passed(),
        ["Tests.One_Exp_17.0.0", "Tests.Three_Exp_17.0.0", "Tests.Two_Exp_17.0.0"]
    );

    let retries: Vec<_> = output
        .kinds()
        .filter(|kind| {
            matches!(
                kind,
                TestEventKind::TestSkipped {
                    reason: SkipReason::WillRetry { .. },
                    ..
                }
            )
        })
        .collect();
    ensure!(retries.len() == 1, "expected one retry, found {retries:?}");

    let state = host.state();
    assert_eq!(
        state.batches,
        [
            vec![
                "Tests.One_Exp_17.0.0".to_owned(),
                "Tests.Two_Exp_17.0.0".to_owned(),
                "Tests.Three_Exp_17.0.0".to_owned(),
            ],
            vec!["Tests.Two_Exp_17.0.0".to_owned()],
        ]
    );
    assert_eq!(state.launches.len(), 1, "the instance is reused for the retry");

    Ok(())
}

#[test]
fn retry_shows_as_flaky_in_junit() {
    test_init();

    let host = FakeHost::new();
    let key = key_17(2);
    let tests = facts(&key, &["Flaky"]);
    host.script(&tests[0], [Scripted::Fail, Scripted::Pass]);

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    let mut collector = JunitCollector::new("instance-runner");
    for event in &output.events {
        collector.write_event(event);
    }
    let xml = collector.finish().to_string().expect("report serialized");

    assert!(xml.contains(r#"name="Flaky (17.0.0, Exp)""#), "{xml}");
    assert!(xml.contains("<flakyFailure"), "{xml}");
    assert!(!xml.contains("<failure"), "{xml}");
}

#[test_case(1 ; "single attempt")]
#[test_case(3 ; "three attempts")]
fn launch_failure_fails_every_test(max_attempts: usize) {
    test_init();

    let host = FakeHost::new();
    host.fail_launches(usize::MAX);
    let key = key_17(max_attempts);
    let tests = facts(&key, &["One", "Two"]);

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.total, 2);
    assert_eq!(output.summary.failed, 2);
    assert_eq!(host.state().launches.len(), max_attempts);

    let mut failures = 0;
    for kind in output.kinds() {
        if let TestEventKind::TestFailed { failure, .. } = kind {
            let TestFailure::Harness(failure) = failure else {
                panic!("expected a harness failure, found {failure}");
            };
            assert!(
                matches!(
                    &**failure.fault(),
                    InfrastructureFault::Launch {
                        error: LaunchError::Spawn { .. },
                        ..
                    }
                ),
                "unexpected fault: {:?}",
                failure.fault()
            );
            failures += 1;
        }
    }
    assert_eq!(failures, 2);

    let faults = output
        .kinds()
        .filter(|kind| matches!(kind, TestEventKind::InfrastructureFault { incomplete: 2, .. }))
        .count();
    assert_eq!(faults, 1);
}

#[test]
fn launch_recovers_on_a_later_attempt() {
    test_init();

    let host = FakeHost::new();
    host.fail_launches(1);
    let key = key_17(2);
    let tests = facts(&key, &["One"]);

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.total, 1);
    assert_eq!(output.summary.failed, 0);
    assert_eq!(output.passed(), ["Tests.One_Exp_17.0.0"]);
    assert_eq!(host.state().launches.len(), 2);
}

#[test]
fn keys_run_one_after_another() {
    test_init();

    let host = FakeHost::new();
    host.add_candidate("/apps/16", Version::new(16, 11, 0));
    let v17 = key_17(1);
    let v16 = InstanceKey::new(Version::new(16, 0, 0));
    let tests = vec![
        TestCase::fact("Tests.New", "New", v17),
        TestCase::fact("Tests.Old", "Old", v16),
    ];

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.total, 2);
    assert_eq!(output.summary.failed, 0);

    let state = host.state();
    assert_eq!(state.batches.len(), 2);
    assert_eq!(state.max_active_batches, 1);
    let launched: Vec<_> = state
        .launches
        .iter()
        .map(|request| request.installation_path.as_str())
        .collect();
    assert_eq!(launched, ["/apps/17", "/apps/16"]);
    // The 17 instance is closed before the 16 one starts, and the 16 one at the end of the run.
    assert_eq!(state.quits, 2);
}

#[test]
fn failing_test_fails_after_last_attempt() {
    test_init();

    let host = FakeHost::new();
    let key = key_17(2);
    let tests = facts(&key, &["Broken", "Fine"]);
    host.script(&tests[0], [Scripted::Fail, Scripted::Fail]);

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.total, 2);
    assert_eq!(output.summary.failed, 1);
    assert_eq!(output.failed(), ["Tests.Broken_Exp_17.0.0"]);
}

#[test]
fn unreported_test_fails() {
    test_init();

    let host = FakeHost::new();
    let key = key_17(1);
    let tests = facts(&key, &["Lost", "Found"]);
    host.script(&tests[0], [Scripted::Omit]);

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.total, 2);
    assert_eq!(output.summary.failed, 1);
    let not_reported = output
        .kinds()
        .filter(|kind| {
            matches!(
                kind,
                TestEventKind::TestFailed {
                    failure: TestFailure::NotReported,
                    ..
                }
            )
        })
        .count();
    assert_eq!(not_reported, 1);
}

#[test]
fn host_skip_is_counted() {
    test_init();

    let host = FakeHost::new();
    let key = key_17(1);
    let tests = facts(&key, &["Skipped", "Run"]);
    host.script(&tests[0], [Scripted::Skip]);

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.total, 2);
    assert_eq!(output.summary.skipped, 1);
    assert_eq!(output.summary.passed(), 1);
}

#[test]
fn host_error_fails_batch_and_tears_down_instance() {
    test_init();

    let host = FakeHost::new();
    host.fail_batches();
    let key = key_17(3);
    let tests = facts(&key, &["One", "Two"]);

    let config = test_config();
    let pool = host.pool(&config);
    let output = run(builder(config), pool.clone(), tests);

    assert_eq!(output.summary.failed, 2);
    let host_faults = output
        .kinds()
        .filter(|kind| match kind {
            TestEventKind::InfrastructureFault { fault, .. } => {
                matches!(**fault, InfrastructureFault::Host { .. })
            }
            _ => false,
        })
        .count();
    assert_eq!(host_faults, 1);
    // Host errors are not retried.
    assert_eq!(host.state().batches.len(), 1);
    assert_eq!(host.state().quits, 1);
    assert!(!pool.is_leased());
    assert_eq!(pool.idle_instance_id(), None);
}

#[test]
fn host_crash_keeps_completed_results() {
    test_init();

    let host = FakeHost::new();
    let key = key_17(2);
    let tests = facts(&key, &["Done", "Crashed", "Queued"]);
    host.script(&tests[1], [Scripted::Crash]);

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.passed(), ["Tests.Done_Exp_17.0.0"]);
    assert_eq!(
        output.failed(),
        ["Tests.Crashed_Exp_17.0.0", "Tests.Queued_Exp_17.0.0"]
    );
    assert_eq!(output.summary.total, 3);
    assert_eq!(output.summary.failed, output.failed().len());
    assert_eq!(output.summary.passed(), output.passed().len());

    let fault_incomplete = output.kinds().find_map(|kind| match kind {
        TestEventKind::InfrastructureFault { incomplete, .. } => Some(*incomplete),
        _ => None,
    });
    assert_eq!(fault_incomplete, Some(2));
    // Host errors are not retried.
    assert_eq!(host.state().batches.len(), 1);
}

#[test]
fn wedged_batch_times_out() {
    test_init();

    let host = FakeHost::new();
    host.wedge_batches(Duration::from_secs(10));
    let key = key_17(1);
    let tests = facts(&key, &["Stuck"]);

    let mut config = test_config();
    config
        .set_attempt_timeout(Duration::from_millis(200))
        .set_hang_timeout(Duration::from_millis(100));
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.failed, 1);
    let timed_out = output.kinds().any(|kind| match kind {
        TestEventKind::InfrastructureFault { fault, .. } => {
            matches!(**fault, InfrastructureFault::HangTimeout { .. })
        }
        _ => false,
    });
    assert!(timed_out, "expected a hang timeout");
}

#[test]
fn smoke_test_passes_without_running_when_key_was_used() {
    test_init();

    let host = FakeHost::new();
    let key = key_17(1);
    let tests = vec![
        TestCase::smoke("Tests.Smoke", "Smoke", key.clone()),
        TestCase::fact("Tests.One", "One", key),
    ];

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.total, 2);
    assert_eq!(output.summary.failed, 0);
    assert_eq!(
        output.passed(),
        ["Tests.One_Exp_17.0.0", "Tests.Smoke_Exp_17.0.0"]
    );
    assert_eq!(host.state().batches.len(), 1);
}

#[test]
fn smoke_test_runs_and_leaves_instance_running() {
    test_init();

    let host = FakeHost::new();
    let tests = vec![TestCase::smoke("Tests.Smoke", "Smoke", key_17(3))];

    let config = test_config();
    let pool = host.pool(&config);
    let output = run(builder(config), pool.clone(), tests);

    assert_eq!(output.summary.total, 1);
    assert_eq!(output.passed(), ["Tests.Smoke_Exp_17.0.0"]);
    assert_eq!(host.state().batches.len(), 1);
    assert!(pool.idle_instance_id().is_some(), "instance left running");
    assert_eq!(host.state().quits, 0);
}

#[test_case(false, 1 ; "shut down")]
#[test_case(true, 0 ; "left running")]
fn instance_lifetime_after_run(leave_running: bool, expected_quits: usize) {
    test_init();

    let host = FakeHost::new();
    let tests = facts(&key_17(1), &["One"]);

    let config = test_config();
    let pool = host.pool(&config);
    let mut builder = builder(config);
    builder.set_leave_running(leave_running);
    run(builder, pool.clone(), tests);

    assert_eq!(host.state().quits, expected_quits);
    assert_eq!(pool.idle_instance_id().is_some(), leave_running);
}

#[test]
fn local_tests_run_before_instance_tests() {
    test_init();

    let host = FakeHost::new();
    let tests = vec![
        TestCase::fact("Tests.Remote", "Remote", key_17(1)),
        TestCase::local("Tests.LocalPass", "local pass"),
        TestCase::local("Tests.LocalFail", "local fail"),
    ];

    let config = test_config();
    let mut builder = builder(config.clone());
    builder.set_local_runner(NameLocalRunner);
    let output = run(builder, host.pool(&config), tests);

    assert_eq!(output.summary.total, 3);
    assert_eq!(output.summary.failed, 1);
    assert_eq!(output.passed(), ["Tests.LocalPass", "Tests.Remote_Exp_17.0.0"]);
    assert_eq!(output.failed(), ["Tests.LocalFail"]);
}

#[test]
fn local_tests_skip_without_local_runner() {
    test_init();

    let host = FakeHost::new();
    let tests = vec![TestCase::local("Tests.Local", "Local")];

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.total, 1);
    assert_eq!(output.summary.skipped, 1);
    assert!(host.state().launches.is_empty());
}

#[test]
fn in_process_mode_is_a_fault() -> Result<()> {
    test_init();

    let config = HarnessConfig::from_toml_str(indoc! {r#"
        execution-mode = "in-process"
    "#})?;
    assert_eq!(config.execution_mode(), ExecutionMode::InProcess);

    let host = FakeHost::new();
    let tests = vec![
        TestCase::local("Tests.Local", "Local"),
        TestCase::fact("Tests.Remote", "Remote", key_17(1)),
    ];
    let mut builder = builder(config.clone());
    builder.set_local_runner(NameLocalRunner);
    let output = run(builder, host.pool(&config), tests);

    assert_eq!(output.summary.total, 2);
    assert_eq!(output.summary.failed, 1);
    assert_eq!(output.passed(), ["Tests.Local"]);
    let unsupported = output.kinds().any(|kind| match kind {
        TestEventKind::InfrastructureFault { fault, .. } => matches!(
            **fault,
            InfrastructureFault::UnsupportedExecutionMode {
                mode: ExecutionMode::InProcess
            }
        ),
        _ => false,
    });
    ensure!(unsupported, "expected an unsupported execution mode fault");
    ensure!(host.state().launches.is_empty(), "nothing was launched");

    Ok(())
}

#[test]
fn cancelled_run_skips_everything() {
    test_init();

    let host = FakeHost::new();
    let tests = facts(&key_17(1), &["One", "Two"]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let config = test_config();
    let output = run_with_cancel(builder(config.clone()), host.pool(&config), tests, cancel);

    assert_eq!(output.summary.total, 2);
    assert_eq!(output.summary.skipped, 2);
    assert!(host.state().launches.is_empty());

    let cancelled = output
        .kinds()
        .filter(|kind| {
            matches!(
                kind,
                TestEventKind::TestSkipped {
                    reason: SkipReason::Cancelled,
                    ..
                }
            )
        })
        .count();
    assert_eq!(cancelled, 2);
    assert!(
        output
            .kinds()
            .any(|kind| matches!(kind, TestEventKind::RunBeginCancel { .. }))
    );
    assert!(matches!(
        output.events.last().map(|event| &event.kind),
        Some(TestEventKind::RunFinished { .. })
    ));
}

#[test]
fn cancel_during_batch_skips_remaining_tests() {
    test_init();

    let host = FakeHost::new();
    let tests = facts(&key_17(1), &["One", "Two", "Three", "Four"]);
    let cancel = CancellationToken::new();
    host.hold_after_first_test(cancel.clone());

    let config = test_config();
    let runner = builder(config.clone())
        .build(host.pool(&config))
        .expect("runner built");
    let mut events = Vec::new();
    let summary = runner
        .execute(tests, cancel.clone(), |event| {
            if matches!(event.kind, TestEventKind::TestFinished { .. }) {
                cancel.cancel();
            }
            events.push(event.kind);
        })
        .expect("run completed without a contract violation");

    let mut terminal: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for kind in &events {
        let (test_case, outcome) = match kind {
            TestEventKind::TestPassed { test_case, .. } => (test_case, "passed"),
            TestEventKind::TestFailed { test_case, .. } => (test_case, "failed"),
            TestEventKind::TestSkipped {
                test_case,
                reason: SkipReason::Cancelled,
            } => (test_case, "cancelled"),
            _ => continue,
        };
        terminal
            .entry(test_case.id().to_string())
            .or_default()
            .push(outcome);
    }
    // The host stops after the test it was running when the run was cancelled.
    assert_eq!(
        terminal,
        BTreeMap::from([
            ("Tests.Four_Exp_17.0.0".to_owned(), vec!["cancelled"]),
            ("Tests.One_Exp_17.0.0".to_owned(), vec!["passed"]),
            ("Tests.Three_Exp_17.0.0".to_owned(), vec!["cancelled"]),
            ("Tests.Two_Exp_17.0.0".to_owned(), vec!["cancelled"]),
        ])
    );

    assert_eq!(summary.total, 4);
    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.failed, 0);
    assert!(
        events
            .iter()
            .any(|kind| matches!(kind, TestEventKind::RunBeginCancel { .. }))
    );
    assert_eq!(host.state().batches.len(), 1);
}

#[test]
fn batch_finished_reports_submitted_objects() {
    test_init();

    let host = FakeHost::new();
    let tests = facts(&key_17(1), &["One", "Two"]);

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    let started: HashMap<String, Arc<TestCase>> = output
        .kinds()
        .filter_map(|kind| match kind {
            TestEventKind::TestStarted { test_case } => {
                Some((test_case.id().to_string(), test_case.clone()))
            }
            _ => None,
        })
        .collect();
    let reported = output
        .kinds()
        .find_map(|kind| match kind {
            TestEventKind::BatchFinished {
                key: Some(_),
                reported,
                ..
            } => Some(reported),
            _ => None,
        })
        .expect("batch finished");

    let ids: Vec<_> = reported.iter().map(|test| test.id().to_string()).collect();
    assert_eq!(ids, ["Tests.One_Exp_17.0.0", "Tests.Two_Exp_17.0.0"]);
    for test_case in reported {
        assert!(
            Arc::ptr_eq(test_case, &started[test_case.id().as_str()]),
            "{} is not the submitted object",
            test_case.id()
        );
    }
}

#[test]
fn callback_error_is_returned() {
    test_init();

    let host = FakeHost::new();
    let tests = facts(&key_17(1), &["One", "Two"]);

    let config = test_config();
    let runner = builder(config.clone())
        .build(host.pool(&config))
        .expect("runner built");
    let result = runner.try_execute(tests, CancellationToken::new(), |event| match event.kind {
        TestEventKind::TestFinished { .. } => Err("reporter failed"),
        _ => Ok(()),
    });

    match result {
        Err(RunError::Callback(error)) => assert_eq!(error, "reporter failed"),
        other => panic!("expected a callback error, found {other:?}"),
    }
}

#[test]
fn duplicate_tests_run_once() {
    test_init();

    let host = FakeHost::new();
    let key = key_17(1);
    let mut tests = facts(&key, &["One"]);
    let duplicate = tests[0].clone();
    tests.push(duplicate);

    let config = test_config();
    let output = run(builder(config.clone()), host.pool(&config), tests);

    assert_eq!(output.summary.total, 1);
    assert_eq!(host.state().batches, [vec!["Tests.One_Exp_17.0.0".to_owned()]]);
}
