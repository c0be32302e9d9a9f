#![cfg(any(target_os = "linux", target_os = "macos"))]

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use mutant_testing::orchestrator::{
    AssemblyImage, BackendError, CommandSpec, DirectoryProvisioner, LoadResult, Mutant,
    MutantKilledSubstate, MutantResultState, MutantTestOrchestrator, MutantsTestingOptions,
    MutationSession, NoopVerifier, ProcessBackend, ResultReporter, TestBackend, TestId,
    TestNodeState, TestTree, TestingError,
};

/// Runner whose behaviour is selected by the assembly's content:
/// `pass`, `fail`, `hang`, `garbled` or `broken`.
fn fake_runner(tmp: &Path) -> PathBuf {
    let script = tmp.join("runner.sh");
    let mut file = File::create(&script).expect("runner script should be created");
    file.write_all(
        br#"#!/usr/bin/env sh
set -e

cmd="$1"
assembly="$2"
shift 2
mode=$(cat "$assembly")

if [ "$cmd" = "list" ]; then
  if [ "$mode" = "broken" ]; then
    echo "cannot read image" >&2
    exit 3
  fi
  echo '{"namespace":"Calc","class":"Ops","name":"adds"}'
  echo '{"namespace":"Calc","class":"Ops","name":"negates"}'
  exit 0
fi

if [ "$cmd" = "run" ]; then
  if [ "$#" -gt 0 ]; then
    tests="$*"
  else
    tests="Calc.Ops.adds Calc.Ops.negates"
  fi
  status=0
  if [ "$mode" = "garbled" ]; then
    echo "warming up"
  fi
  for test in $tests; do
    echo "{\"test\":\"$test\",\"outcome\":\"running\"}"
    if [ "$mode" = "hang" ] && [ "$test" = "Calc.Ops.negates" ]; then
      exec sleep 30
    fi
    if [ "$mode" = "fail" ] && [ "$test" = "Calc.Ops.negates" ]; then
      echo "{\"test\":\"$test\",\"outcome\":\"failure\"}"
      status=1
    else
      echo "{\"test\":\"$test\",\"outcome\":\"success\"}"
    fi
  done
  exit $status
fi

echo "unsupported command: $cmd" >&2
exit 2
"#,
    )
    .expect("runner script should be written");
    file.sync_all().expect("runner script should be flushed");
    fs::set_permissions(&script, PermissionsExt::from_mode(0o755))
        .expect("runner script should be executable");
    script
}

fn runner_command(script: &Path) -> CommandSpec {
    CommandSpec {
        program: script.to_path_buf(),
        args: Vec::new(),
    }
}

fn write_assembly(dir: &Path, name: &str, mode: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, mode).expect("assembly should be written");
    path
}

fn image(name: &str, mode: &str) -> AssemblyImage {
    AssemblyImage {
        file_name: name.to_string(),
        bytes: mode.as_bytes().to_vec(),
    }
}

fn orchestrator(script: &Path, work_root: &Path) -> MutantTestOrchestrator {
    MutantTestOrchestrator::new(
        vec![Arc::new(ProcessBackend::new("process", runner_command(script)))],
        Arc::new(DirectoryProvisioner::new(work_root)),
        Arc::new(NoopVerifier),
    )
}

#[test]
fn runner_discovery_is_grouped_into_one_class() {
    let tmp = tempdir().expect("tempdir should be created");
    let script = fake_runner(tmp.path());
    let assembly = write_assembly(tmp.path(), "Calc.dll", "pass");
    let backend = ProcessBackend::new("process", runner_command(&script));

    let result = backend
        .load_tests(&[assembly.clone()])
        .expect("discovery should succeed");
    let LoadResult::Loaded(context) = result else {
        panic!("expected discovered tests");
    };
    assert_eq!(context.assemblies.len(), 1);
    assert_eq!(context.assemblies[0].path, assembly);
    let classes = &context.assemblies[0].classes;
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].name, "Ops");
    assert_eq!(
        context
            .test_ids()
            .map(|id| id.as_str())
            .collect::<Vec<_>>(),
        vec!["Calc.Ops.adds", "Calc.Ops.negates"]
    );
}

#[test]
fn runner_discovery_failure_carries_stderr() {
    let tmp = tempdir().expect("tempdir should be created");
    let script = fake_runner(tmp.path());
    let assembly = write_assembly(tmp.path(), "Broken.dll", "broken");
    let backend = ProcessBackend::new("process", runner_command(&script));

    match backend.load_tests(&[assembly]) {
        Err(BackendError::Load { message, .. }) => assert_eq!(message, "cannot read image"),
        other => panic!("expected load failure, got {other:?}"),
    }
}

#[tokio::test]
async fn passing_and_failing_runs_are_classified() {
    let tmp = tempdir().expect("tempdir should be created");
    let script = fake_runner(tmp.path());
    let orchestrator = orchestrator(&script, &tmp.path().join("work"));
    let session = MutationSession::new("e2e", MutantsTestingOptions::default());
    let mut mutants = vec![
        Mutant::new("survivor", vec![image("Calc.dll", "pass")]),
        Mutant::new("detected", vec![image("Calc.dll", "fail")]),
        Mutant::new("unloadable", vec![image("Calc.dll", "broken")]),
    ];

    orchestrator
        .run_session(&session, &mut mutants)
        .await
        .expect("session should run");

    assert_eq!(mutants[0].state, MutantResultState::Live);
    assert_eq!(mutants[1].state, MutantResultState::Killed);
    assert_eq!(mutants[1].killed_substate, MutantKilledSubstate::Normal);
    assert_eq!(mutants[1].number_of_failed_tests, 1);
    assert_eq!(mutants[2].state, MutantResultState::Error);
    assert_eq!(mutants[2].test_session.load_failures.len(), 1);

    let work_dirs = fs::read_dir(tmp.path().join("work"))
        .expect("work root should exist")
        .count();
    assert_eq!(work_dirs, 0);
}

#[test]
fn cancel_between_load_and_run_stops_the_run() {
    let tmp = tempdir().expect("tempdir should be created");
    let script = fake_runner(tmp.path());
    let assembly = write_assembly(tmp.path(), "Calc.dll", "hang");
    let backend = ProcessBackend::new("process", runner_command(&script));
    let LoadResult::Loaded(context) = backend
        .load_tests(&[assembly])
        .expect("discovery should succeed")
    else {
        panic!("expected discovered tests");
    };

    backend.cancel();
    let started = Instant::now();
    let result = backend.run_tests(&context, &ResultReporter::new(TestTree::new()));

    assert!(matches!(result, Err(BackendError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn selection_does_not_leak_into_the_next_run() {
    let tmp = tempdir().expect("tempdir should be created");
    let script = fake_runner(tmp.path());
    let orchestrator = orchestrator(&script, tmp.path());
    let session = MutationSession::new("e2e", MutantsTestingOptions::default());
    let mut environment = orchestrator
        .init_test_environment(&session)
        .expect("environment should initialize");

    let selected = MutantsTestingOptions::default()
        .with_selected_tests(vec![TestId::from("Calc.Ops.adds")]);
    let mut first = Mutant::new("first", vec![image("Calc.dll", "pass")]);
    orchestrator
        .run_tests_for_mutant(&mut environment, &selected, &mut first)
        .await;
    assert_eq!(first.state, MutantResultState::Live);

    let mut second = Mutant::new("second", vec![image("Calc.dll", "pass")]);
    orchestrator
        .run_tests_for_mutant(&mut environment, &MutantsTestingOptions::default(), &mut second)
        .await;

    assert_eq!(second.state, MutantResultState::Live);
    let tree = &second.test_session.tree;
    let negates = tree
        .find_test(&"Calc.Ops.negates".into())
        .expect("negates should be discovered");
    assert_eq!(tree.node(negates).state, TestNodeState::Success);

    orchestrator
        .cleanup_test_environment(environment)
        .expect("cleanup should succeed");
}

#[tokio::test]
async fn unparseable_result_line_fails_the_run() {
    let tmp = tempdir().expect("tempdir should be created");
    let script = fake_runner(tmp.path());
    let orchestrator = orchestrator(&script, tmp.path());
    let session = MutationSession::new("e2e", MutantsTestingOptions::default());
    let mut mutants = vec![Mutant::new("noisy", vec![image("Calc.dll", "garbled")])];

    orchestrator
        .run_session(&session, &mut mutants)
        .await
        .expect("session should run");

    let mutant = &mutants[0];
    assert_eq!(mutant.state, MutantResultState::Error);
    let error = mutant
        .test_session
        .error
        .as_ref()
        .expect("error should be captured");
    assert!(matches!(
        *error.cause,
        TestingError::Run(BackendError::Protocol(_))
    ));
    assert!(error.message.contains("warming up"));
}

#[tokio::test]
async fn hanging_runner_is_killed_on_timeout() {
    let tmp = tempdir().expect("tempdir should be created");
    let script = fake_runner(tmp.path());
    let orchestrator = orchestrator(&script, tmp.path());
    let session = MutationSession::new("e2e", MutantsTestingOptions::default());
    let mut environment = orchestrator
        .init_test_environment(&session)
        .expect("environment should initialize");
    let options = MutantsTestingOptions::default().with_testing_timeout_secs(1);
    let mut mutant = Mutant::new("spinner", vec![image("Calc.dll", "hang")]);

    let started = Instant::now();
    orchestrator
        .run_tests_for_mutant(&mut environment, &options, &mut mutant)
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(mutant.state, MutantResultState::Killed);
    assert_eq!(mutant.killed_substate, MutantKilledSubstate::TimedOut);
    let tree = &mutant.test_session.tree;
    let adds = tree
        .find_test(&"Calc.Ops.adds".into())
        .expect("adds should be discovered");
    let negates = tree
        .find_test(&"Calc.Ops.negates".into())
        .expect("negates should be discovered");
    assert_eq!(tree.node(adds).state, TestNodeState::Success);
    assert_eq!(tree.node(negates).state, TestNodeState::Running);

    orchestrator
        .cleanup_test_environment(environment)
        .expect("cleanup should succeed");
}

#[cfg(feature = "cli")]
#[test]
fn cli_reports_json_verdicts() {
    use std::process::Command;

    let tmp = tempdir().expect("tempdir should be created");
    let script = fake_runner(tmp.path());
    let pass = write_assembly(tmp.path(), "Pass.dll", "pass");
    let fail = write_assembly(tmp.path(), "Fail.dll", "fail");
    let session = tmp.path().join("session.json");
    let config = serde_json::json!({
        "name": "cli",
        "work_root": tmp.path().join("work"),
        "backend": { "program": script },
        "mutants": [
            { "id": "m1", "assemblies": [pass] },
            { "id": "m2", "description": "negate flipped", "assemblies": [fail] },
        ],
    });
    fs::write(&session, config.to_string()).expect("session file should be written");

    let output = Command::new(env!("CARGO_BIN_EXE_mutest"))
        .arg("run")
        .arg("--session")
        .arg(&session)
        .arg("--json")
        .output()
        .expect("mutest should run");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let payload: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    let mutants = payload.as_array().expect("payload should be an array");
    assert_eq!(mutants.len(), 2);
    assert_eq!(mutants[0]["mutant_id"], "m1");
    assert_eq!(mutants[0]["state"], "live");
    assert_eq!(mutants[1]["state"], "killed");
    assert_eq!(mutants[1]["killed_substate"], "normal");
    assert_eq!(mutants[1]["failed_tests"], 1);
}
