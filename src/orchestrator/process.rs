//! Backend driving an external test-runner process.
//!
//! Discovery runs `<program> <args..> list <assembly>` and expects one JSON
//! object per stdout line: `{"namespace": .., "class": .., "name": ..}`.
//! Execution runs `<program> <args..> run <assembly> [<test id>..]` and reads
//! `{"test": .., "outcome": ..}` lines as they are produced. Test ids are
//! `namespace.class.name`. Exit codes 0 and 1 both mean the run finished; a
//! result line that does not parse fails the run with a protocol error.
//!
//! The cancel flag is cleared when tests are loaded, never when a run starts,
//! so a `cancel` delivered between loading and running stops that run.

use std::collections::BTreeSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Deserialize;

use super::backend::{
    BackendError, DiscoveredAssembly, LoadResult, ResultReporter, TestBackend, TestsLoadContext,
};
use super::config::CommandSpec;
use super::tree::{DiscoveredClass, DiscoveredTest, TestId, TestNodeState};

#[derive(Debug, Deserialize)]
struct ListRecord {
    namespace: String,
    class: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RunOutcome {
    Running,
    Success,
    Failure,
    Inconclusive,
}

impl From<RunOutcome> for TestNodeState {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Running => TestNodeState::Running,
            RunOutcome::Success => TestNodeState::Success,
            RunOutcome::Failure => TestNodeState::Failure,
            RunOutcome::Inconclusive => TestNodeState::Inconclusive,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunRecord {
    test: String,
    outcome: RunOutcome,
}

#[derive(Debug)]
struct RunningChild {
    child: Child,
    kill_sent: bool,
}

/// [`TestBackend`] over an external runner command.
#[derive(Debug)]
pub struct ProcessBackend {
    name: String,
    command: CommandSpec,
    filter: Mutex<Option<BTreeSet<TestId>>>,
    running: Mutex<Option<RunningChild>>,
    cancelled: AtomicBool,
    loaded: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Group list records into classes, keeping first-seen order.
fn group_classes(records: Vec<ListRecord>) -> Vec<DiscoveredClass> {
    let mut classes: Vec<DiscoveredClass> = Vec::new();
    for record in records {
        let id = TestId::new(format!("{}.{}.{}", record.namespace, record.class, record.name));
        let test = DiscoveredTest {
            id,
            name: record.name,
        };
        match classes
            .iter_mut()
            .find(|c| c.namespace == record.namespace && c.name == record.class)
        {
            Some(class) => class.tests.push(test),
            None => classes.push(DiscoveredClass {
                namespace: record.namespace,
                name: record.class,
                tests: vec![test],
            }),
        }
    }
    classes
}

impl ProcessBackend {
    /// Backend running `command`.
    pub fn new(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
            filter: Mutex::new(None),
            running: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args);
        cmd
    }

    fn list(&self, path: &Path) -> Result<Vec<DiscoveredClass>, BackendError> {
        if !path.exists() {
            return Err(BackendError::MissingAssembly(path.to_path_buf()));
        }
        let output = self.command().arg("list").arg(path).output()?;
        if !output.status.success() {
            return Err(BackendError::Load {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut records = Vec::new();
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let record: ListRecord = serde_json::from_str(line).map_err(|err| BackendError::Load {
                path: path.to_path_buf(),
                message: format!("malformed discovery line `{line}`: {err}"),
            })?;
            records.push(record);
        }
        Ok(group_classes(records))
    }

    fn selected_ids(&self, assembly: &DiscoveredAssembly) -> Option<Vec<String>> {
        let filter = lock(&self.filter);
        let filter = filter.as_ref()?;
        Some(
            assembly
                .classes
                .iter()
                .flat_map(|c| c.tests.iter())
                .filter(|t| filter.contains(&t.id))
                .map(|t| t.id.as_str().to_string())
                .collect(),
        )
    }

    fn run_assembly(
        &self,
        assembly: &DiscoveredAssembly,
        reporter: &ResultReporter,
    ) -> Result<(), BackendError> {
        let selected = self.selected_ids(assembly);
        if selected.as_ref().is_some_and(Vec::is_empty) {
            tracing::debug!(assembly = %assembly.path.display(), "filter excludes every test");
            return Ok(());
        }

        let mut cmd = self.command();
        cmd.arg("run").arg(&assembly.path);
        if let Some(ids) = &selected {
            cmd.args(ids);
        }
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Run("runner stdout unavailable".to_string()))?;

        {
            let mut running = lock(&self.running);
            *running = Some(RunningChild {
                child,
                kill_sent: false,
            });
            // A cancel that raced with spawn saw no child; honor it now.
            if self.cancelled.load(Ordering::SeqCst) {
                if let Some(running) = running.as_mut() {
                    let _ = running.child.kill();
                    running.kill_sent = true;
                }
            }
        }

        // Keep draining after a bad line so the child can exit and be reaped.
        let mut malformed = None;
        for line in BufReader::new(stdout).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(line) {
                Ok(record) => {
                    reporter.report(&TestId::new(record.test), record.outcome.into());
                }
                Err(err) => {
                    tracing::warn!(%line, error = %err, "malformed result line");
                    if malformed.is_none() {
                        malformed = Some(format!("malformed result line `{line}`: {err}"));
                    }
                }
            }
        }

        let finished = lock(&self.running).take();
        let status = match finished {
            Some(mut running) => running.child.wait()?,
            None => return Err(BackendError::Cancelled),
        };
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(BackendError::Cancelled);
        }
        if let Some(message) = malformed {
            return Err(BackendError::Protocol(message));
        }
        match status.code() {
            Some(0) | Some(1) => Ok(()),
            code => Err(BackendError::Run(format!(
                "runner exited with {code:?} for {}",
                assembly.path.display()
            ))),
        }
    }

    fn kill_running(&self) -> bool {
        let mut running = lock(&self.running);
        match running.as_mut() {
            Some(running) if !running.kill_sent => {
                if let Err(err) = running.child.kill() {
                    tracing::debug!(error = %err, "runner already exited");
                }
                running.kill_sent = true;
                true
            }
            _ => false,
        }
    }
}

impl TestBackend for ProcessBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_tests(&self, assembly_paths: &[PathBuf]) -> Result<LoadResult, BackendError> {
        self.cancelled.store(false, Ordering::SeqCst);
        let mut context = TestsLoadContext::default();
        for path in assembly_paths {
            let classes = self.list(path)?;
            if !classes.is_empty() {
                context.assemblies.push(DiscoveredAssembly {
                    path: path.clone(),
                    classes,
                });
            }
        }
        self.loaded.store(true, Ordering::SeqCst);
        if context.assemblies.is_empty() {
            Ok(LoadResult::NoTests)
        } else {
            Ok(LoadResult::Loaded(context))
        }
    }

    fn create_test_filter(&self, selected: Option<&[TestId]>) {
        *lock(&self.filter) = selected.map(|ids| ids.iter().cloned().collect());
    }

    fn run_tests(
        &self,
        context: &TestsLoadContext,
        reporter: &ResultReporter,
    ) -> Result<(), BackendError> {
        for assembly in &context.assemblies {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(BackendError::Cancelled);
            }
            self.run_assembly(assembly, reporter)?;
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.kill_running() {
            tracing::info!(backend = %self.name, "killed running test process");
        }
    }

    fn unload_tests(&self) {
        if self.loaded.swap(false, Ordering::SeqCst) {
            self.kill_running();
            tracing::debug!(backend = %self.name, "tests unloaded");
        }
    }
}
