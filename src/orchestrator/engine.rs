//! Per-mutant test execution: provision, verify, load, run under a timeout,
//! resolve the verdict, release.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::backend::{
    BackendError, BackendSet, CancellationHook, LoadResult, ResultReporter, TestBackend,
    TestsLoadContext,
};
use super::config::MutantsTestingOptions;
use super::environment::{
    AssemblyVerifier, MutationSession, ProvisionError, Provisioner, TestEnvironmentInfo,
    VerificationError,
};
use super::mutant::{LoadFailure, Mutant, MutantKilledSubstate, MutantResultState, TestSession};
use super::signal::{RunEnd, RunSignal, TimeoutGuard};
use super::tree::{TestId, TestTree};
use super::verdict::{self, UnclassifiableResults, Verdict};

const VERIFICATION_FAILED: &str = "Mutant assembly failed verification";
const ERROR_OCCURRED: &str = "Error occurred";

/// Failures of one mutant's testing attempt. None of them escape
/// [`MutantTestOrchestrator::run_tests_for_mutant`]; they end up on the mutant.
#[derive(Debug, Error)]
pub enum TestingError {
    /// A stored assembly is malformed.
    #[error(transparent)]
    Verification(#[from] VerificationError),
    /// The mutant could not be stored.
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    /// A backend failed while running tests.
    #[error("running tests failed: {0}")]
    Run(BackendError),
    /// A backend task panicked.
    #[error("backend task panicked: {0}")]
    TaskPanicked(String),
    /// Testing was cancelled.
    #[error("testing cancelled")]
    Cancelled,
    /// The final results cannot be classified.
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(#[from] UnclassifiableResults),
}

/// A backend's discovery context, tagged with the backend that owns it.
#[derive(Debug, Clone)]
struct LoadedContext {
    backend: usize,
    context: TestsLoadContext,
}

/// Output of test discovery.
#[derive(Debug, Clone, Default)]
pub struct LoadedTests {
    /// Discovered tests.
    pub tree: TestTree,
    /// Assemblies whose discovery failed.
    pub failures: Vec<LoadFailure>,
    /// Wall time of discovery.
    pub elapsed_ms: u64,
    contexts: Vec<LoadedContext>,
}

/// Drives test runs for mutants against a fixed set of backends.
pub struct MutantTestOrchestrator {
    backends: BackendSet,
    provisioner: Arc<dyn Provisioner>,
    verifier: Arc<dyn AssemblyVerifier>,
    all_testing_cancelled: AtomicBool,
    tests_loaded: AtomicBool,
    current_run: Mutex<Option<Arc<RunSignal>>>,
    run_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for MutantTestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutantTestOrchestrator")
            .field("backends", &self.backends)
            .field("cancelled", &self.is_testing_cancelled())
            .finish_non_exhaustive()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl MutantTestOrchestrator {
    /// Build an orchestrator over `backends`.
    pub fn new(
        backends: Vec<Arc<dyn TestBackend>>,
        provisioner: Arc<dyn Provisioner>,
        verifier: Arc<dyn AssemblyVerifier>,
    ) -> Self {
        Self {
            backends: BackendSet::new(backends),
            provisioner,
            verifier,
            all_testing_cancelled: AtomicBool::new(false),
            tests_loaded: AtomicBool::new(false),
            current_run: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Notify `hook` whenever cancellation of a run is requested.
    pub fn with_cancellation_hook(mut self, hook: Arc<dyn CancellationHook>) -> Self {
        self.backends = self.backends.with_hook(hook);
        self
    }

    /// Create the environment shared by a session's mutants.
    pub fn init_test_environment(
        &self,
        session: &MutationSession,
    ) -> Result<TestEnvironmentInfo, ProvisionError> {
        self.provisioner.init(session)
    }

    /// Tear an environment down.
    pub fn cleanup_test_environment(
        &self,
        environment: TestEnvironmentInfo,
    ) -> Result<(), ProvisionError> {
        self.provisioner.cleanup(environment)
    }

    /// Whether [`Self::cancel_all_testing`] was called.
    pub fn is_testing_cancelled(&self) -> bool {
        self.all_testing_cancelled.load(Ordering::SeqCst)
    }

    /// Cancel the in-flight run and every run that has not started yet.
    ///
    /// Safe to call from any thread, with or without a run in progress.
    pub fn cancel_all_testing(&self) {
        info!("request to cancel all testing");
        self.all_testing_cancelled.store(true, Ordering::SeqCst);
        if let Some(signal) = self.current_run() {
            signal.cancel();
        }
        self.backends.cancel_all();
    }

    fn current_run(&self) -> Option<Arc<RunSignal>> {
        self.current_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current_run(&self, signal: Option<Arc<RunSignal>>) {
        *self
            .current_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = signal;
    }

    /// Restrict subsequent runs on every backend; `None` lifts the restriction.
    pub fn create_test_filter(&self, selected: Option<&[TestId]>) {
        self.backends.create_test_filter(selected);
    }

    /// Release backend state if tests are loaded. A second call is a no-op.
    pub fn unload_tests(&self) {
        if self.tests_loaded.swap(false, Ordering::SeqCst) {
            self.backends.unload_all();
        }
    }

    async fn release_tests(&self) {
        if !self.tests_loaded.swap(false, Ordering::SeqCst) {
            return;
        }
        let backends = self.backends.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || backends.unload_all()).await {
            warn!(error = %err, "unloading tests panicked");
        }
    }

    /// Discover tests in `paths` without running them, e.g. to build a
    /// selection from [`TestTree::included_tests`].
    pub async fn discover_tests(&self, paths: &[PathBuf]) -> LoadedTests {
        let _run = self.run_lock.lock().await;
        let loaded = self.load_tests(paths).await;
        self.release_tests().await;
        loaded
    }

    /// Load every path on every backend concurrently and merge the results.
    ///
    /// A failing assembly contributes no nodes and is recorded in
    /// [`LoadedTests::failures`]; its siblings are unaffected.
    async fn load_tests(&self, paths: &[PathBuf]) -> LoadedTests {
        let started = Instant::now();
        self.tests_loaded.store(true, Ordering::SeqCst);

        let mut handles = Vec::with_capacity(paths.len() * self.backends.len());
        for path in paths {
            for (index, backend) in self.backends.backends().iter().enumerate() {
                let backend = Arc::clone(backend);
                let task_path = path.clone();
                let handle = tokio::task::spawn_blocking(move || {
                    backend.load_tests(std::slice::from_ref(&task_path))
                });
                handles.push((index, path.clone(), handle));
            }
        }

        let mut loaded = LoadedTests::default();
        for (index, path, handle) in handles {
            let backend_name = self.backends.backends()[index].name().to_string();
            let message = match handle.await {
                Ok(Ok(LoadResult::Loaded(context))) => {
                    for assembly in &context.assemblies {
                        let node = loaded.tree.assembly_node(&assembly.path);
                        loaded.tree.add_classes(node, assembly.classes.clone());
                    }
                    loaded.contexts.push(LoadedContext {
                        backend: index,
                        context,
                    });
                    continue;
                }
                Ok(Ok(LoadResult::NoTests)) => {
                    debug!(assembly = %path.display(), backend = %backend_name, "no tests found");
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(err) => format!("load task panicked: {err}"),
            };
            warn!(assembly = %path.display(), backend = %backend_name, %message, "loading tests failed");
            loaded.failures.push(LoadFailure {
                assembly: path,
                backend: backend_name,
                message,
            });
        }

        loaded.elapsed_ms = elapsed_ms(started);
        loaded
    }

    /// Run each backend's contexts on its own blocking task and join them all.
    async fn run_tests(
        &self,
        contexts: Vec<LoadedContext>,
        reporter: &ResultReporter,
    ) -> Result<(), TestingError> {
        let mut per_backend: Vec<Vec<TestsLoadContext>> = vec![Vec::new(); self.backends.len()];
        for loaded in contexts {
            per_backend[loaded.backend].push(loaded.context);
        }

        let mut handles = Vec::new();
        for (backend, contexts) in self.backends.backends().iter().zip(per_backend) {
            if contexts.is_empty() {
                continue;
            }
            let backend = Arc::clone(backend);
            let reporter = reporter.clone();
            handles.push(tokio::task::spawn_blocking(
                move || -> Result<(), BackendError> {
                    for context in &contexts {
                        backend.run_tests(context, &reporter)?;
                    }
                    Ok(())
                },
            ));
        }

        let mut first_error = None;
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result.map_err(TestingError::Run),
                Err(err) => Err(TestingError::TaskPanicked(err.to_string())),
            };
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Test one mutant and record its verdict on it.
    ///
    /// Never fails: every error is captured on the mutant. The environment is
    /// borrowed mutably so that no two runs can share it.
    pub async fn run_tests_for_mutant(
        &self,
        environment: &mut TestEnvironmentInfo,
        options: &MutantsTestingOptions,
        mutant: &mut Mutant,
    ) {
        if self.is_testing_cancelled() {
            mutant.set_killed(MutantKilledSubstate::Cancelled);
            info!(mutant = %mutant.id, "testing cancelled before start");
            return;
        }

        let _run = self.run_lock.lock().await;
        let started = Instant::now();
        mutant.state = MutantResultState::Tested;
        mutant.number_of_failed_tests = 0;
        mutant.test_session = TestSession::default();

        let signal = Arc::new(RunSignal::new());
        self.set_current_run(Some(Arc::clone(&signal)));
        if self.is_testing_cancelled() {
            signal.cancel();
        }

        let outcome = self.execute(environment, options, mutant, &signal).await;
        self.set_current_run(None);
        self.release_tests().await;

        match outcome.and_then(|()| Ok(verdict::resolve(&mutant.test_session.tree)?)) {
            Ok(resolution) => {
                mutant.number_of_failed_tests = resolution.failed_classes;
                match resolution.verdict {
                    Verdict::Live => mutant.state = MutantResultState::Live,
                    Verdict::Killed(substate) => mutant.set_killed(substate),
                }
                mutant.test_session.is_complete = true;
                info!(
                    mutant = %mutant.id,
                    state = ?mutant.state,
                    substate = ?mutant.killed_substate,
                    failed = mutant.number_of_failed_tests,
                    "resolved mutant state"
                );
            }
            Err(TestingError::Cancelled) => {
                mutant.set_killed(MutantKilledSubstate::Cancelled);
                info!(mutant = %mutant.id, "testing cancelled");
            }
            Err(err @ TestingError::Verification(_)) => mutant.set_error(VERIFICATION_FAILED, err),
            Err(err) => mutant.set_error(ERROR_OCCURRED, err),
        }

        mutant.test_session.testing_time_ms = elapsed_ms(started);
    }

    async fn execute(
        &self,
        environment: &TestEnvironmentInfo,
        options: &MutantsTestingOptions,
        mutant: &mut Mutant,
        signal: &Arc<RunSignal>,
    ) -> Result<(), TestingError> {
        if signal.end() == RunEnd::Cancelled {
            return Err(TestingError::Cancelled);
        }
        let stored = self.provisioner.store(environment, mutant)?;

        if options.verify_mutants {
            let verifier = Arc::clone(&self.verifier);
            let paths = stored.assembly_paths.clone();
            tokio::task::spawn_blocking(move || {
                paths.iter().try_for_each(|path| verifier.verify(path))
            })
            .await
            .map_err(|err| TestingError::TaskPanicked(err.to_string()))??;
        }

        self.create_test_filter(options.selected_tests.as_deref());

        info!(mutant = %mutant.id, assemblies = stored.assembly_paths.len(), "loading tests");
        let loaded = self.load_tests(&stored.assembly_paths).await;
        mutant.test_session.load_time_ms = loaded.elapsed_ms;
        mutant.test_session.load_failures = loaded.failures;
        let mut tree = loaded.tree;

        if signal.end() == RunEnd::Cancelled {
            mutant.test_session.tree = tree;
            return Err(TestingError::Cancelled);
        }

        tree.mark_running(options.selected_tests.as_deref());
        let reporter = ResultReporter::new(tree);

        let timeout = TimeoutGuard::arm(
            options.testing_timeout(),
            Arc::clone(signal),
            self.backends.clone(),
        );
        info!(mutant = %mutant.id, "running tests");
        let run = self.run_tests(loaded.contexts, &reporter).await;
        signal.complete();
        timeout.disarm();
        mutant.test_session.tree = reporter.detach();

        match (signal.end(), run) {
            (RunEnd::Cancelled, _) => Err(TestingError::Cancelled),
            (RunEnd::TimedOut, Ok(()) | Err(TestingError::Run(BackendError::Cancelled))) => {
                warn!(mutant = %mutant.id, "test run interrupted by timeout");
                Ok(())
            }
            (_, Err(TestingError::Run(BackendError::Cancelled))) => Err(TestingError::Cancelled),
            (_, run) => run,
        }
    }

    /// Test every mutant of a session inside one environment.
    ///
    /// Mutants run one after another; whatever the ordering, each mutant's
    /// verdict is independent of its siblings.
    pub async fn run_session(
        &self,
        session: &MutationSession,
        mutants: &mut [Mutant],
    ) -> Result<(), ProvisionError> {
        let mut environment = self.init_test_environment(session)?;
        let total = mutants.len();
        for (index, mutant) in mutants.iter_mut().enumerate() {
            info!(mutant = %mutant.id, position = index + 1, total, "testing mutant");
            self.run_tests_for_mutant(&mut environment, &session.options, mutant)
                .await;
        }
        self.cleanup_test_environment(environment)
    }
}
