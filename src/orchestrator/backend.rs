//! Test backend capability and fan-out over the registered set.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::tree::{DiscoveredClass, TestId, TestNodeState, TestTree};

/// Backend-level errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Assembly path does not exist.
    #[error("assembly not found: {}", .0.display())]
    MissingAssembly(PathBuf),
    /// Discovery failed for an assembly.
    #[error("failed to load tests from {}: {message}", path.display())]
    Load {
        /// Assembly that failed.
        path: PathBuf,
        /// Backend detail.
        message: String,
    },
    /// Execution failed.
    #[error("test run failed: {0}")]
    Run(String),
    /// Backend output could not be understood, e.g. a malformed result line.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Run was abandoned after `cancel`.
    #[error("test run cancelled")]
    Cancelled,
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tests discovered in one assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAssembly {
    /// Assembly path.
    pub path: PathBuf,
    /// Declaring classes in discovery order.
    pub classes: Vec<DiscoveredClass>,
}

/// Backend discovery context handed back to `run_tests`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TestsLoadContext {
    /// Assemblies with at least one discovered test.
    pub assemblies: Vec<DiscoveredAssembly>,
}

impl TestsLoadContext {
    /// Every discovered test id.
    pub fn test_ids(&self) -> impl Iterator<Item = &TestId> {
        self.assemblies
            .iter()
            .flat_map(|a| a.classes.iter())
            .flat_map(|c| c.tests.iter())
            .map(|t| &t.id)
    }
}

/// Outcome of `load_tests`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadResult {
    /// Tests were found.
    Loaded(TestsLoadContext),
    /// The assemblies are valid but contain no tests for this backend.
    NoTests,
}

/// Handle through which a running backend publishes per-test outcomes.
///
/// Every clone writes into the same tree; the orchestrator detaches the tree
/// once all runs have joined, so late reports land in an empty tree.
#[derive(Debug, Clone, Default)]
pub struct ResultReporter {
    tree: Arc<Mutex<TestTree>>,
}

impl ResultReporter {
    /// Wrap a tree for concurrent updates.
    pub fn new(tree: TestTree) -> Self {
        Self {
            tree: Arc::new(Mutex::new(tree)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TestTree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a test state. Returns false if the test is unknown.
    pub fn report(&self, test: &TestId, state: TestNodeState) -> bool {
        let known = self.lock().set_test_state(test, state);
        if !known {
            tracing::debug!(test = %test, ?state, "result for unknown test ignored");
        }
        known
    }

    /// Current state of a test.
    pub fn state_of(&self, test: &TestId) -> Option<TestNodeState> {
        let tree = self.lock();
        tree.find_test(test).map(|id| tree.node(id).state)
    }

    /// Take the tree out, leaving an empty one behind.
    pub fn detach(&self) -> TestTree {
        std::mem::take(&mut *self.lock())
    }
}

/// A pluggable test framework.
///
/// Methods take `&self` so that `cancel` can be delivered from another thread
/// while `run_tests` is blocked. `load_tests`, `run_tests` and `unload_tests`
/// are not reentrant; the orchestrator serializes them.
pub trait TestBackend: Send + Sync {
    /// Short framework name used in logs.
    fn name(&self) -> &str;

    /// Discover tests in the given assemblies.
    fn load_tests(&self, assembly_paths: &[PathBuf]) -> Result<LoadResult, BackendError>;

    /// Restrict subsequent runs to `selected`; `None` clears any previous
    /// filter so every discovered test runs.
    fn create_test_filter(&self, selected: Option<&[TestId]>);

    /// Execute the tests of `context`, reporting outcomes as they arrive.
    fn run_tests(
        &self,
        context: &TestsLoadContext,
        reporter: &ResultReporter,
    ) -> Result<(), BackendError>;

    /// Ask an in-flight run to stop at its next checkpoint. Idempotent.
    ///
    /// A cancel delivered after `load_tests` but before `run_tests` starts
    /// must still stop that run; only `load_tests` may clear it.
    fn cancel(&self);

    /// Release anything held since loading. Idempotent.
    fn unload_tests(&self);
}

/// Observer notified when cancellation of the current run is requested.
pub trait CancellationHook: Send + Sync {
    /// Called once per cancellation request.
    fn on_testing_cancelled(&self);
}

/// The registered backends, treated uniformly.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: Vec<Arc<dyn TestBackend>>,
    hook: Option<Arc<dyn CancellationHook>>,
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSet")
            .field(
                "backends",
                &self.backends.iter().map(|b| b.name().to_string()).collect::<Vec<_>>(),
            )
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl BackendSet {
    /// Build from backends.
    pub fn new(backends: Vec<Arc<dyn TestBackend>>) -> Self {
        Self {
            backends,
            hook: None,
        }
    }

    /// Attach a cancellation hook.
    pub fn with_hook(mut self, hook: Arc<dyn CancellationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Registered backends.
    pub fn backends(&self) -> &[Arc<dyn TestBackend>] {
        &self.backends
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// True when no backend is registered.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Fan a filter (or its removal) out to every backend.
    pub fn create_test_filter(&self, selected: Option<&[TestId]>) {
        for backend in &self.backends {
            backend.create_test_filter(selected);
        }
    }

    /// Cancel every backend, then notify the hook.
    pub fn cancel_all(&self) {
        for backend in &self.backends {
            backend.cancel();
        }
        if let Some(hook) = &self.hook {
            hook.on_testing_cancelled();
        }
    }

    /// Unload every backend.
    pub fn unload_all(&self) {
        for backend in &self.backends {
            backend.unload_tests();
        }
    }
}
