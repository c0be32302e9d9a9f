//! Mutant model and per-run test session.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::engine::TestingError;
use super::tree::TestTree;

/// Verdict of a mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutantResultState {
    /// Never run.
    #[default]
    Untested,
    /// Run in progress.
    Tested,
    /// Every test passed.
    Live,
    /// Detected; see [`MutantKilledSubstate`].
    Killed,
    /// Could not be evaluated.
    Error,
}

/// Refinement of [`MutantResultState::Killed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutantKilledSubstate {
    /// A test failed.
    #[default]
    Normal,
    /// A test was inconclusive.
    Inconclusive,
    /// The run was interrupted by the timeout.
    TimedOut,
    /// Testing was cancelled.
    Cancelled,
}

/// One serialized assembly of a mutant's variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyImage {
    /// File name the assembly is stored under, e.g. `Core.dll`.
    pub file_name: String,
    /// Assembly bytes.
    pub bytes: Vec<u8>,
}

/// Diagnostic captured when a mutant ends in [`MutantResultState::Error`].
#[derive(Debug, Clone)]
pub struct MutantError {
    /// Short human-readable summary.
    pub description: String,
    /// Message of the underlying failure.
    pub message: String,
    /// Underlying failure.
    pub cause: Arc<TestingError>,
}

/// An assembly whose discovery failed; its tests are absent from the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    /// Assembly path.
    pub assembly: PathBuf,
    /// Backend that failed.
    pub backend: String,
    /// Failure detail.
    pub message: String,
}

/// Results of one testing attempt of a mutant.
#[derive(Debug, Clone, Default)]
pub struct TestSession {
    /// Discovered and executed tests.
    pub tree: TestTree,
    /// Assemblies that could not be loaded.
    pub load_failures: Vec<LoadFailure>,
    /// Time spent loading tests.
    pub load_time_ms: u64,
    /// Total wall time of the attempt.
    pub testing_time_ms: u64,
    /// Set once a verdict was resolved from the tree.
    pub is_complete: bool,
    /// Failure detail, if any.
    pub error: Option<MutantError>,
}

/// A generated program variant.
#[derive(Debug, Clone)]
pub struct Mutant {
    /// Identity within the mutation session.
    pub id: String,
    /// Human-readable mutation summary.
    pub description: String,
    /// Serialized variant assemblies.
    pub assemblies: Vec<AssemblyImage>,
    /// Current verdict.
    pub state: MutantResultState,
    /// Meaningful when `state` is `Killed`.
    pub killed_substate: MutantKilledSubstate,
    /// Failed or inconclusive test classes in the last run.
    pub number_of_failed_tests: usize,
    /// User-set flag, independent of the verdict.
    pub is_equivalent: bool,
    /// Last testing attempt.
    pub test_session: TestSession,
}

impl Mutant {
    /// New untested mutant.
    pub fn new(id: impl Into<String>, assemblies: Vec<AssemblyImage>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            assemblies,
            state: MutantResultState::Untested,
            killed_substate: MutantKilledSubstate::Normal,
            number_of_failed_tests: 0,
            is_equivalent: false,
            test_session: TestSession::default(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark as killed with a substate.
    pub(crate) fn set_killed(&mut self, substate: MutantKilledSubstate) {
        self.state = MutantResultState::Killed;
        self.killed_substate = substate;
    }

    /// Mark as errored and capture the diagnostic.
    pub(crate) fn set_error(&mut self, description: &str, cause: TestingError) {
        tracing::error!(mutant = %self.id, description, error = %cause, "mutant testing error");
        self.state = MutantResultState::Error;
        self.test_session.error = Some(MutantError {
            description: description.to_string(),
            message: cause.to_string(),
            cause: Arc::new(cause),
        });
    }

    /// Description of the captured error.
    pub fn error_description(&self) -> Option<&str> {
        self.test_session
            .error
            .as_ref()
            .map(|e| e.description.as_str())
    }

    /// Message of the captured error.
    pub fn error_message(&self) -> Option<&str> {
        self.test_session.error.as_ref().map(|e| e.message.as_str())
    }
}
