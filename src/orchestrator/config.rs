//! Testing options and session files.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tree::TestId;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Per-session options consumed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutantsTestingOptions {
    /// Wall-clock budget for one mutant's test run.
    #[serde(default = "default_timeout_secs")]
    pub testing_timeout_secs: u64,
    /// Verify stored assemblies before loading tests.
    #[serde(default)]
    pub verify_mutants: bool,
    /// Restrict runs to these tests; `None` runs everything discovered.
    #[serde(default)]
    pub selected_tests: Option<Vec<TestId>>,
}

impl Default for MutantsTestingOptions {
    fn default() -> Self {
        Self {
            testing_timeout_secs: DEFAULT_TIMEOUT_SECS,
            verify_mutants: false,
            selected_tests: None,
        }
    }
}

impl MutantsTestingOptions {
    /// Set the timeout in seconds.
    pub fn with_testing_timeout_secs(mut self, secs: u64) -> Self {
        self.testing_timeout_secs = secs;
        self
    }

    /// Enable or disable verification.
    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verify_mutants = enabled;
        self
    }

    /// Restrict runs to a selection.
    pub fn with_selected_tests(mut self, tests: impl IntoIterator<Item = TestId>) -> Self {
        self.selected_tests = Some(tests.into_iter().collect());
        self
    }

    /// Timeout as a duration.
    pub fn testing_timeout(&self) -> Duration {
        Duration::from_secs(self.testing_timeout_secs)
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO failure.
    #[error("io error reading {}: {source}", path.display())]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Malformed JSON.
    #[error("invalid session file: {0}")]
    Parse(#[from] serde_json::Error),
    /// Semantically invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// External command description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: PathBuf,
    /// Leading arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

/// A mutant as listed in a session file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutantEntry {
    /// Mutant id.
    pub id: String,
    /// Optional description.
    #[serde(default)]
    pub description: String,
    /// Variant assembly files.
    pub assemblies: Vec<PathBuf>,
}

/// JSON session file read by the `mutest` binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Session name.
    pub name: String,
    /// Directory under which test environments are created.
    pub work_root: PathBuf,
    /// Testing options.
    #[serde(default)]
    pub options: MutantsTestingOptions,
    /// Test runner command.
    pub backend: CommandSpec,
    /// Optional verifier command.
    #[serde(default)]
    pub verifier: Option<CommandSpec>,
    /// Mutants to test.
    pub mutants: Vec<MutantEntry>,
}

impl SessionConfig {
    /// Read and validate a session file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.options.testing_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "options.testing_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.mutants.is_empty() {
            return Err(ConfigError::Invalid("no mutants listed".to_string()));
        }
        let mut seen = BTreeSet::new();
        for mutant in &self.mutants {
            if !seen.insert(mutant.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate mutant id `{}`",
                    mutant.id
                )));
            }
        }
        Ok(())
    }
}
