//! Test environment provisioning and assembly verification.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use super::config::{CommandSpec, MutantsTestingOptions};
use super::mutant::Mutant;

static ENVIRONMENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A mutation session as seen by collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationSession {
    /// Session name, used for directory naming.
    pub name: String,
    /// Testing options.
    pub options: MutantsTestingOptions,
}

impl MutationSession {
    /// New session.
    pub fn new(name: impl Into<String>, options: MutantsTestingOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

/// Isolated area where mutants of one session are stored.
///
/// Not `Clone`. Runs borrow it mutably, so one environment serves one run at
/// a time.
#[derive(Debug, PartialEq, Eq)]
pub struct TestEnvironmentInfo {
    /// Environment root directory.
    pub directory: PathBuf,
}

/// Where a mutant's variant was materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMutantInfo {
    /// Stored assembly files.
    pub assembly_paths: Vec<PathBuf>,
}

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// IO failure.
    #[error("io error at {}: {source}", path.display())]
    Io {
        /// Path being written or removed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Mutant has nothing to store.
    #[error("mutant {0} has no assemblies")]
    NoAssemblies(String),
}

/// Creates environments and materializes mutants into them.
pub trait Provisioner: Send + Sync {
    /// Create an environment for a session.
    fn init(&self, session: &MutationSession) -> Result<TestEnvironmentInfo, ProvisionError>;

    /// Write a mutant's assemblies into the environment.
    fn store(
        &self,
        environment: &TestEnvironmentInfo,
        mutant: &Mutant,
    ) -> Result<StoredMutantInfo, ProvisionError>;

    /// Remove an environment.
    fn cleanup(&self, environment: TestEnvironmentInfo) -> Result<(), ProvisionError>;
}

/// Verification failure for one assembly.
#[derive(Debug, Error)]
#[error("assembly {} failed verification: {message}", path.display())]
pub struct VerificationError {
    /// Assembly that failed.
    pub path: PathBuf,
    /// Verifier output.
    pub message: String,
}

/// Validates stored assemblies before tests run against them.
pub trait AssemblyVerifier: Send + Sync {
    /// Fail if the assembly is malformed.
    fn verify(&self, assembly_path: &Path) -> Result<(), VerificationError>;
}

/// Verifier that accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVerifier;

impl AssemblyVerifier for NoopVerifier {
    fn verify(&self, _assembly_path: &Path) -> Result<(), VerificationError> {
        Ok(())
    }
}

/// Verifier delegating to `<program> <args..> <assembly>`; non-zero exit fails.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    command: CommandSpec,
}

impl CommandVerifier {
    /// Wrap a command.
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

impl AssemblyVerifier for CommandVerifier {
    fn verify(&self, assembly_path: &Path) -> Result<(), VerificationError> {
        let output = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg(assembly_path)
            .output()
            .map_err(|err| VerificationError {
                path: assembly_path.to_path_buf(),
                message: format!("failed to run {}: {err}", self.command.program.display()),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&output.stdout).to_string()
            + &String::from_utf8_lossy(&output.stderr);
        Err(VerificationError {
            path: assembly_path.to_path_buf(),
            message: text.trim().to_string(),
        })
    }
}

/// Provisioner writing each session under `<root>/<session>-<pid>-<seq>/` and
/// each mutant under a sub-directory named after its id.
#[derive(Debug, Clone)]
pub struct DirectoryProvisioner {
    root: PathBuf,
}

impl DirectoryProvisioner {
    /// Provision under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProvisionError + '_ {
    move |source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Provisioner for DirectoryProvisioner {
    fn init(&self, session: &MutationSession) -> Result<TestEnvironmentInfo, ProvisionError> {
        let seq = ENVIRONMENT_SEQUENCE.fetch_add(1, Ordering::SeqCst);
        let directory = self.root.join(format!(
            "{}-{}-{seq}",
            sanitize_component(&session.name),
            std::process::id()
        ));
        std::fs::create_dir_all(&directory).map_err(io_error(&directory))?;
        tracing::debug!(directory = %directory.display(), "test environment created");
        Ok(TestEnvironmentInfo { directory })
    }

    fn store(
        &self,
        environment: &TestEnvironmentInfo,
        mutant: &Mutant,
    ) -> Result<StoredMutantInfo, ProvisionError> {
        if mutant.assemblies.is_empty() {
            return Err(ProvisionError::NoAssemblies(mutant.id.clone()));
        }
        let dir = environment.directory.join(sanitize_component(&mutant.id));
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(io_error(&dir))?;
        }
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let mut assembly_paths = Vec::with_capacity(mutant.assemblies.len());
        for image in &mutant.assemblies {
            let path = dir.join(sanitize_component(&image.file_name));
            std::fs::write(&path, &image.bytes).map_err(io_error(&path))?;
            assembly_paths.push(path);
        }
        Ok(StoredMutantInfo { assembly_paths })
    }

    fn cleanup(&self, environment: TestEnvironmentInfo) -> Result<(), ProvisionError> {
        let dir = environment.directory;
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(io_error(&dir))?;
        }
        Ok(())
    }
}
