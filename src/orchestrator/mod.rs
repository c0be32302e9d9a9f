//! Mutant test execution orchestration.

pub mod backend;
pub mod config;
pub mod engine;
pub mod environment;
pub mod mutant;
pub mod process;
pub mod signal;
pub mod tree;
pub mod verdict;

pub use backend::{
    BackendError, BackendSet, CancellationHook, DiscoveredAssembly, LoadResult, ResultReporter,
    TestBackend, TestsLoadContext,
};
pub use config::{CommandSpec, ConfigError, MutantEntry, MutantsTestingOptions, SessionConfig};
pub use engine::{LoadedTests, MutantTestOrchestrator, TestingError};
pub use environment::{
    AssemblyVerifier, CommandVerifier, DirectoryProvisioner, MutationSession, NoopVerifier,
    ProvisionError, Provisioner, StoredMutantInfo, TestEnvironmentInfo, VerificationError,
};
pub use mutant::{
    AssemblyImage, LoadFailure, Mutant, MutantError, MutantKilledSubstate, MutantResultState,
    TestSession,
};
pub use process::ProcessBackend;
pub use tree::{
    DiscoveredClass, DiscoveredTest, NodeId, NodeKind, TestId, TestNode, TestNodeState, TestTree,
};
pub use verdict::{Resolution, UnclassifiableResults, Verdict};
