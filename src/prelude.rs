//! Prelude module for convenient imports.
//!
//! # Example
//!
//! ```rust,ignore
//! use mutant_testing::prelude::*;
//! ```

pub use crate::orchestrator::{
    AssemblyImage, AssemblyVerifier, BackendError, CancellationHook, DirectoryProvisioner,
    LoadResult, Mutant, MutantKilledSubstate, MutantResultState, MutantTestOrchestrator,
    MutantsTestingOptions, MutationSession, NoopVerifier, ProcessBackend, Provisioner,
    ResultReporter, TestBackend, TestId, TestNodeState, TestTree, TestsLoadContext,
};
