//! # mutant-testing
//!
//! `mutant-testing` runs an external test suite against generated program
//! variants ("mutants") and classifies each one:
//! - `orchestrator::engine`: per-mutant provisioning, verification, loading,
//!   running under a timeout, and verdict resolution
//! - `orchestrator::backend`: the pluggable test-framework capability
//! - `orchestrator::tree`: hierarchical result tree with state propagation
//! - `orchestrator::process`: a backend driving an external runner process
//!
//! Generating mutants and rewriting binaries belong to other components;
//! this crate only consumes their serialized output.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod orchestrator;
pub mod prelude;
