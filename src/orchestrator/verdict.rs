//! Verdict resolution from a finished result tree.

use super::mutant::MutantKilledSubstate;
use super::tree::{TestNodeState, TestTree};

/// Verdict derived from test outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Every test passed.
    Live,
    /// At least one test detected the mutant, or the run was interrupted.
    Killed(MutantKilledSubstate),
}

/// Verdict plus the failed-class count reported alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Resolved verdict.
    pub verdict: Verdict,
    /// Class nodes in `Failure` or `Inconclusive`.
    pub failed_classes: usize,
}

/// The tree holds no participating class or an impossible state mix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot resolve verdict from {participating} participating test classes")]
pub struct UnclassifiableResults {
    /// Number of class nodes that took part in the run.
    pub participating: usize,
}

/// Resolve over class-level nodes, ignoring classes left `Inactive`.
///
/// Priority: inconclusive, running (reported as timed out), failure, then
/// all-success. A class still running only proves the run was interrupted,
/// so `TimedOut` may mislabel a mutant whose tests finished as the timer fired.
pub fn resolve(tree: &TestTree) -> Result<Resolution, UnclassifiableResults> {
    let states: Vec<TestNodeState> = tree
        .class_nodes()
        .map(|id| tree.node(id).state)
        .filter(|state| *state != TestNodeState::Inactive)
        .collect();

    let failed_classes = states
        .iter()
        .filter(|s| matches!(s, TestNodeState::Failure | TestNodeState::Inconclusive))
        .count();

    let verdict = if states.contains(&TestNodeState::Inconclusive) {
        Verdict::Killed(MutantKilledSubstate::Inconclusive)
    } else if states.contains(&TestNodeState::Running) {
        Verdict::Killed(MutantKilledSubstate::TimedOut)
    } else if states.contains(&TestNodeState::Failure) {
        Verdict::Killed(MutantKilledSubstate::Normal)
    } else if !states.is_empty() && states.iter().all(|s| *s == TestNodeState::Success) {
        Verdict::Live
    } else {
        return Err(UnclassifiableResults {
            participating: states.len(),
        });
    };

    Ok(Resolution {
        verdict,
        failed_classes,
    })
}
