//! Hierarchical test result tree.
//!
//! Nodes live in an arena owned by [`TestTree`]; ownership runs strictly
//! top-down (root → assembly → namespace → class → test) and the only upward
//! link is the non-owning `parent` index used for state propagation and
//! inclusion inheritance.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Stable identifier of one test method across discovery and execution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(pub String);

impl TestId {
    /// Build an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Execution state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestNodeState {
    /// Not scheduled, or not part of the current run.
    Inactive,
    /// Scheduled and not yet finished.
    Running,
    /// Passed.
    Success,
    /// Failed.
    Failure,
    /// Finished without a definite pass/fail.
    Inconclusive,
}

impl TestNodeState {
    /// Aggregate child states into a parent state.
    ///
    /// Inactive children do not take part. Priority matches verdict
    /// resolution: inconclusive, then running, then failure; a parent is a
    /// success only when every participating child is.
    pub fn aggregate<I>(children: I) -> Self
    where
        I: IntoIterator<Item = TestNodeState>,
    {
        let mut any = false;
        let mut running = false;
        let mut failure = false;
        let mut inconclusive = false;
        for state in children {
            match state {
                Self::Inactive => continue,
                Self::Running => running = true,
                Self::Failure => failure = true,
                Self::Inconclusive => inconclusive = true,
                Self::Success => {}
            }
            any = true;
        }

        if !any {
            Self::Inactive
        } else if inconclusive {
            Self::Inconclusive
        } else if running {
            Self::Running
        } else if failure {
            Self::Failure
        } else {
            Self::Success
        }
    }
}

/// Index of a node inside its [`TestTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

/// Level-specific payload of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Tree root.
    Root,
    /// One loaded assembly.
    Assembly {
        /// On-disk location the tests were loaded from.
        path: PathBuf,
    },
    /// Namespace grouping inside an assembly.
    Namespace,
    /// Declaring class of a group of tests.
    Class {
        /// Namespace the class belongs to.
        namespace: String,
    },
    /// Individual test method.
    Test {
        /// Identifier used by backends and filters.
        id: TestId,
    },
}

/// One node of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestNode {
    /// Display name.
    pub name: String,
    /// Level payload.
    pub kind: NodeKind,
    /// Current state.
    pub state: TestNodeState,
    /// Explicit inclusion flag; `None` inherits from the parent.
    pub included: Option<bool>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl TestNode {
    fn new(name: impl Into<String>, kind: NodeKind, parent: Option<NodeId>) -> Self {
        Self {
            name: name.into(),
            kind,
            state: TestNodeState::Inactive,
            included: None,
            parent,
            children: Vec::new(),
        }
    }

    /// Owning node, absent for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in insertion order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Test id when this node is a leaf test.
    pub fn test_id(&self) -> Option<&TestId> {
        match &self.kind {
            NodeKind::Test { id } => Some(id),
            _ => None,
        }
    }
}

/// A test method reported by a backend during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredTest {
    /// Identifier.
    pub id: TestId,
    /// Method name.
    pub name: String,
}

/// A declaring class and its discovered tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredClass {
    /// Declaring namespace.
    pub namespace: String,
    /// Class name.
    pub name: String,
    /// Tests in discovery order.
    pub tests: Vec<DiscoveredTest>,
}

/// Arena-backed result tree for one test session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTree {
    nodes: Vec<TestNode>,
    tests_by_id: HashMap<TestId, NodeId>,
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTree {
    /// Empty tree containing only the root.
    pub fn new() -> Self {
        Self {
            nodes: vec![TestNode::new("root", NodeKind::Root, None)],
            tests_by_id: HashMap::new(),
        }
    }

    /// Root node id.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Borrow a node.
    ///
    /// Panics if `id` came from another tree.
    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[id.0]
    }

    /// Number of nodes including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing but the root exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Assembly nodes in load order.
    pub fn assemblies(&self) -> &[NodeId] {
        self.node(self.root()).children()
    }

    /// Nodes matching `predicate`, in arena order.
    pub fn nodes_where<F>(&self, mut predicate: F) -> impl Iterator<Item = NodeId> + '_
    where
        F: FnMut(&TestNode) -> bool + 'static,
    {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, node)| predicate(*node))
            .map(|(idx, _)| NodeId(idx))
    }

    /// Class-level nodes, which verdict resolution is evaluated over.
    pub fn class_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes_where(|node| matches!(node.kind, NodeKind::Class { .. }))
    }

    /// Leaf test nodes.
    pub fn test_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes_where(|node| matches!(node.kind, NodeKind::Test { .. }))
    }

    /// Look up a leaf by test id.
    pub fn find_test(&self, id: &TestId) -> Option<NodeId> {
        self.tests_by_id.get(id).copied()
    }

    fn push(&mut self, parent: NodeId, name: impl Into<String>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(TestNode::new(name, kind, Some(parent)));
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Find the assembly node for `path`, creating it under the root if needed.
    pub fn assembly_node(&mut self, path: &Path) -> NodeId {
        let existing = self.assemblies().iter().copied().find(|id| {
            matches!(&self.node(*id).kind, NodeKind::Assembly { path: p } if p == path)
        });
        if let Some(id) = existing {
            return id;
        }
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.push(
            self.root(),
            name,
            NodeKind::Assembly {
                path: path.to_path_buf(),
            },
        )
    }

    /// Attach discovered classes to an assembly, grouped by namespace.
    ///
    /// Namespace groups are created in sorted key order; classes and tests keep
    /// discovery order inside their group. A test id already present in the
    /// tree keeps pointing at its first node.
    pub fn add_classes(&mut self, assembly: NodeId, classes: Vec<DiscoveredClass>) {
        let mut groups: BTreeMap<String, Vec<DiscoveredClass>> = BTreeMap::new();
        for class in classes {
            groups.entry(class.namespace.clone()).or_default().push(class);
        }

        for (namespace, classes) in groups {
            let existing = self.node(assembly).children().iter().copied().find(|id| {
                let node = self.node(*id);
                node.kind == NodeKind::Namespace && node.name == namespace
            });
            let ns_node = match existing {
                Some(id) => id,
                None => self.push(assembly, namespace.clone(), NodeKind::Namespace),
            };

            for class in classes {
                let class_node = self.push(
                    ns_node,
                    class.name,
                    NodeKind::Class {
                        namespace: namespace.clone(),
                    },
                );
                for test in class.tests {
                    let leaf = self.push(
                        class_node,
                        test.name,
                        NodeKind::Test {
                            id: test.id.clone(),
                        },
                    );
                    if self.tests_by_id.contains_key(&test.id) {
                        tracing::warn!(test = %test.id, "duplicate test id in result tree");
                    } else {
                        self.tests_by_id.insert(test.id, leaf);
                    }
                }
            }
        }
    }

    /// Set a node's explicit inclusion flag.
    pub fn set_included(&mut self, id: NodeId, included: Option<bool>) {
        self.nodes[id.0].included = included;
    }

    /// Whether a node is included, inheriting from ancestors (default true).
    pub fn is_included(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            if let Some(included) = node.included {
                return included;
            }
            current = node.parent;
        }
        true
    }

    /// Ids of every included leaf, in tree order.
    pub fn included_tests(&self) -> Vec<TestId> {
        let mut out = Vec::new();
        self.collect_included(self.root(), true, &mut out);
        out
    }

    fn collect_included(&self, id: NodeId, inherited: bool, out: &mut Vec<TestId>) {
        let node = self.node(id);
        let included = node.included.unwrap_or(inherited);
        if !included {
            return;
        }
        if let Some(test) = node.test_id() {
            out.push(test.clone());
        }
        for child in node.children() {
            self.collect_included(*child, included, out);
        }
    }

    /// Set a leaf state by id and propagate upwards. Returns false for unknown ids.
    pub fn set_test_state(&mut self, test: &TestId, state: TestNodeState) -> bool {
        match self.find_test(test) {
            Some(id) => {
                self.set_state(id, state);
                true
            }
            None => false,
        }
    }

    /// Set a node's state and recompute every ancestor from its children.
    pub fn set_state(&mut self, id: NodeId, state: TestNodeState) {
        self.nodes[id.0].state = state;
        let mut current = self.nodes[id.0].parent;
        while let Some(parent) = current {
            let children = &self.nodes[parent.0].children;
            let aggregated =
                TestNodeState::aggregate(children.iter().map(|c| self.nodes[c.0].state));
            self.nodes[parent.0].state = aggregated;
            current = self.nodes[parent.0].parent;
        }
    }

    /// Mark every leaf in `selection` (or every leaf when `None`) as running.
    pub fn mark_running(&mut self, selection: Option<&[TestId]>) {
        let leaves: Vec<NodeId> = match selection {
            Some(ids) => ids.iter().filter_map(|id| self.find_test(id)).collect(),
            None => self.test_nodes().collect(),
        };
        for leaf in leaves {
            self.set_state(leaf, TestNodeState::Running);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn class(namespace: &str, name: &str, tests: &[&str]) -> DiscoveredClass {
        DiscoveredClass {
            namespace: namespace.to_string(),
            name: name.to_string(),
            tests: tests
                .iter()
                .map(|t| DiscoveredTest {
                    id: TestId::new(format!("{namespace}.{name}.{t}")),
                    name: t.to_string(),
                })
                .collect(),
        }
    }

    fn sample_tree() -> TestTree {
        let mut tree = TestTree::new();
        let asm = tree.assembly_node(Path::new("/tmp/A.dll"));
        tree.add_classes(
            asm,
            vec![
                class("Zeta", "Third", &["z1"]),
                class("Alpha", "First", &["a1", "a2"]),
                class("Alpha", "Second", &["b1"]),
            ],
        );
        tree
    }

    #[test]
    fn grouping_orders_namespaces_and_keeps_class_discovery_order() {
        let tree = sample_tree();
        let asm = tree.assemblies()[0];
        assert_eq!(tree.node(asm).name, "A");

        let namespaces: Vec<&str> = tree
            .node(asm)
            .children()
            .iter()
            .map(|id| tree.node(*id).name.as_str())
            .collect();
        assert_eq!(namespaces, vec!["Alpha", "Zeta"]);

        let alpha = tree.node(asm).children()[0];
        let classes: Vec<&str> = tree
            .node(alpha)
            .children()
            .iter()
            .map(|id| tree.node(*id).name.as_str())
            .collect();
        assert_eq!(classes, vec!["First", "Second"]);
        for class in tree.node(alpha).children() {
            assert_eq!(tree.node(*class).parent(), Some(alpha));
        }
    }

    #[test]
    fn same_path_reuses_assembly_node() {
        let mut tree = sample_tree();
        let again = tree.assembly_node(Path::new("/tmp/A.dll"));
        assert_eq!(again, tree.assemblies()[0]);
        assert_eq!(tree.assemblies().len(), 1);
    }

    #[test]
    fn included_tests_inherit_exclusion_from_ancestors() {
        let mut tree = sample_tree();
        assert_eq!(tree.included_tests().len(), 4);

        let alpha = tree.node(tree.assemblies()[0]).children()[0];
        tree.set_included(alpha, Some(false));
        let first_test = tree
            .find_test(&TestId::from("Alpha.First.a1"))
            .expect("a1 should exist");
        tree.set_included(first_test, Some(true));

        // An excluded ancestor hides the subtree even if a leaf opts in.
        assert_eq!(tree.included_tests(), vec![TestId::from("Zeta.Third.z1")]);
        assert!(!tree.is_included(first_test));
    }

    #[test]
    fn leaf_updates_propagate_to_class_and_root() {
        let mut tree = sample_tree();
        tree.mark_running(None);
        assert_eq!(tree.node(tree.root()).state, TestNodeState::Running);

        for id in ["Alpha.First.a1", "Alpha.First.a2", "Alpha.Second.b1", "Zeta.Third.z1"] {
            assert!(tree.set_test_state(&TestId::from(id), TestNodeState::Success));
        }
        assert_eq!(tree.node(tree.root()).state, TestNodeState::Success);

        assert!(tree.set_test_state(&TestId::from("Alpha.First.a2"), TestNodeState::Failure));
        let first = tree
            .class_nodes()
            .find(|id| tree.node(*id).name == "First")
            .expect("class First should exist");
        assert_eq!(tree.node(first).state, TestNodeState::Failure);
        assert_eq!(tree.node(tree.root()).state, TestNodeState::Failure);
    }

    #[test]
    fn unknown_test_id_is_rejected() {
        let mut tree = sample_tree();
        assert!(!tree.set_test_state(&TestId::from("nope"), TestNodeState::Success));
    }

    #[test]
    fn partial_selection_leaves_other_leaves_inactive() {
        let mut tree = sample_tree();
        let selection = vec![TestId::from("Zeta.Third.z1")];
        tree.mark_running(Some(selection.as_slice()));
        let second = tree
            .class_nodes()
            .find(|id| tree.node(*id).name == "Second")
            .expect("class Second should exist");
        assert_eq!(tree.node(second).state, TestNodeState::Inactive);
        assert_eq!(tree.node(tree.root()).state, TestNodeState::Running);
    }

    fn any_state() -> impl Strategy<Value = TestNodeState> {
        prop_oneof![
            Just(TestNodeState::Inactive),
            Just(TestNodeState::Running),
            Just(TestNodeState::Success),
            Just(TestNodeState::Failure),
            Just(TestNodeState::Inconclusive),
        ]
    }

    proptest! {
        #[test]
        fn aggregate_ignores_inactive_children(states in proptest::collection::vec(any_state(), 0..12)) {
            let with_inactive = TestNodeState::aggregate(states.iter().copied());
            let without = TestNodeState::aggregate(
                states.iter().copied().filter(|s| *s != TestNodeState::Inactive),
            );
            prop_assert_eq!(with_inactive, without);
        }

        #[test]
        fn aggregate_inconclusive_dominates(states in proptest::collection::vec(any_state(), 0..12)) {
            let mut states = states;
            states.push(TestNodeState::Inconclusive);
            prop_assert_eq!(TestNodeState::aggregate(states), TestNodeState::Inconclusive);
        }
    }
}
