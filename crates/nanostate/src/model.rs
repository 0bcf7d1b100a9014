//! Typed views over the raw [`OTree`] for the two document shapes this
//! crate produces: state documents on the way in, compiled execution trees
//! on the way out. Both are thin wrappers — the tree remains the source of
//! truth, these just name the top-level contract from §3.

use otree::{OTree, Value};

/// An ordered tree whose top level carries `id`, `description`, and `state`,
/// as loaded from a single `.st` file. Immutable once constructed (spec §3
/// "Lifecycles").
#[derive(Debug, Clone)]
pub struct StateDoc(OTree);

impl StateDoc {
    pub fn from_tree(tree: OTree) -> Self {
        Self(tree)
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get_string("id")
    }

    pub fn description(&self) -> Option<&str> {
        self.0.get_string("description")
    }

    pub fn state_branch(&self) -> Option<&OTree> {
        self.0.get_branch("state")
    }

    pub fn as_tree(&self) -> &OTree {
        &self.0
    }
}

/// The normalized result of compilation: same top-level shape as
/// [`StateDoc`], but `state` maps group ids directly to module-invocation
/// sequences with every sigil stripped and every inclusion/dependency/loop
/// already expanded.
#[derive(Debug, Clone)]
pub struct ExecutionTree(OTree);

impl ExecutionTree {
    pub fn from_tree(tree: OTree) -> Self {
        Self(tree)
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get_string("id")
    }

    pub fn description(&self) -> Option<&str> {
        self.0.get_string("description")
    }

    /// Groups in source declaration order, each paired with its ordered
    /// sequence of module invocations.
    pub fn groups(&self) -> Vec<(&str, &[Value])> {
        let Some(state) = self.0.get_branch("state") else {
            return Vec::new();
        };
        state
            .keys()
            .iter()
            .filter_map(|k| state.get_list(k).map(|seq| (k.as_str(), seq)))
            .collect()
    }

    pub fn as_tree(&self) -> &OTree {
        &self.0
    }

    pub fn into_tree(self) -> OTree {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_tree_groups_preserve_source_order() {
        let mut state = OTree::new();
        state.set("g2", Value::Sequence(Vec::new()));
        state.set("g1", Value::Sequence(Vec::new()));
        let mut tree = OTree::new();
        tree.set("id", Value::from("x"));
        tree.set("state", Value::Tree(state));
        let exec = ExecutionTree::from_tree(tree);
        let names: Vec<&str> = exec.groups().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["g2", "g1"]);
    }
}
