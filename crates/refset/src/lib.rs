//! Reference Set (component C).
//!
//! Tracks which state ids still need to be loaded (`included`), which block
//! names are required from inclusions vs. depended upon, which ids are
//! currently "in flight" (`visited`, used for cycle detection), and which
//! ids are allowed to be absent (`optional`).
//!
//! Grounded in `nanostate/compiler/reflist.go`'s `RefList`, generalized to
//! return a typed error instead of panicking and to preserve discovery order
//! (an ordered set rather than a bare Go map) so that repeated compiles are
//! deterministic.

use std::collections::HashSet;

use otree::OTree;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("reference cycle detected while requesting state '{0}'")]
    Cycle(String),
}

/// An insertion-order-preserving set of strings, used for the four
/// reference-tracking structures below.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OrderedSet {
    order: Vec<String>,
    members: HashSet<String>,
}

impl OrderedSet {
    fn insert(&mut self, value: impl Into<String>) {
        let value = value.into();
        if self.members.insert(value.clone()) {
            self.order.push(value);
        }
    }

    fn remove(&mut self, value: &str) -> bool {
        if self.members.remove(value) {
            if let Some(pos) = self.order.iter().position(|v| v == value) {
                self.order.remove(pos);
            }
            true
        } else {
            false
        }
    }

    fn contains(&self, value: &str) -> bool {
        self.members.contains(value)
    }

    fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Parsed sigil token of a block expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Condition(String),
    Inclusion { id: String, blocks: Vec<String> },
    OptionalInclusion { id: String, blocks: Vec<String> },
    Dependency { id: String, blocks: Vec<String> },
    Loop(String),
    Anchor(String),
}

/// Split a block expression into its tokens, classifying sigils. Does not
/// validate sigil-exclusivity (that's the compiler's job, since it's a
/// compile error rather than a reference-tracking concern).
pub fn tokenize(expr: &str) -> Vec<Token> {
    expr.split_whitespace()
        .map(|tok| {
            if let Some(rest) = tok.strip_prefix("?") {
                Token::Condition(rest.to_owned())
            } else if let Some(rest) = tok.strip_prefix("~") {
                let (id, blocks) = split_id_blocks(rest);
                Token::Inclusion { id, blocks }
            } else if let Some(rest) = tok.strip_prefix("+") {
                let (id, blocks) = split_id_blocks(rest);
                Token::OptionalInclusion { id, blocks }
            } else if let Some(rest) = tok.strip_prefix("&") {
                let (id, blocks) = split_id_blocks(rest);
                Token::Dependency { id, blocks }
            } else if let Some(rest) = tok.strip_prefix("[]") {
                Token::Loop(rest.to_owned())
            } else {
                Token::Anchor(tok.to_owned())
            }
        })
        .collect()
}

fn split_id_blocks(rest: &str) -> (String, Vec<String>) {
    match rest.split_once('/') {
        Some((id, blocks)) => (
            id.to_owned(),
            blocks
                .split(':')
                .filter(|b| !b.is_empty())
                .map(str::to_owned)
                .collect(),
        ),
        None => (rest.to_owned(), Vec::new()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct RefSet {
    included: OrderedSet,
    required_jobs: OrderedSet,
    referenced_jobs: OrderedSet,
    visited: OrderedSet,
    optional: OrderedSet,
}

impl RefSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk the `state` branch of `state_doc` and record every cross-state
    /// reference it mentions, accumulating into `included`/`required_jobs`/
    /// `referenced_jobs` across the whole compile (one `RefSet` is owned by
    /// one compiler instance for the life of a compile session, so each
    /// newly loaded state's references are added to, not substituted for,
    /// the ones already discovered).
    pub fn find_refs(&mut self, state_doc: &OTree) {
        let Some(branch) = state_doc.get_branch("state") else {
            return;
        };

        for expr in branch.keys() {
            for token in tokenize(expr) {
                match token {
                    Token::Inclusion { id, blocks } => {
                        self.included.insert(&id);
                        if blocks.is_empty() {
                            self.required_jobs.insert(String::new());
                        } else {
                            for b in blocks {
                                self.required_jobs.insert(b);
                            }
                        }
                    }
                    Token::OptionalInclusion { id, blocks } => {
                        self.included.insert(&id);
                        self.optional.insert(&id);
                        if blocks.is_empty() {
                            self.required_jobs.insert(String::new());
                        } else {
                            for b in blocks {
                                self.required_jobs.insert(b);
                            }
                        }
                    }
                    Token::Dependency { id, blocks } => {
                        self.included.insert(&id);
                        for b in blocks {
                            self.referenced_jobs.insert(b);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    pub fn included(&self) -> impl Iterator<Item = &str> {
        self.included.iter()
    }

    pub fn required_jobs(&self) -> impl Iterator<Item = &str> {
        self.required_jobs.iter()
    }

    pub fn referenced_jobs(&self) -> impl Iterator<Item = &str> {
        self.referenced_jobs.iter()
    }

    pub fn is_optional(&self, id: &str) -> bool {
        self.optional.contains(id)
    }

    /// Record that `id` is being requested for loading. Fails with
    /// `Error::Cycle` if `id` is already in `visited` (i.e. we're already in
    /// the middle of resolving it).
    pub fn mark_requested(&mut self, id: &str) -> Result<(), Error> {
        if self.visited.contains(id) {
            return Err(Error::Cycle(id.to_owned()));
        }
        self.visited.insert(id);
        Ok(())
    }

    /// Record that `id` has been fully loaded and its references recorded:
    /// removes it from both `visited` and `included`.
    pub fn mark_resolved(&mut self, id: &str) {
        self.visited.remove(id);
        self.included.remove(id);
    }

    /// Force-remove `id` from `included` and mark it visited, without
    /// requiring it to have been loaded. Used when an optional inclusion's
    /// target state cannot be found in the index.
    pub fn squash(&mut self, id: &str) {
        self.included.remove(id);
        self.visited.insert(id);
    }

    pub fn next_included(&self) -> Option<String> {
        self.included.iter().next().map(str::to_owned)
    }

    /// `included - optional`: ids that are still outstanding and are not
    /// allowed to be missing.
    pub fn mandatory_unresolved(&self) -> Vec<String> {
        self.included
            .iter()
            .filter(|id| !self.optional.contains(id))
            .map(str::to_owned)
            .collect()
    }

    pub fn is_drained(&self) -> bool {
        self.included.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otree::{OTree, Value};

    fn state_with_blocks(exprs: &[&str]) -> OTree {
        let mut state_branch = OTree::new();
        for expr in exprs {
            state_branch.set(*expr, Value::Sequence(Vec::new()));
        }
        let mut doc = OTree::new();
        doc.set("id", Value::from("s1"));
        doc.set("state", Value::Tree(state_branch));
        doc
    }

    #[test]
    fn find_refs_classifies_inclusion_and_dependency() {
        let doc = state_with_blocks(&["x ~base/setup", "y &tools/prep:init"]);
        let mut refs = RefSet::new();
        refs.find_refs(&doc);
        assert_eq!(refs.included().collect::<Vec<_>>(), vec!["base", "tools"]);
        assert_eq!(refs.required_jobs().collect::<Vec<_>>(), vec!["setup"]);
        assert_eq!(
            refs.referenced_jobs().collect::<Vec<_>>(),
            vec!["prep", "init"]
        );
    }

    #[test]
    fn optional_inclusion_is_tracked() {
        let doc = state_with_blocks(&["x +maybe/"]);
        let mut refs = RefSet::new();
        refs.find_refs(&doc);
        assert!(refs.is_optional("maybe"));
        assert!(refs.mandatory_unresolved().is_empty());
    }

    #[test]
    fn mark_requested_twice_is_a_cycle() {
        let mut refs = RefSet::new();
        refs.mark_requested("a").unwrap();
        let err = refs.mark_requested("a").unwrap_err();
        assert_eq!(err, Error::Cycle("a".to_owned()));
    }

    #[test]
    fn mark_resolved_clears_visited_and_included() {
        let doc = state_with_blocks(&["x ~base/"]);
        let mut refs = RefSet::new();
        refs.find_refs(&doc);
        refs.mark_requested("base").unwrap();
        refs.mark_resolved("base");
        assert!(refs.is_drained());
    }
}
