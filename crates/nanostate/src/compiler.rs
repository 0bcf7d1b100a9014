//! Compiler (component E): the load→resolve→expand pump described in
//! `nanostate/compiler/ncmp.go`'s `Cycle`/`Compile`, generalized behind an
//! explicit [`PumpState`] state machine so tests can assert on transitions
//! instead of inferring them from a loop's side effects.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use evalctx::{EvalValue, Evaluator, ScriptContext};
use otree::{OTree, Scalar, Value};
use refset::{tokenize, RefSet, Token};

use crate::error::Error;
use crate::loader::{self, Indexer};

/// Transitions: `load_file` runs in `Init`/`Loading`; a non-empty `cycle()`
/// moves to `Resolving` and the driver loops back to `Loading`; an empty
/// `cycle()` moves to `Compiling`; success moves to `Done`. Any failure
/// moves to `Error` and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Init,
    Loading,
    Resolving,
    Compiling,
    Done,
    Error,
}

struct LoadedState {
    tree: OTree,
    script_ctx: Option<ScriptContext>,
}

/// Drives the compile pump for a single compile session. Owns the
/// [`RefSet`] for the session's whole lifetime, per spec §5 ("no shared
/// mutable state across states beyond the Reference Set, which is owned by
/// one compiler instance").
pub struct Compiler {
    evaluator: Evaluator,
    refset: RefSet,
    loaded: HashMap<String, LoadedState>,
    root_id: Option<String>,
    pump_state: PumpState,
    compiled_cache: HashMap<String, OTree>,
    compiling_stack: HashSet<String>,
    debug: bool,
}

impl Compiler {
    pub fn new(evaluator: Evaluator) -> Self {
        Self {
            evaluator,
            refset: RefSet::new(),
            loaded: HashMap::new(),
            root_id: None,
            pump_state: PumpState::Init,
            compiled_cache: HashMap::new(),
            compiling_stack: HashSet::new(),
            debug: false,
        }
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn pump_state(&self) -> PumpState {
        self.pump_state
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    /// Parse the state file at `path`, register it, index its companion
    /// script (if any) with the evaluator, and discover its cross-state
    /// references. The first call's id becomes the root state id.
    pub fn load_file(&mut self, path: &Path) -> Result<String, Error> {
        let (tree, companion) = loader::load(path)?;
        let id = tree
            .get_string("id")
            .ok_or_else(|| Error::NotFound(format!("state at {} has no 'id'", path.display())))?
            .to_owned();

        if self.root_id.is_none() {
            self.root_id = Some(id.clone());
        }

        let script_ctx = companion
            .as_deref()
            .map(|p| self.evaluator.load(p))
            .transpose()?;

        self.refset.find_refs(&tree);
        self.loaded.insert(id.clone(), LoadedState { tree, script_ctx });
        Ok(id)
    }

    /// Pop the next state id still required, marking it requested. Returns
    /// `None` once the reference set is drained.
    fn cycle(&mut self) -> Result<Option<String>, Error> {
        match self.refset.next_included() {
            None => Ok(None),
            Some(id) => {
                self.refset.mark_requested(&id)?;
                Ok(Some(id))
            }
        }
    }

    /// Run the full pump against `indexer` starting from `entry_path`, then
    /// compile and return the normalized execution tree.
    pub fn run(&mut self, indexer: &Indexer, entry_path: &Path) -> Result<OTree, Error> {
        self.pump_state = PumpState::Init;
        if let Err(e) = self.load_file(entry_path) {
            self.pump_state = PumpState::Error;
            return Err(e);
        }
        self.pump_state = PumpState::Loading;

        loop {
            match self.cycle() {
                Ok(Some(id)) => {
                    self.pump_state = PumpState::Resolving;
                    if let Err(e) = self.resolve_one(indexer, &id) {
                        self.pump_state = PumpState::Error;
                        return Err(e);
                    }
                    self.pump_state = PumpState::Loading;
                }
                Ok(None) => break,
                Err(e) => {
                    self.pump_state = PumpState::Error;
                    return Err(e.into());
                }
            }
        }

        self.pump_state = PumpState::Compiling;
        match self.compile() {
            Ok(tree) => {
                self.pump_state = PumpState::Done;
                Ok(tree)
            }
            Err(e) => {
                self.pump_state = PumpState::Error;
                Err(e)
            }
        }
    }

    fn resolve_one(&mut self, indexer: &Indexer, id: &str) -> Result<(), Error> {
        if self.loaded.contains_key(id) {
            self.refset.mark_resolved(id);
            return Ok(());
        }
        match indexer.get_by_id(id) {
            Ok(meta) => {
                let path = meta.absolute_path.clone();
                self.load_file(&path)?;
                self.refset.mark_resolved(id);
                Ok(())
            }
            Err(_) if self.refset.is_optional(id) => {
                if self.debug {
                    log::debug!("optional state '{id}' not found in index, squashing");
                }
                self.refset.squash(id);
                Ok(())
            }
            Err(_) => Err(Error::MissingInclude(id.to_owned())),
        }
    }

    /// Produce the compiled execution tree rooted at the root state id.
    pub fn compile(&mut self) -> Result<OTree, Error> {
        let root_id = self
            .root_id
            .clone()
            .ok_or_else(|| Error::NotFound("no root state loaded".to_owned()))?;
        let state_body = self.compile_state(&root_id)?;

        let mut tree = OTree::new();
        let root_tree = &self.loaded[&root_id].tree;
        tree.set("id", Value::from(root_tree.get_string("id").unwrap_or_default()));
        tree.set(
            "description",
            Value::from(root_tree.get_string("description").unwrap_or_default()),
        );
        tree.set("state", Value::Tree(state_body));
        Ok(tree)
    }

    /// Compile the `state` branch of the state identified by `id`, applying
    /// condition gates, inclusion/dependency splicing, and loop expansion,
    /// per §4.E. Results are memoized per compile session: a state included
    /// from two different places is compiled once.
    fn compile_state(&mut self, id: &str) -> Result<OTree, Error> {
        if let Some(cached) = self.compiled_cache.get(id) {
            return Ok(cached.clone());
        }
        if !self.compiling_stack.insert(id.to_owned()) {
            return Err(Error::Cycle(id.to_owned()));
        }

        let result = self.compile_state_uncached(id);
        self.compiling_stack.remove(id);

        let tree = result?;
        self.compiled_cache.insert(id.to_owned(), tree.clone());
        Ok(tree)
    }

    fn compile_state_uncached(&mut self, id: &str) -> Result<OTree, Error> {
        let exprs: Vec<String> = {
            let state = &self.loaded[id].tree;
            match state.get_branch("state") {
                Some(branch) => branch.keys().to_vec(),
                None => return Ok(OTree::new()),
            }
        };

        let mut output = OTree::new();
        for expr in exprs {
            let payload = {
                let state = &self.loaded[id].tree;
                state
                    .get_branch("state")
                    .and_then(|b| b.get(&expr))
                    .cloned()
            };
            let Some(payload) = payload else { continue };

            let tokens = tokenize(&expr);
            let anchor = expr
                .split_whitespace()
                .next()
                .unwrap_or(&expr)
                .to_owned();

            let mut conditions = Vec::new();
            let mut sigil: Option<Token> = None;
            for tok in &tokens {
                match tok {
                    Token::Condition(name) => conditions.push(name.clone()),
                    Token::Anchor(_) => {}
                    other => {
                        if sigil.is_some() {
                            return Err(Error::MixedSigils { expr: expr.clone() });
                        }
                        sigil = Some(other.clone());
                    }
                }
            }

            if !self.evaluate_conditions(id, &conditions, &expr)? {
                continue;
            }

            match sigil {
                None => {
                    let payload_seq = payload.as_sequence().unwrap_or(&[]).to_vec();
                    let expanded = self.compile_block(id, &payload_seq)?;
                    output.set(anchor, Value::Sequence(expanded));
                }
                Some(Token::Inclusion { id: ref_id, blocks }) => {
                    self.splice_inclusion(&mut output, &ref_id, &blocks, false)?;
                }
                Some(Token::OptionalInclusion { id: ref_id, blocks }) => {
                    self.splice_inclusion(&mut output, &ref_id, &blocks, true)?;
                }
                Some(Token::Dependency { id: ref_id, blocks }) => {
                    let Some(original) = payload.as_sequence() else {
                        return Err(Error::DanglingAnchor { anchor: anchor.clone() });
                    };
                    let original = original.to_vec();

                    if !self.loaded.contains_key(&ref_id) {
                        return Err(Error::MissingInclude(ref_id.clone()));
                    }
                    let compiled_ref = self.compile_state(&ref_id)?;

                    let mut prefix = Vec::new();
                    for b in &blocks {
                        match compiled_ref.get(b) {
                            Some(Value::Sequence(seq)) => prefix.extend(seq.iter().cloned()),
                            Some(_) | None => {
                                if self.debug {
                                    log::debug!(
                                        "dependency on '{ref_id}' missing block '{b}'; skipping. state dump:\n{}",
                                        compiled_ref.to_yaml()
                                    );
                                }
                            }
                        }
                    }

                    prefix.extend(original);
                    output.set(anchor, Value::Sequence(prefix));
                }
                Some(Token::Loop(function_name)) => {
                    let expanded = self.expand_loop(id, &anchor, &function_name)?;
                    output.set(anchor, Value::Sequence(expanded));
                }
                Some(Token::Condition(_)) | Some(Token::Anchor(_)) => unreachable!(),
            }
        }
        Ok(output)
    }

    fn splice_inclusion(
        &mut self,
        output: &mut OTree,
        ref_id: &str,
        blocks: &[String],
        optional: bool,
    ) -> Result<(), Error> {
        if !self.loaded.contains_key(ref_id) {
            if optional {
                return Ok(());
            }
            return Err(Error::MissingInclude(ref_id.to_owned()));
        }
        let compiled_ref = self.compile_state(ref_id)?;
        if blocks.is_empty() {
            for key in compiled_ref.keys() {
                if let Some(v) = compiled_ref.get(key) {
                    output.set(key.clone(), v.clone());
                }
            }
        } else {
            for b in blocks {
                match compiled_ref.get(b) {
                    Some(v) => {
                        output.set(b.clone(), v.clone());
                    }
                    None => {
                        if self.debug {
                            log::debug!(
                                "inclusion of '{ref_id}' missing block '{b}'; skipping. state dump:\n{}",
                                compiled_ref.to_yaml()
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Expand a loop-shaped block's payload: each item is either left as-is
    /// or, if its single key is itself a `[]`-loop expression, replaced by
    /// the generator's elements and this block's processing stops (§4.E
    /// "loop-at-top-of-block semantics").
    fn compile_block(&mut self, id: &str, payload: &[Value]) -> Result<Vec<Value>, Error> {
        let mut out = Vec::new();
        for item in payload {
            let Some(tree) = item.as_tree() else {
                out.push(item.clone());
                continue;
            };
            let Some(key) = tree.keys().first() else {
                out.push(item.clone());
                continue;
            };
            let tokens = tokenize(key);
            if tokens.len() == 2 {
                if let (Token::Anchor(module_name), Token::Loop(function_name)) =
                    (&tokens[0], &tokens[1])
                {
                    let expanded = self.expand_loop(id, module_name, function_name)?;
                    out.extend(expanded);
                    return Ok(out);
                }
            }
            out.push(item.clone());
        }
        Ok(out)
    }

    fn expand_loop(
        &mut self,
        id: &str,
        module_name: &str,
        function_name: &str,
    ) -> Result<Vec<Value>, Error> {
        let ctx = self
            .loaded
            .get_mut(id)
            .and_then(|s| s.script_ctx.as_mut())
            .ok_or_else(|| Error::LoopShape {
                function: function_name.to_owned(),
            })?;
        let result = self
            .evaluator
            .call(ctx, function_name, &[], &BTreeMap::new())?;
        let elements = result.as_list().ok_or_else(|| Error::LoopShape {
            function: function_name.to_owned(),
        })?;

        let mut out = Vec::with_capacity(elements.len());
        for element in elements {
            let dict = element.as_dict().ok_or_else(|| Error::LoopShape {
                function: function_name.to_owned(),
            })?;
            let mut invocation = OTree::new();
            invocation.set(module_name, eval_dict_to_tree_value(dict));
            out.push(Value::Tree(invocation));
        }
        Ok(out)
    }

    fn evaluate_conditions(
        &mut self,
        id: &str,
        conditions: &[String],
        expr: &str,
    ) -> Result<bool, Error> {
        if conditions.is_empty() {
            return Ok(true);
        }
        let ctx = self
            .loaded
            .get_mut(id)
            .and_then(|s| s.script_ctx.as_mut())
            .ok_or_else(|| {
                Error::PredicateCall(format!(
                    "block '{expr}' has predicate(s) {conditions:?} but state '{id}' has no companion script"
                ))
            })?;
        for name in conditions {
            let value = self.evaluator.call(ctx, name, &[], &BTreeMap::new())?;
            if value.truthy() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn eval_dict_to_tree_value(dict: &BTreeMap<String, EvalValue>) -> Value {
    let mut tree = OTree::new();
    for (k, v) in dict {
        tree.set(k.clone(), eval_value_to_value(v));
    }
    Value::Tree(tree)
}

fn eval_value_to_value(v: &EvalValue) -> Value {
    match v {
        EvalValue::Bool(b) => Value::from(*b),
        EvalValue::Int(i) => Value::Scalar(Scalar::Int(*i)),
        EvalValue::Str(s) => Value::from(s.clone()),
        EvalValue::List(l) => Value::Sequence(l.iter().map(eval_value_to_value).collect()),
        EvalValue::Dict(d) => eval_dict_to_tree_value(d),
        EvalValue::Unit => Value::Scalar(Scalar::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalctx::Traits;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn indexer_for(dir: &Path) -> Indexer {
        let mut indexer = Indexer::new();
        indexer.add_roots([dir]);
        indexer.index();
        indexer
    }

    #[test]
    fn minimal_state_compiles_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "s1.st",
            "id: s1\ndescription: d\nstate:\n  g1:\n    - shell:\n        - c1: echo hi\n",
        );
        let indexer = indexer_for(dir.path());
        let entry = indexer.get_by_id("s1").unwrap().absolute_path.clone();

        let mut compiler = Compiler::new(Evaluator::new(Traits::detect()));
        let tree = compiler.run(&indexer, &entry).unwrap();
        assert_eq!(compiler.pump_state(), PumpState::Done);
        let state = tree.get_branch("state").unwrap();
        assert_eq!(state.keys(), &["g1"]);
    }

    #[test]
    fn inclusion_splices_selected_block_only() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "a.st",
            "id: a\ndescription: d\nstate:\n  \"x ~b/x\": []\n",
        );
        write_file(
            dir.path(),
            "b.st",
            "id: b\ndescription: d\nstate:\n  x:\n    - shell:\n        - c: echo x\n  y:\n    - shell:\n        - c: echo y\n",
        );
        let indexer = indexer_for(dir.path());
        let entry = indexer.get_by_id("a").unwrap().absolute_path.clone();

        let mut compiler = Compiler::new(Evaluator::new(Traits::detect()));
        let tree = compiler.run(&indexer, &entry).unwrap();
        let state = tree.get_branch("state").unwrap();
        assert_eq!(state.keys(), &["x"]);
        assert!(!state.exists("y"));
    }

    #[test]
    fn dependency_prepends_referenced_blocks() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "deploy.st",
            "id: deploy\ndescription: d\nstate:\n  \"deploy &setup/prep:init\":\n    - shell:\n        - c: D\n",
        );
        write_file(
            dir.path(),
            "setup.st",
            "id: setup\ndescription: d\nstate:\n  prep:\n    - shell:\n        - c: P\n  init:\n    - shell:\n        - c: I\n",
        );
        let indexer = indexer_for(dir.path());
        let entry = indexer.get_by_id("deploy").unwrap().absolute_path.clone();

        let mut compiler = Compiler::new(Evaluator::new(Traits::detect()));
        let tree = compiler.run(&indexer, &entry).unwrap();
        let state = tree.get_branch("state").unwrap();
        let seq = state.get_list("deploy").unwrap();
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn cycle_between_two_states_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "a.st",
            "id: a\ndescription: d\nstate:\n  \"x ~b/\": []\n",
        );
        write_file(
            dir.path(),
            "b.st",
            "id: b\ndescription: d\nstate:\n  \"y ~a/\": []\n",
        );
        let indexer = indexer_for(dir.path());
        let entry = indexer.get_by_id("a").unwrap().absolute_path.clone();

        let mut compiler = Compiler::new(Evaluator::new(Traits::detect()));
        let err = compiler.run(&indexer, &entry).unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
        assert_eq!(compiler.pump_state(), PumpState::Error);
    }

    #[test]
    fn condition_with_false_predicate_removes_block() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "s1.st",
            "id: s1\ndescription: d\nstate:\n  \"maybe ?never\":\n    - shell:\n        - c: echo no\n",
        );
        write_file(dir.path(), "s1.fn", "fn never() { false }");
        let indexer = indexer_for(dir.path());
        let entry = indexer.get_by_id("s1").unwrap().absolute_path.clone();

        let mut compiler = Compiler::new(Evaluator::new(Traits::detect()));
        let tree = compiler.run(&indexer, &entry).unwrap();
        let state = tree.get_branch("state").unwrap();
        assert!(!state.exists("maybe"));
    }

    #[test]
    fn loop_expands_to_one_invocation_per_element() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "s1.st",
            "id: s1\ndescription: d\nstate:\n  \"add_user []names\": []\n",
        );
        write_file(
            dir.path(),
            "s1.fn",
            r#"fn names() { [ #{ name: "john" }, #{ name: "fred" }, #{ name: "ralf" } ] }"#,
        );
        let indexer = indexer_for(dir.path());
        let entry = indexer.get_by_id("s1").unwrap().absolute_path.clone();

        let mut compiler = Compiler::new(Evaluator::new(Traits::detect()));
        let tree = compiler.run(&indexer, &entry).unwrap();
        let state = tree.get_branch("state").unwrap();
        let seq = state.get_list("add_user").unwrap();
        assert_eq!(seq.len(), 3);
    }
}
