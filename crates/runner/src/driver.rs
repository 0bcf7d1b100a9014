//! Common driver shared by both runner variants (spec §4.F): walks groups
//! in source order, dispatches each module invocation by name, and
//! aggregates results bottom-up. Module dispatch never aborts the run —
//! an unsupported module name is logged and skipped.

use otree::{OTree, Value};

use crate::result::{GroupResult, ModuleResult, RunResult};
use crate::{Cancellation, Runner};

const SHELL_MODULE: &str = "shell";
const ANSIBLE_PREFIX: &str = "ansible.";

/// Drive `runner` over `tree` (the compiled execution tree's `{id,
/// description, state}` shape) and produce the consolidated result
/// document. Groups execute sequentially in source order (spec §5: a later
/// group may depend on an earlier one's effects); a cancelled `cancellation`
/// stops the walk before the next module, leaving already-collected results
/// untouched.
pub async fn run(runner: &dyn Runner, tree: &OTree, cancellation: &Cancellation) -> RunResult {
    let id = tree.get_string("id").unwrap_or_default().to_owned();
    let description = tree.get_string("description").unwrap_or_default().to_owned();

    let mut groups = Vec::new();
    if let Some(state) = tree.get_branch("state") {
        for group_id in state.keys() {
            if cancellation.is_cancelled() {
                break;
            }
            let Some(invocations) = state.get_list(group_id) else {
                continue;
            };
            let modules = run_group(runner, invocations, cancellation).await;
            groups.push(GroupResult::from_modules(group_id.clone(), modules));
        }
    }

    RunResult::from_groups(id, description, groups)
}

async fn run_group(
    runner: &dyn Runner,
    invocations: &[Value],
    cancellation: &Cancellation,
) -> Vec<ModuleResult> {
    let mut modules = Vec::with_capacity(invocations.len());
    for invocation in invocations {
        if cancellation.is_cancelled() {
            break;
        }
        let Some(inv_tree) = invocation.as_tree() else {
            continue;
        };
        let Some(module_name) = inv_tree.keys().first() else {
            continue;
        };
        let payload = inv_tree
            .get(module_name)
            .cloned()
            .unwrap_or(Value::Sequence(Vec::new()));

        let outcome = if module_name == SHELL_MODULE {
            let commands = payload.as_sequence().unwrap_or(&[]);
            runner.call_shell(commands, cancellation).await
        } else if module_name.starts_with(ANSIBLE_PREFIX) {
            runner.call_module(module_name, &payload, cancellation).await
        } else {
            log::warn!("unsupported module '{module_name}', skipping");
            continue;
        };

        modules.push(ModuleResult {
            module: module_name.clone(),
            errcode: outcome.errcode,
            errmsg: outcome.errmsg,
            response: outcome.response,
        });
    }
    modules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cancellation, ModuleOutcome, Runner};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRunner {
        shell_calls: AtomicUsize,
    }

    #[async_trait]
    impl Runner for CountingRunner {
        async fn call_shell(&self, _commands: &[Value], _cancellation: &Cancellation) -> ModuleOutcome {
            self.shell_calls.fetch_add(1, Ordering::SeqCst);
            ModuleOutcome::ok(vec![crate::HostResponse {
                host: "localhost".into(),
                response: serde_json::json!({"stdout": "hi"}),
            }])
        }

        async fn call_module(
            &self,
            _module_name: &str,
            _payload: &Value,
            _cancellation: &Cancellation,
        ) -> ModuleOutcome {
            ModuleOutcome::ok(Vec::new())
        }

        fn set_state_roots(&mut self, _roots: Vec<PathBuf>) {}
    }

    #[tokio::test]
    async fn minimal_tree_dispatches_one_shell_call() {
        let mut shell_payload = OTree::new();
        shell_payload.set("c1", Value::from("echo hi"));
        let mut invocation = OTree::new();
        invocation.set(
            "shell",
            Value::Sequence(vec![Value::Tree({
                let mut t = OTree::new();
                t.set("c1", Value::from("echo hi"));
                t
            })]),
        );
        let mut state = OTree::new();
        state.set("g1", Value::Sequence(vec![Value::Tree(invocation)]));
        let mut tree = OTree::new();
        tree.set("id", Value::from("s1"));
        tree.set("description", Value::from("d"));
        tree.set("state", Value::Tree(state));

        let runner = CountingRunner {
            shell_calls: AtomicUsize::new(0),
        };
        let result = run(&runner, &tree, &Cancellation::new()).await;
        assert_eq!(runner.shell_calls.load(Ordering::SeqCst), 1);
        assert!(result.errcode.is_ok());
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.groups[0].modules.len(), 1);
        let _ = shell_payload;
    }

    #[tokio::test]
    async fn unsupported_module_is_skipped_not_fatal() {
        let mut invocation = OTree::new();
        invocation.set("unknown_thing", Value::Sequence(Vec::new()));
        let mut state = OTree::new();
        state.set("g1", Value::Sequence(vec![Value::Tree(invocation)]));
        let mut tree = OTree::new();
        tree.set("id", Value::from("s1"));
        tree.set("description", Value::from("d"));
        tree.set("state", Value::Tree(state));

        let runner = CountingRunner {
            shell_calls: AtomicUsize::new(0),
        };
        let result = run(&runner, &tree, &Cancellation::new()).await;
        assert!(result.errcode.is_ok());
        assert!(result.groups[0].modules.is_empty());
    }
}
