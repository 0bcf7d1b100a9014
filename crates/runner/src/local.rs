//! Local Shell & Module sub-drivers (spec §4.F).
//!
//! Shell commands are tokenized with `shlex` and spawned through
//! [`crate::children::ManagedChild`], the same graceful-kill wrapper
//! `engine/process_execution/src/local.rs` builds its `CommandRunner` on.
//! Module invocations follow `nanorunners/callers/ansiblecall.go`'s
//! `Call`/`execModule`: write the arguments to a temp JSON file, invoke
//! either the resolved binary or a script interpreter with that file as its
//! sole argument, and parse stdout as the module's JSON response.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use otree::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::sleep;

use crate::cancel::Cancellation;
use crate::children::ManagedChild;
use crate::error::RunError;
use crate::resolve::{self, ModuleKind};
use crate::{HostResponse, ModuleOutcome, Runner};

const LOCALHOST: &str = "localhost";
const GRACEFUL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Runner variant that executes on the local machine. Module invocations
/// are resolved against `library_roots` (the "platform library path" of
/// spec §6); when `chroot` is set, modules run inside a containerized
/// execution rooted there instead of directly on the host (spec §4.F).
pub struct LocalRunner {
    library_roots: Vec<PathBuf>,
    chroot: Option<PathBuf>,
    python: Vec<String>,
    command_timeout: Option<Duration>,
    os: String,
    arch: String,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRunner {
    pub fn new() -> Self {
        Self {
            library_roots: Vec::new(),
            chroot: None,
            python: vec!["/usr/bin/python3".to_owned()],
            command_timeout: None,
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
        }
    }

    pub fn with_chroot(mut self, root: PathBuf) -> Self {
        self.chroot = Some(root);
        self
    }

    pub fn with_python(mut self, python: Vec<String>) -> Self {
        if !python.is_empty() {
            self.python = python;
        }
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    async fn run_one_command(
        &self,
        command_id: &str,
        command_line: &str,
        cancellation: &Cancellation,
    ) -> (HostResponse, Option<String>) {
        let tokens = match shlex::split(command_line) {
            Some(t) if !t.is_empty() => t,
            _ => {
                return (
                    HostResponse {
                        host: LOCALHOST.into(),
                        response: serde_json::json!({ "command_id": command_id, "stdout": "", "stderr": "" }),
                    },
                    Some(format!("could not tokenize command '{command_line}'")),
                )
            }
        };
        let (program, args) = tokens.split_first().expect("checked non-empty above");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        match run_managed(cmd, self.command_timeout, cancellation).await {
            Ok(Completed { success, stdout, stderr }) => {
                let response = serde_json::json!({
                    "command_id": command_id,
                    "stdout": String::from_utf8_lossy(&stdout),
                    "stderr": String::from_utf8_lossy(&stderr),
                });
                let errmsg = if success {
                    None
                } else {
                    Some(format!(
                        "command '{command_line}' exited non-zero: {}",
                        String::from_utf8_lossy(&stderr)
                    ))
                };
                (
                    HostResponse {
                        host: LOCALHOST.into(),
                        response,
                    },
                    errmsg,
                )
            }
            Err(RunError::Timeout) => (
                HostResponse {
                    host: LOCALHOST.into(),
                    response: serde_json::json!({ "command_id": command_id, "stdout": "", "stderr": "" }),
                },
                Some("__TIMEOUT__".to_owned()),
            ),
            Err(e) => (
                HostResponse {
                    host: LOCALHOST.into(),
                    response: serde_json::json!({ "command_id": command_id, "stdout": "", "stderr": "" }),
                },
                Some(e.to_string()),
            ),
        }
    }

    fn args_tree_to_json(payload: &Value) -> serde_json::Value {
        let Some(tree) = payload.as_tree() else {
            return serde_json::Value::Object(serde_json::Map::new());
        };
        tree.to_serializable()
    }
}

struct Completed {
    success: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Spawn `cmd` under [`ManagedChild`], capturing stdout/stderr, honoring
/// both an optional hard `timeout` and cooperative `cancellation`. On
/// either, the child is asked to shut down gracefully before the error is
/// returned (spec §5: "signalled and awaited with a bounded grace period,
/// then killed").
///
/// Stdout/stderr are drained on their own tasks rather than awaited
/// up front: `read_to_end` only resolves at pipe EOF, which for a child
/// that keeps its pipes open (e.g. still running) only happens at exit, so
/// draining them inline would starve the `try_wait`/timeout/cancellation
/// loop below and make a hung child unkillable.
async fn run_managed(
    cmd: Command,
    timeout: Option<Duration>,
    cancellation: &Cancellation,
) -> Result<Completed, RunError> {
    let mut child = ManagedChild::spawn(cmd, GRACEFUL_SHUTDOWN_GRACE)
        .map_err(|e| RunError::Runtime(format!("failed to spawn command: {e}")))?;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped at spawn");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped at spawn");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    let started = Instant::now();
    let wait_result = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                if cancellation.is_cancelled() {
                    let _ = child.graceful_shutdown().await;
                    break Err(RunError::Timeout);
                }
                if let Some(timeout) = timeout {
                    if started.elapsed() >= timeout {
                        let _ = child.graceful_shutdown().await;
                        break Err(RunError::Timeout);
                    }
                }
                sleep(POLL_INTERVAL).await;
            }
            Err(e) => break Err(RunError::Runtime(format!("waiting on child: {e}"))),
        }
    };

    // Killing or exiting the child closes its pipes, so both reader tasks
    // resolve promptly from here regardless of which branch above fired.
    let stdout_buf = stdout_task
        .await
        .map_err(|e| RunError::Runtime(format!("stdout reader task panicked: {e}")))?
        .map_err(|e| RunError::Runtime(format!("reading stdout: {e}")))?;
    let stderr_buf = stderr_task
        .await
        .map_err(|e| RunError::Runtime(format!("stderr reader task panicked: {e}")))?
        .map_err(|e| RunError::Runtime(format!("reading stderr: {e}")))?;

    wait_result.map(|status| Completed {
        success: status.success(),
        stdout: stdout_buf,
        stderr: stderr_buf,
    })
}

#[async_trait]
impl Runner for LocalRunner {
    async fn call_shell(&self, commands: &[Value], cancellation: &Cancellation) -> ModuleOutcome {
        let mut response = Vec::with_capacity(commands.len());
        let mut first_error = None;

        for command in commands {
            if cancellation.is_cancelled() {
                return ModuleOutcome::timeout("cancelled before all commands ran");
            }
            let Some(tree) = command.as_tree() else { continue };
            let Some(command_id) = tree.keys().first() else { continue };
            let Some(command_line) = tree.get_string(command_id) else { continue };

            let (host_response, errmsg) = self.run_one_command(command_id, command_line, cancellation).await;
            response.push(host_response);
            if let Some(msg) = errmsg {
                if msg == "__TIMEOUT__" {
                    return ModuleOutcome {
                        errcode: crate::ErrCode::Timeout,
                        errmsg: format!("command '{command_id}' timed out"),
                        response,
                    };
                }
                first_error.get_or_insert(msg);
            }
        }

        match first_error {
            Some(msg) => ModuleOutcome::failed(msg, response),
            None => ModuleOutcome::ok(response),
        }
    }

    async fn call_module(&self, module_name: &str, payload: &Value, cancellation: &Cancellation) -> ModuleOutcome {
        if cancellation.is_cancelled() {
            return ModuleOutcome::timeout("cancelled before module call");
        }

        let resolved = match resolve::resolve(&self.library_roots, module_name, &self.os, &self.arch) {
            Ok(r) => r,
            Err(e) => return ModuleOutcome::failed(e.to_string(), Vec::new()),
        };

        let args = Self::args_tree_to_json(payload);
        let config_body = match resolved.kind {
            ModuleKind::Binary => args,
            ModuleKind::Script => serde_json::json!({ "ANSIBLE_MODULE_ARGS": args }),
        };

        let config_file = match tempfile::Builder::new().prefix("nst-ansible-").tempfile() {
            Ok(f) => f,
            Err(e) => return ModuleOutcome::failed(format!("creating module config file: {e}"), Vec::new()),
        };
        if let Err(e) = std::fs::write(config_file.path(), config_body.to_string()) {
            return ModuleOutcome::failed(format!("writing module config file: {e}"), Vec::new());
        }

        let mut cmd = if let Some(chroot) = &self.chroot {
            let mut c = Command::new("chroot");
            c.arg(chroot);
            match resolved.kind {
                ModuleKind::Binary => {
                    c.arg(&resolved.exe_path).arg(config_file.path());
                }
                ModuleKind::Script => {
                    c.args(&self.python).arg(&resolved.exe_path).arg(config_file.path());
                }
            }
            c
        } else {
            match resolved.kind {
                ModuleKind::Binary => {
                    let mut c = Command::new(&resolved.exe_path);
                    c.arg(config_file.path());
                    c
                }
                ModuleKind::Script => {
                    let (interpreter, rest) = self.python.split_first().expect("non-empty python command");
                    let mut c = Command::new(interpreter);
                    c.args(rest).arg(&resolved.exe_path).arg(config_file.path());
                    c
                }
            }
        };
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let completed = match run_managed(cmd, self.command_timeout, cancellation).await {
            Ok(c) => c,
            Err(RunError::Timeout) => return ModuleOutcome::timeout(format!("module '{module_name}' timed out")),
            Err(e) => return ModuleOutcome::failed(e.to_string(), Vec::new()),
        };

        let stdout = String::from_utf8_lossy(&completed.stdout);
        let stderr = String::from_utf8_lossy(&completed.stderr);
        if !stderr.is_empty() {
            log::info!("module '{module_name}' stderr:\n{stderr}");
        }

        match serde_json::from_str::<serde_json::Value>(stdout.trim()) {
            Ok(parsed) => {
                let host_response = HostResponse {
                    host: LOCALHOST.into(),
                    response: parsed.clone(),
                };
                let failed = parsed.get("failed").and_then(|v| v.as_bool()).unwrap_or(false);
                if failed || !completed.success {
                    ModuleOutcome::failed(
                        parsed
                            .get("msg")
                            .and_then(|v| v.as_str())
                            .unwrap_or("module reported failure")
                            .to_owned(),
                        vec![host_response],
                    )
                } else {
                    ModuleOutcome::ok(vec![host_response])
                }
            }
            Err(_) if !stderr.is_empty() => {
                ModuleOutcome::failed(format!("module '{module_name}' produced non-JSON stdout: {stderr}"), Vec::new())
            }
            Err(e) => ModuleOutcome::failed(format!("module '{module_name}' produced non-JSON stdout: {e}"), Vec::new()),
        }
    }

    fn set_state_roots(&mut self, roots: Vec<PathBuf>) {
        self.library_roots = roots;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otree::OTree;

    fn shell_command(id: &str, line: &str) -> Value {
        let mut t = OTree::new();
        t.set(id, Value::from(line));
        Value::Tree(t)
    }

    #[tokio::test]
    async fn call_shell_runs_commands_in_order_and_captures_stdout() {
        let runner = LocalRunner::new();
        let commands = vec![shell_command("c1", "echo hi")];
        let outcome = runner.call_shell(&commands, &Cancellation::new()).await;
        assert!(outcome.errcode.is_ok());
        assert_eq!(outcome.response.len(), 1);
        assert_eq!(outcome.response[0].response["stdout"].as_str().unwrap().trim(), "hi");
    }

    #[tokio::test]
    async fn call_shell_continues_after_a_failing_command() {
        let runner = LocalRunner::new();
        let commands = vec![
            shell_command("c1", "false"),
            shell_command("c2", "echo still-ran"),
        ];
        let outcome = runner.call_shell(&commands, &Cancellation::new()).await;
        assert!(!outcome.errcode.is_ok());
        assert_eq!(outcome.response.len(), 2);
        assert_eq!(
            outcome.response[1].response["stdout"].as_str().unwrap().trim(),
            "still-ran"
        );
    }

    #[tokio::test]
    async fn cancelled_before_any_command_yields_timeout() {
        let runner = LocalRunner::new();
        let cancellation = Cancellation::new();
        cancellation.cancel();
        let commands = vec![shell_command("c1", "echo hi")];
        let outcome = runner.call_shell(&commands, &cancellation).await;
        assert_eq!(outcome.errcode.as_i64(), crate::ErrCode::Timeout.as_i64());
    }

    #[tokio::test]
    async fn cancellation_during_a_long_running_command_is_observed() {
        let runner = LocalRunner::new();
        let cancellation = Cancellation::new();
        let commands = vec![shell_command("c1", "sleep 5")];

        let cancel_handle = cancellation.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            cancel_handle.cancel();
        });

        // A child that never writes to its pipes must not block cancellation
        // on pipe EOF: this must resolve long before the command's own sleep.
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            runner.call_shell(&commands, &cancellation),
        )
        .await
        .expect("cancellation should be observed without waiting for the command to exit");
        assert_eq!(outcome.errcode.as_i64(), crate::ErrCode::Timeout.as_i64());
    }

    #[tokio::test]
    async fn unresolvable_module_fails_without_panicking() {
        let runner = LocalRunner::new();
        let payload = Value::Tree(OTree::new());
        let outcome = runner
            .call_module("ansible.commands.shell", &payload, &Cancellation::new())
            .await;
        assert!(!outcome.errcode.is_ok());
    }
}
