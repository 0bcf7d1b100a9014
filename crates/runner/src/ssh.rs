//! SSH Runner (spec §4.F, §6 "SSH runner").
//!
//! Grounded in `nanorunners/sshrunner.go`'s `SSHRunner`: one SSH connection
//! per host per call, one session (channel) per command, host identifiers
//! are fully-qualified names, port defaults to 22, key path defaults to the
//! invoking user's `~/.ssh`. Per-host concurrency uses the bounded
//! [`crate::WorkerPool`] (spec §5: "Implementers should adopt a
//! parallel-workers-per-host model with a bounded worker pool; each worker
//! owns its host's transport exclusively") rather than the original's fully
//! serial host loop.
//!
//! The transport itself is `russh`/`russh-keys` (spec §1: "we only specify
//! the connection/session operations the core relies on" — the library's
//! own internals are out of scope).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use otree::{Scalar, Value};
use russh::client;
use russh_keys::key;
use tokio::sync::Mutex;

use crate::cancel::Cancellation;
use crate::error::RunError;
use crate::worker_pool::WorkerPool;
use crate::{HostResponse, ModuleOutcome, Runner};

const DEFAULT_PORT: u16 = 22;

/// Runner variant that dispatches module invocations over SSH to a fleet of
/// hosts. Per spec §6: host identifiers are fully-qualified names, and host
/// verification may be explicitly disabled.
pub struct SshRunner {
    hosts: Vec<String>,
    key_path: PathBuf,
    port: u16,
    strict_host_verification: bool,
    remote_user: Option<String>,
    permanent_root: Option<PathBuf>,
    remote_helper_path: PathBuf,
    state_roots: Vec<PathBuf>,
    worker_pool: WorkerPool,
    bootstrapped: Arc<Mutex<HashSet<String>>>,
}

impl SshRunner {
    pub fn new() -> Self {
        let key_path = dirs_home_ssh();
        Self {
            hosts: Vec::new(),
            key_path,
            port: DEFAULT_PORT,
            strict_host_verification: true,
            remote_user: None,
            permanent_root: None,
            remote_helper_path: PathBuf::from("/opt/nanostate/bin/nanostate-module"),
            state_roots: Vec::new(),
            worker_pool: WorkerPool::new(8),
            bootstrapped: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn add_host(mut self, fqdn: impl Into<String>) -> Self {
        self.hosts.push(fqdn.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_key_path(mut self, key_path: PathBuf) -> Self {
        self.key_path = key_path;
        self
    }

    pub fn with_remote_user(mut self, username: impl Into<String>) -> Self {
        self.remote_user = Some(username.into());
        self
    }

    pub fn with_host_verification(mut self, enabled: bool) -> Self {
        self.strict_host_verification = enabled;
        self
    }

    /// Configure the root to bootstrap (`bin/`, `etc/`, `modules/`) the
    /// first time a command fails on a given host, per spec §4.F.
    pub fn with_permanent_root(mut self, root: PathBuf) -> Self {
        self.permanent_root = Some(root);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.worker_pool = WorkerPool::new(max_concurrency);
        self
    }
}

impl Default for SshRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn dirs_home_ssh() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".ssh"))
        .unwrap_or_else(|| PathBuf::from(".ssh"))
}

struct HostKeyHandler {
    strict: bool,
    host: String,
    port: u16,
    known_hosts_path: PathBuf,
}

#[async_trait]
impl client::Handler for HostKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &key::PublicKey) -> Result<bool, Self::Error> {
        if !self.strict {
            return Ok(true);
        }
        match russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, &self.known_hosts_path) {
            Ok(known) => Ok(known),
            Err(_) => Ok(false),
        }
    }
}

async fn connect_host(
    host: &str,
    port: u16,
    key_path: &Path,
    strict: bool,
    user: Option<&str>,
) -> Result<client::Handle<HostKeyHandler>, RunError> {
    let config = Arc::new(client::Config::default());
    let handler = HostKeyHandler {
        strict,
        host: host.to_owned(),
        port,
        known_hosts_path: key_path.join("known_hosts"),
    };

    let mut handle = client::connect(config, (host, port), handler)
        .await
        .map_err(|e| RunError::Runtime(format!("connecting to {host}:{port}: {e}")))?;

    let username = user.map(str::to_owned).unwrap_or_else(default_local_user);
    let key_pair = russh_keys::load_secret_key(key_path.join("id_rsa"), None)
        .map_err(|e| RunError::Runtime(format!("loading ssh key for {host} from {}: {e}", key_path.display())))?;

    let authenticated = handle
        .authenticate_publickey(&username, Arc::new(key_pair))
        .await
        .map_err(|e| RunError::Runtime(format!("authenticating to {host}: {e}")))?;
    if !authenticated {
        return Err(RunError::Runtime(format!("ssh authentication rejected by {host}")));
    }
    Ok(handle)
}

fn default_local_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_owned())
}

/// Open one channel, run `command` to completion, and collect its output.
/// "Sessions are single-use per the transport contract" (spec §4.F): a new
/// channel is opened for every command, over the same connection.
async fn exec_command(
    handle: &mut client::Handle<HostKeyHandler>,
    command: &str,
) -> Result<(bool, Vec<u8>, Vec<u8>), RunError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| RunError::Runtime(format!("opening ssh session: {e}")))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| RunError::Runtime(format!("executing '{command}': {e}")))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            russh::ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            russh::ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
            russh::ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            russh::ChannelMsg::Eof | russh::ChannelMsg::Close => break,
            _ => {}
        }
    }

    Ok((exit_status.unwrap_or(0) == 0, stdout, stderr))
}

/// Create `bin/`, `etc/`, `modules/` under the permanent root. Uploading
/// architecture-specific runner binaries into those directories is left to
/// the out-of-scope module/transport layer (spec §1): this lays down the
/// directory shape the remote helper expects and lets the caller retry.
async fn bootstrap_host(handle: &mut client::Handle<HostKeyHandler>, permanent_root: &Path) -> Result<(), RunError> {
    let root = permanent_root.display();
    exec_command(handle, &format!("mkdir -p {root}/bin {root}/etc {root}/modules"))
        .await
        .map(|_| ())
}

fn flatten_args(payload: &Value) -> String {
    let Some(tree) = payload.as_tree() else {
        return String::new();
    };
    tree.keys()
        .iter()
        .filter_map(|k| tree.get(k).map(|v| format!("{k}={}", flatten_value(v))))
        .collect::<Vec<_>>()
        .join(" ")
}

fn flatten_value(v: &Value) -> String {
    match v {
        Value::Scalar(Scalar::Str(s)) => s.clone(),
        Value::Scalar(Scalar::Bool(b)) => b.to_string(),
        Value::Scalar(Scalar::Int(i)) => i.to_string(),
        Value::Scalar(Scalar::Null) => String::new(),
        Value::Sequence(seq) => seq.iter().map(flatten_value).collect::<Vec<_>>().join(","),
        Value::Tree(_) => String::new(),
    }
}

struct HostCallParams {
    host: String,
    port: u16,
    key_path: PathBuf,
    strict: bool,
    user: Option<String>,
    permanent_root: Option<PathBuf>,
}

/// Run every command in `commands` against one host over a single
/// connection, retrying the first failure once after a bootstrap attempt
/// (spec §9: "preserved but flagged as a retry-policy decision worth
/// revisiting"). Per-host failures never abort other hosts.
async fn run_host_shell(
    params: HostCallParams,
    commands: Vec<Value>,
    bootstrapped: Arc<Mutex<HashSet<String>>>,
    cancellation: Cancellation,
) -> (HostResponse, Option<String>) {
    let mut handle = match connect_host(&params.host, params.port, &params.key_path, params.strict, params.user.as_deref()).await {
        Ok(h) => h,
        Err(e) => {
            return (
                HostResponse {
                    host: params.host.clone(),
                    response: serde_json::Value::Object(serde_json::Map::new()),
                },
                Some(e.to_string()),
            )
        }
    };

    let mut response = serde_json::Map::new();
    let mut first_error = None;

    for command in &commands {
        if cancellation.is_cancelled() {
            first_error.get_or_insert("cancelled before all commands ran".to_owned());
            break;
        }
        let Some(tree) = command.as_tree() else { continue };
        let Some(command_id) = tree.keys().first() else { continue };
        let Some(command_line) = tree.get_string(command_id) else { continue };

        let mut attempt = exec_command(&mut handle, command_line).await;
        if attempt.is_err() {
            if let Some(root) = &params.permanent_root {
                let already_bootstrapped = {
                    let mut seen = bootstrapped.lock().await;
                    !seen.insert(params.host.clone())
                };
                if !already_bootstrapped && bootstrap_host(&mut handle, root).await.is_ok() {
                    attempt = exec_command(&mut handle, command_line).await;
                }
            }
        }

        match attempt {
            Ok((success, stdout, stderr)) => {
                response.insert(
                    command_id.clone(),
                    serde_json::json!({
                        "stdout": String::from_utf8_lossy(&stdout),
                        "stderr": String::from_utf8_lossy(&stderr),
                    }),
                );
                if !success {
                    first_error.get_or_insert(format!(
                        "command '{command_id}' on {} exited non-zero",
                        params.host
                    ));
                }
            }
            Err(e) => {
                first_error.get_or_insert(format!("command '{command_id}' on {}: {e}", params.host));
            }
        }
    }

    (
        HostResponse {
            host: params.host,
            response: serde_json::Value::Object(response),
        },
        first_error,
    )
}

async fn run_host_module(
    params: HostCallParams,
    module_name: String,
    payload: Value,
    remote_helper_path: PathBuf,
    bootstrapped: Arc<Mutex<HashSet<String>>>,
) -> (HostResponse, Option<String>) {
    let mut handle = match connect_host(&params.host, params.port, &params.key_path, params.strict, params.user.as_deref()).await {
        Ok(h) => h,
        Err(e) => {
            return (
                HostResponse {
                    host: params.host.clone(),
                    response: serde_json::Value::Object(serde_json::Map::new()),
                },
                Some(e.to_string()),
            )
        }
    };

    let bare_name = module_name.strip_prefix("ansible.").unwrap_or(&module_name);
    let command = format!(
        "{} {bare_name} {}",
        remote_helper_path.display(),
        flatten_args(&payload)
    );

    let mut attempt = exec_command(&mut handle, &command).await;
    if attempt.is_err() {
        if let Some(root) = &params.permanent_root {
            let already_bootstrapped = {
                let mut seen = bootstrapped.lock().await;
                !seen.insert(params.host.clone())
            };
            if !already_bootstrapped && bootstrap_host(&mut handle, root).await.is_ok() {
                attempt = exec_command(&mut handle, &command).await;
            }
        }
    }

    match attempt {
        Ok((success, stdout, stderr)) => {
            let response = serde_json::json!({
                module_name.clone(): {
                    "stdout": String::from_utf8_lossy(&stdout),
                    "stderr": String::from_utf8_lossy(&stderr),
                }
            });
            let errmsg = if success {
                None
            } else {
                Some(format!("module '{module_name}' on {} exited non-zero", params.host))
            };
            (
                HostResponse {
                    host: params.host,
                    response,
                },
                errmsg,
            )
        }
        Err(e) => (
            HostResponse {
                host: params.host.clone(),
                response: serde_json::Value::Object(serde_json::Map::new()),
            },
            Some(format!("module '{module_name}' on {}: {e}", params.host)),
        ),
    }
}

#[async_trait]
impl Runner for SshRunner {
    async fn call_shell(&self, commands: &[Value], cancellation: &Cancellation) -> ModuleOutcome {
        let commands_owned = commands.to_vec();
        let mut tasks = tokio::task::JoinSet::new();

        for host in &self.hosts {
            let params = HostCallParams {
                host: host.clone(),
                port: self.port,
                key_path: self.key_path.clone(),
                strict: self.strict_host_verification,
                user: self.remote_user.clone(),
                permanent_root: self.permanent_root.clone(),
            };
            let commands = commands_owned.clone();
            let bootstrapped = self.bootstrapped.clone();
            let cancellation = cancellation.clone();
            let pool = self.worker_pool.clone();
            tasks.spawn(async move {
                let _permit = pool.acquire().await;
                run_host_shell(params, commands, bootstrapped, cancellation).await
            });
        }

        collect_host_results(tasks).await
    }

    async fn call_module(&self, module_name: &str, payload: &Value, _cancellation: &Cancellation) -> ModuleOutcome {
        let mut tasks = tokio::task::JoinSet::new();

        for host in &self.hosts {
            let params = HostCallParams {
                host: host.clone(),
                port: self.port,
                key_path: self.key_path.clone(),
                strict: self.strict_host_verification,
                user: self.remote_user.clone(),
                permanent_root: self.permanent_root.clone(),
            };
            let module_name = module_name.to_owned();
            let payload = payload.clone();
            let remote_helper_path = self.remote_helper_path.clone();
            let bootstrapped = self.bootstrapped.clone();
            let pool = self.worker_pool.clone();
            tasks.spawn(async move {
                let _permit = pool.acquire().await;
                run_host_module(params, module_name, payload, remote_helper_path, bootstrapped).await
            });
        }

        collect_host_results(tasks).await
    }

    fn set_state_roots(&mut self, roots: Vec<PathBuf>) {
        self.state_roots = roots;
    }
}

async fn collect_host_results(mut tasks: tokio::task::JoinSet<(HostResponse, Option<String>)>) -> ModuleOutcome {
    let mut response = Vec::new();
    let mut first_error = None;
    while let Some(outcome) = tasks.join_next().await {
        match outcome {
            Ok((host_response, errmsg)) => {
                response.push(host_response);
                if let Some(msg) = errmsg {
                    first_error.get_or_insert(msg);
                }
            }
            Err(join_err) => {
                first_error.get_or_insert(format!("host task panicked: {join_err}"));
            }
        }
    }
    match first_error {
        Some(msg) => ModuleOutcome::failed(msg, response),
        None => ModuleOutcome::ok(response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otree::OTree;

    #[test]
    fn flatten_args_joins_key_value_pairs() {
        let mut tree = OTree::new();
        tree.set("name", Value::from("john"));
        tree.set("uid", Value::Scalar(Scalar::Int(1000)));
        let flattened = flatten_args(&Value::Tree(tree));
        assert_eq!(flattened, "name=john uid=1000");
    }

    #[test]
    fn builder_defaults_match_spec() {
        let runner = SshRunner::new();
        assert_eq!(runner.port, DEFAULT_PORT);
        assert!(runner.strict_host_verification);
    }
}
