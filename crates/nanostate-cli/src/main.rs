//! `nanostate` CLI: load a root state file, compile it into an execution
//! tree, and drive either the local runner or the SSH runner over it.
//!
//! Argument parsing and logging setup follow
//! `process_execution/sandboxer/bin/client.rs`: a `clap::Parser` derive
//! struct plus a custom `env_logger` formatter with millisecond timestamps.

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use evalctx::{Evaluator, Traits};
use nanostate::Indexer;
use runner::local::LocalRunner;
use runner::ssh::SshRunner;
use runner::{Cancellation, Runner};

/// Compile and run a nanostate document against the local machine or a
/// fleet of SSH hosts.
#[derive(Parser)]
struct Opt {
    /// Path to the root `.st` state file to compile.
    #[arg(long)]
    state: PathBuf,

    /// Additional roots to search for included/referenced states and
    /// module libraries. May be repeated.
    #[arg(long = "root")]
    roots: Vec<PathBuf>,

    /// Run against this host over SSH instead of locally. May be repeated;
    /// an empty list runs locally.
    #[arg(long = "host")]
    hosts: Vec<String>,

    /// SSH port (SSH runner only).
    #[arg(long, default_value_t = 22)]
    ssh_port: u16,

    /// Path to the SSH private key directory, defaults to `~/.ssh`.
    #[arg(long)]
    ssh_key_path: Option<PathBuf>,

    /// Remote username (SSH runner only), defaults to the resolver's local
    /// username.
    #[arg(long)]
    ssh_user: Option<String>,

    /// Disable strict SSH host-key verification.
    #[arg(long)]
    ssh_insecure: bool,

    /// Root to bootstrap (bin/etc/modules) on a host's first failed
    /// invocation (SSH runner only).
    #[arg(long)]
    permanent_root: Option<PathBuf>,

    /// Run modules inside a chroot rooted here (local runner only).
    #[arg(long)]
    chroot: Option<PathBuf>,

    /// Emit `log::debug!` tracing from the compiler pump.
    #[arg(long)]
    debug: bool,

    /// Increase log verbosity; repeat for more (`-v` = info, `-vv` = debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::new();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        };
        builder.filter_level(level);
    } else {
        builder.parse_default_env();
    }
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.args()
            )
        })
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();
    init_logging(opt.verbose);

    let mut indexer = Indexer::new();
    indexer.add_roots(opt.roots.iter().cloned());
    indexer.index();

    let evaluator = Evaluator::new(Traits::detect());
    let mut compiler = nanostate::Compiler::new(evaluator);
    compiler.set_debug(opt.debug);
    let tree = compiler.run(&indexer, &opt.state)?;

    let mut runner: Box<dyn Runner> = if opt.hosts.is_empty() {
        let mut local = LocalRunner::new();
        if let Some(chroot) = opt.chroot.clone() {
            local = local.with_chroot(chroot);
        }
        Box::new(local)
    } else {
        let mut ssh = SshRunner::new()
            .with_port(opt.ssh_port)
            .with_host_verification(!opt.ssh_insecure);
        for host in &opt.hosts {
            ssh = ssh.add_host(host.clone());
        }
        if let Some(key_path) = opt.ssh_key_path.clone() {
            ssh = ssh.with_key_path(key_path);
        }
        if let Some(user) = opt.ssh_user.clone() {
            ssh = ssh.with_remote_user(user);
        }
        if let Some(root) = opt.permanent_root.clone() {
            ssh = ssh.with_permanent_root(root);
        }
        Box::new(ssh)
    };
    runner.set_state_roots(opt.roots.clone());

    let cancellation = Cancellation::new();
    let result = runner::run(runner.as_ref(), &tree, &cancellation).await;

    let report = serde_json::to_string_pretty(&result)?;
    println!("{report}");

    std::process::exit(result.errcode.as_i64() as i32);
}
