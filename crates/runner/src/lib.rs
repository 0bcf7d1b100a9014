//! Runners (component F): walk a compiled execution tree in declared order
//! and invoke modules, aggregating per-host, per-group, per-module results.
//!
//! The `Runner` capability is a plain trait object, not a base class — spec
//! §9 "Runtime polymorphism via self-reference" re-architects the source's
//! inheritance-based dispatch this way, mirroring
//! `process_execution`'s `Box<dyn CommandRunner>` (`bounded.rs`).

pub mod cancel;
pub mod children;
mod driver;
mod error;
pub mod local;
pub mod resolve;
pub mod result;
pub mod ssh;
mod worker_pool;

pub use cancel::Cancellation;
pub use driver::run;
pub use error::RunError;
pub use result::{ErrCode, GroupResult, HostResponse, ModuleResult, RunResult};
pub use worker_pool::WorkerPool;

use std::path::PathBuf;

use async_trait::async_trait;
use otree::Value;

/// Outcome of a single module invocation, already classified into the
/// result-document shape: never a hard `Err`, since runtime failures are
/// locally recovered per spec §7 and folded into `errcode`/`errmsg`.
#[derive(Debug, Clone)]
pub struct ModuleOutcome {
    pub errcode: ErrCode,
    pub errmsg: String,
    pub response: Vec<HostResponse>,
}

impl ModuleOutcome {
    pub fn ok(response: Vec<HostResponse>) -> Self {
        Self {
            errcode: ErrCode::Ok,
            errmsg: String::new(),
            response,
        }
    }

    pub fn failed(errmsg: impl Into<String>, response: Vec<HostResponse>) -> Self {
        Self {
            errcode: ErrCode::Failed,
            errmsg: errmsg.into(),
            response,
        }
    }

    pub fn timeout(errmsg: impl Into<String>) -> Self {
        Self {
            errcode: ErrCode::Timeout,
            errmsg: errmsg.into(),
            response: Vec::new(),
        }
    }
}

/// `{call_shell(args)→results, call_module(name, kwargs)→results,
/// set_state_roots(…)}` per spec §9. One `Runner` drives either local
/// execution or a fleet of SSH hosts; the common driver in [`driver`]
/// doesn't know or care which.
#[async_trait]
pub trait Runner: Send + Sync {
    /// `commands` is the `shell` module's payload: an ordered sequence of
    /// single-key `{command_id: command_line}` invocations. `cancellation`
    /// is checked between commands (spec §5); a request to cancel surfaces
    /// as `ErrCode::Timeout` on whatever command was in flight.
    async fn call_shell(&self, commands: &[Value], cancellation: &Cancellation) -> ModuleOutcome;

    /// `payload` is the structured keyword-argument tree for an
    /// `ansible.`-prefixed module invocation.
    async fn call_module(
        &self,
        module_name: &str,
        payload: &Value,
        cancellation: &Cancellation,
    ) -> ModuleOutcome;

    /// Configure the roots the runner searches for module libraries and
    /// (for the SSH runner) bootstraps onto the permanent install root.
    fn set_state_roots(&mut self, roots: Vec<PathBuf>);
}
