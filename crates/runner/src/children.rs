//! A child process running in its own process group, killed gracefully
//! (SIGINT, then SIGKILL after a bounded grace period) on cancellation or
//! drop. Ported from `engine/process_execution/src/children.rs`'s
//! `ManagedChild`; the per-host concurrency guarantees in spec §5 rely on
//! this to release transport/process resources on every exit path.

use std::ops::{Deref, DerefMut};
use std::os::unix::process::CommandExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::{getpgid, Pid};
use tokio::process::{Child, Command};
use tokio::time::sleep;

const GRACEFUL_SHUTDOWN_POLL_TIME: Duration = Duration::from_millis(50);

pub struct ManagedChild {
    child: Child,
    graceful_shutdown_timeout: Duration,
    killed: AtomicBool,
}

impl ManagedChild {
    pub fn spawn(mut command: Command, graceful_shutdown_timeout: Duration) -> std::io::Result<Self> {
        command.kill_on_drop(true);

        // SAFETY: setsid only calls an async-signal-safe syscall between fork and exec.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_pgid| ())
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            });
        }

        let child = command.spawn()?;
        Ok(Self {
            child,
            graceful_shutdown_timeout,
            killed: AtomicBool::new(false),
        })
    }

    fn pgid(&self) -> Result<Pid, String> {
        let pid = self.id().ok_or_else(|| "child had no pid".to_owned())?;
        getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| format!("could not get process group id of child: {e}"))
    }

    fn signal_pg(&self, signal: Signal) -> Result<(), String> {
        let pgid = self.pgid()?;
        signal::kill(Pid::from_raw(-pgid.as_raw()), signal)
            .map_err(|e| format!("failed to signal child process group: {e}"))
    }

    /// Send SIGINT and wait up to `graceful_shutdown_timeout` for the child
    /// to exit; escalate to SIGKILL on timeout or error. Bounded: never
    /// blocks longer than the configured grace period plus the cost of a
    /// single SIGKILL.
    pub async fn graceful_shutdown(&mut self) -> Result<(), String> {
        self.signal_pg(Signal::SIGINT)?;

        let deadline = tokio::time::Instant::now() + self.graceful_shutdown_timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => {
                    self.killed.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Ok(None) => {
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    sleep(GRACEFUL_SHUTDOWN_POLL_TIME).await;
                }
                Err(e) => {
                    log::warn!("error polling child for graceful shutdown: {e}; sending SIGKILL");
                    break;
                }
            }
        }
        self.kill_pgid()
    }

    fn kill_pgid(&mut self) -> Result<(), String> {
        self.signal_pg(Signal::SIGKILL)?;
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Deref for ManagedChild {
    type Target = Child;
    fn deref(&self) -> &Child {
        &self.child
    }
}

impl DerefMut for ManagedChild {
    fn deref_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if !self.killed.load(Ordering::SeqCst) {
            let pgid = self.pgid();
            if let Ok(pgid) = pgid {
                let _ = signal::kill(Pid::from_raw(-pgid.as_raw()), Signal::SIGKILL);
            }
        }
    }
}
