use thiserror::Error;

/// Locally-recovered runtime errors (spec §7: `ErrRuntime`, `ErrNonCompliant`).
/// Unlike `nanostate::Error`, these never abort a whole run: the common
/// driver catches them per-module and records `FAILED`/`TIMEOUT` instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("module layout is non-compliant: {0}")]
    NonCompliant(String),

    #[error("execution timed out")]
    Timeout,
}

impl From<std::io::Error> for RunError {
    fn from(e: std::io::Error) -> Self {
        RunError::Runtime(e.to_string())
    }
}
