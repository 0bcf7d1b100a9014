use thiserror::Error;

/// Error taxonomy for the state loader and compiler (spec §7). Every variant
/// here is fatal for the whole compile except where noted; the runner has
/// its own, separate error type for locally recovered runtime failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("state or file not found: {0}")]
    NotFound(String),

    #[error("reference cycle detected: {0}")]
    Cycle(String),

    #[error("cannot include state '{0}': not found")]
    MissingInclude(String),

    #[error("block expression '{expr}' mixes incompatible sigils")]
    MixedSigils { expr: String },

    #[error("anchor '{anchor}' has no declared block in the current state")]
    DanglingAnchor { anchor: String },

    #[error("loop generator '{function}' did not return a sequence of mappings")]
    LoopShape { function: String },

    #[error("unknown predicate/generator function: {0}")]
    UnknownFunction(String),

    #[error("error calling predicate: {0}")]
    PredicateCall(String),

    #[error("unsupported leaf type: {0}")]
    UnsupportedType(String),

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<refset::Error> for Error {
    fn from(e: refset::Error) -> Self {
        match e {
            refset::Error::Cycle(id) => Error::Cycle(id),
        }
    }
}

impl From<otree::Error> for Error {
    fn from(e: otree::Error) -> Self {
        match e {
            otree::Error::UnsupportedType(msg) => Error::UnsupportedType(msg),
        }
    }
}

impl From<evalctx::Error> for Error {
    fn from(e: evalctx::Error) -> Self {
        match e {
            evalctx::Error::UnknownFunction(name) => Error::UnknownFunction(name),
            other => Error::PredicateCall(other.to_string()),
        }
    }
}
