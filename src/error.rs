use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::ProtocolError;

/// Failures while talking to a helper process.
///
/// None of these reach the client: the orchestrator turns them into
/// [`Verdict::InternalError`](crate::Verdict::InternalError).
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("couldn't spawn helper process {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("helper pipe error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to write to helper - wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("early EOF from helper")]
    Eof,

    #[error("helper line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("helper reports broken helper: {0}")]
    BrokenHelper(String),

    /// The handle was destroyed by an earlier failure and must be re-acquired
    #[error("helper process was already destroyed")]
    HelperGone,

    #[error("handshake exceeded {0} rounds")]
    RoundLimit(u32),
}

impl AuthError {
    /// Whether the helper that produced this error must be destroyed.
    /// A failed spawn never produced a helper, and a round limit is the client's doing.
    pub fn is_helper_fault(&self) -> bool {
        !matches!(self, AuthError::Spawn { .. } | AuthError::HelperGone | AuthError::RoundLimit(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid helper command line '{0}'")]
    Command(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
