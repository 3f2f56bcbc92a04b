use std::error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/**
 * Errors that bring down the whole process group. There is no partial
 * recovery inside a running simulation: every variant is fatal, and restart
 * from the last checkpoint is the only way back.
 */
#[derive(Debug)]
pub enum Error {
    Io { context: String, source: io::Error },
    Config(String),
    InvalidMesh(String),
    MissingMessenger { remote: usize, role: &'static str },
    MessageSize { remote: usize, expected: usize, received: usize },
    GlobalIdMismatch { local: u64, received: u64 },
    LayoutMismatch { prepared: usize, requested: usize },
    NegativeLambda { element: usize, lambda: f64 },
    CheckpointGroupSize { file: i32, group: usize },
    CheckpointNodeCount { harbored: usize, max: usize },
    MalformedCheckpoint { path: PathBuf, reason: String },
    MalformedSource { path: PathBuf, reason: String },
    Encode(String),
    Decode(String),
    Transport(String),
    Aborted { rank: usize, reason: String },
    PeerFailed { operation: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;




// ============================================================================
impl Error {
    pub fn io<C: Into<String>>(context: C, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> std::result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Io { context, source } => write!(fmt, "{}: {}", context, source),
            Config(msg) => write!(fmt, "invalid configuration: {}", msg),
            InvalidMesh(msg) => write!(fmt, "inconsistent mesh: {}", msg),
            MissingMessenger { remote, role } => {
                write!(fmt, "no {} messenger for process {}", role, remote)
            }
            MessageSize {
                remote,
                expected,
                received,
            } => write!(
                fmt,
                "message from process {} has {} bytes, expected {}",
                remote, received, expected
            ),
            GlobalIdMismatch { local, received } => write!(
                fmt,
                "record carries global id {} but the local node is {}",
                received, local
            ),
            LayoutMismatch { prepared, requested } => write!(
                fmt,
                "schedule was prepared for {} fields per record, exchange uses {}",
                prepared, requested
            ),
            NegativeLambda { element, lambda } => {
                write!(fmt, "element {} produces negative lambda = {:.6}", element, lambda)
            }
            CheckpointGroupSize { file, group } => write!(
                fmt,
                "checkpoint was written by {} processes, this group has {}",
                file, group
            ),
            CheckpointNodeCount { harbored, max } => write!(
                fmt,
                "harbored node count {} exceeds checkpoint maximum {}",
                harbored, max
            ),
            MalformedCheckpoint { path, reason } => {
                write!(fmt, "malformed checkpoint {}: {}", path.display(), reason)
            }
            MalformedSource { path, reason } => {
                write!(fmt, "malformed force file {}: {}", path.display(), reason)
            }
            Encode(msg) => write!(fmt, "encode failed: {}", msg),
            Decode(msg) => write!(fmt, "decode failed: {}", msg),
            Transport(msg) => write!(fmt, "transport failure: {}", msg),
            Aborted { rank, reason } => write!(fmt, "process {} aborted the group: {}", rank, reason),
            PeerFailed { operation } => write!(fmt, "{} failed on another process", operation),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for Error {
    fn from(e: ciborium::ser::Error<io::Error>) -> Self {
        Error::Encode(e.to_string())
    }
}
