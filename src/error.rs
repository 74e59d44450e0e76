use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidArgument(String),
    ResourceExhausted(String),
    InvalidHeader,
    ChecksumMismatch,
    Corrupted(String),
    Encode(&'static str, String),
    Decode(&'static str, String),
    MutexPoisoned,
    InvalidState(String),
    LockError(io::Error),
}

/// Coarse error classes a transport can map onto its own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was malformed; nothing was touched.
    InvalidArgument,
    /// Persistence failed; the write was not acknowledged and may be retried.
    Io,
    /// A configured capacity limit would be exceeded; nothing was applied.
    ResourceExhausted,
    /// Persisted state is corrupt or the engine is in an unusable state.
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::IoError(_) | Error::Encode(..) | Error::LockError(_) => ErrorKind::Io,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::InvalidHeader
            | Error::ChecksumMismatch
            | Error::Corrupted(_)
            | Error::Decode(..)
            | Error::MutexPoisoned
            | Error::InvalidState(_) => ErrorKind::Internal,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::Corrupted(msg) => write!(f, "Corrupted data: {}", msg),
            Error::Encode(field, msg) => write!(f, "Failed to encode {}: {}", field, msg),
            Error::Decode(field, msg) => write!(f, "Failed to decode {}: {}", field, msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::LockError(err) => Some(err),
            _ => None,
        }
    }
}
