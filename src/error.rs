use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the log store.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller supplied an argument the operation cannot act on: zero
    /// record coordinates, an empty payload, a path that is not a directory,
    /// or a reclamation target that is still active or not fully
    /// acknowledged.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The log was opened without `create` and does not exist.
    #[error("log environment does not exist: {}", path.display())]
    Missing { path: PathBuf },

    /// The referenced segment has been reclaimed.
    #[error("segment {segment} has been reclaimed")]
    Gone { segment: u64 },

    /// The operation is not available for this writer flavor.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A contended or interrupted storage operation; retrying may succeed.
    #[error("transient storage failure")]
    Retry(#[source] io::Error),

    /// Unrecoverable storage failure.
    #[error(transparent)]
    Storage(io::Error),
}

impl Error {
    /// `true` if the failed operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            // The substrate reports caller errors (a name shadowed by a
            // directory, a malformed name) as `InvalidInput`.
            io::ErrorKind::InvalidInput => Self::InvalidArgument(e.to_string()),
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                Self::Retry(e)
            }
            _ => Self::Storage(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
