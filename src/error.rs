use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for database operations
pub type Result<T> = result::Result<T, Error>;

/// Database error kinds
#[derive(Debug, Error)]
pub enum Error {
    /// Key is absent, or the file to open does not exist
    #[error("record not found")]
    NotFound,
    /// Insert-only store on a key that is already present
    #[error("record already exists")]
    Exists,
    /// Underlying filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Header or record validation failed
    #[error("database corrupt: {0}")]
    Corrupt(String),
    /// Handle misuse: closed handle, conflicting transaction or lock state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Caller passed a value the engine cannot honour
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Mutation attempted on a read-only handle
    #[error("database is read-only")]
    ReadOnly,
    /// OS lock acquisition or release failed
    #[error("lock failed: {0}")]
    Lock(#[source] io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// Failures of the storage itself rather than of the request
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Corrupt(_) | Error::Lock(_))
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Error {
        Error::Corrupt(msg.into())
    }

    /// Errors worth telling apart from a plain filesystem failure at open time
    pub(crate) fn from_open(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            _ => Error::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_errors_map_missing_files_to_not_found() {
        let err = Error::from_open(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());

        let err = Error::from_open(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(Error::NotFound.to_string(), "record not found");
        assert_eq!(
            Error::InvalidState("handle is closed").to_string(),
            "invalid state: handle is closed"
        );
    }
}
