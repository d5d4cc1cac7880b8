//! Error taxonomy shared by layers, the union engine, and file handles.

use std::io;

use thiserror::Error;

/// Result type for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Filesystem operation errors.
#[derive(Debug, Clone, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("io error: {0}")]
    Io(String),
}

impl FsError {
    /// Error for a synchronous call attempted while an asynchronous
    /// operation holds the serialization lock.
    pub fn sync_call_in_flight() -> Self {
        FsError::InvalidArgument(
            "synchronous call while an asynchronous operation is in flight".into(),
        )
    }

    /// Error for any operation invoked before `initialize` has completed.
    pub fn not_initialized() -> Self {
        FsError::Permission("filesystem not initialized".into())
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => FsError::NotFound(err.to_string()),
            ErrorKind::AlreadyExists => FsError::AlreadyExists(err.to_string()),
            ErrorKind::NotADirectory => FsError::NotADirectory(err.to_string()),
            ErrorKind::IsADirectory => FsError::IsADirectory(err.to_string()),
            ErrorKind::DirectoryNotEmpty => FsError::NotEmpty(err.to_string()),
            ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => {
                FsError::Permission(err.to_string())
            }
            ErrorKind::InvalidInput => FsError::InvalidArgument(err.to_string()),
            ErrorKind::Unsupported => FsError::Unsupported(err.to_string()),
            _ => FsError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_error() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(FsError::from(not_found), FsError::NotFound(_)));

        let exists = io::Error::new(io::ErrorKind::AlreadyExists, "there");
        assert!(matches!(FsError::from(exists), FsError::AlreadyExists(_)));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(FsError::from(denied), FsError::Permission(_)));

        let other = io::Error::other("weird");
        assert!(matches!(FsError::from(other), FsError::Io(_)));
    }
}
