use storage_backend::StoreError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Cannot decode key {key}: {reason}")]
    KeyDecode { key: String, reason: String },

    #[error("Cannot decode value of {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Cannot encode {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Version conflict on {key}: expected version {expected} is no longer current")]
    VersionConflict { key: String, expected: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Watch stream terminated")]
    WatchTerminated,

    #[error("Repository shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
