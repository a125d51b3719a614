use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Watch stream closed")]
    WatchClosed,

    #[error("Watch canceled by the store: {0}")]
    WatchCanceled(String),

    #[error("Revision {requested} has been compacted; oldest retained is {compacted}")]
    Compacted { requested: i64, compacted: i64 },

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
