use crate::object_id::ObjectId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OpalError>;

#[derive(Error, Debug)]
pub enum OpalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Object existence: {0}")]
    ObjectExists(String),

    #[error("Object not found: {0}")]
    NotFound(ObjectId),

    #[error("No space: need {needed} bytes, {available} available")]
    NoSpace { needed: u64, available: u64 },

    #[error("Unacceptable object: {0}")]
    UnacceptableObject(String),

    #[error("Object deleted: {0}")]
    DeletedObject(ObjectId),

    #[error("Object {0} is not locked by the current context")]
    NotLocked(ObjectId),

    #[error("Unsupported erasure algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Insufficient fragments: need {required}, found {found}")]
    InsufficientFragments { required: usize, found: usize },

    #[error("Not recoverable: {0}")]
    NotRecoverable(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("No such node: {0}")]
    NoSuchNode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for OpalError {
    fn from(err: redis::RedisError) -> Self {
        OpalError::Internal(format!("redis error: {}", err))
    }
}
