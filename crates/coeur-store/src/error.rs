use std::fmt;
use std::path::PathBuf;

use coeur_types::{PostId, ShardId, TypeError};
use rusqlite::ErrorCode;

/// What a [`StoreError::NotFound`] refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Missing {
    /// No post with this identifier exists in any shard.
    Post(PostId),
    /// The post does not exist in the named shard.
    PostInShard(PostId, ShardId),
    /// The shard is not part of the store.
    Shard(ShardId),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Post(id) => write!(f, "post {id}"),
            Self::PostInShard(id, shard) => write!(f, "post {id} in shard {shard}"),
            Self::Shard(shard) => write!(f, "shard {shard}"),
        }
    }
}

/// Errors from sharded store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested post or shard does not exist. Never retried.
    #[error("not found: {0}")]
    NotFound(Missing),

    /// Duplicate identifier or missing required field on write.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A shard could not be opened or attached to the session.
    #[error("shard {shard} unavailable: {reason}")]
    ShardUnavailable { shard: ShardId, reason: String },

    /// The store has more shards than one session can attach.
    #[error("{shards} shards exceed the {limit} a session can query")]
    TooManyShards { shards: usize, limit: usize },

    /// Rollover could not create the next shard. The write that triggered
    /// the evaluation stays committed.
    #[error("could not create shard {shard}: {reason}")]
    CapacityExpansionFailed { shard: ShardId, reason: String },

    /// Underlying file I/O failed. Retrying is up to the caller.
    #[error("I/O error: {0}")]
    TransientIo(String),

    /// The store directory holds no primary shard.
    #[error("no shard store initialized at {}", .0.display())]
    Uninitialized(PathBuf),

    /// `create` was called on a directory that already holds a store.
    #[error("a shard store already exists at {}", .0.display())]
    AlreadyInitialized(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid record: {0}")]
    Type(#[from] TypeError),

    /// Any other SQLite failure.
    #[error("database error: {0}")]
    Database(#[source] rusqlite::Error),
}

impl StoreError {
    /// Returns `true` for failures a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::ConstraintViolation => Self::ConstraintViolation(err.to_string()),
                ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::DiskFull
                | ErrorCode::CannotOpen => Self::TransientIo(err.to_string()),
                _ => Self::Database(err),
            },
            _ => Self::Database(err),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
