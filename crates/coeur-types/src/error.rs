use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("post identifier must not be empty")]
    EmptyPostId,

    #[error("invalid shard number {0}: shards are numbered from 1")]
    InvalidShard(i64),

    #[error("unknown content format: {0:?}")]
    UnknownContentFormat(String),

    #[error("metadata document error: {0}")]
    Metadata(String),
}
