use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Number of the shard that owns a post.
///
/// Shards are numbered densely from 1. Shard 1 is the primary store every
/// session connects through; shards 2..N are auxiliary stores attached to
/// the same session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct ShardId(u32);

impl ShardId {
    /// The primary shard.
    pub const PRIMARY: ShardId = ShardId(1);

    /// Create a shard number, rejecting zero.
    pub fn new(number: u32) -> Result<Self, TypeError> {
        if number == 0 {
            return Err(TypeError::InvalidShard(0));
        }
        Ok(Self(number))
    }

    /// The raw 1-based shard number.
    pub fn get(&self) -> u32 {
        self.0
    }

    /// Returns `true` for shard 1.
    pub fn is_primary(&self) -> bool {
        self.0 == 1
    }
}

impl TryFrom<i64> for ShardId {
    type Error = TypeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match u32::try_from(value) {
            Ok(n) if n > 0 => Ok(Self(n)),
            _ => Err(TypeError::InvalidShard(value)),
        }
    }
}

impl From<ShardId> for i64 {
    fn from(id: ShardId) -> Self {
        i64::from(id.0)
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
