//! Shard identity used for routing and for the identify payload.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Error when construct a shard info
#[derive(Debug, Snafu)]
#[snafu(display("shard index {index} is out of range for shard count {count}"))]
pub struct InvalidShardError {
    /// given index
    pub index: u32,
    /// given count
    pub count: u32,
}

/// Immutable `(index, count)` pair, `index < count` always holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u32; 2]", into = "[u32; 2]")]
pub struct ShardInfo {
    index: u32,
    count: u32,
}

impl Default for ShardInfo {
    fn default() -> Self {
        Self { index: 0, count: 1 }
    }
}

impl ShardInfo {
    /// Create a shard info, fails when `index >= count`
    pub fn new(index: u32, count: u32) -> Result<Self, InvalidShardError> {
        if index >= count {
            return Err(InvalidShardError { index, count });
        }
        Ok(Self { index, count })
    }

    /// shard index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// total shard count
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Index of the shard owning the top-level resource (e.g. a guild) with this snowflake id.
    pub fn shard_for(resource_id: u64, count: u32) -> u32 {
        ((resource_id >> 22) % u64::from(count.max(1))) as u32
    }

    /// Check if this shard owns the top-level resource with this snowflake id.
    pub fn owns(&self, resource_id: u64) -> bool {
        Self::shard_for(resource_id, self.count) == self.index
    }

    /// `[index, count]`, the form used in identify payload
    pub fn as_array(&self) -> [u32; 2] {
        [self.index, self.count]
    }
}

impl TryFrom<[u32; 2]> for ShardInfo {
    type Error = InvalidShardError;

    fn try_from([index, count]: [u32; 2]) -> Result<Self, Self::Error> {
        Self::new(index, count)
    }
}

impl From<ShardInfo> for [u32; 2] {
    fn from(shard: ShardInfo) -> Self {
        shard.as_array()
    }
}

impl Display for ShardInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}
