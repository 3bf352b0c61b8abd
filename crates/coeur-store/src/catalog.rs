//! Shard discovery.
//!
//! The catalog is derived, never persisted: every call re-reads the store
//! directory so new shard files and size changes are always observed fresh.
//!
//! # Layout
//!
//! ```text
//! db/
//! +-- db1.sqlite      # shard 1, the primary
//! +-- db2.sqlite      # shard 2, attached as `db2`
//! +-- ...
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use coeur_types::ShardId;

use crate::error::{StoreError, StoreResult};

/// File name of the primary shard.
pub const PRIMARY_SHARD_FILE: &str = "db1.sqlite";

const SHARD_PREFIX: &str = "db";
const SHARD_SUFFIX: &str = ".sqlite";

/// A shard file observed in the store directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardRef {
    pub id: ShardId,
    pub path: PathBuf,
    /// On-disk size when the directory was listed.
    pub size_bytes: u64,
}

/// Enumerates the shard files of one store directory.
#[derive(Clone, Debug)]
pub struct ShardCatalog {
    dir: PathBuf,
}

impl ShardCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for shard `id`: `db<id>.sqlite`.
    pub fn file_name(id: ShardId) -> String {
        format!("{SHARD_PREFIX}{id}{SHARD_SUFFIX}")
    }

    pub fn shard_path(&self, id: ShardId) -> PathBuf {
        self.dir.join(Self::file_name(id))
    }

    /// Returns `true` if shard `id`'s file exists.
    pub fn contains(&self, id: ShardId) -> bool {
        self.shard_path(id).exists()
    }

    /// All shard files, ordered by id.
    ///
    /// An absent directory yields an empty list; callers treat that as an
    /// uninitialized store. Entries that vanish or cannot be inspected while
    /// listing are skipped with a warning.
    pub fn list_shards(&self) -> StoreResult<Vec<ShardRef>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut shards = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = parse_shard_file_name(&name.to_string_lossy()) else {
                continue;
            };
            match entry.metadata() {
                Ok(meta) if meta.is_file() => shards.push(ShardRef {
                    id,
                    path: entry.path(),
                    size_bytes: meta.len(),
                }),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(shard = %id, error = %e, "skipping unreadable shard file");
                }
            }
        }
        shards.sort_by_key(|s| s.id);

        if shards.iter().enumerate().any(|(i, s)| s.id.get() as usize != i + 1) {
            tracing::warn!(
                dir = %self.dir.display(),
                shards = ?shards.iter().map(|s| s.id).collect::<Vec<_>>(),
                "shard numbering has gaps"
            );
        }
        Ok(shards)
    }

    /// Like [`Self::list_shards`], but an empty store is an error.
    pub fn require_shards(&self) -> StoreResult<Vec<ShardRef>> {
        let shards = self.list_shards()?;
        if shards.first().map(|s| s.id) != Some(ShardId::PRIMARY) {
            return Err(StoreError::Uninitialized(self.dir.clone()));
        }
        Ok(shards)
    }

    /// Identifier for the next shard: one past the number of shards.
    pub fn next_shard_id(&self) -> StoreResult<ShardId> {
        let count = self.list_shards()?.len();
        let next = u32::try_from(count + 1)
            .map_err(|_| StoreError::InvalidArgument("too many shards".into()))?;
        Ok(ShardId::new(next)?)
    }
}

/// The smallest shard in `shards`. Ties go to the first one in iteration
/// order.
pub fn least_loaded(shards: &[ShardRef]) -> Option<&ShardRef> {
    shards.iter().min_by_key(|s| s.size_bytes)
}

/// Parse `db<n>.sqlite` into shard `n`. Leading zeros are rejected so two
/// file names can never claim the same shard.
pub fn parse_shard_file_name(name: &str) -> Option<ShardId> {
    let digits = name.strip_prefix(SHARD_PREFIX)?.strip_suffix(SHARD_SUFFIX)?;
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    ShardId::new(digits.parse().ok()?).ok()
}
