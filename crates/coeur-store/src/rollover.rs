//! Shard rollover.
//!
//! After every commit the store asks [`RolloverPolicy::evaluate`] whether it
//! is full. The policy looks at the *least-loaded* shard: writes are placed
//! on the smallest shard, so once even that one is over budget the whole
//! store is considered full and shard N+1 is created.
//!
//! Shards the caller cannot write to are excluded from the evaluation, so
//! the policy judges the same set that placement chooses from. A store
//! never grows past the number of shards one session can attach.
//!
//! Evaluating the newest shard instead would be the obvious alternative.
//! Placement depends on this choice, so it stays as is until a migration
//! story for existing stores exists.

use std::fs;
use std::io;
use std::sync::{Mutex, PoisonError};

use coeur_types::ShardId;
use tempfile::NamedTempFile;

use crate::catalog::{least_loaded, ShardCatalog, ShardRef};
use crate::error::{StoreError, StoreResult};
use crate::schema;

/// Result of one rollover evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloverOutcome {
    /// The least-loaded shard is within budget.
    Stable { least_loaded: ShardId },
    /// A new shard was created.
    Expanded(ShardRef),
    /// The shard this evaluation would have created already exists.
    AlreadyPresent(ShardId),
}

/// Decides when the store is full and creates the next shard.
#[derive(Debug)]
pub struct RolloverPolicy {
    max_shard_bytes: u64,
    max_shards: Option<usize>,
    /// Serializes "create shard N" within the process.
    creation: Mutex<()>,
}

impl RolloverPolicy {
    pub fn new(max_shard_bytes: u64) -> Self {
        Self {
            max_shard_bytes,
            max_shards: None,
            creation: Mutex::new(()),
        }
    }

    /// Refuse to create a shard beyond the `max`-th.
    pub fn with_max_shards(mut self, max: usize) -> Self {
        self.max_shards = Some(max);
        self
    }

    pub fn max_shard_bytes(&self) -> u64 {
        self.max_shard_bytes
    }

    pub fn needs_rollover(&self, least_loaded: &ShardRef) -> bool {
        least_loaded.size_bytes > self.max_shard_bytes
    }

    /// Re-read the catalog and create the next shard if even the
    /// least-loaded shard outside `excluded` is over budget.
    ///
    /// Sizes and the next shard id are read inside the creation section, so
    /// two evaluations in a row against a full store create one shard.
    pub fn evaluate(
        &self,
        catalog: &ShardCatalog,
        excluded: &[ShardId],
    ) -> StoreResult<RolloverOutcome> {
        let _guard = self.creation.lock().unwrap_or_else(PoisonError::into_inner);

        let shards = catalog.require_shards()?;
        let usable: Vec<ShardRef> = shards
            .iter()
            .filter(|s| !excluded.contains(&s.id))
            .cloned()
            .collect();
        let least = least_loaded(&usable)
            .ok_or_else(|| StoreError::Uninitialized(catalog.dir().to_path_buf()))?;
        if !self.needs_rollover(least) {
            return Ok(RolloverOutcome::Stable {
                least_loaded: least.id,
            });
        }

        let next = catalog.next_shard_id()?;
        if let Some(max) = self.max_shards {
            if shards.len() >= max {
                return Err(StoreError::CapacityExpansionFailed {
                    shard: next,
                    reason: format!("a session can query at most {max} shards"),
                });
            }
        }
        tracing::debug!(
            shard = %least.id,
            size = least.size_bytes,
            budget = self.max_shard_bytes,
            next = %next,
            "least-loaded shard over budget"
        );
        self.create_shard(catalog, next)
    }

    /// Create shard `id` unless it already exists.
    pub fn create_shard(
        &self,
        catalog: &ShardCatalog,
        id: ShardId,
    ) -> StoreResult<RolloverOutcome> {
        match create_shard_file(catalog, id) {
            Ok(Some(shard)) => {
                tracing::info!(shard = %shard.id, path = %shard.path.display(), "created shard");
                Ok(RolloverOutcome::Expanded(shard))
            }
            Ok(None) => Ok(RolloverOutcome::AlreadyPresent(id)),
            Err(err) => Err(StoreError::CapacityExpansionFailed {
                shard: id,
                reason: err.to_string(),
            }),
        }
    }
}

/// Build shard `id` under a temporary name and move it into place only if
/// no file with the final name exists. Returns `None` when the shard was
/// already there.
pub(crate) fn create_shard_file(
    catalog: &ShardCatalog,
    id: ShardId,
) -> StoreResult<Option<ShardRef>> {
    let path = catalog.shard_path(id);
    match fs::metadata(&path) {
        Ok(meta) if meta.is_file() => return Ok(None),
        Ok(_) => {
            return Err(StoreError::Config(format!(
                "{} exists and is not a shard file",
                path.display()
            )))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let staging = NamedTempFile::new_in(catalog.dir())?;
    schema::initialize_shard_file(staging.path(), id)?;
    match staging.persist_noclobber(&path) {
        Ok(file) => {
            file.sync_all()?;
            let size_bytes = fs::metadata(&path)?.len();
            Ok(Some(ShardRef {
                id,
                path,
                size_bytes,
            }))
        }
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e.error.into()),
    }
}
