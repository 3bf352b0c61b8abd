//! Query sessions spanning every shard.
//!
//! A [`Session`] is one SQLite connection opened on shard 1 with every other
//! shard attached under its `db<n>` alias. The shard list is an explicit
//! input to [`SessionBuilder`], taken fresh from the catalog each time a
//! session is opened.
//!
//! SQLite bounds how many databases one connection may attach. The session
//! raises that bound to [`MAX_ATTACHED`] and refuses a shard list it cannot
//! attach in full with [`StoreError::TooManyShards`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use coeur_types::{Post, ShardId};
use rusqlite::limits::Limit;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};

use crate::catalog::ShardRef;
use crate::error::{StoreError, StoreResult};
use crate::query::{schema_alias, BoundQuery};
use crate::row::RowLayout;
use crate::schema;

/// Databases a session asks to attach besides shard 1. SQLite lowers
/// this to the limit it was compiled with.
pub const MAX_ATTACHED: u32 = 125;

/// Builds a [`Session`] from an explicit shard list.
#[derive(Clone, Debug)]
pub struct SessionBuilder {
    dir: PathBuf,
    shards: Vec<ShardRef>,
    busy_timeout: Duration,
    max_attached: u32,
}

impl SessionBuilder {
    /// `shards` must contain shard 1; the rest are attached.
    pub fn new(dir: impl Into<PathBuf>, shards: Vec<ShardRef>) -> Self {
        Self {
            dir: dir.into(),
            shards,
            busy_timeout: Duration::from_secs(5),
            max_attached: MAX_ATTACHED,
        }
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Lower the attach limit below [`MAX_ATTACHED`].
    pub fn max_attached(mut self, max: u32) -> Self {
        self.max_attached = max.min(MAX_ATTACHED);
        self
    }

    /// Open shard 1 and attach the others.
    ///
    /// Failing to open shard 1 is fatal, as is a shard list longer than the
    /// connection can attach. Any other shard that cannot be attached is
    /// skipped and reported through [`Session::unavailable`].
    pub fn open(self) -> StoreResult<Session> {
        let primary = self
            .shards
            .iter()
            .find(|s| s.id.is_primary())
            .ok_or_else(|| StoreError::Uninitialized(self.dir.clone()))?;

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&primary.path, flags).map_err(|e| {
            StoreError::ShardUnavailable {
                shard: ShardId::PRIMARY,
                reason: e.to_string(),
            }
        })?;
        conn.busy_timeout(self.busy_timeout)?;
        let has_posts = schema::has_posts_table(&conn, "main").map_err(|e| {
            StoreError::ShardUnavailable {
                shard: ShardId::PRIMARY,
                reason: e.to_string(),
            }
        })?;
        if !has_posts {
            return Err(StoreError::ShardUnavailable {
                shard: ShardId::PRIMARY,
                reason: "no posts table".into(),
            });
        }

        let requested = i32::try_from(self.max_attached).unwrap_or(i32::MAX);
        conn.set_limit(Limit::SQLITE_LIMIT_ATTACHED, requested);
        let max_shards = usize::try_from(conn.limit(Limit::SQLITE_LIMIT_ATTACHED))
            .unwrap_or_default()
            + 1;
        if self.shards.len() > max_shards {
            return Err(StoreError::TooManyShards {
                shards: self.shards.len(),
                limit: max_shards,
            });
        }

        let mut session = Session {
            conn,
            attached: vec![ShardId::PRIMARY],
            unavailable: Vec::new(),
            max_shards,
        };
        for shard in self.shards.iter().filter(|s| !s.id.is_primary()) {
            session.attach_or_record(shard)?;
        }
        tracing::debug!(
            attached = session.attached.len(),
            max_shards,
            unavailable = session.unavailable.len(),
            "opened shard session"
        );
        Ok(session)
    }
}

/// A shard that could not be attached when the session was opened or
/// refreshed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnavailableShard {
    pub shard: ShardId,
    pub reason: String,
}

/// One connection with every available shard attached.
///
/// Not shareable across threads; open one session per thread of control.
pub struct Session {
    conn: Connection,
    attached: Vec<ShardId>,
    unavailable: Vec<UnavailableShard>,
    max_shards: usize,
}

impl Session {
    /// Shards queryable through this session, ascending.
    pub fn shards(&self) -> &[ShardId] {
        &self.attached
    }

    pub fn is_attached(&self, shard: ShardId) -> bool {
        self.attached.contains(&shard)
    }

    /// Shards left out of the union view, with the reason.
    pub fn unavailable(&self) -> &[UnavailableShard] {
        &self.unavailable
    }

    /// Most shards this session can query, shard 1 included.
    pub fn max_shards(&self) -> usize {
        self.max_shards
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Attach shards from `shards` that this session does not see yet.
    /// Returns the shards newly attached. Must not be called inside an open
    /// transaction.
    ///
    /// Fails with `TooManyShards` once the attach limit is reached; shards
    /// attached before that stay attached.
    pub fn refresh(&mut self, shards: &[ShardRef]) -> StoreResult<Vec<ShardId>> {
        let mut added = Vec::new();
        for shard in shards {
            if shard.id.is_primary() || self.is_attached(shard.id) {
                continue;
            }
            if self.attach_or_record(shard)? {
                added.push(shard.id);
            }
        }
        Ok(added)
    }

    /// Attach one shard.
    pub fn attach(&mut self, shard: &ShardRef) -> StoreResult<()> {
        if self.attached.len() >= self.max_shards {
            return Err(StoreError::TooManyShards {
                shards: self.attached.len() + 1,
                limit: self.max_shards,
            });
        }
        let alias = schema_alias(shard.id);
        let path = path_str(&shard.path, shard.id)?;
        let unavailable = |reason: String| StoreError::ShardUnavailable {
            shard: shard.id,
            reason,
        };

        self.conn
            .execute(&format!("ATTACH DATABASE ?1 AS {alias}"), params![path])
            .map_err(|e| unavailable(e.to_string()))?;
        match schema::has_posts_table(&self.conn, &alias) {
            Ok(true) => {}
            Ok(false) => {
                self.detach(&alias);
                return Err(unavailable("no posts table".into()));
            }
            Err(e) => {
                self.detach(&alias);
                return Err(unavailable(e.to_string()));
            }
        }

        self.unavailable.retain(|u| u.shard != shard.id);
        let at = self.attached.partition_point(|id| *id < shard.id);
        self.attached.insert(at, shard.id);
        Ok(())
    }

    /// Attach `shard`, or record it as unavailable. Only the attach limit is
    /// an error.
    fn attach_or_record(&mut self, shard: &ShardRef) -> StoreResult<bool> {
        match self.attach(shard) {
            Ok(()) => Ok(true),
            Err(err @ StoreError::TooManyShards { .. }) => Err(err),
            Err(err) => {
                tracing::warn!(shard = %shard.id, error = %err, "shard left out of union view");
                let reason = match err {
                    StoreError::ShardUnavailable { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.unavailable.retain(|u| u.shard != shard.id);
                self.unavailable.push(UnavailableShard {
                    shard: shard.id,
                    reason,
                });
                Ok(false)
            }
        }
    }

    fn detach(&self, alias: &str) {
        if let Err(e) = self.conn.execute_batch(&format!("DETACH DATABASE {alias}")) {
            tracing::warn!(alias, error = %e, "detach failed");
        }
    }

    /// Run a query and hand each post to `visit` as it is read. Returns the
    /// number of rows visited. Nothing beyond the current row is held.
    pub fn stream<F>(&self, query: &BoundQuery, mut visit: F) -> StoreResult<usize>
    where
        F: FnMut(Post) -> StoreResult<()>,
    {
        tracing::debug!(sql = %query.sql, "union query");
        let mut stmt = self.conn.prepare(&query.sql)?;
        let layout = RowLayout::from_statement(&stmt)?;
        let mut rows = stmt.query(params_from_iter(query.params.iter()))?;
        let mut seen = 0;
        while let Some(row) = rows.next()? {
            visit(layout.post(row)?)?;
            seen += 1;
        }
        Ok(seen)
    }

    /// Run a query and collect the posts.
    pub fn fetch(&self, query: &BoundQuery) -> StoreResult<Vec<Post>> {
        let mut posts = Vec::new();
        self.stream(query, |post| {
            posts.push(post);
            Ok(())
        })?;
        Ok(posts)
    }

    /// Run a single-value count query.
    pub fn count(&self, query: &BoundQuery) -> StoreResult<u64> {
        let count: i64 = self.conn.query_row(
            &query.sql,
            params_from_iter(query.params.iter()),
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("attached", &self.attached)
            .field("unavailable", &self.unavailable)
            .field("max_shards", &self.max_shards)
            .finish()
    }
}

fn path_str(path: &Path, shard: ShardId) -> StoreResult<&str> {
    path.to_str().ok_or_else(|| StoreError::ShardUnavailable {
        shard,
        reason: format!("path is not valid UTF-8: {}", path.display()),
    })
}
