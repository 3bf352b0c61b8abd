//! The shard schema.
//!
//! Every shard holds one `posts` table with the same structure. New shards
//! get it from [`SHARD_DDL`]; nothing is ever inferred from an existing
//! table.

use std::path::Path;

use coeur_types::ShardId;
use rusqlite::{params, Connection, OpenFlags};

use crate::error::StoreResult;

pub const POSTS_TABLE: &str = "posts";

/// Stored in `PRAGMA user_version` of every shard.
pub const SCHEMA_VERSION: i64 = 1;

/// Table and index definitions applied to every new shard file.
pub const SHARD_DDL: &str = "
CREATE TABLE IF NOT EXISTS posts (
    identifier TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    content_format TEXT,
    path TEXT,
    metadata TEXT,
    date TEXT,
    image TEXT,
    shard_number INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS posts_date ON posts (date);
";

/// A column of the `posts` table.
///
/// Queries name columns only through this enum, so no caller-provided text
/// ever ends up in an identifier position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Column {
    Identifier,
    Title,
    Content,
    ContentFormat,
    Path,
    Metadata,
    Date,
    Image,
    ShardNumber,
}

/// Number of columns in the `posts` table.
pub const COLUMN_COUNT: usize = 9;

impl Column {
    /// Every column, in table order.
    pub const ALL: [Column; COLUMN_COUNT] = [
        Column::Identifier,
        Column::Title,
        Column::Content,
        Column::ContentFormat,
        Column::Path,
        Column::Metadata,
        Column::Date,
        Column::Image,
        Column::ShardNumber,
    ];

    /// Lightweight projection used for counting: avoids pulling metadata
    /// and other large columns through the union.
    pub const COUNT_PROJECTION: [Column; 2] = [Column::Title, Column::Content];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::Title => "title",
            Self::Content => "content",
            Self::ContentFormat => "content_format",
            Self::Path => "path",
            Self::Metadata => "metadata",
            Self::Date => "date",
            Self::Image => "image",
            Self::ShardNumber => "shard_number",
        }
    }
}

/// Create the posts table in a freshly opened shard file.
pub fn apply(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(SHARD_DDL)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

/// Create a shard database at `path` with the shard schema applied.
///
/// The file must either not exist yet or be empty.
pub fn initialize_shard_file(path: &Path, shard: ShardId) -> StoreResult<()> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let mut conn = Connection::open_with_flags(path, flags)?;
    apply(&mut conn)?;
    tracing::debug!(shard = %shard, path = %path.display(), "applied shard schema");
    conn.close().map_err(|(_, e)| e)?;
    Ok(())
}

/// Returns `true` if `schema` (as attached to `conn`) contains the posts
/// table.
pub fn has_posts_table(conn: &Connection, schema: &str) -> StoreResult<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM {schema}.sqlite_master WHERE type = 'table' AND name = ?1"
    );
    let count: i64 = conn.query_row(&sql, params![POSTS_TABLE], |row| row.get(0))?;
    Ok(count > 0)
}
