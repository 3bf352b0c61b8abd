//! Sharded post storage for the Coeur content pipeline.
//!
//! Posts are spread over a directory of size-bounded SQLite files
//! ("shards") that are queried together as if they were one `posts` table.
//! When even the least-loaded shard grows past the configured budget, the
//! next commit creates a new, empty shard and new posts go there.
//!
//! # Layout
//!
//! - [`ShardCatalog`] -- lists the shard files of a store directory
//! - [`union_sql`] / [`PostQuery`] -- compose parameterized queries over
//!   the union of all shards
//! - [`SessionBuilder`] / [`Session`] -- one connection on shard 1 with
//!   every other shard attached
//! - [`RolloverPolicy`] -- decides when the store is full and creates the
//!   next shard
//! - [`Pages`] -- lazy, bounded-memory paging over the union view
//! - [`ShardedStore`] / [`WriteTxn`] -- the facade collaborators use,
//!   implementing [`PostReader`] and [`PostWriter`]
//!
//! # Design Rules
//!
//! 1. Post identifiers are unique across all shards, not just within one.
//! 2. A post stays in the shard it was created in.
//! 3. The shard list is re-read from disk, never cached across writes.
//! 4. A shard that cannot be attached degrades the union view; only shard 1
//!    is required. A store with more shards than one session can attach
//!    fails with [`StoreError::TooManyShards`] instead.
//! 5. A failed rollover never undoes the commit that triggered it.

pub mod catalog;
pub mod config;
pub mod error;
pub mod pagination;
pub mod query;
pub mod rollover;
pub mod row;
pub mod schema;
pub mod session;
pub mod store;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use catalog::{ShardCatalog, ShardRef};
pub use config::StoreConfig;
pub use error::{Missing, StoreError, StoreResult};
pub use pagination::{Page, Pages};
pub use query::{union_sql, Direction, Filter, PostQuery};
pub use rollover::{RolloverOutcome, RolloverPolicy};
pub use schema::Column;
pub use session::{Session, SessionBuilder, UnavailableShard, MAX_ATTACHED};
pub use store::{CommitReport, PostPage, ShardedStore, WriteTxn};
pub use traits::{PostReader, PostWriter};
