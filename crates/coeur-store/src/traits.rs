use coeur_types::{Post, PostChanges, PostDraft, PostId, ShardId};

use crate::error::StoreResult;
use crate::query::PostQuery;
use crate::store::{CommitReport, PostPage};

/// Read side of the post store, as used by rendering, publishing and
/// administration.
///
/// All implementations must satisfy these invariants:
/// - Reads see the union of every shard attached to the session; a shard
///   that could not be attached is left out, not an error.
/// - Listings ordered by date break ties by identifier, so paging with a
///   fixed page size neither repeats nor skips a post.
/// - Filter values are bound as query parameters, never spliced into SQL.
pub trait PostReader {
    /// Number of posts across every shard.
    fn count_all(&self) -> StoreResult<u64>;

    /// Page `page` (1-based) of all posts, newest first, with the total.
    ///
    /// Returns `InvalidArgument` for page 0 or page size 0.
    fn get_page(&self, page: u64, page_size: u64) -> StoreResult<PostPage>;

    /// Look a post up by identifier in any shard.
    fn get_by_id(&self, id: &PostId) -> StoreResult<Post>;

    /// Posts whose title contains `needle` (ASCII case-insensitive), newest
    /// first. `None` uses the store's default limit.
    fn search(&self, needle: &str, limit: Option<u64>) -> StoreResult<Vec<Post>>;

    /// Posts matching an arbitrary filtered query.
    fn find(&self, query: &PostQuery) -> StoreResult<Vec<Post>>;
}

/// Write side of the post store.
pub trait PostWriter: PostReader {
    /// A new, unsaved post bound to the shard that should receive it.
    fn new_post(&mut self, draft: PostDraft) -> StoreResult<Post>;

    /// Persist one post in its own transaction.
    fn insert_post(&mut self, post: &Post) -> StoreResult<CommitReport>;

    /// Apply `changes` to the post in `shard` and return the stored result.
    ///
    /// Returns `NotFound` if the post is not in that shard.
    fn update_post(
        &mut self,
        id: &PostId,
        shard: ShardId,
        changes: &PostChanges,
    ) -> StoreResult<Post>;
}
