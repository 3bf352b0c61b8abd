use std::fs;

use coeur_types::{Metadata, Post, PostChanges, PostDraft, PostId, PublishRecord, ShardId};

use crate::catalog::{least_loaded, ShardCatalog, ShardRef};
use crate::config::StoreConfig;
use crate::error::{Missing, StoreError, StoreResult};
use crate::pagination::Pages;
use crate::query::{single, PostQuery};
use crate::rollover::{self, RolloverOutcome, RolloverPolicy};
use crate::schema::Column;
use crate::session::{Session, SessionBuilder, UnavailableShard};
use crate::traits::{PostReader, PostWriter};

/// One page of a listing plus the size of the whole listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

impl PostPage {
    /// Number of pages needed to list `total` posts.
    pub fn page_count(&self) -> u64 {
        self.total.div_ceil(self.page_size)
    }
}

/// A set of size-bounded shard files queried as one `posts` table.
///
/// The store owns one [`Session`] and is meant for a single thread of
/// control; it performs at most one write transaction at a time. The shard
/// list is re-read from disk when the store is opened, before each write
/// transaction, and after each rollover.
#[derive(Debug)]
pub struct ShardedStore {
    config: StoreConfig,
    catalog: ShardCatalog,
    policy: RolloverPolicy,
    session: Session,
}

impl ShardedStore {
    /// Initialize a new store: create the directory and shard 1.
    pub fn create(config: StoreConfig) -> StoreResult<Self> {
        fs::create_dir_all(&config.dir)?;
        let catalog = ShardCatalog::new(&config.dir);
        match rollover::create_shard_file(&catalog, ShardId::PRIMARY)? {
            Some(shard) => {
                tracing::info!(path = %shard.path.display(), "initialized shard store");
            }
            None => return Err(StoreError::AlreadyInitialized(config.dir.clone())),
        }
        Self::open(config)
    }

    /// Open an existing store.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let catalog = ShardCatalog::new(&config.dir);
        let session = open_session(&config, &catalog)?;
        Ok(Self {
            policy: RolloverPolicy::new(config.max_shard_bytes)
                .with_max_shards(session.max_shards()),
            config,
            catalog,
            session,
        })
    }

    /// Open the store, initializing it first if the directory holds none.
    pub fn open_or_create(config: StoreConfig) -> StoreResult<Self> {
        if ShardCatalog::new(&config.dir).contains(ShardId::PRIMARY) {
            Self::open(config)
        } else {
            Self::create(config)
        }
    }

    /// Drop the current session and open a new one against the shard files
    /// on disk now.
    pub fn reopen(&mut self) -> StoreResult<()> {
        self.session = open_session(&self.config, &self.catalog)?;
        Ok(())
    }

    /// Attach shards created since the session was opened. Returns the
    /// shards newly attached.
    pub fn refresh_shards(&mut self) -> StoreResult<Vec<ShardId>> {
        let shards = self.catalog.require_shards()?;
        self.session.refresh(&shards)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ShardCatalog {
        &self.catalog
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Every shard file of the store, with current sizes.
    pub fn shards(&self) -> StoreResult<Vec<ShardRef>> {
        self.catalog.require_shards()
    }

    /// Shards left out of the union view of the current session.
    pub fn degraded(&self) -> &[UnavailableShard] {
        self.session.unavailable()
    }

    /// Start a write transaction.
    pub fn transaction(&mut self) -> StoreResult<WriteTxn<'_>> {
        self.refresh_shards()?;
        self.session.connection().execute_batch("BEGIN IMMEDIATE")?;
        Ok(WriteTxn {
            store: self,
            writes: 0,
            finished: false,
        })
    }

    /// Run the rollover policy and attach the shard it created, if any.
    ///
    /// Shards the session could not attach are left out of the evaluation,
    /// matching the shards [`PostWriter::new_post`] places posts on.
    pub fn evaluate_rollover(&mut self) -> StoreResult<RolloverOutcome> {
        let excluded: Vec<ShardId> = self.degraded().iter().map(|u| u.shard).collect();
        let outcome = self.policy.evaluate(&self.catalog, &excluded);
        match &outcome {
            Ok(RolloverOutcome::Expanded(shard)) => {
                self.session.refresh(std::slice::from_ref(shard))?;
            }
            Ok(RolloverOutcome::AlreadyPresent(_)) => {
                self.refresh_shards()?;
            }
            Ok(RolloverOutcome::Stable { .. }) => {}
            Err(err) => {
                tracing::warn!(error = %err, "capacity expansion failed");
            }
        }
        outcome
    }

    /// Posts matching `query`, handed to `visit` one at a time.
    pub fn for_each<F>(&self, query: &PostQuery, visit: F) -> StoreResult<usize>
    where
        F: FnMut(Post) -> StoreResult<()>,
    {
        self.session
            .stream(&query.to_select(self.session.shards())?, visit)
    }

    /// All posts in pages of `per_page`, stopping after `max_total` posts
    /// if given.
    pub fn pages(&self, per_page: u64, max_total: Option<u64>) -> StoreResult<Pages<'_>> {
        Pages::new(&self.session, PostQuery::new(), per_page, max_total)
    }

    /// [`Self::pages`] with the configured page size and no cap.
    pub fn all_pages(&self) -> StoreResult<Pages<'_>> {
        self.pages(self.config.page_size, None)
    }

    /// Page `page` of one shard, newest first, with that shard's total.
    pub fn shard_page(&self, shard: ShardId, page: u64, page_size: u64) -> StoreResult<PostPage> {
        let offset = page_offset(page, page_size)?;
        self.readable(shard)?;
        let posts = self
            .session
            .fetch(&single::page(shard, page_size, offset))?;
        Ok(PostPage {
            posts,
            total: self.session.count(&single::count(shard))?,
            page,
            page_size,
        })
    }

    pub fn count_shard(&self, shard: ShardId) -> StoreResult<u64> {
        self.readable(shard)?;
        self.session.count(&single::count(shard))
    }

    /// The post `id` as stored in `shard`.
    pub fn get_in_shard(&self, id: &PostId, shard: ShardId) -> StoreResult<Post> {
        self.readable(shard)?;
        self.session
            .fetch(&single::lookup(shard, id))?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(Missing::PostInShard(id.clone(), shard)))
    }

    /// Record that the post was republished to `channel` at `url`, under
    /// `social.<channel>` in its metadata document.
    pub fn record_publication(
        &mut self,
        id: &PostId,
        shard: ShardId,
        channel: &str,
        url: &str,
    ) -> StoreResult<Post> {
        let post = self.get_in_shard(id, shard)?;
        let mut metadata = Metadata::parse(&post.metadata)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        metadata
            .record_publication(channel, &PublishRecord::now(url))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let changes = PostChanges {
            metadata: Some(metadata.to_json_string()),
            ..PostChanges::default()
        };
        self.update_post(id, shard, &changes)
    }

    /// Fail unless `shard` is attached to the session.
    fn readable(&self, shard: ShardId) -> StoreResult<()> {
        if self.session.is_attached(shard) {
            return Ok(());
        }
        if let Some(unavailable) = self
            .session
            .unavailable()
            .iter()
            .find(|u| u.shard == shard)
        {
            return Err(StoreError::ShardUnavailable {
                shard,
                reason: unavailable.reason.clone(),
            });
        }
        Err(StoreError::NotFound(Missing::Shard(shard)))
    }
}

impl PostReader for ShardedStore {
    fn count_all(&self) -> StoreResult<u64> {
        self.session
            .count(&PostQuery::new().to_count(self.session.shards())?)
    }

    fn get_page(&self, page: u64, page_size: u64) -> StoreResult<PostPage> {
        let offset = page_offset(page, page_size)?;
        let query = PostQuery::newest_first().limit(page_size).offset(offset);
        let posts = self.find(&query)?;
        Ok(PostPage {
            posts,
            total: self.count_all()?,
            page,
            page_size,
        })
    }

    fn get_by_id(&self, id: &PostId) -> StoreResult<Post> {
        let query = PostQuery::new()
            .equals(Column::Identifier, id.as_str())
            .limit(1);
        self.find(&query)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(Missing::Post(id.clone())))
    }

    fn search(&self, needle: &str, limit: Option<u64>) -> StoreResult<Vec<Post>> {
        let query = PostQuery::newest_first()
            .contains(Column::Title, needle)
            .limit(limit.unwrap_or(self.config.search_limit));
        self.find(&query)
    }

    fn find(&self, query: &PostQuery) -> StoreResult<Vec<Post>> {
        self.session.fetch(&query.to_select(self.session.shards())?)
    }
}

impl PostWriter for ShardedStore {
    /// Allocate an identifier and choose a shard for a new post. Nothing is
    /// written; persist the post with [`WriteTxn::insert`] or
    /// [`PostWriter::insert_post`].
    ///
    /// Rollover is evaluated first, so a store whose shards are all over
    /// budget places the post on a fresh shard.
    fn new_post(&mut self, draft: PostDraft) -> StoreResult<Post> {
        if let Err(err) = self.evaluate_rollover() {
            if !matches!(err, StoreError::CapacityExpansionFailed { .. }) {
                return Err(err);
            }
        }
        self.refresh_shards()?;

        let shards: Vec<ShardRef> = self
            .catalog
            .require_shards()?
            .into_iter()
            .filter(|s| self.session.is_attached(s.id))
            .collect();
        let target = least_loaded(&shards)
            .ok_or_else(|| StoreError::Uninitialized(self.config.dir.clone()))?;
        Ok(Post::from_draft(PostId::generate(), target.id, draft))
    }

    fn insert_post(&mut self, post: &Post) -> StoreResult<CommitReport> {
        let mut txn = self.transaction()?;
        txn.insert(post)?;
        txn.commit()
    }

    fn update_post(
        &mut self,
        id: &PostId,
        shard: ShardId,
        changes: &PostChanges,
    ) -> StoreResult<Post> {
        let mut txn = self.transaction()?;
        let post = txn.update(id, shard, changes)?;
        txn.commit()?;
        Ok(post)
    }
}

fn open_session(config: &StoreConfig, catalog: &ShardCatalog) -> StoreResult<Session> {
    let shards = catalog.require_shards()?;
    SessionBuilder::new(catalog.dir(), shards)
        .busy_timeout(config.busy_timeout())
        .open()
}

fn page_offset(page: u64, page_size: u64) -> StoreResult<u64> {
    if page == 0 || page_size == 0 {
        return Err(StoreError::InvalidArgument(format!(
            "page {page} of size {page_size}: both must be at least 1"
        )));
    }
    (page - 1)
        .checked_mul(page_size)
        .ok_or_else(|| StoreError::InvalidArgument(format!("page {page} is out of range")))
}

/// What a committed transaction did.
#[derive(Debug)]
pub struct CommitReport {
    pub writes: usize,
    /// Rollover evaluation that ran after the commit. A failure here does
    /// not undo the commit.
    pub rollover: StoreResult<RolloverOutcome>,
}

/// An open write transaction on the store's session.
///
/// Dropping it without [`WriteTxn::commit`] rolls every write back.
#[derive(Debug)]
pub struct WriteTxn<'s> {
    store: &'s mut ShardedStore,
    writes: usize,
    finished: bool,
}

impl WriteTxn<'_> {
    /// Read access to the store, seeing this transaction's own writes.
    pub fn store(&self) -> &ShardedStore {
        &*self.store
    }

    /// Insert `post` into the shard it is bound to.
    pub fn insert(&mut self, post: &Post) -> StoreResult<()> {
        let session = &self.store.session;
        if !session.is_attached(post.shard) {
            self.store.readable(post.shard)?;
        }

        // Each shard only enforces its own primary key.
        let existing = PostQuery::new()
            .equals(Column::Identifier, post.id.as_str())
            .to_count(session.shards())?;
        if session.count(&existing)? > 0 {
            return Err(StoreError::ConstraintViolation(format!(
                "post identifier {} already exists",
                post.id
            )));
        }

        let insert = single::insert(post);
        session
            .connection()
            .execute(&insert.sql, rusqlite::params_from_iter(insert.params.iter()))?;
        self.writes += 1;
        Ok(())
    }

    /// Insert a batch. Stops at the first failure; the batch is only
    /// persisted if the transaction is committed.
    pub fn insert_all<'p, I>(&mut self, posts: I) -> StoreResult<usize>
    where
        I: IntoIterator<Item = &'p Post>,
    {
        let mut inserted = 0;
        for post in posts {
            self.insert(post)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Apply `changes` to post `id` in `shard` and return the updated post.
    pub fn update(
        &mut self,
        id: &PostId,
        shard: ShardId,
        changes: &PostChanges,
    ) -> StoreResult<Post> {
        let mut post = self.store.get_in_shard(id, shard)?;
        if let Some(update) = single::update(shard, id, changes) {
            self.store.session.connection().execute(
                &update.sql,
                rusqlite::params_from_iter(update.params.iter()),
            )?;
            self.writes += 1;
            post.apply(changes);
        }
        Ok(post)
    }

    /// Commit, then evaluate rollover before returning.
    pub fn commit(mut self) -> StoreResult<CommitReport> {
        self.store.session.connection().execute_batch("COMMIT")?;
        self.finished = true;
        tracing::debug!(writes = self.writes, "committed");
        let rollover = self.store.evaluate_rollover();
        Ok(CommitReport {
            writes: self.writes,
            rollover,
        })
    }

    /// Undo every write made in this transaction.
    pub fn rollback(mut self) -> StoreResult<()> {
        self.finished = true;
        self.store.session.connection().execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.store.session.connection().execute_batch("ROLLBACK") {
            tracing::warn!(error = %err, "rollback of abandoned transaction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coeur_types::ContentFormat;
    use proptest::prelude::*;
    use rusqlite::{params, Connection};
    use std::collections::HashSet;
    use std::path::Path;

    const BUDGET: u64 = 64 * 1024;

    fn new_store(dir: &Path) -> ShardedStore {
        ShardedStore::create(StoreConfig::new(dir.join("db")).with_max_shard_bytes(BUDGET))
            .unwrap()
    }

    fn draft(n: usize) -> PostDraft {
        PostDraft::new(format!("Post {n}"), format!("Body of post {n}"))
            .path(format!("/posts/{n}"))
            .date(format!("2024-01-{:02}", n % 28 + 1))
    }

    fn insert_posts(store: &mut ShardedStore, n: usize) -> Vec<Post> {
        let mut posts = Vec::new();
        for i in 0..n {
            let post = store.new_post(draft(i)).unwrap();
            store.insert_post(&post).unwrap();
            posts.push(post);
        }
        posts
    }

    /// Insert directly into shard files, bypassing the store.
    fn inflate(store: &ShardedStore, shard: ShardId) {
        let conn = Connection::open(store.catalog().shard_path(shard)).unwrap();
        conn.execute(
            "INSERT INTO posts (identifier, title, content, date, shard_number) \
             VALUES (?1, 'filler', ?2, '2000-01-01', ?3)",
            params![
                PostId::generate().as_str(),
                "x".repeat(2 * BUDGET as usize),
                shard.get()
            ],
        )
        .unwrap();
    }

    fn add_shard(store: &mut ShardedStore) -> ShardId {
        let next = store.catalog().next_shard_id().unwrap();
        rollover::create_shard_file(store.catalog(), next)
            .unwrap()
            .unwrap();
        store.refresh_shards().unwrap();
        next
    }

    fn shard_ids(store: &ShardedStore) -> Vec<u32> {
        store.shards().unwrap().iter().map(|s| s.id.get()).collect()
    }

    #[test]
    fn create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("db"));
        drop(ShardedStore::create(config.clone()).unwrap());

        assert!(matches!(
            ShardedStore::create(config.clone()),
            Err(StoreError::AlreadyInitialized(_))
        ));
        let store = ShardedStore::open(config).unwrap();
        assert_eq!(shard_ids(&store), vec![1]);
        assert_eq!(store.count_all().unwrap(), 0);
    }

    #[test]
    fn open_empty_directory_is_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShardedStore::open(StoreConfig::new(dir.path())).unwrap_err();
        assert!(matches!(err, StoreError::Uninitialized(_)));

        let store = ShardedStore::open_or_create(StoreConfig::new(dir.path())).unwrap();
        assert_eq!(shard_ids(&store), vec![1]);
    }

    #[test]
    fn three_posts_two_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        insert_posts(&mut store, 3);

        assert_eq!(store.count_all().unwrap(), 3);
        let first = store.get_page(1, 2).unwrap();
        assert_eq!(first.posts.len(), 2);
        assert_eq!(first.total, 3);
        assert_eq!(first.page_count(), 2);
        let second = store.get_page(2, 2).unwrap();
        assert_eq!(second.posts.len(), 1);
        assert_eq!(second.total, 3);
        assert!(store.get_page(3, 2).unwrap().posts.is_empty());
    }

    #[test]
    fn page_arguments_validated() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path());
        assert!(matches!(
            store.get_page(0, 10),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.get_page(1, 0),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.get_page(u64::MAX, u64::MAX),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let draft = PostDraft::new("Ünïcødé title", "line one\n\n  indented\ttab\r\nend")
            .format(ContentFormat::Html)
            .path("/2024/hello-world")
            .metadata("{ \"tags\" : [\"a\", \"b\"],\n \"draft\": false }")
            .date("2024-03-01T10:00:00")
            .image("/img/cover.png");
        let post = store.new_post(draft).unwrap();

        let mut txn = store.transaction().unwrap();
        txn.insert(&post).unwrap();
        txn.commit().unwrap();

        assert_eq!(store.get_by_id(&post.id).unwrap(), post);
        assert_eq!(store.get_in_shard(&post.id, post.shard).unwrap(), post);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path());
        let id = PostId::generate();
        assert!(matches!(
            store.get_by_id(&id),
            Err(StoreError::NotFound(Missing::Post(_)))
        ));
        assert!(matches!(
            store.get_in_shard(&id, ShardId::PRIMARY),
            Err(StoreError::NotFound(Missing::PostInShard(_, _)))
        ));
    }

    #[test]
    fn duplicate_identifier_rejected_in_same_shard() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let post = insert_posts(&mut store, 1).remove(0);

        let mut txn = store.transaction().unwrap();
        let err = txn.insert(&post).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[test]
    fn duplicate_identifier_rejected_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let second = add_shard(&mut store);
        let post = insert_posts(&mut store, 1).remove(0);

        let mut copy = post.clone();
        copy.shard = if post.shard == second {
            ShardId::PRIMARY
        } else {
            second
        };
        let mut txn = store.transaction().unwrap();
        assert!(matches!(
            txn.insert(&copy),
            Err(StoreError::ConstraintViolation(_))
        ));

        // Also within one transaction.
        let fresh = Post::from_draft(PostId::generate(), ShardId::PRIMARY, draft(9));
        let mut twin = fresh.clone();
        twin.shard = second;
        txn.insert(&fresh).unwrap();
        assert!(matches!(
            txn.insert(&twin),
            Err(StoreError::ConstraintViolation(_))
        ));
        txn.commit().unwrap();
        assert_eq!(store.count_all().unwrap(), 2);
    }

    #[test]
    fn rollback_and_drop_undo_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let second = add_shard(&mut store);

        let a = Post::from_draft(PostId::generate(), ShardId::PRIMARY, draft(1));
        let b = Post::from_draft(PostId::generate(), second, draft(2));
        let mut txn = store.transaction().unwrap();
        assert_eq!(txn.insert_all([&a, &b]).unwrap(), 2);
        assert_eq!(txn.store().count_all().unwrap(), 2);
        txn.rollback().unwrap();
        assert_eq!(store.count_all().unwrap(), 0);

        {
            let mut txn = store.transaction().unwrap();
            txn.insert(&a).unwrap();
        }
        assert_eq!(store.count_all().unwrap(), 0);

        // A failed batch leaves nothing behind once dropped.
        {
            let mut txn = store.transaction().unwrap();
            assert!(txn.insert_all([&a, &a]).is_err());
        }
        assert_eq!(store.count_all().unwrap(), 0);
    }

    #[test]
    fn count_is_sum_of_shards() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let second = add_shard(&mut store);
        let third = add_shard(&mut store);

        let mut txn = store.transaction().unwrap();
        for (i, shard) in [ShardId::PRIMARY, second, second, third, third, third]
            .into_iter()
            .enumerate()
        {
            txn.insert(&Post::from_draft(PostId::generate(), shard, draft(i)))
                .unwrap();
        }
        txn.commit().unwrap();

        let per_shard: u64 = [ShardId::PRIMARY, second, third]
            .into_iter()
            .map(|s| store.count_shard(s).unwrap())
            .sum();
        assert_eq!(store.count_shard(third).unwrap(), 3);
        assert_eq!(store.count_all().unwrap(), per_shard);
        assert_eq!(per_shard, 6);
    }

    #[test]
    fn commit_over_budget_rolls_over() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());

        let big = PostDraft::new("big", "y".repeat(2 * BUDGET as usize));
        let post = store.new_post(big).unwrap();
        assert_eq!(post.shard, ShardId::PRIMARY);

        let mut txn = store.transaction().unwrap();
        txn.insert(&post).unwrap();
        let report = txn.commit().unwrap();
        assert_eq!(report.writes, 1);
        let Ok(RolloverOutcome::Expanded(shard)) = &report.rollover else {
            panic!("expected rollover, got {:?}", report.rollover);
        };
        assert_eq!(shard.id.get(), 2);
        assert!(store.session().is_attached(shard.id));

        let next = store.new_post(draft(1)).unwrap();
        assert_eq!(next.shard, shard.id);
        assert_eq!(shard_ids(&store), vec![1, 2]);
    }

    #[test]
    fn oversized_primary_sends_next_post_to_shard_two() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        inflate(&store, ShardId::PRIMARY);

        let post = store.new_post(draft(1)).unwrap();
        assert_eq!(post.shard.get(), 2);
        assert_eq!(shard_ids(&store), vec![1, 2]);

        let mut txn = store.transaction().unwrap();
        txn.insert(&post).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.count_shard(post.shard).unwrap(), 1);
    }

    #[test]
    fn rollover_evaluated_twice_creates_one_shard() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        inflate(&store, ShardId::PRIMARY);

        assert!(matches!(
            store.evaluate_rollover().unwrap(),
            RolloverOutcome::Expanded(_)
        ));
        assert!(matches!(
            store.evaluate_rollover().unwrap(),
            RolloverOutcome::Stable { .. }
        ));
        assert_eq!(shard_ids(&store), vec![1, 2]);
    }

    #[test]
    fn update_changes_fields_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let post = insert_posts(&mut store, 1).remove(0);

        let changes = PostChanges {
            title: Some("Renamed".into()),
            image: Some(Some("/img/new.png".into())),
            ..PostChanges::default()
        };
        let updated = store.update_post(&post.id, post.shard, &changes).unwrap();
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.image.as_deref(), Some("/img/new.png"));
        assert_eq!(updated.content, post.content);
        assert_eq!(updated.shard, post.shard);
        assert_eq!(store.get_by_id(&post.id).unwrap(), updated);
    }

    #[test]
    fn update_missing_post_or_shard() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let changes = PostChanges {
            title: Some("x".into()),
            ..PostChanges::default()
        };
        let id = PostId::generate();
        assert!(matches!(
            store.update_post(&id, ShardId::PRIMARY, &changes),
            Err(StoreError::NotFound(Missing::PostInShard(_, _)))
        ));
        assert!(matches!(
            store.update_post(&id, ShardId::new(7).unwrap(), &changes),
            Err(StoreError::NotFound(Missing::Shard(_)))
        ));
    }

    #[test]
    fn search_by_title_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let entries = [
            ("Rust in 2023", "2023-05-01"),
            ("Why rust", "2024-02-01"),
            ("Go notes", "2024-03-01"),
            ("50% rusty", "2022-01-01"),
        ];
        let mut txn = store.transaction().unwrap();
        for (title, date) in entries {
            let post = Post::from_draft(
                PostId::generate(),
                ShardId::PRIMARY,
                PostDraft::new(title, "body").date(date),
            );
            txn.insert(&post).unwrap();
        }
        txn.commit().unwrap();

        let titles = |posts: Vec<Post>| posts.into_iter().map(|p| p.title).collect::<Vec<_>>();
        assert_eq!(
            titles(store.search("rust", None).unwrap()),
            vec!["Why rust", "Rust in 2023", "50% rusty"]
        );
        assert_eq!(titles(store.search("rust", Some(1)).unwrap()), vec!["Why rust"]);
        assert_eq!(titles(store.search("%", None).unwrap()), vec!["50% rusty"]);
        assert!(store.search("python", None).unwrap().is_empty());
    }

    #[test]
    fn record_publication_and_find_unpublished() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let mut posts = insert_posts(&mut store, 1);
        for metadata in [r#"{"tags": ["mastodon"]}"#, "not json"] {
            let post = store
                .new_post(draft(posts.len()).metadata(metadata))
                .unwrap();
            store.insert_post(&post).unwrap();
            posts.push(post);
        }

        let published = store
            .record_publication(
                &posts[0].id,
                posts[0].shard,
                "mastodon",
                "https://mastodon.example/@me/1",
            )
            .unwrap();
        let record = published
            .metadata_document()
            .unwrap()
            .published_to("mastodon")
            .unwrap();
        assert_eq!(record.url, "https://mastodon.example/@me/1");
        assert!(!record.date.is_empty());

        let unpublished = store
            .find(&PostQuery::newest_first().unpublished_to("mastodon"))
            .unwrap();
        let ids: HashSet<PostId> = unpublished.into_iter().map(|p| p.id).collect();
        let expected: HashSet<PostId> = posts[1..].iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, expected);

        let everyone = PostQuery::new().unpublished_to("bluesky");
        assert_eq!(store.find(&everyone).unwrap().len(), 3);
        let session = store.session();
        let count = PostQuery::new()
            .unpublished_to("mastodon")
            .to_count(session.shards())
            .unwrap();
        assert_eq!(session.count(&count).unwrap(), 2);
    }

    #[test]
    fn record_publication_rejects_malformed_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let post = store
            .new_post(PostDraft::new("t", "c").metadata("[1, 2]"))
            .unwrap();
        let mut txn = store.transaction().unwrap();
        txn.insert(&post).unwrap();
        txn.commit().unwrap();

        let err = store
            .record_publication(&post.id, post.shard, "bluesky", "https://b.example/1")
            .unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
        assert_eq!(store.get_by_id(&post.id).unwrap().metadata, "[1, 2]");
    }

    #[test]
    fn shard_page_lists_one_shard() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let second = add_shard(&mut store);

        let mut txn = store.transaction().unwrap();
        for i in 0..5 {
            let shard = if i < 2 { ShardId::PRIMARY } else { second };
            txn.insert(&Post::from_draft(PostId::generate(), shard, draft(i)))
                .unwrap();
        }
        txn.commit().unwrap();

        let page = store.shard_page(second, 1, 2).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.posts.len(), 2);
        assert!(page.posts.iter().all(|p| p.shard == second));
        assert!(page.posts[0].date >= page.posts[1].date);
        assert_eq!(store.shard_page(second, 2, 2).unwrap().posts.len(), 1);

        assert!(matches!(
            store.shard_page(ShardId::new(9).unwrap(), 1, 2),
            Err(StoreError::NotFound(Missing::Shard(_)))
        ));
    }

    #[test]
    fn corrupt_shard_degrades_union_view() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let second = add_shard(&mut store);
        let posts = insert_posts(&mut store, 2);
        let config = store.config().clone();
        drop(store);

        fs::write(
            ShardCatalog::new(&config.dir).shard_path(second),
            vec![b'x'; 4096],
        )
        .unwrap();
        let mut store = ShardedStore::open(config).unwrap();

        assert_eq!(store.degraded().len(), 1);
        assert_eq!(store.degraded()[0].shard, second);
        let on_primary = posts.iter().filter(|p| p.shard.is_primary()).count() as u64;
        assert_eq!(store.count_all().unwrap(), on_primary);
        let err = store.count_shard(second).unwrap_err();
        assert!(matches!(err, StoreError::ShardUnavailable { .. }));
        assert_eq!(err.to_string().matches("unavailable").count(), 1, "{err}");

        // New posts only go to shards the session can see.
        let post = store.new_post(draft(7)).unwrap();
        assert!(post.shard.is_primary());
        let stray = Post::from_draft(PostId::generate(), second, draft(8));
        let mut txn = store.transaction().unwrap();
        assert!(matches!(
            txn.insert(&stray),
            Err(StoreError::ShardUnavailable { .. })
        ));
    }

    #[test]
    fn unreadable_shard_does_not_hold_off_rollover() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let second = add_shard(&mut store);
        let config = store.config().clone();
        drop(store);

        fs::write(
            ShardCatalog::new(&config.dir).shard_path(second),
            vec![b'x'; 4096],
        )
        .unwrap();
        let mut store = ShardedStore::open(config).unwrap();
        inflate(&store, ShardId::PRIMARY);

        // Shard 2 is the smallest file but takes no writes.
        let post = store.new_post(draft(1)).unwrap();
        assert_eq!(post.shard.get(), 3);
        assert!(store.session().is_attached(post.shard));
        store.insert_post(&post).unwrap();
        assert_eq!(store.get_by_id(&post.id).unwrap(), post);
    }

    #[test]
    fn failed_rollover_keeps_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        fs::create_dir(store.catalog().shard_path(ShardId::new(2).unwrap())).unwrap();

        let big = PostDraft::new("big", "y".repeat(2 * BUDGET as usize));
        let post = store.new_post(big).unwrap();
        let report = store.insert_post(&post).unwrap();
        assert_eq!(report.writes, 1);
        assert!(
            matches!(
                report.rollover,
                Err(StoreError::CapacityExpansionFailed { .. })
            ),
            "{:?}",
            report.rollover
        );

        assert_eq!(store.get_by_id(&post.id).unwrap(), post);
        assert_eq!(store.count_all().unwrap(), 1);
        assert_eq!(shard_ids(&store), vec![1]);
        // The store keeps accepting writes on the full shard.
        let next = store.new_post(draft(2)).unwrap();
        assert!(next.shard.is_primary());
        store.insert_post(&next).unwrap();
        assert_eq!(store.count_all().unwrap(), 2);
    }

    #[test]
    fn more_than_ten_attached_shards() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let mut shards = vec![ShardId::PRIMARY];
        for _ in 0..13 {
            shards.push(add_shard(&mut store));
        }
        assert_eq!(shard_ids(&store), (1..=14).collect::<Vec<_>>());
        assert_eq!(store.session().shards().len(), 14);
        assert!(store.degraded().is_empty());
        assert!(store.session().max_shards() > 14);

        let mut txn = store.transaction().unwrap();
        for (i, &shard) in shards.iter().enumerate() {
            txn.insert(&Post::from_draft(PostId::generate(), shard, draft(i)))
                .unwrap();
        }
        txn.commit().unwrap();

        let last = *shards.last().unwrap();
        assert_eq!(last.get(), 14);
        assert_eq!(store.count_shard(last).unwrap(), 1);
        let per_shard: u64 = shards.iter().map(|&s| store.count_shard(s).unwrap()).sum();
        assert_eq!(store.count_all().unwrap(), per_shard);
        assert_eq!(per_shard, 14);

        // A reopened store sees every shard too.
        store.reopen().unwrap();
        assert_eq!(store.count_all().unwrap(), 14);
        assert!(matches!(
            store.evaluate_rollover().unwrap(),
            RolloverOutcome::Stable { .. }
        ));
    }

    #[test]
    fn new_post_prefers_least_loaded_shard() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let second = add_shard(&mut store);
        // Both shards start out the same size; fill the primary a little.
        let mut txn = store.transaction().unwrap();
        txn.insert(&Post::from_draft(
            PostId::generate(),
            ShardId::PRIMARY,
            PostDraft::new("t", "z".repeat(8 * 1024)),
        ))
        .unwrap();
        txn.commit().unwrap();

        assert_eq!(store.new_post(draft(1)).unwrap().shard, second);
    }

    #[test]
    fn pages_cover_everything_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        add_shard(&mut store);
        let posts = insert_posts(&mut store, 5);

        let pages: Vec<_> = store
            .pages(2, None)
            .unwrap()
            .collect::<StoreResult<_>>()
            .unwrap();
        let sizes: Vec<usize> = pages.iter().map(|p| p.posts.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let numbers: Vec<u64> = pages.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let seen: HashSet<PostId> = pages
            .into_iter()
            .flat_map(|p| p.posts)
            .map(|p| p.id)
            .collect();
        let expected: HashSet<PostId> = posts.into_iter().map(|p| p.id).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn pages_respect_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        insert_posts(&mut store, 5);

        let pages = store.pages(10, Some(3)).unwrap();
        assert_eq!(pages.per_page(), 3);
        let sizes: Vec<usize> = pages.map(|p| p.unwrap().posts.len()).collect();
        assert_eq!(sizes, vec![3]);

        let sizes: Vec<usize> = store
            .pages(2, Some(3))
            .unwrap()
            .map(|p| p.unwrap().posts.len())
            .collect();
        assert_eq!(sizes, vec![2, 1]);

        assert_eq!(store.pages(2, Some(0)).unwrap().count(), 0);
        assert!(matches!(
            store.pages(0, None),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_store_has_no_pages() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path());
        assert_eq!(store.all_pages().unwrap().count(), 0);
    }

    #[test]
    fn for_each_streams_matches() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        insert_posts(&mut store, 4);

        let mut titles = Vec::new();
        let seen = store
            .for_each(&PostQuery::new().contains(Column::Path, "/posts/"), |post| {
                titles.push(post.title);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 4);
        assert_eq!(titles.len(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn get_page_is_exhaustive(n in 0usize..24, page_size in 1u64..8, shards in 1u32..4) {
            let dir = tempfile::tempdir().unwrap();
            let mut store = new_store(dir.path());
            let mut targets = vec![ShardId::PRIMARY];
            for _ in 1..shards {
                targets.push(add_shard(&mut store));
            }

            let mut txn = store.transaction().unwrap();
            for i in 0..n {
                let shard = targets[i % targets.len()];
                txn.insert(&Post::from_draft(PostId::generate(), shard, draft(i))).unwrap();
            }
            txn.commit().unwrap();

            let total = store.count_all().unwrap();
            prop_assert_eq!(total, n as u64);

            let mut seen = HashSet::new();
            let mut listed = 0u64;
            for page in 1..=total.div_ceil(page_size) {
                let result = store.get_page(page, page_size).unwrap();
                prop_assert_eq!(result.total, total);
                for post in result.posts {
                    listed += 1;
                    seen.insert(post.id);
                }
            }
            prop_assert_eq!(listed, total);
            prop_assert_eq!(seen.len() as u64, total);

            let paged: u64 = store
                .pages(page_size, None)
                .unwrap()
                .map(|p| p.unwrap().posts.len() as u64)
                .sum();
            prop_assert_eq!(paged, total);
        }
    }
}
