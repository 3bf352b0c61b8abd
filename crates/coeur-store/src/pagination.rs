//! Lazy paging over the union view.

use coeur_types::{Post, ShardId};

use crate::error::{StoreError, StoreResult};
use crate::query::PostQuery;
use crate::session::Session;

/// One page of posts. Page numbers start at 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub number: u64,
    pub posts: Vec<Post>,
}

/// Forward-only sequence of pages over a query.
///
/// The total is counted once, on the first call to `next`. Each page is a
/// separate `LIMIT`/`OFFSET` query, so at most one page of posts is held at
/// a time. The shard set is fixed when the iterator is built.
///
/// Iteration ends when the counted total (or the optional cap) has been
/// fetched, when a page comes back empty, or after the first error.
pub struct Pages<'s> {
    session: &'s Session,
    shards: Vec<ShardId>,
    query: PostQuery,
    per_page: u64,
    max_total: Option<u64>,
    total: Option<u64>,
    offset: u64,
    fetched: u64,
    page: u64,
    done: bool,
}

impl<'s> Pages<'s> {
    /// `per_page` must be positive. When `max_total` is smaller than
    /// `per_page`, pages are shrunk to `max_total`.
    pub fn new(
        session: &'s Session,
        query: PostQuery,
        per_page: u64,
        max_total: Option<u64>,
    ) -> StoreResult<Self> {
        if per_page == 0 {
            return Err(StoreError::InvalidArgument(
                "page size must be at least 1".into(),
            ));
        }
        let per_page = match max_total {
            Some(cap) if cap > 0 => per_page.min(cap),
            _ => per_page,
        };
        Ok(Self {
            session,
            shards: session.shards().to_vec(),
            query,
            per_page,
            max_total,
            total: None,
            offset: 0,
            fetched: 0,
            page: 0,
            done: false,
        })
    }

    pub fn per_page(&self) -> u64 {
        self.per_page
    }

    /// Posts the iterator will yield in total, once known.
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    fn fetch_next(&mut self) -> StoreResult<Option<Page>> {
        let total = match self.total {
            Some(total) => total,
            None => {
                let total = self.session.count(&self.query.to_count(&self.shards)?)?;
                let total = self.max_total.map_or(total, |cap| cap.min(total));
                self.total = Some(total);
                total
            }
        };
        if self.fetched >= total {
            return Ok(None);
        }

        let limit = self.per_page.min(total - self.fetched);
        let bound = self
            .query
            .clone()
            .limit(limit)
            .offset(self.offset)
            .to_select(&self.shards)?;
        let posts = self.session.fetch(&bound)?;
        if posts.is_empty() {
            return Ok(None);
        }

        let len = posts.len() as u64;
        self.offset += len;
        self.fetched += len;
        self.page += 1;
        tracing::debug!(page = self.page, posts = len, fetched = self.fetched, total, "fetched page");
        Ok(Some(Page {
            number: self.page,
            posts,
        }))
    }
}

impl Iterator for Pages<'_> {
    type Item = StoreResult<Page>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fetch_next() {
            Ok(Some(page)) => Some(Ok(page)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl std::fmt::Debug for Pages<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pages")
            .field("shards", &self.shards)
            .field("per_page", &self.per_page)
            .field("max_total", &self.max_total)
            .field("fetched", &self.fetched)
            .field("page", &self.page)
            .finish_non_exhaustive()
    }
}
