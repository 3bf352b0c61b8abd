//! Union view composition.
//!
//! [`union_sql`] turns a shard list and a projection into one
//! `UNION ALL` select that behaves like a single `posts` table.
//! [`PostQuery`] layers filters, ordering and paging on top and always
//! produces a parameterized statement: filter values are bound, never
//! spliced into the SQL text.

use coeur_types::metadata::SOCIAL_KEY;
use coeur_types::ShardId;
use rusqlite::types::Value;

use crate::error::{StoreError, StoreResult};
use crate::schema::{Column, POSTS_TABLE};

/// Alias under which a shard is attached to a session. Shard 1 is the
/// session's own `main` database.
pub fn schema_alias(shard: ShardId) -> String {
    if shard.is_primary() {
        "main".to_string()
    } else {
        format!("db{shard}")
    }
}

/// Table reference for a shard's posts: unqualified for shard 1,
/// `db<n>.posts` otherwise.
pub fn table_ref(shard: ShardId) -> String {
    if shard.is_primary() {
        POSTS_TABLE.to_string()
    } else {
        format!("db{shard}.{POSTS_TABLE}")
    }
}

fn column_list(projection: &[Column]) -> String {
    projection
        .iter()
        .map(|c| c.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One `SELECT <projection> FROM <table>` per shard, joined with
/// `UNION ALL` (no deduplication). Pure: the same input always yields the
/// same text.
pub fn union_sql(shards: &[ShardId], projection: &[Column]) -> String {
    let columns = column_list(projection);
    shards
        .iter()
        .map(|&shard| format!("SELECT {columns} FROM {}", table_ref(shard)))
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

/// SQL text plus its positional parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    /// Column equals the value.
    Equals(Column, String),
    /// Column contains the substring (ASCII case-insensitive).
    Contains(Column, String),
    /// Column does not contain the substring. NULL counts as empty.
    NotContains(Column, String),
    /// The metadata document holds no `social.<channel>` record. Posts with
    /// missing or malformed metadata match.
    NotPublishedTo(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// A filtered, ordered, paged query over the union of all shards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostQuery {
    filters: Vec<Filter>,
    order: Vec<(Column, Direction)>,
    limit: Option<u64>,
    offset: u64,
}

impl PostQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest first, identifier as tie-break so paging is stable.
    pub fn newest_first() -> Self {
        Self::new()
            .order_by(Column::Date, Direction::Descending)
            .order_by(Column::Identifier, Direction::Ascending)
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn equals(self, column: Column, value: impl Into<String>) -> Self {
        self.filter(Filter::Equals(column, value.into()))
    }

    pub fn contains(self, column: Column, value: impl Into<String>) -> Self {
        self.filter(Filter::Contains(column, value.into()))
    }

    pub fn not_contains(self, column: Column, value: impl Into<String>) -> Self {
        self.filter(Filter::NotContains(column, value.into()))
    }

    /// Posts not yet republished to `channel`.
    pub fn unpublished_to(self, channel: impl Into<String>) -> Self {
        self.filter(Filter::NotPublishedTo(channel.into()))
    }

    pub fn order_by(mut self, column: Column, direction: Direction) -> Self {
        self.order.push((column, direction));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Select every column of matching posts.
    pub fn to_select(&self, shards: &[ShardId]) -> StoreResult<BoundQuery> {
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT * FROM ({}) AS all_posts",
            union_sql(non_empty(shards)?, &Column::ALL)
        );
        self.push_where(&mut sql, &mut params);

        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|(column, direction)| match direction {
                    Direction::Ascending => format!("{} ASC", column.name()),
                    Direction::Descending => format!("{} DESC", column.name()),
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }

        if self.limit.is_some() || self.offset > 0 {
            // SQLite needs a LIMIT before OFFSET; -1 means unbounded.
            let limit = self.limit.map_or(-1, clamp_i64);
            params.push(Value::Integer(limit));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
            params.push(Value::Integer(clamp_i64(self.offset)));
            sql.push_str(&format!(" OFFSET ?{}", params.len()));
        }
        Ok(BoundQuery { sql, params })
    }

    /// Count matching posts. Without filters only the lightweight count
    /// projection is unioned; ordering and paging are ignored.
    pub fn to_count(&self, shards: &[ShardId]) -> StoreResult<BoundQuery> {
        let shards = non_empty(shards)?;
        let projection: Vec<Column> = if self.filters.is_empty() {
            Column::COUNT_PROJECTION.to_vec()
        } else {
            let mut columns = Column::COUNT_PROJECTION.to_vec();
            for filter in &self.filters {
                let column = filter_column(filter);
                if !columns.contains(&column) {
                    columns.push(column);
                }
            }
            columns
        };
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT COUNT(*) FROM ({}) AS all_posts",
            union_sql(shards, &projection)
        );
        self.push_where(&mut sql, &mut params);
        Ok(BoundQuery { sql, params })
    }

    fn push_where(&self, sql: &mut String, params: &mut Vec<Value>) {
        if self.filters.is_empty() {
            return;
        }
        let mut clauses = Vec::with_capacity(self.filters.len());
        for filter in &self.filters {
            let clause = match filter {
                Filter::Equals(column, value) => {
                    params.push(Value::Text(value.clone()));
                    format!("{} = ?{}", column.name(), params.len())
                }
                Filter::Contains(column, value) => {
                    params.push(Value::Text(like_pattern(value)));
                    format!("{} LIKE ?{} ESCAPE '\\'", column.name(), params.len())
                }
                Filter::NotContains(column, value) => {
                    params.push(Value::Text(like_pattern(value)));
                    format!(
                        "IFNULL({}, '') NOT LIKE ?{} ESCAPE '\\'",
                        column.name(),
                        params.len()
                    )
                }
                Filter::NotPublishedTo(channel) => {
                    params.push(Value::Text(channel.clone()));
                    // CASE keeps json_each away from malformed documents.
                    format!(
                        "(CASE WHEN json_valid({metadata}) THEN NOT EXISTS \
                         (SELECT 1 FROM json_each({metadata}, '$.{SOCIAL_KEY}') \
                         WHERE key = ?{} AND type = 'object') ELSE 1 END)",
                        params.len(),
                        metadata = Column::Metadata.name(),
                    )
                }
            };
            clauses.push(clause);
        }
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
}

/// Statements addressed to one shard's table instead of the union.
pub mod single {
    use coeur_types::{Post, PostChanges, PostId, ShardId};
    use rusqlite::types::Value;

    use super::{clamp_i64, column_list, table_ref, BoundQuery};
    use crate::schema::Column;

    /// The post with `id` in `shard`.
    pub fn lookup(shard: ShardId, id: &PostId) -> BoundQuery {
        BoundQuery {
            sql: format!(
                "SELECT * FROM {} WHERE identifier = ?1 LIMIT 1",
                table_ref(shard)
            ),
            params: vec![Value::Text(id.as_str().to_string())],
        }
    }

    /// One page of a shard, newest first.
    pub fn page(shard: ShardId, limit: u64, offset: u64) -> BoundQuery {
        BoundQuery {
            sql: format!(
                "SELECT * FROM {} ORDER BY date DESC, identifier ASC LIMIT ?1 OFFSET ?2",
                table_ref(shard)
            ),
            params: vec![
                Value::Integer(clamp_i64(limit)),
                Value::Integer(clamp_i64(offset)),
            ],
        }
    }

    pub fn count(shard: ShardId) -> BoundQuery {
        BoundQuery {
            sql: format!("SELECT COUNT(*) FROM {}", table_ref(shard)),
            params: Vec::new(),
        }
    }

    /// Insert `post` into its own shard.
    pub fn insert(post: &Post) -> BoundQuery {
        let placeholders = (1..=Column::ALL.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        BoundQuery {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({placeholders})",
                table_ref(post.shard),
                column_list(&Column::ALL)
            ),
            params: vec![
                Value::Text(post.id.as_str().to_string()),
                Value::Text(post.title.clone()),
                Value::Text(post.content.clone()),
                Value::Text(post.content_format.as_str().to_string()),
                Value::Text(post.path.clone()),
                Value::Text(post.metadata.clone()),
                Value::Text(post.date.clone()),
                post.image.clone().map_or(Value::Null, Value::Text),
                Value::Integer(i64::from(post.shard)),
            ],
        }
    }

    /// Targeted update of the fields set in `changes`. `None` when there is
    /// nothing to change.
    pub fn update(shard: ShardId, id: &PostId, changes: &PostChanges) -> Option<BoundQuery> {
        let text = |value: &Option<String>| value.clone().map(Value::Text);
        let assignments = [
            (Column::Title, text(&changes.title)),
            (Column::Content, text(&changes.content)),
            (
                Column::ContentFormat,
                changes
                    .content_format
                    .map(|f| Value::Text(f.as_str().to_string())),
            ),
            (Column::Path, text(&changes.path)),
            (Column::Metadata, text(&changes.metadata)),
            (Column::Date, text(&changes.date)),
            (
                Column::Image,
                changes
                    .image
                    .clone()
                    .map(|image| image.map_or(Value::Null, Value::Text)),
            ),
        ];

        let mut params = Vec::new();
        let mut set = Vec::new();
        for (column, value) in assignments {
            if let Some(value) = value {
                params.push(value);
                set.push(format!("{} = ?{}", column.name(), params.len()));
            }
        }
        if set.is_empty() {
            return None;
        }
        params.push(Value::Text(id.as_str().to_string()));
        Some(BoundQuery {
            sql: format!(
                "UPDATE {} SET {} WHERE identifier = ?{}",
                table_ref(shard),
                set.join(", "),
                params.len()
            ),
            params,
        })
    }
}

fn filter_column(filter: &Filter) -> Column {
    match filter {
        Filter::Equals(column, _) | Filter::Contains(column, _) | Filter::NotContains(column, _) => {
            *column
        }
        Filter::NotPublishedTo(_) => Column::Metadata,
    }
}


fn non_empty(shards: &[ShardId]) -> StoreResult<&[ShardId]> {
    if shards.is_empty() {
        return Err(StoreError::InvalidArgument(
            "a union query needs at least one shard".into(),
        ));
    }
    Ok(shards)
}

fn clamp_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// `%value%` with LIKE wildcards and the escape character escaped.
pub fn like_pattern(value: &str) -> String {
    let mut pattern = String::with_capacity(value.len() + 2);
    pattern.push('%');
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}
