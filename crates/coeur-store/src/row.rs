use coeur_types::{ContentFormat, Post, PostId, ShardId};
use rusqlite::{Row, Statement};

use crate::error::{StoreError, StoreResult};
use crate::schema::{Column, COLUMN_COUNT};

/// Position of every post column in a statement's result set.
///
/// Union queries are assembled at runtime, so positions are read from the
/// statement's declared result columns instead of being assumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowLayout {
    positions: [usize; COLUMN_COUNT],
}

impl RowLayout {
    pub fn from_statement(stmt: &Statement<'_>) -> StoreResult<Self> {
        Self::from_names(&stmt.column_names())
    }

    pub fn from_names(names: &[&str]) -> StoreResult<Self> {
        let mut positions = [0usize; COLUMN_COUNT];
        for (slot, column) in positions.iter_mut().zip(Column::ALL) {
            *slot = names
                .iter()
                .position(|name| *name == column.name())
                .ok_or_else(|| {
                    StoreError::Serialization(format!(
                        "result set has no `{}` column",
                        column.name()
                    ))
                })?;
        }
        Ok(Self { positions })
    }

    fn position(&self, column: Column) -> usize {
        // Column::ALL is in declaration order.
        self.positions[column as usize]
    }

    /// Rebuild a post from one result row.
    pub fn post(&self, row: &Row<'_>) -> StoreResult<Post> {
        let id: String = row.get(self.position(Column::Identifier))?;
        let format: Option<String> = row.get(self.position(Column::ContentFormat))?;
        let shard: i64 = row.get(self.position(Column::ShardNumber))?;

        Ok(Post {
            id: PostId::parse(id)?,
            title: row.get(self.position(Column::Title))?,
            content: row.get(self.position(Column::Content))?,
            content_format: match format.as_deref() {
                None | Some("") => ContentFormat::default(),
                Some(tag) => tag.parse()?,
            },
            path: self.text_or_empty(row, Column::Path)?,
            metadata: self.text_or_empty(row, Column::Metadata)?,
            date: self.text_or_empty(row, Column::Date)?,
            image: row.get(self.position(Column::Image))?,
            shard: ShardId::try_from(shard)?,
        })
    }

    fn text_or_empty(&self, row: &Row<'_>, column: Column) -> StoreResult<String> {
        let value: Option<String> = row.get(self.position(column))?;
        Ok(value.unwrap_or_default())
    }
}
