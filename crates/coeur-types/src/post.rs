use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::shard::ShardId;

/// Globally unique identifier of a post.
///
/// New identifiers are UUID v7 strings, so they sort by creation time.
/// Identifiers read back from a store are treated as opaque text: rows
/// written by older tooling may carry other UUID versions.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PostId(String);

impl PostId {
    /// Generate a new time-ordered identifier (UUID v7).
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Wrap an existing identifier. Empty identifiers are rejected.
    pub fn parse(s: impl Into<String>) -> Result<Self, TypeError> {
        let s = s.into();
        if s.trim().is_empty() {
            return Err(TypeError::EmptyPostId);
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short representation (first 8 characters).
    pub fn short_id(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl TryFrom<String> for PostId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PostId> for String {
    fn from(id: PostId) -> Self {
        id.0
    }
}

impl fmt::Debug for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PostId({})", self.short_id())
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Markup format of a post body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    /// Lightweight markup, rendered to HTML at build time.
    #[default]
    #[serde(rename = "md")]
    Markdown,
    /// Raw markup, copied into the page as-is.
    Html,
}

impl ContentFormat {
    /// The tag stored in the `content_format` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Html => "html",
        }
    }
}

impl FromStr for ContentFormat {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md" => Ok(Self::Markdown),
            "html" => Ok(Self::Html),
            other => Err(TypeError::UnknownContentFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content record owned by exactly one shard.
///
/// `metadata` holds the serialized metadata document verbatim; use
/// [`Post::metadata_document`] to inspect it. `date` is an ISO-8601 date
/// (or date-time) string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub title: String,
    pub content: String,
    pub content_format: ContentFormat,
    pub path: String,
    pub metadata: String,
    pub date: String,
    pub image: Option<String>,
    /// Shard chosen when the post was created. Never changes afterwards.
    pub shard: ShardId,
}

impl Post {
    /// Bind a draft to an identifier and an owning shard.
    pub fn from_draft(id: PostId, shard: ShardId, draft: PostDraft) -> Self {
        Self {
            id,
            title: draft.title,
            content: draft.content,
            content_format: draft.content_format,
            path: draft.path,
            metadata: draft.metadata,
            date: draft.date,
            image: draft.image,
            shard,
        }
    }

    /// Parse the metadata document.
    pub fn metadata_document(&self) -> Result<crate::Metadata, TypeError> {
        crate::Metadata::parse(&self.metadata)
    }

    /// Public URL of the rendered post: `<base_url><path>/`.
    pub fn permalink(&self, base_url: &str) -> String {
        let base = base_url.strip_suffix('/').unwrap_or(base_url);
        let path = self.path.strip_suffix('/').unwrap_or(&self.path);
        format!("{base}{path}/")
    }

    /// Apply a partial update in memory.
    pub fn apply(&mut self, changes: &PostChanges) {
        if let Some(title) = &changes.title {
            self.title.clone_from(title);
        }
        if let Some(content) = &changes.content {
            self.content.clone_from(content);
        }
        if let Some(format) = changes.content_format {
            self.content_format = format;
        }
        if let Some(path) = &changes.path {
            self.path.clone_from(path);
        }
        if let Some(metadata) = &changes.metadata {
            self.metadata.clone_from(metadata);
        }
        if let Some(date) = &changes.date {
            self.date.clone_from(date);
        }
        if let Some(image) = &changes.image {
            self.image.clone_from(image);
        }
    }
}

/// Caller-supplied fields of a new post, before an identifier and a shard
/// have been assigned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDraft {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub content_format: ContentFormat,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub image: Option<String>,
}

impl PostDraft {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn format(mut self, format: ContentFormat) -> Self {
        self.content_format = format;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn date(mut self, date: impl Into<String>) -> Self {
        self.date = date.into();
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// A partial update of an existing post. `None` leaves a field untouched;
/// `image: Some(None)` clears the image.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_format: Option<ContentFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Option<String>>,
}
