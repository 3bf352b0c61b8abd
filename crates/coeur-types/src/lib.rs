//! Foundation types for the Coeur content pipeline.
//!
//! This crate provides the record and identity types shared by the sharded
//! content store and every collaborator that reads or writes posts
//! (ingestion, rendering, publishing, administration).
//!
//! # Key Types
//!
//! - [`PostId`] -- Globally unique post identifier (UUID v7 text)
//! - [`ShardId`] -- 1-based number of the shard that owns a post
//! - [`ContentFormat`] -- Markup format of a post body
//! - [`Post`] -- A persisted (or about to be persisted) content record
//! - [`PostDraft`] -- Caller-supplied fields for a new post
//! - [`PostChanges`] -- Partial field update for an existing post
//! - [`Metadata`] -- The free-form metadata document attached to a post

pub mod error;
pub mod metadata;
pub mod post;
pub mod shard;

pub use error::TypeError;
pub use metadata::{Metadata, PublishRecord};
pub use post::{ContentFormat, Post, PostChanges, PostDraft, PostId};
pub use shard::ShardId;
