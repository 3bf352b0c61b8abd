use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TypeError;

/// Key under which per-channel publication records are kept.
pub const SOCIAL_KEY: &str = "social";

/// Result of republishing a post to an external channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    /// URL of the published item on the channel.
    pub url: String,
    /// When the item was published (RFC 3339).
    pub date: String,
}

impl PublishRecord {
    /// A record stamped with the current UTC time.
    pub fn now(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// The free-form metadata document attached to a post.
///
/// Stored as a JSON object. An empty stored string is read as an empty
/// document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    fields: Map<String, Value>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a stored metadata string.
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(fields)) => Ok(Self { fields }),
            Ok(Value::Null) => Ok(Self::default()),
            Ok(other) => Err(TypeError::Metadata(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ))),
            Err(e) => Err(TypeError::Metadata(e.to_string())),
        }
    }

    /// Serialize back to the stored string form.
    pub fn to_json_string(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The publication record for `channel`, if the post was published there.
    pub fn published_to(&self, channel: &str) -> Option<PublishRecord> {
        let record = self.fields.get(SOCIAL_KEY)?.get(channel)?;
        serde_json::from_value(record.clone()).ok()
    }

    /// Record a publication under `social.<channel>`, replacing any earlier
    /// record for the same channel.
    pub fn record_publication(
        &mut self,
        channel: &str,
        record: &PublishRecord,
    ) -> Result<(), TypeError> {
        let value =
            serde_json::to_value(record).map_err(|e| TypeError::Metadata(e.to_string()))?;
        let social = self
            .fields
            .entry(SOCIAL_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        match social {
            Value::Object(channels) => {
                channels.insert(channel.to_string(), value);
                Ok(())
            }
            other => Err(TypeError::Metadata(format!(
                "`{SOCIAL_KEY}` must be an object, found {}",
                json_kind(other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
