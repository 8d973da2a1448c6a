//! Core data types flowing through the ingestion and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category label used when a channel has no category assigned.
pub const NO_CATEGORY: &str = "No Category";

/// One inbound chat message, as delivered by the ingestion boundary.
///
/// Never persisted directly — consumed entirely by the buffer layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub tenant_id: i64,
    pub channel_id: String,
    pub author: String,
    pub author_id: i64,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RawMessage {
    /// Buffer identity for this message.
    pub fn buffer_key(&self) -> BufferKey {
        BufferKey {
            tenant_id: self.tenant_id,
            channel_id: self.channel_id.clone(),
        }
    }

    /// Category label, falling back to the [`NO_CATEGORY`] sentinel.
    pub fn category_label(&self) -> &str {
        self.category.as_deref().unwrap_or(NO_CATEGORY)
    }
}

/// Identity of one message buffer: `(tenant, channel)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub tenant_id: i64,
    pub channel_id: String,
}

/// A merged, embedded chunk before persistence.
///
/// The storage layer assigns the id on insert; see [`ConversationChunk`]
/// for the persisted form.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub tenant_id: i64,
    pub channel_id: String,
    pub category: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub started_at: DateTime<Utc>,
    pub message_count: i64,
}

/// The unit of retrieval: a persisted conversation chunk.
///
/// Immutable once created. `text` is the merged transcript (one line per
/// source message, arrival order); `started_at` is the earliest message
/// timestamp in the source buffer.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationChunk {
    pub id: String,
    pub tenant_id: i64,
    pub channel_id: String,
    pub category: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub started_at: DateTime<Utc>,
    pub message_count: i64,
}

impl ConversationChunk {
    pub fn from_new(id: String, new: NewChunk) -> Self {
        Self {
            id,
            tenant_id: new.tenant_id,
            channel_id: new.channel_id,
            category: new.category,
            text: new.text,
            embedding: new.embedding,
            started_at: new.started_at,
            message_count: new.message_count,
        }
    }
}

/// A chunk as read back from storage for index construction and listing.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub started_at: i64,
}
