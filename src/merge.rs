//! Buffer-to-chunk merging.
//!
//! Flattens a flushed message batch into one canonical transcript, embeds
//! it with a single Embedder call, and persists the result. One chunk of
//! ten messages costs one embedding call, not ten; retrieval granularity
//! is traded for a tenfold reduction in embedding volume.

use chrono::Utc;
use tracing::info;

use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::models::{BufferKey, ConversationChunk, NewChunk, RawMessage};
use crate::store::ChunkStore;

/// Render one message as a transcript line.
///
/// The line format is part of the persisted data contract: retrieval
/// returns these transcripts verbatim as answer context.
fn render_line(message: &RawMessage) -> String {
    format!(
        "{} (id:{}) at {} said: {}",
        message.author,
        message.author_id,
        message.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        message.content
    )
}

/// Flatten a message batch into the canonical transcript: one line per
/// message, arrival order.
pub fn render_transcript(messages: &[RawMessage]) -> String {
    messages
        .iter()
        .map(render_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merge a flushed batch into a persisted [`ConversationChunk`].
///
/// Calls the embedder exactly once with the full transcript. On embedder
/// failure nothing is persisted and the merge is safe to retry with the
/// same batch; the caller decides whether to requeue or discard.
pub async fn merge(
    store: &dyn ChunkStore,
    embedder: &dyn Embedder,
    key: &BufferKey,
    messages: &[RawMessage],
    category: &str,
) -> Result<ConversationChunk, EngineError> {
    let text = render_transcript(messages);
    let embedding = embedder.embed(&text).await?;

    // The threshold check means this list is never empty; fall back to the
    // current time rather than failing if that assumption ever breaks.
    let started_at = messages
        .iter()
        .map(|m| m.timestamp)
        .min()
        .unwrap_or_else(Utc::now);

    let new_chunk = NewChunk {
        tenant_id: key.tenant_id,
        channel_id: key.channel_id.clone(),
        category: category.to_string(),
        text,
        embedding,
        started_at,
        message_count: messages.len() as i64,
    };

    let id = store.insert(&new_chunk).await?;
    info!(
        tenant_id = key.tenant_id,
        channel_id = %key.channel_id,
        chunk_id = %id,
        message_count = new_chunk.message_count,
        "persisted conversation chunk"
    );

    Ok(ConversationChunk::from_new(id, new_chunk))
}
