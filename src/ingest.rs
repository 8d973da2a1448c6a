//! Ingestion entry point.
//!
//! One call per inbound message: duplicate suppression, buffering, and,
//! when a buffer fills, the merge/embed/persist flush. Ingestion failures
//! are logged and the flushed batch is requeued; already-buffered messages
//! are never silently dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::buffer::MessageBuffers;
use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::merge::merge;
use crate::models::{ConversationChunk, RawMessage};
use crate::store::ChunkStore;

/// Seconds within which an identical message from the same author is
/// treated as spam and dropped.
const DUPLICATE_WINDOW_SECS: i64 = 10;

/// What happened to one ingested message.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Appended to its buffer; no flush yet.
    Buffered,
    /// The append filled the buffer and the batch was merged and persisted.
    Flushed(ConversationChunk),
    /// Dropped before buffering; a no-op, not an error.
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Trimmed content was empty.
    EmptyContent,
    /// Identical content from the same author within the spam window.
    Duplicate,
}

/// Long-lived ingestion state: the buffer map plus the per-author
/// duplicate guard. Owned by the ingestion surface (CLI or server) and
/// injected into [`ingest`]; never ambient.
pub struct IngestState {
    buffers: MessageBuffers,
    last_messages: Mutex<HashMap<(i64, i64), (String, DateTime<Utc>)>>,
}

impl IngestState {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buffers: MessageBuffers::new(chunk_size),
            last_messages: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffers(&self) -> &MessageBuffers {
        &self.buffers
    }

    /// True when this message repeats the author's previous content inside
    /// the spam window. Updates the per-author record either way.
    fn is_duplicate(&self, message: &RawMessage) -> bool {
        let key = (message.tenant_id, message.author_id);
        let mut last = self.last_messages.lock().expect("dedup lock poisoned");

        let duplicate = last.get(&key).is_some_and(|(content, seen_at)| {
            *content == message.content
                && (message.timestamp - *seen_at).num_seconds() < DUPLICATE_WINDOW_SECS
        });

        if !duplicate {
            last.insert(key, (message.content.clone(), message.timestamp));
        }

        duplicate
    }
}

/// Ingest one message.
///
/// Whitespace-only content and spam-window duplicates are skipped without
/// touching the buffers. When the append fills the buffer, the batch is
/// merged, embedded, and persisted; if that fails the batch is requeued at
/// the front of its buffer and the error propagates, so the messages are
/// retried on the next flush rather than lost. The chunk was not persisted,
/// so the retry embeds the batch exactly once more and no duplicate chunk
/// is ever stored.
pub async fn ingest(
    state: &IngestState,
    store: &dyn ChunkStore,
    embedder: &dyn Embedder,
    message: RawMessage,
) -> Result<IngestOutcome, EngineError> {
    if message.content.trim().is_empty() {
        return Ok(IngestOutcome::Skipped(SkipReason::EmptyContent));
    }

    if state.is_duplicate(&message) {
        return Ok(IngestOutcome::Skipped(SkipReason::Duplicate));
    }

    let key = message.buffer_key();
    let Some(batch) = state.buffers.append(message) else {
        return Ok(IngestOutcome::Buffered);
    };

    let category = batch[0].category_label().to_string();
    match merge(store, embedder, &key, &batch, &category).await {
        Ok(chunk) => Ok(IngestOutcome::Flushed(chunk)),
        Err(err) => {
            warn!(
                tenant_id = key.tenant_id,
                channel_id = %key.channel_id,
                batch_len = batch.len(),
                error = %err,
                "merge failed, requeueing batch"
            );
            state.buffers.requeue(key, batch);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::FixedEmbedder;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EngineError> {
            Err(EngineError::embedding("upstream down", true))
        }

        fn dims(&self) -> usize {
            8
        }
    }

    fn message_at(author_id: i64, content: &str, ts: i64) -> RawMessage {
        RawMessage {
            tenant_id: 5,
            channel_id: "general".to_string(),
            author: "ada".to_string(),
            author_id,
            content: content.to_string(),
            category: Some("Chatter".to_string()),
            timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn empty_content_is_a_noop() {
        let state = IngestState::new(2);
        let store = MemoryStore::new();
        let embedder = FixedEmbedder::new(8);

        let outcome = ingest(&state, &store, &embedder, message_at(1, "  \n ", 0))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Skipped(SkipReason::EmptyContent)
        ));
    }

    #[tokio::test]
    async fn duplicate_within_window_is_dropped() {
        let state = IngestState::new(10);
        let store = MemoryStore::new();
        let embedder = FixedEmbedder::new(8);

        ingest(&state, &store, &embedder, message_at(1, "spam", 100))
            .await
            .unwrap();
        let outcome = ingest(&state, &store, &embedder, message_at(1, "spam", 105))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Skipped(SkipReason::Duplicate)
        ));

        // Same content after the window is fine.
        let outcome = ingest(&state, &store, &embedder, message_at(1, "spam", 115))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Buffered));
    }

    #[tokio::test]
    async fn duplicate_from_other_author_is_kept() {
        let state = IngestState::new(10);
        let store = MemoryStore::new();
        let embedder = FixedEmbedder::new(8);

        ingest(&state, &store, &embedder, message_at(1, "same words", 100))
            .await
            .unwrap();
        let outcome = ingest(&state, &store, &embedder, message_at(2, "same words", 101))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Buffered));
    }

    #[tokio::test]
    async fn threshold_flush_persists_a_chunk() {
        let state = IngestState::new(3);
        let store = MemoryStore::new();
        let embedder = FixedEmbedder::new(8);

        for i in 0..2 {
            let outcome = ingest(
                &state,
                &store,
                &embedder,
                message_at(1, &format!("msg {}", i), i),
            )
            .await
            .unwrap();
            assert!(matches!(outcome, IngestOutcome::Buffered));
        }

        let outcome = ingest(&state, &store, &embedder, message_at(1, "msg 2", 2))
            .await
            .unwrap();
        let IngestOutcome::Flushed(chunk) = outcome else {
            panic!("expected flush on third message");
        };
        assert_eq!(chunk.message_count, 3);
        assert_eq!(chunk.category, "Chatter");
        assert_eq!(store.count(5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_flush_requeues_the_batch() {
        let state = IngestState::new(2);
        let store = MemoryStore::new();

        ingest(&state, &store, &FixedEmbedder::new(8), message_at(1, "one", 0))
            .await
            .unwrap();
        let err = ingest(&state, &store, &BrokenEmbedder, message_at(1, "two", 1))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // Nothing persisted, nothing lost: both messages are back in the
        // buffer awaiting the next flush.
        assert_eq!(store.count(5).await.unwrap(), 0);
        let key = message_at(1, "x", 0).buffer_key();
        assert_eq!(state.buffers().len(&key), 2);

        // The next arrival retries the whole batch successfully.
        let outcome = ingest(
            &state,
            &store,
            &FixedEmbedder::new(8),
            message_at(1, "three", 20),
        )
        .await
        .unwrap();
        let IngestOutcome::Flushed(chunk) = outcome else {
            panic!("expected retry flush");
        };
        assert_eq!(chunk.message_count, 3);
        assert!(chunk.text.lines().next().unwrap().contains("one"));
        assert_eq!(store.count(5).await.unwrap(), 1);
    }
}
