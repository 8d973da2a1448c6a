//! Per-(tenant, channel) message buffering.
//!
//! [`MessageBuffers`] owns every in-flight buffer and is the only long-lived
//! mutable state in the engine. All access goes through [`append`] and
//! [`requeue`]; the map lock is held across the full-check and drain so a
//! flush is atomic with respect to concurrent appends: no message can land
//! between "buffer observed as full" and "buffer cleared", and none is lost
//! or double-counted across the flush boundary.
//!
//! [`append`]: MessageBuffers::append
//! [`requeue`]: MessageBuffers::requeue

use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::{BufferKey, RawMessage};

/// Owned, injected buffer state; construct one per ingestion service (or
/// per test) rather than sharing ambient globals.
pub struct MessageBuffers {
    chunk_size: usize,
    buffers: Mutex<HashMap<BufferKey, Vec<RawMessage>>>,
}

impl MessageBuffers {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Append a message to its buffer, creating the buffer if absent.
    ///
    /// Returns the completed batch once the buffer reaches the chunk size,
    /// clearing the buffer in the same critical section; otherwise `None`.
    /// A message whose trimmed content is empty never reaches the buffer
    /// and never counts toward the threshold.
    pub fn append(&self, message: RawMessage) -> Option<Vec<RawMessage>> {
        if message.content.trim().is_empty() {
            return None;
        }

        let key = message.buffer_key();
        let mut buffers = self.buffers.lock().expect("buffer lock poisoned");
        let buffer = buffers.entry(key).or_default();
        buffer.push(message);

        if buffer.len() >= self.chunk_size {
            Some(std::mem::take(buffer))
        } else {
            None
        }
    }

    /// Splice a drained batch back at the front of its buffer, ahead of any
    /// messages that arrived while the batch was out for merging. Used when
    /// a merge fails before persistence so the messages are retried rather
    /// than lost.
    pub fn requeue(&self, key: BufferKey, mut batch: Vec<RawMessage>) {
        let mut buffers = self.buffers.lock().expect("buffer lock poisoned");
        let buffer = buffers.entry(key).or_default();
        batch.append(buffer);
        *buffer = batch;
    }

    /// Number of messages currently buffered for `key`.
    pub fn len(&self, key: &BufferKey) -> usize {
        let buffers = self.buffers.lock().expect("buffer lock poisoned");
        buffers.get(key).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self, key: &BufferKey) -> bool {
        self.len(key) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(channel: &str, content: &str) -> RawMessage {
        RawMessage {
            tenant_id: 1,
            channel_id: channel.to_string(),
            author: "ada".to_string(),
            author_id: 7,
            content: content.to_string(),
            category: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn under_threshold_accumulates_in_order() {
        let buffers = MessageBuffers::new(10);
        for content in ["hi", "bye", "hi"] {
            assert!(buffers.append(message("general", content)).is_none());
        }
        let key = message("general", "x").buffer_key();
        assert_eq!(buffers.len(&key), 3);
    }

    #[test]
    fn threshold_append_flushes_everything_in_order() {
        let buffers = MessageBuffers::new(10);
        let contents: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();

        let mut flush = None;
        for content in &contents {
            let result = buffers.append(message("general", content));
            if result.is_some() {
                assert!(flush.is_none(), "flushed more than once");
                flush = result;
            }
        }

        let batch = flush.expect("tenth message should flush");
        assert_eq!(batch.len(), 10);
        let order: Vec<&str> = batch.iter().map(|m| m.content.as_str()).collect();
        let expected: Vec<&str> = contents.iter().map(String::as_str).collect();
        assert_eq!(order, expected);

        let key = message("general", "x").buffer_key();
        assert!(buffers.is_empty(&key));
    }

    #[test]
    fn whitespace_only_never_counts() {
        let buffers = MessageBuffers::new(3);
        assert!(buffers.append(message("general", "   ")).is_none());
        assert!(buffers.append(message("general", "\n\t")).is_none());
        assert!(buffers.append(message("general", "real")).is_none());
        let key = message("general", "x").buffer_key();
        assert_eq!(buffers.len(&key), 1);
    }

    #[test]
    fn channels_buffer_independently() {
        let buffers = MessageBuffers::new(2);
        assert!(buffers.append(message("a", "one")).is_none());
        assert!(buffers.append(message("b", "one")).is_none());
        // Second message in channel a flushes a only.
        let flushed = buffers.append(message("a", "two")).unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(buffers.len(&message("b", "x").buffer_key()), 1);
    }

    #[test]
    fn requeue_restores_order_ahead_of_new_arrivals() {
        let buffers = MessageBuffers::new(10);
        let batch: Vec<RawMessage> = (0..3).map(|i| message("general", &format!("old{}", i))).collect();
        let key = batch[0].buffer_key();

        buffers.append(message("general", "new0"));
        buffers.requeue(key.clone(), batch);

        assert_eq!(buffers.len(&key), 4);
        // Drain by filling to the threshold and inspect order.
        let mut flush = None;
        for i in 0..6 {
            flush = buffers.append(message("general", &format!("new{}", i + 1)));
        }
        let batch = flush.expect("should flush at threshold");
        assert_eq!(batch[0].content, "old0");
        assert_eq!(batch[1].content, "old1");
        assert_eq!(batch[2].content, "old2");
        assert_eq!(batch[3].content, "new0");
    }

    #[test]
    fn three_then_seven_scenario() {
        let buffers = MessageBuffers::new(10);
        let key = message("c", "x").buffer_key();

        for content in ["hi", "bye", "hi"] {
            assert!(buffers.append(message("c", content)).is_none());
        }
        assert_eq!(buffers.len(&key), 3);

        let mut flush = None;
        for i in 0..7 {
            flush = buffers.append(message("c", &format!("more{}", i)));
        }
        let batch = flush.expect("tenth message flushes");
        assert_eq!(batch.len(), 10);
        assert_eq!(batch[0].content, "hi");
        assert_eq!(batch[1].content, "bye");
        assert_eq!(batch[2].content, "hi");
        assert!(buffers.is_empty(&key));
    }
}
