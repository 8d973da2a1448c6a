//! Storage boundary for persisted chunks.
//!
//! The [`ChunkStore`] trait is the document-store contract the engine
//! relies on: insert, fetch-all, fetch-recent (timestamp descending), and
//! delete-by-ids, all tenant-scoped. No transactional guarantees are
//! assumed across calls.
//!
//! Two implementations: [`SqliteStore`] for deployments and
//! [`MemoryStore`] for tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{NewChunk, StoredChunk};

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Returns `None` when the blob
/// is empty or not a whole number of f32s — the row is quarantined by the
/// caller rather than crashing index construction.
pub fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Tenant-scoped document store for conversation chunks.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Persist a chunk. Returns the assigned tenant-scoped unique id.
    async fn insert(&self, chunk: &NewChunk) -> Result<String, EngineError>;

    /// Every persisted chunk for the tenant, in storage order.
    async fn fetch_all(&self, tenant_id: i64) -> Result<Vec<StoredChunk>, EngineError>;

    /// The most recent chunks for the tenant, newest first.
    async fn fetch_recent(&self, tenant_id: i64, limit: i64)
        -> Result<Vec<StoredChunk>, EngineError>;

    /// Delete the given chunk ids for the tenant. Returns the count
    /// actually deleted.
    async fn delete_by_ids(&self, tenant_id: i64, ids: &[String]) -> Result<u64, EngineError>;

    /// Number of persisted chunks for the tenant.
    async fn count(&self, tenant_id: i64) -> Result<i64, EngineError>;
}

// ============ SQLite ============

/// SQLite-backed store (sqlx pool, WAL mode — see [`crate::db`]).
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Option<StoredChunk> {
        let id: String = row.get("id");
        let blob: Vec<u8> = row.get("embedding");
        let Some(vector) = decode_vector(&blob) else {
            warn!(chunk_id = %id, "quarantined chunk with undecodable embedding");
            return None;
        };
        Some(StoredChunk {
            id,
            vector,
            text: row.get("text"),
            started_at: row.get("started_at"),
        })
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn insert(&self, chunk: &NewChunk) -> Result<String, EngineError> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO chunks (id, tenant_id, channel_id, category, text, embedding, dims, started_at, message_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(chunk.tenant_id)
        .bind(&chunk.channel_id)
        .bind(&chunk.category)
        .bind(&chunk.text)
        .bind(encode_vector(&chunk.embedding))
        .bind(chunk.embedding.len() as i64)
        .bind(chunk.started_at.timestamp())
        .bind(chunk.message_count)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn fetch_all(&self, tenant_id: i64) -> Result<Vec<StoredChunk>, EngineError> {
        let rows =
            sqlx::query("SELECT id, embedding, text, started_at FROM chunks WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.iter().filter_map(Self::row_to_chunk).collect())
    }

    async fn fetch_recent(
        &self,
        tenant_id: i64,
        limit: i64,
    ) -> Result<Vec<StoredChunk>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT id, embedding, text, started_at FROM chunks
            WHERE tenant_id = ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(Self::row_to_chunk).collect())
    }

    async fn delete_by_ids(&self, tenant_id: i64, ids: &[String]) -> Result<u64, EngineError> {
        let mut deleted = 0u64;
        for id in ids {
            let result = sqlx::query("DELETE FROM chunks WHERE tenant_id = ? AND id = ?")
                .bind(tenant_id)
                .bind(id)
                .execute(&self.pool)
                .await?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    async fn count(&self, tenant_id: i64) -> Result<i64, EngineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// ============ In-memory ============

struct MemoryChunk {
    id: String,
    tenant_id: i64,
    vector: Vec<f32>,
    text: String,
    started_at: i64,
}

/// In-memory store for unit tests; no persistence.
#[derive(Default)]
pub struct MemoryStore {
    chunks: RwLock<Vec<MemoryChunk>>,
    next_id: RwLock<HashMap<i64, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pre-built stored chunk directly, bypassing the merge path.
    /// Lets tests stage fixtures with hand-picked vectors.
    pub fn insert_raw(&self, tenant_id: i64, chunk: StoredChunk) {
        self.chunks.write().unwrap().push(MemoryChunk {
            id: chunk.id,
            tenant_id,
            vector: chunk.vector,
            text: chunk.text,
            started_at: chunk.started_at,
        });
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn insert(&self, chunk: &NewChunk) -> Result<String, EngineError> {
        let mut ids = self.next_id.write().unwrap();
        let counter = ids.entry(chunk.tenant_id).or_insert(0);
        let id = format!("chunk-{}-{}", chunk.tenant_id, counter);
        *counter += 1;

        self.chunks.write().unwrap().push(MemoryChunk {
            id: id.clone(),
            tenant_id: chunk.tenant_id,
            vector: chunk.embedding.clone(),
            text: chunk.text.clone(),
            started_at: chunk.started_at.timestamp(),
        });

        Ok(id)
    }

    async fn fetch_all(&self, tenant_id: i64) -> Result<Vec<StoredChunk>, EngineError> {
        let chunks = self.chunks.read().unwrap();
        Ok(chunks
            .iter()
            .filter(|c| c.tenant_id == tenant_id)
            .map(|c| StoredChunk {
                id: c.id.clone(),
                vector: c.vector.clone(),
                text: c.text.clone(),
                started_at: c.started_at,
            })
            .collect())
    }

    async fn fetch_recent(
        &self,
        tenant_id: i64,
        limit: i64,
    ) -> Result<Vec<StoredChunk>, EngineError> {
        let mut recent = self.fetch_all(tenant_id).await?;
        recent.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        recent.truncate(limit.max(0) as usize);
        Ok(recent)
    }

    async fn delete_by_ids(&self, tenant_id: i64, ids: &[String]) -> Result<u64, EngineError> {
        let mut chunks = self.chunks.write().unwrap();
        let before = chunks.len();
        chunks.retain(|c| !(c.tenant_id == tenant_id && ids.contains(&c.id)));
        Ok((before - chunks.len()) as u64)
    }

    async fn count(&self, tenant_id: i64) -> Result<i64, EngineError> {
        let chunks = self.chunks.read().unwrap();
        Ok(chunks.iter().filter(|c| c.tenant_id == tenant_id).count() as i64)
    }
}
