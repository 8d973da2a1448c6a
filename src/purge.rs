//! Administrative purge: delete a tenant's most recent chunks.
//!
//! Authorization happens at the calling boundary (admin token on the HTTP
//! surface, operator trust on the CLI); this module trusts its caller.

use tracing::info;

use crate::error::EngineError;
use crate::store::ChunkStore;

/// Delete the `count` most-recently-started chunks for a tenant.
///
/// Returns the number actually deleted, which may be lower than `count`
/// when the tenant holds fewer chunks.
pub async fn purge_recent(
    store: &dyn ChunkStore,
    tenant_id: i64,
    count: i64,
) -> Result<u64, EngineError> {
    if count <= 0 {
        return Ok(0);
    }

    let recent = store.fetch_recent(tenant_id, count).await?;
    if recent.is_empty() {
        return Ok(0);
    }

    let ids: Vec<String> = recent.into_iter().map(|c| c.id).collect();
    let deleted = store.delete_by_ids(tenant_id, &ids).await?;
    info!(tenant_id, deleted, "purged recent chunks");

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StoredChunk;
    use crate::store::MemoryStore;

    fn seed(store: &MemoryStore, tenant_id: i64, id: &str, started_at: i64) {
        store.insert_raw(
            tenant_id,
            StoredChunk {
                id: id.to_string(),
                vector: vec![1.0],
                text: format!("chunk {}", id),
                started_at,
            },
        );
    }

    #[tokio::test]
    async fn deletes_newest_first() {
        let store = MemoryStore::new();
        seed(&store, 1, "old", 10);
        seed(&store, 1, "mid", 20);
        seed(&store, 1, "new", 30);

        let deleted = purge_recent(&store, 1, 2).await.unwrap();
        assert_eq!(deleted, 2);

        let remaining = store.fetch_all(1).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "old");
    }

    #[tokio::test]
    async fn count_beyond_population_deletes_all() {
        let store = MemoryStore::new();
        seed(&store, 1, "only", 10);

        assert_eq!(purge_recent(&store, 1, 50).await.unwrap(), 1);
        assert_eq!(store.count(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_tenant_deletes_nothing() {
        let store = MemoryStore::new();
        assert_eq!(purge_recent(&store, 7, 5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_positive_count_is_a_noop() {
        let store = MemoryStore::new();
        seed(&store, 1, "kept", 10);
        assert_eq!(purge_recent(&store, 1, 0).await.unwrap(), 0);
        assert_eq!(purge_recent(&store, 1, -3).await.unwrap(), 0);
        assert_eq!(store.count(1).await.unwrap(), 1);
    }
}
