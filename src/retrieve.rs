//! Retrieval: k-NN search plus cosine rerank.
//!
//! Raw L2 distance and cosine similarity rank differently when vector
//! magnitudes vary (transcript length shifts embedding norms), so the
//! candidate set from the flat index gets a second, cosine-ordered pass.
//! The rerank only touches the already-narrowed candidates, bounding its
//! cost to O(top_k·D). It can be disabled to fall back to raw index
//! order; the default is on.

use tracing::debug;

use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::index::FlatIndex;
use crate::store::ChunkStore;

/// Epsilon guard against zero-norm vectors in the cosine denominator.
const COSINE_EPSILON: f32 = 1e-9;

/// Inputs for a single retrieval invocation. Each call is a fresh
/// computation over a fresh index; nothing is cached across calls.
#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub tenant_id: i64,
    pub query: &'a str,
    pub top_k: usize,
    pub rerank: bool,
}

/// One retrieved chunk, carrying both scores for display surfaces.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    /// Squared Euclidean distance from the first-pass search.
    pub distance: f32,
    /// Cosine similarity from the rerank pass; `None` when rerank is off.
    pub similarity: Option<f32>,
}

/// Cosine similarity with a zero-norm guard:
/// `dot(a,b) / (‖a‖·‖b‖ + ε)`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt() + COSINE_EPSILON)
}

/// Retrieve the `top_k` most relevant chunks for a tenant's query.
///
/// Builds a fresh [`FlatIndex`] from the tenant's full chunk snapshot,
/// embeds the query, takes the `top_k` nearest by squared L2, then
/// (by default) reranks that candidate set by cosine similarity.
///
/// An empty tenant is a successful empty result, returned before the
/// embedder is ever called.
pub async fn retrieve(
    store: &dyn ChunkStore,
    embedder: &dyn Embedder,
    req: &RetrievalRequest<'_>,
) -> Result<Vec<RetrievedChunk>, EngineError> {
    let chunks = store.fetch_all(req.tenant_id).await?;
    let Some(index) = FlatIndex::build(&chunks)? else {
        return Ok(Vec::new());
    };

    let query_vec = embedder.embed(req.query).await?;
    let neighbors = index.search(&query_vec, req.top_k)?;

    let mut candidates: Vec<RetrievedChunk> = neighbors
        .iter()
        .map(|n| {
            let entry = index.entry(n.position);
            let similarity = req
                .rerank
                .then(|| cosine_similarity(&query_vec, index.vector(n.position)));
            RetrievedChunk {
                id: entry.id.clone(),
                text: entry.text.clone(),
                distance: n.distance,
                similarity,
            }
        })
        .collect();

    if req.rerank {
        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    candidates.truncate(req.top_k);
    debug!(
        tenant_id = req.tenant_id,
        candidates = candidates.len(),
        rerank = req.rerank,
        "retrieval complete"
    );

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StoredChunk;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Returns one fixed vector for every query.
    struct StubEmbedder {
        vector: Vec<f32>,
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EngineError> {
            Ok(self.vector.clone())
        }

        fn dims(&self) -> usize {
            self.vector.len()
        }
    }

    /// Fails every call; proves the empty-tenant path never embeds.
    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EngineError> {
            Err(EngineError::embedding("should never be called", false))
        }

        fn dims(&self) -> usize {
            2
        }
    }

    fn store_with(vectors: &[(&str, Vec<f32>)]) -> MemoryStore {
        let store = MemoryStore::new();
        for (id, vector) in vectors {
            store.insert_raw(
                1,
                StoredChunk {
                    id: id.to_string(),
                    vector: vector.clone(),
                    text: format!("text for {}", id),
                    started_at: 0,
                },
            );
        }
        store
    }

    fn request(top_k: usize, rerank: bool) -> RetrievalRequest<'static> {
        RetrievalRequest {
            tenant_id: 1,
            query: "what happened?",
            top_k,
            rerank,
        }
    }

    #[test]
    fn cosine_of_vector_with_itself_is_one() {
        let v = vec![0.3, -1.2, 4.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_zero_norm_guarded() {
        let zero = vec![0.0, 0.0];
        let v = vec![1.0, 0.0];
        assert_eq!(cosine_similarity(&zero, &v), 0.0);
    }

    #[tokio::test]
    async fn empty_tenant_returns_empty_without_embedding() {
        let store = MemoryStore::new();
        let result = retrieve(&store, &FailingEmbedder, &request(5, true))
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn l2_candidates_then_cosine_order() {
        // Nearest to [1,0] by L2: itself, then [0.9,0.1]; cosine rerank
        // keeps that order (1.0 vs ~0.994).
        let store = store_with(&[
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.0, 1.0]),
            ("c", vec![0.9, 0.1]),
        ]);
        let embedder = StubEmbedder {
            vector: vec![1.0, 0.0],
        };

        let result = retrieve(&store, &embedder, &request(2, true)).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, "a");
        assert_eq!(result[1].id, "c");
        assert!((result[0].similarity.unwrap() - 1.0).abs() < 1e-5);
        assert!((result[1].similarity.unwrap() - 0.9940).abs() < 1e-3);
    }

    #[tokio::test]
    async fn rerank_order_is_permutation_invariant() {
        let fixtures: Vec<(&str, Vec<f32>)> = vec![
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.6, 0.8]),
            ("c", vec![0.9, 0.1]),
        ];
        let embedder = StubEmbedder {
            vector: vec![1.0, 0.0],
        };

        let baseline = retrieve(
            &store_with(&fixtures),
            &embedder,
            &request(3, true),
        )
        .await
        .unwrap();

        let mut reversed = fixtures.clone();
        reversed.reverse();
        let permuted = retrieve(&store_with(&reversed), &embedder, &request(3, true))
            .await
            .unwrap();

        let baseline_ids: Vec<&str> = baseline.iter().map(|c| c.id.as_str()).collect();
        let permuted_ids: Vec<&str> = permuted.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(baseline_ids, permuted_ids);
    }

    #[tokio::test]
    async fn rerank_off_returns_raw_index_order() {
        // [0.5, 0.5] is closer to the query by L2 than the long vector
        // [3,0], but cosine would prefer [3,0]. With rerank off the raw
        // L2 order must survive.
        let store = store_with(&[("long", vec![3.0, 0.0]), ("short", vec![0.5, 0.5])]);
        let embedder = StubEmbedder {
            vector: vec![1.0, 0.0],
        };

        let result = retrieve(&store, &embedder, &request(2, false)).await.unwrap();
        assert_eq!(result[0].id, "short");
        assert_eq!(result[1].id, "long");
        assert!(result[0].similarity.is_none());
    }

    #[tokio::test]
    async fn rerank_on_promotes_cosine_winner() {
        let store = store_with(&[("long", vec![3.0, 0.0]), ("short", vec![0.5, 0.5])]);
        let embedder = StubEmbedder {
            vector: vec![1.0, 0.0],
        };

        let result = retrieve(&store, &embedder, &request(2, true)).await.unwrap();
        assert_eq!(result[0].id, "long");
    }

    #[tokio::test]
    async fn top_k_beyond_population_returns_all_ranked() {
        let store = store_with(&[("a", vec![1.0, 0.0]), ("b", vec![0.0, 1.0])]);
        let embedder = StubEmbedder {
            vector: vec![1.0, 0.0],
        };

        let result = retrieve(&store, &embedder, &request(10, true)).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, "a");
    }

    #[tokio::test]
    async fn mixed_dimension_snapshot_is_fatal() {
        let store = store_with(&[("a", vec![1.0, 0.0]), ("b", vec![1.0, 0.0, 0.0])]);
        let embedder = StubEmbedder {
            vector: vec![1.0, 0.0],
        };

        let err = retrieve(&store, &embedder, &request(5, true))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { .. }));
    }
}
