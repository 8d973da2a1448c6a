//! Flat (brute-force) nearest-neighbor index over chunk embeddings.
//!
//! Rebuilt from scratch for every retrieval request from the full snapshot
//! of one tenant's persisted chunks; positions are only valid against that
//! snapshot. Build and query are both O(N·D), which holds up while tenants
//! stay in the thousands of chunks; an approximate index would slot in
//! here first if that stops being true.

use crate::error::{validate_dimension, EngineError};
use crate::models::StoredChunk;

/// One indexed chunk: the opaque storage id plus the transcript returned
/// to callers.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: String,
    pub text: String,
}

/// A search hit: position into the build snapshot plus squared Euclidean
/// distance to the query.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

/// Brute-force squared-L2 index over a tenant's chunk vectors.
#[derive(Debug)]
pub struct FlatIndex {
    dims: usize,
    vectors: Vec<Vec<f32>>,
    entries: Vec<IndexEntry>,
}

impl FlatIndex {
    /// Build an index from a tenant's chunk snapshot.
    ///
    /// Returns `Ok(None)` for an empty snapshot: a normal state for a
    /// newly onboarded tenant, not a fault. Every vector must share one
    /// dimension; a mismatch aborts the build with
    /// [`EngineError::DimensionMismatch`] rather than truncating or
    /// padding, since a flat index requires uniform dimensionality.
    pub fn build(chunks: &[StoredChunk]) -> Result<Option<Self>, EngineError> {
        let Some(first) = chunks.first() else {
            return Ok(None);
        };

        let dims = first.vector.len();
        let mut vectors = Vec::with_capacity(chunks.len());
        let mut entries = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            validate_dimension(dims, chunk.vector.len())?;
            vectors.push(chunk.vector.clone());
            entries.push(IndexEntry {
                id: chunk.id.clone(),
                text: chunk.text.clone(),
            });
        }

        Ok(Some(Self {
            dims,
            vectors,
            entries,
        }))
    }

    /// The `k` nearest chunks to `query` by squared Euclidean distance,
    /// ascending. Returns fewer than `k` when the index is smaller. Order
    /// among exact distance ties is implementation-defined (stable sort
    /// over snapshot order).
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, EngineError> {
        validate_dimension(self.dims, query.len())?;

        let mut neighbors: Vec<Neighbor> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, vector)| Neighbor {
                position,
                distance: squared_l2(query, vector),
            })
            .collect();

        neighbors.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        neighbors.truncate(k);

        Ok(neighbors)
    }

    pub fn entry(&self, position: usize) -> &IndexEntry {
        &self.entries[position]
    }

    pub fn vector(&self, position: usize) -> &[f32] {
        &self.vectors[position]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, vector: Vec<f32>) -> StoredChunk {
        StoredChunk {
            id: id.to_string(),
            vector,
            text: format!("text for {}", id),
            started_at: 0,
        }
    }

    #[test]
    fn empty_snapshot_builds_no_index() {
        assert!(FlatIndex::build(&[]).unwrap().is_none());
    }

    #[test]
    fn mixed_dimensions_abort_the_build() {
        let chunks = vec![chunk("a", vec![1.0, 0.0]), chunk("b", vec![1.0, 0.0, 0.0])];
        let err = FlatIndex::build(&chunks).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn nearest_by_squared_l2() {
        let chunks = vec![
            chunk("x", vec![1.0, 0.0]),
            chunk("y", vec![0.0, 1.0]),
            chunk("z", vec![0.9, 0.1]),
        ];
        let index = FlatIndex::build(&chunks).unwrap().unwrap();

        let neighbors = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(neighbors.len(), 2);
        assert_eq!(index.entry(neighbors[0].position).id, "x");
        assert_eq!(index.entry(neighbors[1].position).id, "z");
        assert!(neighbors[0].distance <= neighbors[1].distance);
        assert!(neighbors[0].distance.abs() < 1e-6);
    }

    #[test]
    fn query_dimension_must_match() {
        let index = FlatIndex::build(&[chunk("a", vec![1.0, 0.0])])
            .unwrap()
            .unwrap();
        let err = index.search(&[1.0, 0.0, 0.0], 1).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { .. }));
    }

    #[test]
    fn k_larger_than_index_returns_all() {
        let chunks = vec![chunk("a", vec![0.0]), chunk("b", vec![2.0])];
        let index = FlatIndex::build(&chunks).unwrap().unwrap();
        let neighbors = index.search(&[1.0], 10).unwrap();
        assert_eq!(neighbors.len(), 2);
    }
}
