//! In-memory nearest-neighbour index.
//!
//! An exact, brute-force index over squared Euclidean distance. Dimension,
//! metric and capacity are fixed when the index is created; entries are only
//! ever appended, in insertion order.

use std::collections::HashSet;

use crate::semantic::codec::CompoundId;

/// Distance function the index was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Squared Euclidean distance.
    L2,
}

impl Metric {
    /// Tag written to persisted indexes.
    pub fn tag(self) -> u8 {
        match self {
            Metric::L2 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Metric::L2),
            _ => None,
        }
    }

    fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| {
                    let d = x - y;
                    d * d
                })
                .sum(),
        }
    }
}

/// An entry in the index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: CompoundId,
    pub embedding: Vec<f32>,
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: CompoundId,
    /// Squared L2 distance to the query
    pub distance: f32,
}

/// Fixed-capacity vector index.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    metric: Metric,
    dimensions: usize,
    capacity: usize,
    entries: Vec<IndexEntry>,
    ids: HashSet<CompoundId>,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Index dimensions must be greater than 0")]
    ZeroDimensions,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Capacity exceeded: index holds at most {capacity} entries, {requested} requested")]
    CapacityExceeded { capacity: usize, requested: usize },

    #[error("Got {embeddings} embeddings but {ids} ids")]
    LengthMismatch { embeddings: usize, ids: usize },

    #[error("Duplicate id {0}")]
    DuplicateId(CompoundId),

    #[error("Vector contains a non-finite component")]
    NonFiniteVector,
}

impl FlatIndex {
    /// Create an empty L2 index.
    pub fn new(dimensions: usize, capacity: usize) -> Result<Self, IndexError> {
        if dimensions == 0 {
            return Err(IndexError::ZeroDimensions);
        }

        Ok(Self {
            metric: Metric::L2,
            dimensions,
            capacity,
            // Capacity is a ceiling, not a hint; allocate for what arrives.
            entries: Vec::new(),
            ids: HashSet::new(),
        })
    }

    /// Build an index from aligned embeddings and ids.
    ///
    /// Entries are inserted in input order. Nothing is returned unless every
    /// entry was inserted, so a failed build never yields a usable index.
    pub fn build(
        dimensions: usize,
        capacity: usize,
        embeddings: Vec<Vec<f32>>,
        ids: &[CompoundId],
    ) -> Result<Self, IndexError> {
        if embeddings.len() != ids.len() {
            return Err(IndexError::LengthMismatch {
                embeddings: embeddings.len(),
                ids: ids.len(),
            });
        }

        if embeddings.len() > capacity {
            return Err(IndexError::CapacityExceeded {
                capacity,
                requested: embeddings.len(),
            });
        }

        let mut index = Self::new(dimensions, capacity)?;
        index.entries.reserve(embeddings.len());
        for (embedding, id) in embeddings.into_iter().zip(ids.iter()) {
            index.insert(*id, embedding)?;
        }

        Ok(index)
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Get the expected embedding dimensions.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of entries in the index.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Append an entry.
    pub fn insert(&mut self, id: CompoundId, embedding: Vec<f32>) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFiniteVector);
        }

        if self.entries.len() >= self.capacity {
            return Err(IndexError::CapacityExceeded {
                capacity: self.capacity,
                requested: self.entries.len() + 1,
            });
        }

        if !self.ids.insert(id) {
            return Err(IndexError::DuplicateId(id));
        }

        self.entries.push(IndexEntry { id, embedding });

        Ok(())
    }

    /// Find up to `k` nearest entries, nearest first.
    ///
    /// Returns every entry when the index holds fewer than `k`. Equal
    /// distances keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if query.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFiniteVector);
        }

        let mut results: Vec<Neighbor> = self
            .entries
            .iter()
            .map(|entry| Neighbor {
                id: entry.id,
                distance: self.metric.distance(query, &entry.embedding),
            })
            .collect();

        // sort_by is stable, so ties stay in insertion order
        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results.truncate(k);

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::codec::encode;

    fn id(position: u64, category: i64) -> CompoundId {
        encode(position, category).unwrap()
    }

    #[test]
    fn test_new_index() {
        let index = FlatIndex::new(512, 10_000).unwrap();
        assert_eq!(index.dimensions(), 512);
        assert_eq!(index.capacity(), 10_000);
        assert_eq!(index.metric(), Metric::L2);
        assert!(index.is_empty());
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(matches!(FlatIndex::new(0, 10), Err(IndexError::ZeroDimensions)));
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut index = FlatIndex::new(3, 10).unwrap();
        let result = index.insert(id(0, 1), vec![1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { expected: 3, got: 4 })));
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let mut index = FlatIndex::new(2, 10).unwrap();
        index.insert(id(0, 1), vec![1.0, 0.0]).unwrap();
        let result = index.insert(id(0, 1), vec![0.0, 1.0]);
        assert!(matches!(result, Err(IndexError::DuplicateId(_))));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_zero_vector_is_a_valid_point() {
        let mut index = FlatIndex::new(2, 10).unwrap();
        index.insert(id(0, 1), vec![0.0, 0.0]).unwrap();
        let results = index.search(&[0.0, 0.0], 1).unwrap();
        assert_eq!(results[0].distance, 0.0);
    }

    #[test]
    fn test_insert_past_capacity_rejected() {
        let mut index = FlatIndex::new(2, 1).unwrap();
        index.insert(id(0, 1), vec![1.0, 0.0]).unwrap();
        let result = index.insert(id(1, 1), vec![0.0, 1.0]);
        assert!(matches!(
            result,
            Err(IndexError::CapacityExceeded { capacity: 1, requested: 2 })
        ));
    }

    #[test]
    fn test_build_rejects_more_entries_than_capacity() {
        let embeddings = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
        let ids = [id(0, 1), id(1, 2), id(2, 3)];
        let result = FlatIndex::build(2, 2, embeddings, &ids);
        assert!(matches!(
            result,
            Err(IndexError::CapacityExceeded { capacity: 2, requested: 3 })
        ));
    }

    #[test]
    fn test_build_rejects_misaligned_input() {
        let result = FlatIndex::build(2, 10, vec![vec![1.0, 0.0]], &[id(0, 1), id(1, 1)]);
        assert!(matches!(
            result,
            Err(IndexError::LengthMismatch { embeddings: 1, ids: 2 })
        ));
    }

    #[test]
    fn test_build_preserves_insertion_order() {
        let ids = [id(0, 5), id(1, 7), id(2, 5)];
        let embeddings = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
        let index = FlatIndex::build(2, 3, embeddings, &ids).unwrap();

        let stored: Vec<CompoundId> = index.iter().map(|e| e.id).collect();
        assert_eq!(stored, ids.to_vec());
    }

    #[test]
    fn test_search_nearest_first() {
        let index = FlatIndex::build(
            4,
            2,
            vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]],
            &[id(0, 5), id(1, 7)],
        )
        .unwrap();

        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, id(0, 5));
        assert_eq!(results[0].distance, 0.0);
        assert_eq!(results[1].id, id(1, 7));
        assert!((results[1].distance - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_search_k_larger_than_index_returns_everything() {
        let index = FlatIndex::build(2, 5, vec![vec![1.0, 0.0]], &[id(0, 3)]).unwrap();
        let results = index.search(&[0.0, 1.0], 10).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_search_ties_keep_insertion_order() {
        let index = FlatIndex::build(
            2,
            3,
            vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.0, -1.0]],
            &[id(0, 1), id(1, 2), id(2, 3)],
        )
        .unwrap();

        // every point is at distance 1 from the origin
        let results = index.search(&[0.0, 0.0], 3).unwrap();
        let order: Vec<u8> = results.iter().map(|n| n.id.category()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let index = FlatIndex::new(3, 1).unwrap();
        let result = index.search(&[1.0, 0.0], 1);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_metric_tag_round_trip() {
        assert_eq!(Metric::from_tag(Metric::L2.tag()), Some(Metric::L2));
        assert_eq!(Metric::from_tag(0), None);
    }
}
