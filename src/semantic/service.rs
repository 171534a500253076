//! Filler resolution service.
//!
//! Turns an utterance into filler texts:
//! embed -> search -> decode ids -> look up filler table.
//! Each step finishes before the next one starts, and any failure is
//! returned to the caller instead of producing a partial result.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::semantic::codec::{self, CompoundId};
use crate::semantic::embeddings::{embed_one, model_id_hash, Embedder, EmbeddingError};
use crate::semantic::fillers::{FillerTable, FillerTableError};
use crate::semantic::index::{FlatIndex, IndexError};
use crate::semantic::preprocess::normalize_text;
use crate::semantic::storage::{IndexStorage, IndexStorageError};

/// Errors that can occur while resolving a filler.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Query text is empty")]
    EmptyQuery,

    #[error("Index has {index} dimensions but the embedding model produces {model}")]
    DimensionMismatch { index: usize, model: usize },

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] IndexStorageError),

    #[error("Filler table error: {0}")]
    FillerTable(#[from] FillerTableError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Nearest neighbours of a query and the filler texts they resolve to.
///
/// The three vectors are parallel and ordered nearest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub neighbors: Vec<CompoundId>,
    pub distances: Vec<f32>,
    pub fillers: Vec<String>,
}

impl SearchResult {
    /// Filler text of the nearest neighbour, if any.
    pub fn best(&self) -> Option<&str> {
        self.fillers.first().map(String::as_str)
    }
}

/// Wall time spent in each stage of one resolution.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimings {
    #[serde(serialize_with = "as_millis")]
    pub embed: Duration,
    #[serde(serialize_with = "as_millis")]
    pub search: Duration,
    #[serde(serialize_with = "as_millis")]
    pub resolve: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Shared slot holding the index queries run against.
///
/// Readers take a snapshot `Arc`; a rebuilt index is swapped in whole, so a
/// query in flight keeps using the instance it started with and no instance
/// is ever mutated while it is being searched.
pub struct IndexHandle {
    current: RwLock<Arc<FlatIndex>>,
}

impl IndexHandle {
    pub fn new(index: FlatIndex) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
        }
    }

    /// Snapshot of the current index.
    pub fn current(&self) -> Result<Arc<FlatIndex>, ResolveError> {
        self.current
            .read()
            .map(|guard| guard.clone())
            .map_err(|e| ResolveError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Swap in a new index, returning the one it replaced.
    pub fn replace(&self, index: FlatIndex) -> Result<Arc<FlatIndex>, ResolveError> {
        let mut guard = self
            .current
            .write()
            .map_err(|e| ResolveError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(std::mem::replace(&mut *guard, Arc::new(index)))
    }
}

/// Resolves utterances to filler texts against a loaded index.
pub struct FillerResolver {
    embedder: Arc<dyn Embedder>,
    index: IndexHandle,
    fillers: Arc<FillerTable>,
}

impl FillerResolver {
    /// Create a resolver over an already built or loaded index.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: FlatIndex,
        fillers: Arc<FillerTable>,
    ) -> Result<Self, ResolveError> {
        Self::check_dimensions(embedder.as_ref(), &index)?;

        let resolver = Self {
            embedder,
            index: IndexHandle::new(index),
            fillers,
        };
        resolver.warn_uncovered()?;
        Ok(resolver)
    }

    /// Load the persisted index and create a resolver over it.
    pub fn open(
        embedder: Arc<dyn Embedder>,
        storage: &IndexStorage,
        fillers: Arc<FillerTable>,
    ) -> Result<Self, ResolveError> {
        let index = Self::load_for(embedder.as_ref(), storage)?;
        log::info!(
            "Loaded index with {} entries from {}",
            index.len(),
            storage.path().display()
        );
        Self::new(embedder, index, fillers)
    }

    /// Reload the persisted index and swap it in. Returns the new entry count.
    pub fn reload(&self, storage: &IndexStorage) -> Result<usize, ResolveError> {
        let index = Self::load_for(self.embedder.as_ref(), storage)?;
        let len = index.len();
        self.index.replace(index)?;
        self.warn_uncovered()?;
        log::info!("Reloaded index with {} entries", len);
        Ok(len)
    }

    /// Number of entries in the current index.
    pub fn indexed_count(&self) -> Result<usize, ResolveError> {
        Ok(self.index.current()?.len())
    }

    /// Resolve `query_text` to the filler texts of its `k` nearest entries.
    ///
    /// `k` is a ceiling: a smaller index returns all of its entries.
    pub fn resolve(&self, query_text: &str, k: usize) -> Result<SearchResult, ResolveError> {
        self.resolve_with_timings(query_text, k)
            .map(|(result, _)| result)
    }

    /// Same as [`resolve`](Self::resolve), also reporting per-stage timings.
    pub fn resolve_with_timings(
        &self,
        query_text: &str,
        k: usize,
    ) -> Result<(SearchResult, StageTimings), ResolveError> {
        let _span = tracing::debug_span!("resolve", k).entered();
        let mut timings = StageTimings::default();

        let query = normalize_text(query_text).ok_or(ResolveError::EmptyQuery)?;

        let start = Instant::now();
        let query_embedding = embed_one(self.embedder.as_ref(), &query)?;
        timings.embed = start.elapsed();

        let start = Instant::now();
        let index = self.index.current()?;
        let hits = index.search(&query_embedding, k)?;
        timings.search = start.elapsed();

        let start = Instant::now();
        let mut result = SearchResult {
            neighbors: Vec::with_capacity(hits.len()),
            distances: Vec::with_capacity(hits.len()),
            fillers: Vec::with_capacity(hits.len()),
        };
        for hit in hits {
            let filler = self.fillers.get(codec::decode(hit.id))?;
            result.neighbors.push(hit.id);
            result.distances.push(hit.distance);
            result.fillers.push(filler.to_string());
        }
        timings.resolve = start.elapsed();

        log::debug!(
            "Resolved {} neighbour(s): embed {:?}, search {:?}, resolve {:?}",
            result.neighbors.len(),
            timings.embed,
            timings.search,
            timings.resolve
        );

        Ok((result, timings))
    }

    /// Categories present in the index that the filler table cannot resolve.
    pub fn uncovered_categories(&self) -> Result<BTreeSet<u8>, ResolveError> {
        Ok(self
            .index
            .current()?
            .iter()
            .map(|entry| entry.id.category())
            .filter(|category| !self.fillers.contains(*category))
            .collect())
    }

    fn warn_uncovered(&self) -> Result<(), ResolveError> {
        let uncovered = self.uncovered_categories()?;
        if !uncovered.is_empty() {
            log::warn!(
                "Filler table has no text for categories {:?}; queries hitting them will fail",
                uncovered
            );
        }
        Ok(())
    }

    fn load_for(embedder: &dyn Embedder, storage: &IndexStorage) -> Result<FlatIndex, ResolveError> {
        let model_id = model_id_hash(embedder.name());
        Ok(storage.load(&model_id, embedder.dimensions())?)
    }

    fn check_dimensions(embedder: &dyn Embedder, index: &FlatIndex) -> Result<(), ResolveError> {
        if index.dimensions() != embedder.dimensions() {
            return Err(ResolveError::DimensionMismatch {
                index: index.dimensions(),
                model: embedder.dimensions(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::codec::encode;
    use crate::tests::LookupEmbedder;
    use std::collections::BTreeMap;

    fn fillers(entries: &[(u8, &str)]) -> Arc<FillerTable> {
        let map: BTreeMap<u8, String> = entries.iter().map(|(k, v)| (*k, v.to_string())).collect();
        Arc::new(FillerTable::new(map).unwrap())
    }

    fn two_entry_resolver() -> FillerResolver {
        let embedder = LookupEmbedder::new(4)
            .with("hello there", vec![1.0, 0.0, 0.0, 0.0])
            .with("what do you mean", vec![0.0, 1.0, 0.0, 0.0]);
        let index = FlatIndex::build(
            4,
            2,
            vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]],
            &[encode(0, 5).unwrap(), encode(1, 7).unwrap()],
        )
        .unwrap();

        FillerResolver::new(
            Arc::new(embedder),
            index,
            fillers(&[(5, "Hi!"), (7, "Let me explain.")]),
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_nearest_filler() {
        let resolver = two_entry_resolver();
        let result = resolver.resolve("hello there", 1).unwrap();

        assert_eq!(result.neighbors.len(), 1);
        assert_eq!(result.neighbors[0].category(), 5);
        assert_eq!(result.distances, vec![0.0]);
        assert_eq!(result.best(), Some("Hi!"));
    }

    #[test]
    fn test_resolve_normalises_query() {
        let resolver = two_entry_resolver();
        let result = resolver.resolve("  what   do you\nmean ", 1).unwrap();
        assert_eq!(result.fillers, vec!["Let me explain.".to_string()]);
    }

    #[test]
    fn test_k_larger_than_index_returns_all() {
        let resolver = two_entry_resolver();
        let result = resolver.resolve("hello there", 10).unwrap();

        assert_eq!(result.neighbors.len(), 2);
        assert_eq!(result.fillers, vec!["Hi!".to_string(), "Let me explain.".to_string()]);
        assert!(result.distances[0] <= result.distances[1]);
    }

    #[test]
    fn test_resolve_is_repeatable() {
        let resolver = two_entry_resolver();
        let first = resolver.resolve("what do you mean", 2).unwrap();
        let second = resolver.resolve("what do you mean", 2).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_query_rejected() {
        let resolver = two_entry_resolver();
        assert!(matches!(resolver.resolve("   ", 1), Err(ResolveError::EmptyQuery)));
    }

    #[test]
    fn test_missing_filler_is_an_error() {
        let embedder = LookupEmbedder::new(2).with("hm", vec![1.0, 0.0]);
        let index = FlatIndex::build(
            2,
            2,
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            &[encode(0, 5).unwrap(), encode(1, 9).unwrap()],
        )
        .unwrap();
        let resolver =
            FillerResolver::new(Arc::new(embedder), index, fillers(&[(5, "Hmm.")])).unwrap();

        assert_eq!(resolver.uncovered_categories().unwrap(), BTreeSet::from([9]));

        // nearest hit resolves, but the second one does not: no partial result
        assert!(resolver.resolve("hm", 1).is_ok());
        assert!(matches!(
            resolver.resolve("hm", 2),
            Err(ResolveError::FillerTable(FillerTableError::Missing(9)))
        ));
    }

    #[test]
    fn test_embedding_failure_surfaces() {
        let resolver = two_entry_resolver();
        assert!(matches!(
            resolver.resolve("never seen", 1),
            Err(ResolveError::Embedding(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let embedder = LookupEmbedder::new(3);
        let index = FlatIndex::new(4, 1).unwrap();
        let result = FillerResolver::new(Arc::new(embedder), index, fillers(&[(0, "Hm.")]));
        assert!(matches!(
            result,
            Err(ResolveError::DimensionMismatch { index: 4, model: 3 })
        ));
    }

    #[test]
    fn test_index_handle_swap_keeps_old_snapshot() {
        let handle = IndexHandle::new(FlatIndex::new(2, 1).unwrap());
        let before = handle.current().unwrap();

        let mut rebuilt = FlatIndex::new(2, 1).unwrap();
        rebuilt.insert(encode(0, 1).unwrap(), vec![1.0, 0.0]).unwrap();
        let replaced = handle.replace(rebuilt).unwrap();

        assert!(before.is_empty());
        assert!(Arc::ptr_eq(&before, &replaced));
        assert_eq!(handle.current().unwrap().len(), 1);
    }

    #[test]
    fn test_timings_reported() {
        let resolver = two_entry_resolver();
        let (result, timings) = resolver.resolve_with_timings("hello there", 1).unwrap();
        assert_eq!(result.best(), Some("Hi!"));

        let json = serde_json::to_value(timings).unwrap();
        assert!(json["embed"].is_f64());
        assert!(json["search"].is_f64());
        assert!(json["resolve"].is_f64());
    }
}
