use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::Config;
use crate::semantic::{Embedder, EmbeddingError};


/// Embedder backed by a fixed text -> vector table.
///
/// Unknown texts fail the whole batch, like a model service rejecting a
/// request would.
pub struct LookupEmbedder {
    dimensions: usize,
    vectors: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
}

impl LookupEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    /// Number of embed_batch calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for LookupEmbedder {
    fn name(&self) -> &str {
        "lookup-test-model"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        texts
            .iter()
            .map(|text| {
                self.vectors
                    .get(text)
                    .cloned()
                    .ok_or_else(|| EmbeddingError::EmbeddingFailed(format!("no vector for {text:?}")))
            })
            .collect()
    }
}

/// Config rooted in `base`, shaped for small test indexes.
pub fn test_config(base: &Path, dimensions: usize, capacity: usize) -> Config {
    let mut config = Config::load_with(base).expect("failed to load config");
    config.index.dimensions = dimensions;
    config.index.capacity = capacity;
    std::fs::create_dir_all(config.source_dir()).expect("failed to create source dir");
    config
}

/// Write a corpus file of `(pageContent, fillerCategory)` records.
pub fn write_corpus(dir: &Path, name: &str, records: &[(&str, i64)]) {
    let records: Vec<serde_json::Value> = records
        .iter()
        .map(|(content, category)| {
            serde_json::json!({
                "pageContent": content,
                "metadata": { "fillerCategory": category },
            })
        })
        .collect();
    std::fs::write(
        dir.join(name),
        serde_json::to_string_pretty(&records).expect("failed to encode corpus"),
    )
    .expect("failed to write corpus file");
}
