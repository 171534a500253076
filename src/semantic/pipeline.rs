//! Batch ingestion run: ingest -> embed -> build -> persist.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::Config;
use crate::lock::FileLock;
use crate::semantic::embeddings::{embed_aligned, model_id_hash, Embedder, EmbeddingError};
use crate::semantic::index::{FlatIndex, IndexError};
use crate::semantic::ingest::{self, IngestError, IngestedCorpus};
use crate::semantic::storage::{IndexStorage, IndexStorageError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Could not lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Index is configured for {configured} dimensions but the embedding model produces {model}")]
    DimensionMismatch { configured: usize, model: usize },

    #[error("Ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] IndexStorageError),
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    /// Entries in the whole processed corpus
    pub entries: usize,
    /// Entries read from this run's files
    pub new_entries: usize,
    /// Files moved to the processed directory by this run
    pub files: Vec<PathBuf>,
    /// Where the index was written; `None` when the persisted index already
    /// covered the corpus
    pub index_path: Option<PathBuf>,
    pub timings: IngestTimings,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestTimings {
    #[serde(serialize_with = "as_millis")]
    pub read: Duration,
    #[serde(serialize_with = "as_millis")]
    pub embed: Duration,
    #[serde(serialize_with = "as_millis")]
    pub build: Duration,
    #[serde(serialize_with = "as_millis")]
    pub persist: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Ingest pending corpus files and rebuild the persisted index over the
/// whole processed corpus.
///
/// The new index is only written after every stage succeeded; any failure
/// leaves the previously persisted index in place. Files moved by a failed
/// run stay in the processed directory and are indexed by the next run.
pub fn run_ingestion(config: &Config, embedder: &dyn Embedder) -> Result<IngestReport, PipelineError> {
    let _span = tracing::info_span!("ingest").entered();

    if embedder.dimensions() != config.index.dimensions {
        return Err(PipelineError::DimensionMismatch {
            configured: config.index.dimensions,
            model: embedder.dimensions(),
        });
    }

    let _lock = FileLock::try_acquire(config.base_path()).map_err(|source| PipelineError::Lock {
        path: config.base_path().to_path_buf(),
        source,
    })?;

    let mut timings = IngestTimings::default();

    let start = Instant::now();
    let batch = ingest::ingest(
        &config.source_dir(),
        &config.processed_dir(),
        &config.ingest.extension,
    )?;
    let corpus = ingest::load_processed(&config.processed_dir(), &config.ingest.extension)?;
    timings.read = start.elapsed();
    log::info!(
        "Read {} new entries from {} file(s), {} entries in the corpus, in {:?}",
        batch.len(),
        batch.processed_files.len(),
        corpus.len(),
        timings.read
    );

    let model_id = model_id_hash(embedder.name());
    let storage = IndexStorage::new(config.index_path());

    if batch.is_empty() && index_is_current(config, &storage, &model_id, corpus.len()) {
        log::info!("Nothing new to ingest, keeping the existing index");
        return Ok(IngestReport {
            entries: corpus.len(),
            new_entries: 0,
            files: batch.processed_files,
            index_path: None,
            timings,
        });
    }

    if let Err(e) = build_and_persist(config, embedder, &storage, &model_id, &corpus, &mut timings) {
        log::error!(
            "Index not updated; the next run rebuilds it from {}",
            config.processed_dir().display()
        );
        return Err(e);
    }

    Ok(IngestReport {
        entries: corpus.len(),
        new_entries: batch.len(),
        files: batch.processed_files,
        index_path: Some(storage.path().to_path_buf()),
        timings,
    })
}

/// True when the persisted index is intact and was built by this model and
/// configuration over a corpus of `corpus_len` entries.
fn index_is_current(
    config: &Config,
    storage: &IndexStorage,
    model_id: &[u8; 32],
    corpus_len: usize,
) -> bool {
    if corpus_len == 0 {
        return true;
    }

    match storage.verify() {
        Ok(header) => {
            header.model_id == *model_id
                && header.dimensions == config.index.dimensions
                && header.capacity == config.index.capacity
                && header.entry_count == corpus_len
        }
        Err(e) => {
            log::warn!("Rebuilding index {}: {}", storage.path().display(), e);
            false
        }
    }
}

fn build_and_persist(
    config: &Config,
    embedder: &dyn Embedder,
    storage: &IndexStorage,
    model_id: &[u8; 32],
    corpus: &IngestedCorpus,
    timings: &mut IngestTimings,
) -> Result<(), PipelineError> {
    let start = Instant::now();
    let embeddings = embed_aligned(embedder, &corpus.contents)?;
    timings.embed = start.elapsed();
    log::info!("Embedded {} entries in {:?}", embeddings.len(), timings.embed);

    let start = Instant::now();
    let index = FlatIndex::build(
        config.index.dimensions,
        config.index.capacity,
        embeddings,
        &corpus.ids,
    )?;
    timings.build = start.elapsed();
    log::info!("Built index in {:?}", timings.build);

    let start = Instant::now();
    storage.save(&index, model_id)?;
    timings.persist = start.elapsed();
    log::info!("Saved index to {} in {:?}", storage.path().display(), timings.persist);

    Ok(())
}
