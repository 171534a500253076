//! Filler retrieval over sentence embeddings.
//!
//! Reference utterances are embedded and stored in a nearest-neighbour
//! index whose ids also carry each utterance's filler category. A live
//! utterance is embedded the same way, its nearest reference entries are
//! looked up, and their categories are resolved to filler texts.
//!
//! # Architecture
//!
//! - `codec`: Packs sequence position and filler category into one id
//! - `preprocess`: Text normalisation shared by corpus and queries
//! - `ingest`: Reads corpus files and moves them to the processed directory
//! - `embeddings`: Embedding gateway, wraps fastembed
//! - `index`: In-memory L2 index with fixed dimension and capacity
//! - `storage`: Binary file I/O for index.bin persistence
//! - `fillers`: Filler category -> text table
//! - `service`: Query-time resolution against a loaded index
//! - `pipeline`: Batch ingestion run

pub mod codec;
pub mod embeddings;
pub mod fillers;
pub mod index;
pub mod ingest;
pub mod pipeline;
mod preprocess;
mod service;
mod storage;

pub use codec::{decode, encode, CodecError, CompoundId, CATEGORY_MODULUS};
pub use embeddings::{Embedder, EmbeddingError, EmbeddingModel};
pub use fillers::{FillerTable, FillerTableError};
pub use index::{FlatIndex, IndexError, Metric, Neighbor};
pub use ingest::{IngestError, IngestedCorpus};
pub use pipeline::{run_ingestion, IngestReport, PipelineError};
pub use preprocess::normalize_text;
pub use service::{FillerResolver, IndexHandle, ResolveError, SearchResult, StageTimings};
pub use storage::{IndexHeader, IndexStorage, IndexStorageError};
