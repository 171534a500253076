use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::storage::{BackendLocal, StorageManager};

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default embedding model: CLIP ViT-B/32 text tower, 512 dimensions
const DEFAULT_EMBEDDING_MODEL: &str = "clip-vit-b-32";
const DEFAULT_MODEL_CACHE_DIR: &str = "models";
const DEFAULT_DIMENSIONS: usize = 512;
const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_INDEX_PATH: &str = "index.bin";
const DEFAULT_SOURCE_DIR: &str = "data/to_process";
const DEFAULT_PROCESSED_DIR: &str = "data/processed";
const DEFAULT_EXTENSION: &str = "json";
const DEFAULT_NEAREST_NEIGHBORS: usize = 3;
const DEFAULT_FILLER_TABLE: &str = "fillers.yaml";

/// Embedding model settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name (e.g., "clip-vit-b-32", "bge-small-en-v1.5")
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Where downloaded model files are cached
    #[serde(default = "default_model_cache_dir")]
    pub cache_dir: String,

    /// Print download progress on first use
    #[serde(default = "default_true")]
    pub show_download_progress: bool,

    /// Batch size for the model; model default when unset
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            cache_dir: default_model_cache_dir(),
            show_download_progress: true,
            batch_size: None,
        }
    }
}

/// Index shape, fixed when an index is built
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Maximum number of corpus entries one index holds
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_index_path")]
    pub path: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            capacity: DEFAULT_CAPACITY,
            path: default_index_path(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    #[serde(default = "default_processed_dir")]
    pub processed_dir: String,

    /// Corpus file extension, without the leading dot
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            processed_dir: default_processed_dir(),
            extension: default_extension(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Neighbours returned per query when not given on the command line
    #[serde(default = "default_nearest_neighbors")]
    pub nearest_neighbors: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            nearest_neighbors: DEFAULT_NEAREST_NEIGHBORS,
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_model_cache_dir() -> String {
    DEFAULT_MODEL_CACHE_DIR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_index_path() -> String {
    DEFAULT_INDEX_PATH.to_string()
}

fn default_source_dir() -> String {
    DEFAULT_SOURCE_DIR.to_string()
}

fn default_processed_dir() -> String {
    DEFAULT_PROCESSED_DIR.to_string()
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_nearest_neighbors() -> usize {
    DEFAULT_NEAREST_NEIGHBORS
}

fn default_filler_table() -> String {
    DEFAULT_FILLER_TABLE.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub query: QueryConfig,
    /// Filler table file, relative to the base path
    #[serde(default = "default_filler_table")]
    pub filler_table: String,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            ingest: IngestConfig::default(),
            query: QueryConfig::default(),
            filler_table: default_filler_table(),
            base_path: PathBuf::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }

        if self.embedding.batch_size == Some(0) {
            bail!("embedding.batch_size must be greater than 0");
        }

        if self.index.dimensions == 0 || u32::try_from(self.index.dimensions).is_err() {
            bail!(
                "index.dimensions must be between 1 and {}, got {}",
                u32::MAX,
                self.index.dimensions
            );
        }

        if self.index.capacity == 0 {
            bail!("index.capacity must be greater than 0");
        }

        let ext = &self.ingest.extension;
        if ext.is_empty() || ext.starts_with('.') {
            bail!("ingest.extension must be non-empty and without a leading dot, got '{ext}'");
        }

        if self.query.nearest_neighbors == 0 {
            bail!("query.nearest_neighbors must be greater than 0");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if absent.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = BackendLocal::new(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE_NAME) {
            store
                .write(CONFIG_FILE_NAME, serde_yml::to_string(&Self::default())?.as_bytes())
                .context("failed to write default config")?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE_NAME)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store
            .write(CONFIG_FILE_NAME, config_str.as_bytes())
            .context("failed to save config")?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a configured path against the base path.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.resolve(&self.index.path)
    }

    pub fn source_dir(&self) -> PathBuf {
        self.resolve(&self.ingest.source_dir)
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.resolve(&self.ingest.processed_dir)
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        self.resolve(&self.embedding.cache_dir)
    }
}
