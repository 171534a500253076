//! Static filler table: filler category -> filler text.
//!
//! Loaded once from `fillers.yaml` and shared read-only afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use crate::semantic::codec::CATEGORY_MODULUS;
use crate::storage::{BackendLocal, StorageManager};

/// Errors raised while loading or querying the filler table.
#[derive(Debug, thiserror::Error)]
pub enum FillerTableError {
    #[error("No filler text for category {0}")]
    Missing(u8),

    #[error("Filler category {0} is outside [0, 100)")]
    CategoryOutOfRange(u8),

    #[error("Filler text for category {0} is empty")]
    EmptyText(u8),

    #[error("Failed to read filler table: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filler table is malformed: {0}")]
    Parse(#[from] serde_yml::Error),
}

/// Read-only mapping from filler category to filler text.
#[derive(Debug, Clone, PartialEq)]
pub struct FillerTable {
    fillers: BTreeMap<u8, String>,
}

impl FillerTable {
    /// Build a table, checking every category fits the codec and every text
    /// is non-empty.
    pub fn new(fillers: BTreeMap<u8, String>) -> Result<Self, FillerTableError> {
        for (&category, text) in &fillers {
            if u64::from(category) >= CATEGORY_MODULUS {
                return Err(FillerTableError::CategoryOutOfRange(category));
            }
            if text.trim().is_empty() {
                return Err(FillerTableError::EmptyText(category));
            }
        }

        Ok(Self { fillers })
    }

    /// Parse a YAML mapping of category to text.
    pub fn from_yaml(yaml: &str) -> Result<Self, FillerTableError> {
        let fillers: BTreeMap<u8, String> = serde_yml::from_str(yaml)?;
        Self::new(fillers)
    }

    /// Load the table from `file_name` inside `base_path`, writing the
    /// default table there first if the file does not exist yet.
    pub fn load_with(base_path: &Path, file_name: &str) -> Result<Self, FillerTableError> {
        let store = BackendLocal::new(base_path)?;

        if !store.exists(file_name) {
            log::info!("No filler table at {}, writing defaults", base_path.join(file_name).display());
            store.write(file_name, Self::default().to_yaml()?.as_bytes())?;
        }

        let yaml = String::from_utf8(store.read(file_name)?).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e)
        })?;

        let table = Self::from_yaml(&yaml)?;
        log::debug!("Loaded {} filler texts", table.len());
        Ok(table)
    }

    pub fn to_yaml(&self) -> Result<String, FillerTableError> {
        Ok(serde_yml::to_string(&self.fillers)?)
    }

    /// Filler text for `category`.
    pub fn get(&self, category: u8) -> Result<&str, FillerTableError> {
        self.fillers
            .get(&category)
            .map(String::as_str)
            .ok_or(FillerTableError::Missing(category))
    }

    pub fn contains(&self, category: u8) -> bool {
        self.fillers.contains_key(&category)
    }

    pub fn len(&self) -> usize {
        self.fillers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fillers.is_empty()
    }

    /// Iterate in category order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.fillers.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl Default for FillerTable {
    fn default() -> Self {
        let fillers = [
            "Hmm.",
            "I see.",
            "Right.",
            "Okay.",
            "Got it.",
            "Let me think about that.",
            "Interesting.",
            "Sure.",
            "Yeah.",
            "Uh-huh.",
        ]
        .iter()
        .enumerate()
        .map(|(category, text)| (category as u8, text.to_string()))
        .collect();

        Self { fillers }
    }
}
