//! Binary storage for the nearest-neighbour index.
//!
//! File format: index.bin
//!
//! Header (62 bytes):
//! - magic: [u8; 4] (b"FLIX")
//! - version: u8 (1)
//! - metric: u8 (1 = squared L2)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u32 (little-endian)
//! - capacity: u64 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, in insertion order):
//! - id: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)
//!
//! Trailer:
//! - body_checksum: u32 (CRC32 of all entry bytes)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::codec::CompoundId;
use crate::semantic::index::{FlatIndex, IndexEntry, Metric};

/// Identifies an index file
const MAGIC: [u8; 4] = *b"FLIX";

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: magic(4) + version(1) + metric(1) + model_id(32)
/// + dimensions(4) + capacity(8) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 62;

/// Offset of the header checksum
const HEADER_CHECKSUM_OFFSET: usize = 58;

/// Body checksum trailer size in bytes
const TRAILER_SIZE: usize = 4;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Header checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Body checksum mismatch: stored vectors are corrupted")]
    BodyChecksumMismatch,

    #[error("File is {actual} bytes, header describes {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Corrupt index: {0}")]
    Corrupt(String),

    #[error("Model mismatch: index was built with a different embedding model")]
    ModelMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl IndexStorageError {
    /// True when the stored bytes themselves are bad, as opposed to a valid
    /// index that does not fit the running model or an I/O failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            IndexStorageError::InvalidFormat(_)
                | IndexStorageError::VersionMismatch(..)
                | IndexStorageError::ChecksumMismatch
                | IndexStorageError::BodyChecksumMismatch
                | IndexStorageError::SizeMismatch { .. }
                | IndexStorageError::Corrupt(_)
        )
    }
}

/// Self-describing header of a persisted index.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct IndexHeader {
    pub version: u8,
    pub metric: Metric,
    #[serde(serialize_with = "hex_digest")]
    pub model_id: [u8; 32],
    pub dimensions: usize,
    pub capacity: usize,
    pub entry_count: usize,
}

fn hex_digest<S: serde::Serializer>(digest: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    serializer.serialize_str(&hex)
}

impl IndexHeader {
    /// Bytes taken by one entry.
    fn entry_size(&self) -> Option<u64> {
        (self.dimensions as u64).checked_mul(4)?.checked_add(8)
    }

    /// Total file size this header describes.
    fn expected_file_size(&self) -> Option<u64> {
        self.entry_size()?
            .checked_mul(self.entry_count as u64)?
            .checked_add((HEADER_SIZE + TRAILER_SIZE) as u64)
    }
}

/// Storage manager for a persisted index.
pub struct IndexStorage {
    path: PathBuf,
}

impl IndexStorage {
    /// Create a new storage manager for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Get the storage file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the storage file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read and verify only the header.
    pub fn inspect(&self) -> Result<IndexHeader, IndexStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        Self::read_header(&mut reader)
    }

    /// Load the index from storage.
    ///
    /// # Arguments
    /// * `expected_model_id` - SHA256 hash of the running model's name
    /// * `expected_dimensions` - Dimensions the running model produces
    ///
    /// # Returns
    /// A fully populated index, or an error. A file that fails any
    /// consistency check never yields a partial index.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<FlatIndex, IndexStorageError> {
        let file = File::open(&self.path)?;
        let actual_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let header = Self::read_header(&mut reader)?;
        Self::validate_header(&header, expected_model_id, expected_dimensions)?;

        if header.entry_count > header.capacity {
            return Err(IndexStorageError::Corrupt(format!(
                "{} entries stored in an index with capacity {}",
                header.entry_count, header.capacity
            )));
        }

        let expected_size = header.expected_file_size().ok_or_else(|| {
            IndexStorageError::Corrupt("header describes an impossibly large file".to_string())
        })?;
        if expected_size != actual_size {
            return Err(IndexStorageError::SizeMismatch {
                expected: expected_size,
                actual: actual_size,
            });
        }

        let mut index = FlatIndex::new(header.dimensions, header.capacity)
            .map_err(|e| IndexStorageError::Corrupt(e.to_string()))?;

        let mut body_hasher = crc32fast::Hasher::new();
        for _ in 0..header.entry_count {
            let (id, embedding) =
                Self::read_entry(&mut reader, header.dimensions, &mut body_hasher)?;
            index
                .insert(id, embedding)
                .map_err(|e| IndexStorageError::Corrupt(e.to_string()))?;
        }

        let mut trailer = [0u8; TRAILER_SIZE];
        reader.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer) != body_hasher.finalize() {
            return Err(IndexStorageError::BodyChecksumMismatch);
        }

        Ok(index)
    }

    /// Save the index to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &FlatIndex, model_id: &[u8; 32]) -> Result<(), IndexStorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, index, model_id);

        if result.is_err() {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }

        Ok(())
    }

    /// Fully load the index against its own header, checking every entry and
    /// both checksums without needing the running model.
    pub fn verify(&self) -> Result<IndexHeader, IndexStorageError> {
        let header = self.inspect()?;
        self.load(&header.model_id, header.dimensions)?;
        Ok(header)
    }

    fn write_to_file(
        &self,
        path: &Path,
        index: &FlatIndex,
        model_id: &[u8; 32],
    ) -> Result<(), IndexStorageError> {
        let dimensions = u32::try_from(index.dimensions()).map_err(|_| {
            IndexStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the file format",
                index.dimensions()
            ))
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        Self::write_header(
            &mut writer,
            index.metric(),
            model_id,
            dimensions,
            index.capacity() as u64,
            index.len() as u64,
        )?;

        let mut body_hasher = crc32fast::Hasher::new();
        for entry in index.iter() {
            Self::write_entry(&mut writer, entry, &mut body_hasher)?;
        }
        writer.write_all(&body_hasher.finalize().to_le_bytes())?;

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header<R: Read>(reader: &mut R) -> Result<IndexHeader, IndexStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                IndexStorageError::InvalidFormat("file is shorter than the header".to_string())
            }
            _ => IndexStorageError::Io(e),
        })?;

        if header_bytes[0..4] != MAGIC {
            return Err(IndexStorageError::InvalidFormat(
                "not an index file (bad magic)".to_string(),
            ));
        }

        // Checksum before trusting any field
        let stored_checksum = u32::from_le_bytes(read_array(&header_bytes, HEADER_CHECKSUM_OFFSET));
        let computed_checksum = crc32fast::hash(&header_bytes[0..HEADER_CHECKSUM_OFFSET]);
        if stored_checksum != computed_checksum {
            return Err(IndexStorageError::ChecksumMismatch);
        }

        let version = header_bytes[4];
        if version != FORMAT_VERSION {
            return Err(IndexStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let metric = Metric::from_tag(header_bytes[5]).ok_or_else(|| {
            IndexStorageError::InvalidFormat(format!("unknown metric tag {}", header_bytes[5]))
        })?;

        let model_id: [u8; 32] = read_array(&header_bytes, 6);
        let dimensions = u32::from_le_bytes(read_array(&header_bytes, 38));
        let capacity = u64::from_le_bytes(read_array(&header_bytes, 42));
        let entry_count = u64::from_le_bytes(read_array(&header_bytes, 50));

        let to_usize = |value: u64, field: &str| {
            usize::try_from(value).map_err(|_| {
                IndexStorageError::Corrupt(format!("{field} {value} does not fit in memory"))
            })
        };

        Ok(IndexHeader {
            version,
            metric,
            model_id,
            dimensions: dimensions as usize,
            capacity: to_usize(capacity, "capacity")?,
            entry_count: to_usize(entry_count, "entry count")?,
        })
    }

    /// Validate header against the running model.
    fn validate_header(
        header: &IndexHeader,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), IndexStorageError> {
        if header.model_id != *expected_model_id {
            return Err(IndexStorageError::ModelMismatch);
        }

        if header.dimensions != expected_dimensions {
            return Err(IndexStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions,
            });
        }

        Ok(())
    }

    fn write_header<W: Write>(
        writer: &mut W,
        metric: Metric,
        model_id: &[u8; 32],
        dimensions: u32,
        capacity: u64,
        entry_count: u64,
    ) -> Result<(), IndexStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0..4].copy_from_slice(&MAGIC);
        header_bytes[4] = FORMAT_VERSION;
        header_bytes[5] = metric.tag();
        header_bytes[6..38].copy_from_slice(model_id);
        header_bytes[38..42].copy_from_slice(&dimensions.to_le_bytes());
        header_bytes[42..50].copy_from_slice(&capacity.to_le_bytes());
        header_bytes[50..58].copy_from_slice(&entry_count.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..HEADER_CHECKSUM_OFFSET]);
        header_bytes[HEADER_CHECKSUM_OFFSET..HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_entry<R: Read>(
        reader: &mut R,
        dimensions: usize,
        hasher: &mut crc32fast::Hasher,
    ) -> Result<(CompoundId, Vec<f32>), IndexStorageError> {
        let mut id_bytes = [0u8; 8];
        reader.read_exact(&mut id_bytes)?;
        hasher.update(&id_bytes);
        let id = CompoundId::from_raw(u64::from_le_bytes(id_bytes));

        let mut embedding = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            let mut float_bytes = [0u8; 4];
            reader.read_exact(&mut float_bytes)?;
            hasher.update(&float_bytes);
            embedding.push(f32::from_le_bytes(float_bytes));
        }

        Ok((id, embedding))
    }

    fn write_entry<W: Write>(
        writer: &mut W,
        entry: &IndexEntry,
        hasher: &mut crc32fast::Hasher,
    ) -> Result<(), IndexStorageError> {
        let id_bytes = entry.id.get().to_le_bytes();
        writer.write_all(&id_bytes)?;
        hasher.update(&id_bytes);

        for &value in &entry.embedding {
            let float_bytes = value.to_le_bytes();
            writer.write_all(&float_bytes)?;
            hasher.update(&float_bytes);
        }

        Ok(())
    }
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}
