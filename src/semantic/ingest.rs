//! Corpus ingestion.
//!
//! Reads every `*.<extension>` file in the source directory, flattens the
//! records of all files into one sequence and assigns compound ids from each
//! record's position in that sequence. A file is moved to the processed
//! directory only after all of its records parsed and validated; until then
//! it stays in the source directory and will be picked up by the next run.
//!
//! The processed directory is the durable corpus: every index build reads
//! it whole, so records from earlier or failed runs are never dropped.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::semantic::codec::{self, CodecError, CompoundId};
use crate::semantic::preprocess::normalize_text;

/// Record as authored in corpus files.
#[derive(Debug, Clone, Deserialize)]
pub struct CorpusRecord {
    #[serde(rename = "pageContent")]
    pub page_content: String,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordMetadata {
    #[serde(rename = "fillerCategory", alias = "fillerID")]
    pub filler_category: i64,
}

/// Sequenced corpus entries and the files they came from.
#[derive(Debug, Default)]
pub struct IngestedCorpus {
    pub contents: Vec<String>,
    pub ids: Vec<CompoundId>,
    /// Files folded into the corpus, at their processed location
    pub processed_files: Vec<PathBuf>,
}

impl IngestedCorpus {
    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Assign flattened sequence positions to `entries`.
    fn sequence(entries: Vec<(String, u8)>, files: Vec<PathBuf>) -> Result<Self, IngestError> {
        let mut corpus = IngestedCorpus {
            contents: Vec::with_capacity(entries.len()),
            ids: Vec::with_capacity(entries.len()),
            processed_files: files,
        };

        for (position, (content, category)) in entries.into_iter().enumerate() {
            corpus.ids.push(codec::encode(position as u64, i64::from(category))?);
            corpus.contents.push(content);
        }

        Ok(corpus)
    }
}

/// A source file that could not be ingested.
#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: IngestError,
}

/// Errors that can occur during ingestion.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed corpus file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid record {record} in {path}: {reason}")]
    InvalidRecord {
        path: PathBuf,
        record: usize,
        reason: String,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("Id encoding failed: {0}")]
    Codec(#[from] CodecError),

    #[error("{} corpus file(s) could not be ingested: {}", .0.len(), describe_failures(.0))]
    FilesFailed(Vec<FileFailure>),
}

fn describe_failures(failures: &[FileFailure]) -> String {
    failures
        .iter()
        .map(|f| f.error.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// List files in `directory` with the given extension (case-insensitive,
/// without the leading dot), in filesystem enumeration order.
pub fn list_source_files(directory: &Path, extension: &str) -> Result<Vec<PathBuf>, IngestError> {
    let read_dir_error = |source| IngestError::ReadDir {
        path: directory.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory).map_err(read_dir_error)? {
        let path = entry.map_err(read_dir_error)?.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(extension))
            .unwrap_or(false);

        if matches && path.is_file() {
            files.push(path);
        }
    }

    Ok(files)
}

/// Parse and validate one corpus file. Returns normalised contents and
/// categories in file order.
pub fn parse_corpus_file(path: &Path) -> Result<Vec<(String, u8)>, IngestError> {
    let raw = std::fs::read_to_string(path).map_err(|source| IngestError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let records: Vec<CorpusRecord> =
        serde_json::from_str(&raw).map_err(|source| IngestError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;

    records
        .into_iter()
        .enumerate()
        .map(|(record, r)| {
            let invalid = |reason: String| IngestError::InvalidRecord {
                path: path.to_path_buf(),
                record,
                reason,
            };

            let category = codec::validate_category(r.metadata.filler_category)
                .map_err(|e| invalid(e.to_string()))?;
            let content = normalize_text(&r.page_content)
                .ok_or_else(|| invalid("pageContent is empty".to_string()))?;

            Ok((content, category))
        })
        .collect()
}

/// First free name for `path` inside `processed_dir`: the file's own name,
/// else `<stem>.<n>.<ext>`.
fn processed_destination(path: &Path, processed_dir: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?;
    let destination = processed_dir.join(file_name);
    if !destination.exists() {
        return Some(destination);
    }

    let stem = path.file_stem()?.to_string_lossy();
    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    (1u64..)
        .map(|n| processed_dir.join(format!("{stem}.{n}{extension}")))
        .find(|candidate| !candidate.exists())
}

/// Move `path` into `processed_dir` without replacing an earlier file of the
/// same name. Callers hold the ingestion lock, so the free name cannot be
/// taken between the check and the rename.
fn move_to_processed(path: &Path, processed_dir: &Path) -> Result<PathBuf, IngestError> {
    let destination = processed_destination(path, processed_dir).ok_or_else(|| IngestError::Move {
        from: path.to_path_buf(),
        to: processed_dir.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
    })?;

    // rename is atomic within a filesystem: the file is either still in the
    // source directory or fully in the processed one
    std::fs::rename(path, &destination).map_err(|source| IngestError::Move {
        from: path.to_path_buf(),
        to: destination.clone(),
        source,
    })?;

    Ok(destination)
}

/// Ingest all matching files from `source_dir`.
///
/// Every well-formed file is folded into the corpus and moved to
/// `processed_dir`. Files that fail to read, parse, validate or move are
/// left in place; if there are any, the run fails with
/// [`IngestError::FilesFailed`] after the remaining files were handled.
pub fn ingest(
    source_dir: &Path,
    processed_dir: &Path,
    extension: &str,
) -> Result<IngestedCorpus, IngestError> {
    let files = list_source_files(source_dir, extension)?;
    log::info!("Found {} corpus file(s) in {}", files.len(), source_dir.display());

    if !files.is_empty() {
        std::fs::create_dir_all(processed_dir).map_err(|source| IngestError::Move {
            from: source_dir.to_path_buf(),
            to: processed_dir.to_path_buf(),
            source,
        })?;
    }

    let mut entries: Vec<(String, u8)> = Vec::new();
    let mut processed_files = Vec::new();
    let mut failures = Vec::new();

    for path in files {
        let parsed = match parse_corpus_file(&path) {
            Ok(parsed) => parsed,
            Err(error) => {
                log::error!("{}", error);
                failures.push(FileFailure { path, error });
                continue;
            }
        };

        // Records join the corpus only once their file has left the source
        // directory, so a failed move cannot index a file twice across runs.
        match move_to_processed(&path, processed_dir) {
            Ok(destination) => {
                log::debug!("Read {} record(s) from {}", parsed.len(), path.display());
                entries.extend(parsed);
                processed_files.push(destination);
            }
            Err(error) => {
                log::error!("{}", error);
                failures.push(FileFailure { path, error });
            }
        }
    }

    if !failures.is_empty() {
        return Err(IngestError::FilesFailed(failures));
    }

    IngestedCorpus::sequence(entries, processed_files)
}

/// Read the whole processed corpus, in file name order.
///
/// These files were validated when they were moved, so any failure here
/// aborts the read. A missing directory is an empty corpus.
pub fn load_processed(processed_dir: &Path, extension: &str) -> Result<IngestedCorpus, IngestError> {
    if !processed_dir.exists() {
        return Ok(IngestedCorpus::default());
    }

    let mut files = list_source_files(processed_dir, extension)?;
    files.sort();

    let mut entries = Vec::new();
    for path in &files {
        entries.extend(parse_corpus_file(path)?);
    }
    log::debug!(
        "Read {} processed entries from {} file(s)",
        entries.len(),
        files.len()
    );

    IngestedCorpus::sequence(entries, files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_list_source_files_filters_extension() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", "[]");
        write(dir.path(), "b.JSON", "[]");
        write(dir.path(), "c.txt", "[]");
        std::fs::create_dir(dir.path().join("d.json")).unwrap();

        let mut names: Vec<String> = list_source_files(dir.path(), "json")
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.json", "b.JSON"]);
    }

    #[test]
    fn test_parse_accepts_filler_id_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "a.json",
            r#"[{"pageContent": "  so   um ", "metadata": {"fillerID": 3, "source": "x"}},
                {"pageContent": "right", "metadata": {"fillerCategory": 4}}]"#,
        );

        let parsed = parse_corpus_file(&path).unwrap();
        assert_eq!(parsed, vec![("so um".to_string(), 3), ("right".to_string(), 4)]);
    }

    #[test]
    fn test_parse_missing_category_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.json", r#"[{"pageContent": "x", "metadata": {}}]"#);
        assert!(matches!(parse_corpus_file(&path), Err(IngestError::Malformed { .. })));
    }

    #[test]
    fn test_parse_missing_content_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.json", r#"[{"metadata": {"fillerCategory": 1}}]"#);
        assert!(matches!(parse_corpus_file(&path), Err(IngestError::Malformed { .. })));
    }

    #[test]
    fn test_parse_rejects_out_of_range_category() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "a.json",
            r#"[{"pageContent": "ok", "metadata": {"fillerCategory": 1}},
                {"pageContent": "bad", "metadata": {"fillerCategory": 100}}]"#,
        );
        assert!(matches!(
            parse_corpus_file(&path),
            Err(IngestError::InvalidRecord { record: 1, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_blank_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "a.json",
            r#"[{"pageContent": " \n ", "metadata": {"fillerCategory": 1}}]"#,
        );
        assert!(matches!(
            parse_corpus_file(&path),
            Err(IngestError::InvalidRecord { record: 0, .. })
        ));
    }

    #[test]
    fn test_ingest_flattens_positions_across_files() {
        let source = tempfile::tempdir().unwrap();
        let processed = tempfile::tempdir().unwrap();
        write(
            source.path(),
            "a.json",
            r#"[{"pageContent": "one", "metadata": {"fillerCategory": 5}},
                {"pageContent": "two", "metadata": {"fillerCategory": 7}}]"#,
        );
        write(
            source.path(),
            "b.json",
            r#"[{"pageContent": "three", "metadata": {"fillerCategory": 5}}]"#,
        );

        let corpus = ingest(source.path(), processed.path(), "json").unwrap();

        assert_eq!(corpus.len(), 3);
        let positions: Vec<u64> = corpus.ids.iter().map(|id| id.sequence_position()).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        for (content, id) in corpus.contents.iter().zip(corpus.ids.iter()) {
            let expected = match content.as_str() {
                "one" | "three" => 5,
                "two" => 7,
                other => panic!("unexpected content {other}"),
            };
            assert_eq!(id.category(), expected);
        }
        assert_eq!(corpus.processed_files.len(), 2);
        assert!(list_source_files(source.path(), "json").unwrap().is_empty());
    }

    #[test]
    fn test_ingest_keeps_earlier_file_with_same_name() {
        let source = tempfile::tempdir().unwrap();
        let processed = tempfile::tempdir().unwrap();

        write(
            source.path(),
            "batch.json",
            r#"[{"pageContent": "yeah", "metadata": {"fillerCategory": 8}}]"#,
        );
        ingest(source.path(), processed.path(), "json").unwrap();

        write(
            source.path(),
            "batch.json",
            r#"[{"pageContent": "hmm", "metadata": {"fillerCategory": 0}}]"#,
        );
        let second = ingest(source.path(), processed.path(), "json").unwrap();
        assert_eq!(second.processed_files, vec![processed.path().join("batch.1.json")]);

        write(
            source.path(),
            "batch.json",
            r#"[{"pageContent": "right", "metadata": {"fillerCategory": 2}}]"#,
        );
        let third = ingest(source.path(), processed.path(), "json").unwrap();
        assert_eq!(third.processed_files, vec![processed.path().join("batch.2.json")]);

        let first = parse_corpus_file(&processed.path().join("batch.json")).unwrap();
        assert_eq!(first, vec![("yeah".to_string(), 8)]);

        let all = load_processed(processed.path(), "json").unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_load_processed_sequences_all_files() {
        let processed = tempfile::tempdir().unwrap();
        write(
            processed.path(),
            "b.json",
            r#"[{"pageContent": "three", "metadata": {"fillerCategory": 1}}]"#,
        );
        write(
            processed.path(),
            "a.json",
            r#"[{"pageContent": "one", "metadata": {"fillerCategory": 5}},
                {"pageContent": "two", "metadata": {"fillerCategory": 7}}]"#,
        );

        let corpus = load_processed(processed.path(), "json").unwrap();

        assert_eq!(corpus.contents, vec!["one", "two", "three"]);
        let ids: Vec<u64> = corpus.ids.iter().map(|id| id.get()).collect();
        assert_eq!(ids, vec![5, 107, 201]);
        assert_eq!(
            corpus.processed_files,
            vec![processed.path().join("a.json"), processed.path().join("b.json")]
        );
    }

    #[test]
    fn test_load_processed_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = load_processed(&dir.path().join("processed"), "json").unwrap();
        assert!(corpus.is_empty());
    }

    #[test]
    fn test_ingest_empty_directory() {
        let source = tempfile::tempdir().unwrap();
        let processed = source.path().join("processed");

        let corpus = ingest(source.path(), &processed, "json").unwrap();
        assert!(corpus.is_empty());
        assert!(!processed.exists());
    }

    #[test]
    fn test_ingest_missing_source_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = ingest(&dir.path().join("nope"), &dir.path().join("done"), "json");
        assert!(matches!(result, Err(IngestError::ReadDir { .. })));
    }
}
