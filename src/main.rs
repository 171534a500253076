use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use filler_match::config::Config;
use filler_match::semantic::{
    run_ingestion, EmbeddingModel, FillerResolver, FillerTable, IndexStorage, SearchResult,
    StageTimings,
};

mod cli;

#[derive(Serialize)]
struct QueryOutput<'a> {
    query: &'a str,
    #[serde(flatten)]
    result: SearchResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    timings: Option<StageTimings>,
}

fn base_path(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = arg {
        return Ok(path);
    }
    if let Ok(path) = std::env::var("FILLER_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("Could not determine home directory")?
        .context("Home directory path is empty")?;
    Ok(home.join(".local/share/filler-match"))
}

fn load_model(config: &Config) -> anyhow::Result<EmbeddingModel> {
    EmbeddingModel::new(
        &config.embedding.model,
        config.model_cache_dir(),
        config.embedding.show_download_progress,
        config.embedding.batch_size,
    )
    .with_context(|| format!("Failed to load embedding model {}", config.embedding.model))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FILLER_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let base_path = base_path(args.base_path)?;
    std::fs::create_dir_all(&base_path)
        .with_context(|| format!("Failed to create {}", base_path.display()))?;
    let config = Config::load_with(&base_path)?;

    match args.command {
        cli::Command::Ingest {} => {
            let model = load_model(&config)?;
            let report = run_ingestion(&config, &model)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        cli::Command::Query {
            mut texts,
            neighbors,
            stdin,
            timings,
        } => {
            if stdin {
                for line in std::io::stdin().lock().lines() {
                    let line = line.context("Failed to read stdin")?;
                    if !line.trim().is_empty() {
                        texts.push(line);
                    }
                }
            }
            if texts.is_empty() {
                bail!("Nothing to resolve, pass utterances as arguments or use --stdin");
            }

            let k = neighbors.unwrap_or(config.query.nearest_neighbors);
            let fillers = FillerTable::load_with(&base_path, &config.filler_table)?;
            let storage = IndexStorage::new(config.index_path());
            let resolver = FillerResolver::open(Arc::new(load_model(&config)?), &storage, Arc::new(fillers))
                .with_context(|| format!("Failed to open index {}", storage.path().display()))?;

            for text in &texts {
                let (result, stage_timings) = resolver.resolve_with_timings(text, k)?;
                let output = QueryOutput {
                    query: text,
                    result,
                    timings: timings.then_some(stage_timings),
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
        }

        cli::Command::Fillers {} => {
            let fillers = FillerTable::load_with(&base_path, &config.filler_table)?;
            print!("{}", fillers.to_yaml()?);
        }

        cli::Command::Inspect {} => {
            let storage = IndexStorage::new(config.index_path());
            if !storage.exists() {
                bail!("No index at {}, run ingest first", storage.path().display());
            }
            let header = match storage.verify() {
                Ok(header) => header,
                Err(e) if e.is_corruption() => {
                    bail!(
                        "Index at {} is corrupt ({}), run ingest to rebuild it",
                        storage.path().display(),
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            };
            println!("{}", serde_json::to_string_pretty(&header)?);
        }
    }

    Ok(())
}
