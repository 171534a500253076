use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding config.yaml, the filler table, corpus and index.
    /// Defaults to $FILLER_BASE_PATH, then ~/.local/share/filler-match
    #[clap(long, global = true)]
    pub base_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Embed pending corpus files and rebuild the index.
    ///
    /// Files are read from the source directory and moved to the processed
    /// directory once read.
    Ingest {},

    /// Resolve utterances to filler texts.
    Query {
        /// Utterances to resolve
        texts: Vec<String>,

        /// Number of nearest neighbours to return (defaults to config)
        #[clap(short = 'k', long)]
        neighbors: Option<usize>,

        /// Read one utterance per line from stdin
        #[clap(long, default_value = "false")]
        stdin: bool,

        /// Include per-stage timings in the output
        #[clap(long, default_value = "false")]
        timings: bool,
    },

    /// Print the filler table.
    Fillers {},

    /// Verify the persisted index and print its header.
    Inspect {},
}
