//! CLI argument parsing for the sazinka-import binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sazinka-import", about = "Partner job import and reconciliation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Source file and the profile that maps it
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Partner export (csv/tsv/txt or xlsx/xls/xlsb/ods)
    pub source: PathBuf,

    /// Mapping profile JSON document
    #[arg(long)]
    pub profile: PathBuf,

    /// Sheet to read from a spreadsheet source (default: first sheet)
    #[arg(long)]
    pub sheet: Option<String>,

    /// Field delimiter for delimited text (overrides IMPORT_CSV_DELIMITER)
    #[arg(long)]
    pub delimiter: Option<String>,

    /// JSON snapshot of the destination job store
    #[arg(long, default_value = "job-store.json")]
    pub store: PathBuf,
}

#[derive(Subcommand)]
pub enum Command {
    /// Reconcile the source against the job store
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Write changes; without this flag the run is a dry run
        #[arg(long)]
        apply: bool,

        /// Do not insert jobs the store does not know yet
        #[arg(long)]
        no_create: bool,

        /// Keep preview detail for live runs too
        #[arg(long)]
        verbose: bool,

        /// 0-based row to start from
        #[arg(long, default_value_t = 0)]
        start_row: usize,

        /// Process a single window of this many rows and report where to resume
        #[arg(long)]
        max_rows: Option<usize>,

        /// Rows per chunk (overrides IMPORT_CHUNK_SIZE)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Windows processed concurrently first (overrides IMPORT_PARALLEL_CHUNKS)
        #[arg(long)]
        parallel: Option<usize>,

        /// Write errors and warnings as CSV
        #[arg(long)]
        issues_csv: Option<PathBuf>,

        /// Write the whole run result as JSON
        #[arg(long)]
        result_json: Option<PathBuf>,
    },
    /// Check the profile against the source without reconciling
    Validate {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Map unmapped engineer identifiers by name and save the profile
    AutoMatch {
        #[command(flatten)]
        source: SourceArgs,

        /// Show what would be matched without saving the profile
        #[arg(long)]
        dry_run: bool,
    },
}
