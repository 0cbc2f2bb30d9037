//! Configuration management

use std::path::PathBuf;

use anyhow::{self, Context, Result};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Rows per chunk
    pub chunk_size: usize,

    /// Windows dispatched concurrently before continuing sequentially (0 = sequential)
    pub parallel_chunks: usize,

    /// Rows per fetch while the engineer gate scans the source
    pub gate_page_size: usize,

    /// Errors/warnings shown inline; full lists go to the export
    pub error_display_limit: usize,

    /// Field delimiter for delimited text sources
    pub csv_delimiter: u8,

    /// Directory for rolling log files
    pub logs_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            parallel_chunks: 0,
            gate_page_size: 1000,
            error_display_limit: 50,
            csv_delimiter: b',',
            logs_dir: PathBuf::from("../logs"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let chunk_size = parse_usize(&lookup, "IMPORT_CHUNK_SIZE", defaults.chunk_size)?;
        if chunk_size == 0 {
            anyhow::bail!("IMPORT_CHUNK_SIZE must be greater than zero");
        }

        let parallel_chunks =
            parse_usize(&lookup, "IMPORT_PARALLEL_CHUNKS", defaults.parallel_chunks)?;

        let gate_page_size = parse_usize(&lookup, "IMPORT_GATE_PAGE_SIZE", defaults.gate_page_size)?;
        if gate_page_size == 0 {
            anyhow::bail!("IMPORT_GATE_PAGE_SIZE must be greater than zero");
        }

        let error_display_limit = parse_usize(
            &lookup,
            "IMPORT_ERROR_DISPLAY_LIMIT",
            defaults.error_display_limit,
        )?;

        let csv_delimiter = match lookup("IMPORT_CSV_DELIMITER") {
            Some(raw) => parse_delimiter(&raw).context("IMPORT_CSV_DELIMITER")?,
            None => defaults.csv_delimiter,
        };

        let logs_dir = lookup("LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.logs_dir);

        Ok(Self {
            chunk_size,
            parallel_chunks,
            gate_page_size,
            error_display_limit,
            csv_delimiter,
            logs_dir,
        })
    }

    /// Create the log directory if it does not exist yet
    pub fn ensure_logs_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.logs_dir)
            .with_context(|| format!("Failed to create log directory {}", self.logs_dir.display()))
    }
}

fn parse_usize<F>(lookup: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, raw)),
        None => Ok(default),
    }
}

/// Single ASCII character, or the words `tab` / `\t`
pub fn parse_delimiter(raw: &str) -> Result<u8> {
    match raw {
        "tab" | "\\t" | "\t" => return Ok(b'\t'),
        _ => {}
    }
    let raw = raw.trim();
    match raw.as_bytes() {
        [byte] if byte.is_ascii() => Ok(*byte),
        _ => anyhow::bail!("delimiter must be a single ASCII character, got '{}'", raw),
    }
}
