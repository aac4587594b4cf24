//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// retriage - automatic re-triage of finished sandbox analyses
///
/// Reads finished analysis results, decides whether each one deserves a
/// follow-up task (breakpoint rerun, family package, or unpacker/dumper
/// jobs) and submits those tasks to the sandbox task API.
///
/// Examples:
///   retriage /opt/sandbox/storage/analyses/42/reports/report.json
///   retriage --analyses-dir /opt/sandbox/storage/analyses --dry-run
///   retriage --analyses-dir ./analyses --in-place --format json -o summary.json
///   retriage --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Analysis result files (report.json) to process
    #[arg(value_name = "RESULT")]
    pub results: Vec<PathBuf>,

    /// Directory holding one sub-directory per finished analysis
    ///
    /// Every <DIR>/<id>/reports/report.json below it is processed.
    #[arg(short, long, value_name = "DIR", env = "RETRIAGE_ANALYSES_DIR")]
    pub analyses_dir: Option<PathBuf>,

    /// Decide and log follow-up tasks without submitting anything
    #[arg(long)]
    pub dry_run: bool,

    /// Write child task records back into each result file
    #[arg(long)]
    pub in_place: bool,

    /// Write the batch summary to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format for the batch summary (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Path to configuration file
    ///
    /// If not specified, looks for .retriage.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Task API base URL
    #[arg(long, value_name = "URL", env = "RETRIAGE_API_URL")]
    pub api_url: Option<String>,

    /// Task API token
    #[arg(long, value_name = "TOKEN", env = "RETRIAGE_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Route follow-up tasks through the distributed server
    #[arg(long)]
    pub distributed: bool,

    /// Distributed server URL
    #[arg(long, value_name = "URL")]
    pub server_url: Option<String>,

    /// Number of results processed concurrently
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Process at most this many results from --analyses-dir
    #[arg(long, value_name = "NUM")]
    pub max_results: Option<usize>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Generate a default .retriage.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the batch summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.results.is_empty() && self.analyses_dir.is_none() {
            return Err("Give at least one result file or --analyses-dir".to_string());
        }

        if let Some(ref url) = self.api_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("API URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if let Some(ref url) = self.server_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Server URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.max_results == Some(0) {
            return Err("Max results must be at least 1".to_string());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        if let Some(ref dir) = self.analyses_dir {
            if !dir.is_dir() {
                return Err(format!(
                    "Analyses directory does not exist: {}",
                    dir.display()
                ));
            }
        }

        Ok(())
    }
}
