//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.retriage.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = ".retriage.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Resubmission settings.
    #[serde(default)]
    pub resubmit: ResubmitConfig,

    /// Task API settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Result discovery settings.
    #[serde(default)]
    pub scanner: ScannerConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Number of results processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

impl GeneralConfig {
    /// Log level for these settings. `quiet` wins over `verbose`.
    pub fn log_level(&self, quiet: bool) -> tracing::Level {
        if quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

/// Resubmission behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResubmitConfig {
    /// Report section that hands a result to a custom extractor instead.
    #[serde(default = "default_keyword")]
    pub keyword: String,

    /// Route follow-up tasks through the distributed server.
    #[serde(default)]
    pub distributed: bool,

    /// Distributed server URL, passed verbatim with every submission.
    #[serde(default)]
    pub url: String,

    /// Filename fragments of internal test samples that are never resubmitted.
    #[serde(default = "default_skip_filenames")]
    pub skip_filenames: Vec<String>,
}

impl Default for ResubmitConfig {
    fn default() -> Self {
        Self {
            keyword: default_keyword(),
            distributed: false,
            url: String::new(),
            skip_filenames: default_skip_filenames(),
        }
    }
}

fn default_keyword() -> String {
    "tr_extractor".to_string()
}

fn default_skip_filenames() -> Vec<String> {
    vec!["_test_00", "danabot"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Task submission API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the task API.
    #[serde(default = "default_api_url")]
    pub url: String,

    /// API token, sent as `Authorization: Token <token>`.
    #[serde(default)]
    pub token: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            token: None,
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_api_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Analyses directory scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Directory names never descended into.
    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,

    /// Stop after this many results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            excludes: default_excludes(),
            max_results: None,
        }
    }
}

fn default_excludes() -> Vec<String> {
    vec!["files", "memory", "shots", "CAPE", "procdump", "selfextracted"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        Self::load_from_dir(Path::new("."))
    }

    /// Try to load `.retriage.toml` from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            Ok(Some(Self::load(&config_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref url) = args.api_url {
            self.api.url = url.clone();
        }
        if let Some(ref token) = args.api_token {
            self.api.token = Some(token.clone());
        }
        if let Some(timeout) = args.timeout {
            self.api.timeout_seconds = timeout;
        }

        if args.distributed {
            self.resubmit.distributed = true;
        }
        if let Some(ref url) = args.server_url {
            self.resubmit.url = url.clone();
        }

        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = concurrency;
        }
        if let Some(max) = args.max_results {
            self.scanner.max_results = Some(max);
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
