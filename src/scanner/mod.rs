//! Analysis result discovery and loading.
//!
//! Results live either at explicit paths or under an analyses directory laid
//! out as `<dir>/<task id>/reports/report.json`.

use crate::config::ScannerConfig;
use crate::models::{AnalysisResult, ChildRecord};
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Name of the report file inside each analysis directory.
pub const REPORT_FILE_NAME: &str = "report.json";

/// Configuration for result discovery.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Directory names that are never descended into.
    pub excludes: Vec<String>,
    /// Maximum number of results to return.
    pub max_results: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::from(&ScannerConfig::default())
    }
}

impl From<&ScannerConfig> for ScanConfig {
    fn from(config: &ScannerConfig) -> Self {
        Self {
            excludes: config.excludes.clone(),
            max_results: config.max_results,
        }
    }
}

/// Finds stored analysis results under an analyses directory.
pub struct ResultScanner {
    config: ScanConfig,
    root: PathBuf,
}

impl ResultScanner {
    /// Create a new scanner rooted at `root`.
    pub fn new(root: PathBuf, config: ScanConfig) -> Self {
        Self { config, root }
    }

    /// Return every `reports/report.json` below the root, sorted by path.
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(anyhow::anyhow!(
                "Analyses directory not found: {}",
                self.root.display()
            ));
        }

        let mut found = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .max_depth(3)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !self.is_excluded(entry.file_name().to_str().unwrap_or(""))
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("Cannot read directory entry: {}", e);
                    continue;
                }
            };

            if entry.file_type().is_file() && self.matches(entry.path()) {
                found.push(entry.into_path());
            }
        }

        found.sort();
        if let Some(max) = self.config.max_results {
            found.truncate(max);
        }

        debug!("Found {} results under {}", found.len(), self.root.display());
        Ok(found)
    }

    /// Whether `path` is a report file in a `reports` directory.
    pub fn matches(&self, path: &Path) -> bool {
        let is_report = path.file_name().and_then(|n| n.to_str()) == Some(REPORT_FILE_NAME);
        let in_reports = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            == Some("reports");
        is_report && in_reports
    }

    fn is_excluded(&self, name: &str) -> bool {
        // Hidden directories
        if name.starts_with('.') {
            return true;
        }

        self.config.excludes.iter().any(|pattern| name == pattern)
    }
}

/// Read and parse one analysis result.
pub fn load_result(path: &Path) -> Result<AnalysisResult> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read result: {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse result: {}", path.display()))
}

/// Record `children` in the result file at `path`.
///
/// The file is re-read as plain JSON and only the `children` key is replaced,
/// so every other field keeps its original shape.
pub fn save_children(path: &Path, children: &[ChildRecord]) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read result: {}", path.display()))?;
    let mut record: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse result: {}", path.display()))?;

    let object = record
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("Result is not a JSON object: {}", path.display()))?;
    object.insert(
        "children".to_string(),
        serde_json::to_value(children).context("Failed to serialize children")?,
    );

    let content = serde_json::to_string_pretty(&record).context("Failed to serialize result")?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write result: {}", path.display()))
}

/// Resolve explicit paths and an optional analyses directory into one list.
///
/// Explicit paths that do not exist are reported and skipped. `config` only
/// applies to the directory scan.
pub fn collect_paths(
    explicit: &[PathBuf],
    analyses_dir: Option<&Path>,
    config: &ScanConfig,
) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    for path in explicit {
        if path.is_file() {
            paths.push(path.clone());
        } else {
            warn!("Result file not found: {}", path.display());
        }
    }

    if let Some(dir) = analyses_dir {
        let scanner = ResultScanner::new(dir.to_path_buf(), config.clone());
        for path in scanner.scan()? {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }

    Ok(paths)
}
