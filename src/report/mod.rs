//! Batch summary reports.

pub mod generator;

pub use generator::{generate_json_report, generate_markdown_report};

use crate::orchestrator::{Decision, Outcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Summary of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub metadata: ReportMetadata,
    pub summary: BatchSummary,
    pub outcomes: Vec<Outcome>,
    pub failures: Vec<LoadFailure>,
}

/// Run metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    pub api_url: String,
    pub dry_run: bool,
    pub duration_seconds: f64,
}

/// A result that could not be read or written.
#[derive(Debug, Clone, Serialize)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Counts per decision branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub rejected: usize,
    pub breakpoints: usize,
    pub selected: usize,
    pub fallback: usize,
    pub submitted: usize,
    pub children: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[Outcome], failures: &[LoadFailure]) -> Self {
        let mut summary = BatchSummary {
            processed: outcomes.len(),
            failed: failures.len(),
            ..Default::default()
        };

        for outcome in outcomes {
            match outcome.decision {
                Decision::Rejected { .. } => summary.rejected += 1,
                Decision::Breakpoints { .. } => summary.breakpoints += 1,
                Decision::Selected { .. } => summary.selected += 1,
                Decision::Fallback { .. } => summary.fallback += 1,
            }
            summary.submitted += outcome.submitted;
            summary.children += outcome.children.len();
        }

        summary
    }
}

impl BatchReport {
    pub fn new(metadata: ReportMetadata, mut outcomes: Vec<Outcome>, failures: Vec<LoadFailure>) -> Self {
        // Concurrent processing finishes in any order.
        outcomes.sort_by_key(|o| o.task_id);
        let summary = BatchSummary::from_outcomes(&outcomes, &failures);

        Self {
            metadata,
            summary,
            outcomes,
            failures,
        }
    }
}
