//! Markdown and JSON report generation.
//!
//! This module renders a [`BatchReport`] for humans or for further tooling.

use super::{BatchReport, BatchSummary, LoadFailure, ReportMetadata};
use crate::orchestrator::{Decision, Outcome};
use anyhow::Result;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &BatchReport) -> String {
    let mut output = String::new();

    output.push_str("# Resubmission Report\n\n");

    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_summary_section(&report.summary));
    output.push_str(&generate_submissions_section(&report.outcomes));
    output.push_str(&generate_rejections_section(&report.outcomes));
    output.push_str(&generate_failures_section(&report.failures));

    output
}

fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Task API:** {}\n", metadata.api_url));
    if metadata.dry_run {
        section.push_str("- **Mode:** dry run (nothing submitted)\n");
    }
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

fn generate_summary_section(summary: &BatchSummary) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str("| Processed | Rejected | Breakpoints | Selected | Fallback | Failed |\n");
    section.push_str("|:---:|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | {} | {} |\n\n",
        summary.processed,
        summary.rejected,
        summary.breakpoints,
        summary.selected,
        summary.fallback,
        summary.failed
    ));
    section.push_str(&format!(
        "**{}** follow-up tasks requested, **{}** accepted.\n\n",
        summary.submitted, summary.children
    ));

    section
}

/// One row per result that asked for at least one follow-up task.
fn generate_submissions_section(outcomes: &[Outcome]) -> String {
    let submitted: Vec<_> = outcomes.iter().filter(|o| o.submitted > 0).collect();
    if submitted.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Submissions\n\n");
    section.push_str("| Task | Decision | Detections | Children |\n");
    section.push_str("|:---|:---|:---|:---|\n");

    for outcome in submitted {
        let children = if outcome.children.is_empty() {
            "-".to_string()
        } else {
            outcome
                .children
                .iter()
                .map(|c| format!("{} ({})", c.task_id, c.package))
                .collect::<Vec<_>>()
                .join(", ")
        };

        section.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            outcome.task_id,
            describe_decision(&outcome.decision),
            outcome.detections.join(", "),
            children
        ));
    }
    section.push('\n');

    section
}

fn generate_rejections_section(outcomes: &[Outcome]) -> String {
    let rejected: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o.decision {
            Decision::Rejected { ref reason } => Some((o.task_id, reason)),
            _ => None,
        })
        .collect();

    if rejected.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Not Resubmitted\n\n");
    for (task_id, reason) in rejected {
        section.push_str(&format!("- **{}**: {}\n", task_id, reason));
    }
    section.push('\n');

    section
}

fn generate_failures_section(failures: &[LoadFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Failures\n\n");
    for failure in failures {
        section.push_str(&format!(
            "- `{}`: {}\n",
            failure.path.display(),
            failure.error
        ));
    }
    section.push('\n');

    section
}

fn describe_decision(decision: &Decision) -> String {
    match decision {
        Decision::Rejected { .. } => "rejected".to_string(),
        Decision::Breakpoints { slots } => {
            let slots: Vec<String> = slots
                .iter()
                .map(|(slot, address)| format!("bp{}={:#x}", slot, address))
                .collect();
            format!("breakpoints {}", slots.join(" "))
        }
        Decision::Selected { package } => format!("selected `{}`", package),
        Decision::Fallback { labels } => format!("fallback x{}", labels.len()),
    }
}

/// Generate a JSON report.
pub fn generate_json_report(report: &BatchReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChildRecord;
    use chrono::Utc;
    use std::path::PathBuf;

    fn create_test_report() -> BatchReport {
        let metadata = ReportMetadata {
            generated_at: Utc::now(),
            api_url: "http://127.0.0.1:8000".to_string(),
            dry_run: false,
            duration_seconds: 1.5,
        };

        let outcomes = vec![
            Outcome {
                task_id: 12,
                decision: Decision::Selected {
                    package: "Hancitor_doc".to_string(),
                },
                detections: vec!["Hancitor".to_string()],
                submitted: 1,
                children: vec![ChildRecord::new(40, "Hancitor_doc")],
            },
            Outcome {
                task_id: 3,
                decision: Decision::Rejected {
                    reason: "task was itself an automatic resubmission".to_string(),
                },
                detections: Vec::new(),
                submitted: 0,
                children: Vec::new(),
            },
            Outcome {
                task_id: 7,
                decision: Decision::Breakpoints {
                    slots: vec![(0, 0x401000)],
                },
                detections: Vec::new(),
                submitted: 1,
                children: Vec::new(),
            },
        ];

        let failures = vec![LoadFailure {
            path: PathBuf::from("/analyses/9/reports/report.json"),
            error: "Failed to parse result".to_string(),
        }];

        BatchReport::new(metadata, outcomes, failures)
    }

    #[test]
    fn test_outcomes_sorted_and_counted() {
        let report = create_test_report();
        let ids: Vec<_> = report.outcomes.iter().map(|o| o.task_id).collect();
        assert_eq!(ids, vec![3, 7, 12]);

        assert_eq!(report.summary.processed, 3);
        assert_eq!(report.summary.rejected, 1);
        assert_eq!(report.summary.breakpoints, 1);
        assert_eq!(report.summary.selected, 1);
        assert_eq!(report.summary.submitted, 2);
        assert_eq!(report.summary.children, 1);
        assert_eq!(report.summary.failed, 1);
    }

    #[test]
    fn test_generate_markdown_report() {
        let report = create_test_report();
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# Resubmission Report"));
        assert!(markdown.contains("## Summary"));
        assert!(markdown.contains("| 12 | selected `Hancitor_doc` | Hancitor | 40 (Hancitor_doc) |"));
        assert!(markdown.contains("| 7 | breakpoints bp0=0x401000 |  | - |"));
        assert!(markdown.contains("## Not Resubmitted"));
        assert!(markdown.contains("- **3**: task was itself"));
        assert!(markdown.contains("## Failures"));
    }

    #[test]
    fn test_empty_sections_are_omitted() {
        let report = BatchReport::new(
            ReportMetadata {
                generated_at: Utc::now(),
                api_url: String::new(),
                dry_run: true,
                duration_seconds: 0.0,
            },
            Vec::new(),
            Vec::new(),
        );
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("dry run"));
        assert!(!markdown.contains("## Submissions"));
        assert!(!markdown.contains("## Not Resubmitted"));
        assert!(!markdown.contains("## Failures"));
    }

    #[test]
    fn test_generate_json_report() {
        let report = create_test_report();
        let json = generate_json_report(&report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["summary"]["processed"], 3);
        assert_eq!(value["outcomes"][2]["decision"]["kind"], "selected");
        assert_eq!(value["outcomes"][2]["children"][0][0], 40);
    }
}
