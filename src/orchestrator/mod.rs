//! Resubmission orchestration.
//!
//! This module turns finished analyses into follow-up task submissions.

pub mod resubmit;
pub mod submit;

pub use resubmit::{Decision, Orchestrator, OrchestratorConfig, Outcome};
pub use submit::{DryRunSubmitter, HttpSubmitter, TaskSubmitter};
