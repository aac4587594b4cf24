//! Resubmission of finished analyses.
//!
//! One [`Orchestrator::process`] call handles one finished result:
//! guard checks, detection aggregation with breakpoint resolution, the
//! option-aware guard, package selection, submission and write-back of the
//! child tasks. All working state is local to the call, so any number of
//! results can be processed concurrently with the same orchestrator.

use crate::analysis::{
    aggregate, select_package, DetectionSet, LoopGuard, Package, ParentPackage, Rejection,
};
use crate::config::ResubmitConfig;
use crate::models::{AnalysisResult, ChildRecord, TaskId, TaskSpec};
use crate::options::{BreakpointSlot, OptionString};
use crate::orchestrator::submit::TaskSubmitter;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Settings the orchestrator reads for every result.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Report section that disables resubmission for a result.
    pub keyword: Option<String>,
    /// Filename fragments of internal test samples.
    pub skip_filenames: Vec<String>,
    /// Route submissions through the distributed server.
    pub distributed: bool,
    /// Distributed server URL.
    pub server_url: String,
}

impl From<&ResubmitConfig> for OrchestratorConfig {
    fn from(config: &ResubmitConfig) -> Self {
        Self {
            keyword: Some(config.keyword.clone()),
            skip_filenames: config.skip_filenames.clone(),
            distributed: config.distributed,
            server_url: config.url.clone(),
        }
    }
}

/// Which branch of the decision was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    /// No follow-up allowed.
    Rejected { reason: String },
    /// Same package again, with resolved breakpoints.
    Breakpoints { slots: Vec<(usize, u64)> },
    /// A family package was selected.
    Selected { package: String },
    /// One dumper job per remaining detection label.
    Fallback { labels: Vec<String> },
}

impl Decision {
    fn rejected(rejection: Rejection) -> Self {
        info!("No resubmission: {}", rejection);
        Decision::Rejected {
            reason: rejection.to_string(),
        }
    }
}

/// The submissions one result calls for.
#[derive(Debug, Clone)]
pub struct Plan {
    pub decision: Decision,
    pub detections: DetectionSet,
    pub specs: Vec<TaskSpec>,
}

impl Plan {
    fn rejected(rejection: Rejection, detections: DetectionSet) -> Self {
        Self {
            decision: Decision::rejected(rejection),
            detections,
            specs: Vec::new(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.decision, Decision::Rejected { .. })
    }
}

/// What happened to one result.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub task_id: TaskId,
    pub decision: Decision,
    pub detections: Vec<String>,
    pub submitted: usize,
    pub children: Vec<ChildRecord>,
}

/// Parent linkage for submitted tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Lineage {
    parent_id: TaskId,
    tag: String,
}

impl Lineage {
    fn of(result: &AnalysisResult) -> Self {
        let info = &result.info;
        let parent_id = info.options.main_task_id().unwrap_or(info.id);

        let mut tag = format!("Parent_Task_ID:{}", info.id);
        if let Some(custom) = info.custom.as_deref().filter(|c| !c.is_empty()) {
            tag.push_str(&format!(" Parent_Custom:{}", custom));
        }

        Self { parent_id, tag }
    }
}

/// Decides and submits follow-up tasks for finished analyses.
pub struct Orchestrator<S> {
    config: OrchestratorConfig,
    guard: LoopGuard,
    submitter: S,
}

impl<S: TaskSubmitter> Orchestrator<S> {
    pub fn new(config: OrchestratorConfig, submitter: S) -> Self {
        let guard = LoopGuard::new(config.keyword.clone(), config.skip_filenames.clone());
        Self {
            config,
            guard,
            submitter,
        }
    }

    /// Decide on follow-up tasks for `result` and submit them.
    ///
    /// Every task that got an id is recorded in `result.children`. Failed
    /// submissions are logged and skipped; the remaining ones still run.
    pub async fn process(&self, result: &mut AnalysisResult) -> Outcome {
        let plan = self.plan(result);
        let mut children = Vec::new();

        for spec in &plan.specs {
            match self.submitter.submit(spec).await {
                Ok(Some(task_id)) => {
                    info!(
                        "Submitted task {} with package {} for parent {}",
                        task_id, spec.package, spec.parent_id
                    );
                    children.push(ChildRecord::new(task_id, spec.package.clone()));
                }
                Ok(None) => {
                    warn!(
                        "No task id returned for package {} of task {}",
                        spec.package, result.info.id
                    );
                }
                Err(e) => {
                    warn!(
                        "Submitting package {} for task {} failed: {}",
                        spec.package, result.info.id, e
                    );
                }
            }
        }

        if !plan.is_rejected() {
            result.children = Some(children.clone());
        }

        Outcome {
            task_id: result.info.id,
            decision: plan.decision,
            detections: plan.detections.iter().map(|p| p.to_string()).collect(),
            submitted: plan.specs.len(),
            children,
        }
    }

    /// Work out which tasks `result` calls for without submitting anything.
    pub fn plan(&self, result: &AnalysisResult) -> Plan {
        debug!("Planning resubmission for task {}", result.info.id);

        if let Err(rejection) = self.guard.check_result(result) {
            return Plan::rejected(rejection, DetectionSet::default());
        }

        let parent = ParentPackage::parse(result.info.package_name());
        let options = &result.info.options;
        let aggregation = aggregate(result, options);
        let mut detections = aggregation.detections;

        if let Some(resolution) = aggregation.resolution {
            if let Err(rejection) = self.guard.check_breakpoint_path(&parent) {
                return Plan::rejected(rejection, detections);
            }

            let spec = self.task_spec(result, parent.name(), resolution.options);
            return Plan {
                decision: Decision::Breakpoints {
                    slots: resolution
                        .assignments
                        .iter()
                        .map(|(slot, address)| (BreakpointSlot::index(*slot), *address))
                        .collect(),
                },
                detections,
                specs: vec![spec],
            };
        }

        if let Err(rejection) = self.guard.check_selection_path(options) {
            return Plan::rejected(rejection, detections);
        }

        let selected = select_package(&mut detections, result.signatures.as_deref(), &parent);

        // Follow-up tasks never take automatic process dumps.
        let mut child_options = options.clone();
        child_options.disable("procdump");

        match selected {
            Some(package) if !parent.is(package) => {
                info!(
                    "Task {} ({}) selected for {}",
                    result.info.id,
                    parent.name(),
                    package
                );
                let spec = self.task_spec(result, package.name(), child_options);
                Plan {
                    decision: Decision::Selected {
                        package: package.to_string(),
                    },
                    detections,
                    specs: vec![spec],
                }
            }
            _ => {
                if let Err(rejection) = self.guard.check_fallback(&parent) {
                    return Plan::rejected(rejection, detections);
                }

                let labels: Vec<Package> = detections.iter().collect();
                let specs = labels
                    .iter()
                    .map(|label| self.task_spec(result, label.name(), child_options.clone()))
                    .collect();

                Plan {
                    decision: Decision::Fallback {
                        labels: labels.iter().map(|l| l.to_string()).collect(),
                    },
                    detections,
                    specs,
                }
            }
        }
    }

    fn task_spec(&self, result: &AnalysisResult, package: &str, options: OptionString) -> TaskSpec {
        let info = &result.info;
        let lineage = Lineage::of(result);

        TaskSpec {
            target: result.target_path().unwrap_or_default().to_string(),
            package: package.to_string(),
            timeout: info.timeout,
            options,
            // Expedite the follow-up ahead of the general queue.
            priority: info.priority.saturating_add(1),
            machine: info.machine.clone(),
            platform: info.platform.clone(),
            memory: info.memory,
            enforce_timeout: info.enforce_timeout,
            parent_id: lineage.parent_id,
            tlp: info.tlp.clone(),
            custom: Some(lineage.tag),
            distributed: self.config.distributed,
            filename: result.file_name().to_string(),
            server_url: self.config.server_url.clone(),
        }
    }
}
