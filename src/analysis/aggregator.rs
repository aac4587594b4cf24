//! Detection aggregation across the target and its artifacts.
//!
//! This module folds every detection hit of one analysis into a detection set
//! and applies at most one breakpoint rewrite to the task options.

use super::rules::{Family, Package};
use crate::models::AnalysisResult;
use crate::options::{resolve_breakpoints, OptionString, Resolution};
use tracing::{debug, info};

/// Ordered, duplicate-free detection labels for one analysis.
///
/// Labels are named by the package that handles them, so a label left over
/// after package selection can run as a fallback job directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionSet {
    labels: Vec<Package>,
}

impl DetectionSet {
    /// Add a label. Returns false if it was already present.
    pub fn insert(&mut self, label: Package) -> bool {
        if self.contains(label) {
            return false;
        }
        self.labels.push(label);
        true
    }

    pub fn contains(&self, label: Package) -> bool {
        self.labels.contains(&label)
    }

    pub fn iter(&self) -> impl Iterator<Item = Package> + '_ {
        self.labels.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Everything the detection sources say about one analysis.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub detections: DetectionSet,
    /// The first successful breakpoint rewrite, if any.
    pub resolution: Option<Resolution>,
}

/// Scan all detection hits of `result` against the task's `options`.
pub fn aggregate(result: &AnalysisResult, options: &OptionString) -> Aggregation {
    let mut aggregation = Aggregation::default();

    for (source, hit) in result.detection_hits() {
        match hit.options() {
            Some(hit_options) => {
                if aggregation.resolution.is_some() {
                    debug!("Ignoring options of {} hit {}: already rewritten", source, hit.name);
                    continue;
                }

                if let Some(resolution) = resolve_breakpoints(options, hit_options, &hit.addresses)
                {
                    info!(
                        "Breakpoints from {} hit {} resolved: {}",
                        source, hit.name, resolution.options
                    );
                    aggregation.resolution = Some(resolution);
                }
            }
            None => {
                if let Some(family) = Family::from_hit_name(&hit.name) {
                    if aggregation.detections.insert(family.label()) {
                        debug!("Detected {} in {}", family.label(), source);
                    }
                }
            }
        }
    }

    aggregation
}
