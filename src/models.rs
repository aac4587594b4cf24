//! Data models for finished analyses and resubmitted tasks.
//!
//! `AnalysisResult` mirrors the sandbox's JSON report. Every sub-field the
//! resubmission logic reads is optional; keys it does not know about are kept
//! in `extra` so a record can be written back unchanged apart from `children`.

use crate::options::OptionString;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier assigned by the task scheduler.
pub type TaskId = u64;

/// Treat an explicit JSON `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accept a machine either as its label or as the report's machine object.
fn machine_label<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Machine {
        Label(String),
        Details {
            #[serde(default)]
            label: Option<String>,
            #[serde(default)]
            name: Option<String>,
        },
    }

    Ok(match Option::<Machine>::deserialize(deserializer)? {
        Some(Machine::Label(label)) => Some(label),
        Some(Machine::Details { label, name }) => label.or(name),
        None => None,
    }
    .filter(|label| !label.is_empty()))
}

/// The record of one finished analysis job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Task settings of the finished job.
    #[serde(default, deserialize_with = "null_as_default")]
    pub info: TaskInfo,

    /// The analyzed sample.
    #[serde(default, deserialize_with = "null_as_default")]
    pub target: Target,

    /// Process memory dumps.
    #[serde(default, deserialize_with = "null_as_default")]
    pub procdump: Vec<Artifact>,

    /// Payloads and configs extracted during analysis.
    #[serde(rename = "CAPE", default, deserialize_with = "null_as_default")]
    pub extracted: Vec<Artifact>,

    /// Files dropped by the sample.
    #[serde(default, deserialize_with = "null_as_default")]
    pub dropped: Vec<Artifact>,

    /// Behavioral signatures, absent when the signature engine did not run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<Signature>>,

    /// Follow-up tasks submitted for this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ChildRecord>>,

    /// Every other report section.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnalysisResult {
    /// Name of the analyzed file.
    pub fn file_name(&self) -> &str {
        self.target.file.name.as_deref().unwrap_or("")
    }

    /// Stored path of the sample. A bare file name is not enough to resubmit.
    pub fn target_path(&self) -> Option<&str> {
        self.target.file.path.as_deref().filter(|p| !p.is_empty())
    }

    /// Whether a top-level report section with this key exists.
    pub fn has_section(&self, key: &str) -> bool {
        self.extra.contains_key(key)
    }

    /// Whether a config has already been extracted for this sample.
    pub fn has_extracted_config(&self) -> bool {
        self.extracted.iter().any(Artifact::has_config)
    }

    /// All detection hits in visiting order: target, dumps, extracted, dropped.
    pub fn detection_hits(&self) -> impl Iterator<Item = (HitSource, &DetectionHit)> {
        let target = self
            .target
            .file
            .cape_yara
            .iter()
            .map(|hit| (HitSource::Target, hit));

        let artifacts = [
            (HitSource::ProcessDump, &self.procdump),
            (HitSource::Extracted, &self.extracted),
            (HitSource::Dropped, &self.dropped),
        ]
        .into_iter()
        .flat_map(|(source, artifacts)| {
            artifacts
                .iter()
                .flat_map(move |a| a.cape_yara.iter().map(move |hit| (source, hit)))
        });

        target.chain(artifacts)
    }
}

/// Settings of the finished task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInfo {
    #[serde(default)]
    pub id: TaskId,

    /// Analysis package the task ran under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,

    /// Instrumentation options the task ran with.
    #[serde(default)]
    pub options: OptionString,

    /// Free-form tag set by the submitter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub priority: u32,

    #[serde(default, deserialize_with = "machine_label")]
    pub machine: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    /// Full memory dump requested.
    #[serde(default, deserialize_with = "null_as_default")]
    pub memory: bool,

    /// Analysis timeout in seconds.
    #[serde(default, deserialize_with = "null_as_default")]
    pub timeout: u64,

    #[serde(default, deserialize_with = "null_as_default")]
    pub enforce_timeout: bool,

    /// Traffic light protocol marking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlp: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskInfo {
    /// The package name, treating an empty string as absent.
    pub fn package_name(&self) -> Option<&str> {
        self.package.as_deref().filter(|p| !p.is_empty())
    }
}

/// The analyzed sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, deserialize_with = "null_as_default")]
    pub file: TargetFile,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub cape_yara: Vec<DetectionHit>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A file derived from the analysis (dump, extracted payload, dropped file).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub cape_yara: Vec<DetectionHit>,

    /// Malware configuration extracted from this artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cape_config: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Artifact {
    pub fn has_config(&self) -> bool {
        match &self.cape_config {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }
}

/// Where a detection hit was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    Target,
    ProcessDump,
    Extracted,
    Dropped,
}

impl fmt::Display for HitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HitSource::Target => write!(f, "target"),
            HitSource::ProcessDump => write!(f, "process dump"),
            HitSource::Extracted => write!(f, "extracted payload"),
            HitSource::Dropped => write!(f, "dropped file"),
        }
    }
}

/// One pattern-engine match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionHit {
    /// Family or technique identifier of the matching rule.
    #[serde(default)]
    pub name: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub meta: HitMeta,

    /// Where each labelled pattern fired.
    #[serde(default, deserialize_with = "null_as_default")]
    pub addresses: BTreeMap<String, u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DetectionHit {
    /// Instrumentation options the rule asks for, if any.
    pub fn options(&self) -> Option<&str> {
        self.meta
            .cape_options
            .as_deref()
            .filter(|o| !o.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cape_options: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A behavioral signature that fired during analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A request to run a new analysis task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub target: String,
    pub package: String,
    pub timeout: u64,
    pub options: OptionString,
    pub priority: u32,
    pub machine: Option<String>,
    pub platform: Option<String>,
    pub memory: bool,
    pub enforce_timeout: bool,
    pub parent_id: TaskId,
    pub tlp: Option<String>,
    /// Lineage tag for operators.
    pub custom: Option<String>,
    /// Route through the distributed server instead of the local API.
    pub distributed: bool,
    pub filename: String,
    pub server_url: String,
}

/// A submitted follow-up task, serialized as `[task_id, package]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(TaskId, String)", into = "(TaskId, String)")]
pub struct ChildRecord {
    pub task_id: TaskId,
    pub package: String,
}

impl ChildRecord {
    pub fn new(task_id: TaskId, package: impl Into<String>) -> Self {
        Self {
            task_id,
            package: package.into(),
        }
    }
}

impl From<(TaskId, String)> for ChildRecord {
    fn from((task_id, package): (TaskId, String)) -> Self {
        Self { task_id, package }
    }
}

impl From<ChildRecord> for (TaskId, String) {
    fn from(child: ChildRecord) -> Self {
        (child.task_id, child.package)
    }
}
