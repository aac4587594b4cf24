//! Task submission.
//!
//! Submission is the only state-changing call the orchestrator makes. It is
//! behind the [`TaskSubmitter`] trait so the HTTP client can be swapped for a
//! dry-run logger or an in-memory recorder in tests.

use crate::config::ApiConfig;
use crate::models::{TaskId, TaskSpec};
use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Path of the task creation endpoint, relative to the API base URL.
const CREATE_TASK_PATH: &str = "/apiv2/tasks/create/file/";

/// Errors from a single submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("failed to read sample {path}: {source}")]
    Sample {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("task API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("task API rejected the task: {0}")]
    Rejected(String),

    #[error("failed to decode task API response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Something that can queue a new analysis task.
pub trait TaskSubmitter {
    /// Submit one task. `Ok(None)` means the service accepted the request but
    /// returned no task id.
    fn submit(
        &self,
        spec: &TaskSpec,
    ) -> impl Future<Output = Result<Option<TaskId>, SubmitError>> + Send;
}

/// Task API response body.
#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    error_value: Option<String>,
    #[serde(default)]
    data: Option<CreateData>,
}

#[derive(Debug, Deserialize)]
struct CreateData {
    #[serde(default)]
    task_ids: Vec<TaskId>,
}

impl CreateResponse {
    fn into_task_id(self) -> Result<Option<TaskId>, SubmitError> {
        if self.error {
            return Err(SubmitError::Rejected(
                self.error_value
                    .unwrap_or_else(|| "unspecified error".to_string()),
            ));
        }
        Ok(self.data.and_then(|d| d.task_ids.first().copied()))
    }
}

/// Submits tasks to the sandbox REST API.
pub struct HttpSubmitter {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl HttpSubmitter {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_url: config.url.clone(),
            token: config.token.clone(),
        })
    }

    /// Distributed tasks go to the distributed server when one is configured.
    fn endpoint(&self, spec: &TaskSpec) -> String {
        let base = if spec.distributed && !spec.server_url.is_empty() {
            &spec.server_url
        } else {
            &self.api_url
        };
        format!("{}{}", base.trim_end_matches('/'), CREATE_TASK_PATH)
    }
}

/// Form fields sent next to the sample.
///
/// Flags are only sent when set, the API treats any present value as true.
fn form_fields(spec: &TaskSpec) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("package", spec.package.clone()),
        ("timeout", spec.timeout.to_string()),
        ("options", spec.options.to_string()),
        ("priority", spec.priority.to_string()),
        ("parent_id", spec.parent_id.to_string()),
    ];

    let optional = [
        ("machine", &spec.machine),
        ("platform", &spec.platform),
        ("tlp", &spec.tlp),
        ("custom", &spec.custom),
    ];
    for (name, value) in optional {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            fields.push((name, value.to_string()));
        }
    }

    if spec.memory {
        fields.push(("memory", "1".to_string()));
    }
    if spec.enforce_timeout {
        fields.push(("enforce_timeout", "1".to_string()));
    }

    fields
}

/// Name the uploaded sample is stored under.
fn upload_name(spec: &TaskSpec) -> String {
    if !spec.filename.is_empty() {
        return spec.filename.clone();
    }
    Path::new(&spec.target)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sample".to_string())
}

impl TaskSubmitter for HttpSubmitter {
    async fn submit(&self, spec: &TaskSpec) -> Result<Option<TaskId>, SubmitError> {
        let sample = tokio::fs::read(&spec.target)
            .await
            .map_err(|source| SubmitError::Sample {
                path: spec.target.clone(),
                source,
            })?;

        let url = self.endpoint(spec);
        debug!(
            "Uploading {} ({} bytes) as {} to {}",
            spec.target,
            sample.len(),
            spec.package,
            url
        );

        let form = form_fields(spec).into_iter().fold(
            Form::new().part("file", Part::bytes(sample).file_name(upload_name(spec))),
            |form, (name, value)| form.text(name, value),
        );

        let mut request = self.client.post(&url).multipart(form);
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Token {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|source| SubmitError::Transport {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SubmitError::Status { status, body });
        }

        let body: CreateResponse = response.json().await.map_err(SubmitError::Decode)?;
        body.into_task_id()
    }
}

/// Logs what would be submitted and never creates a task.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunSubmitter;

impl TaskSubmitter for DryRunSubmitter {
    async fn submit(&self, spec: &TaskSpec) -> Result<Option<TaskId>, SubmitError> {
        info!(
            "[dry-run] would submit {} (parent {}, priority {}) with options {}",
            spec.package, spec.parent_id, spec.priority, spec.options
        );
        Ok(None)
    }
}
