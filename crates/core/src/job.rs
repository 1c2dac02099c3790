use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One PDF -> DOCX conversion. Paths live inside the request workspace and
/// are named after the job id, never the uploaded filename.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub id: String,
    pub request_id: String,
    pub source_name: String,
    pub output_name: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub status: JobStatus,
    pub error_kind: Option<&'static str>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConversionJob {
    pub fn new(request_id: &str, workspace: &std::path::Path, source_name: &str) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            input_path: workspace.join(format!("{id}.pdf")),
            output_path: workspace.join(format!("{id}.docx")),
            id,
            request_id: request_id.to_string(),
            source_name: source_name.to_string(),
            output_name: crate::upload::docx_name(source_name),
            status: JobStatus::Pending,
            error_kind: None,
            error_detail: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self) {
        self.status = JobStatus::Succeeded;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, kind: &'static str, detail: String) {
        self.status = JobStatus::Failed;
        self.error_kind = Some(kind);
        self.error_detail = Some(detail);
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        let completed_at = self.completed_at?;
        let started_at = self.started_at.unwrap_or(self.created_at);
        Some((completed_at - started_at).num_milliseconds().max(0))
    }

    pub fn outcome(&self) -> JobOutcome {
        JobOutcome {
            file: self.source_name.clone(),
            output_name: self.output_name.clone(),
            status: self.status,
            error_kind: self.error_kind.map(str::to_string),
            error: self.error_detail.clone(),
        }
    }
}

/// Per-file result reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub file: String,
    pub output_name: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub request_id: String,
    pub file: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl From<&ConversionJob> for JobResponse {
    fn from(job: &ConversionJob) -> Self {
        Self {
            id: job.id.clone(),
            request_id: job.request_id.clone(),
            file: job.source_name.clone(),
            status: job.status,
            error: job.error_detail.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            duration_ms: job.duration_ms(),
        }
    }
}

/// Jobs of requests that have not been cleaned up yet.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<DashMap<String, ConversionJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, job: &ConversionJob) {
        self.jobs.insert(job.id.clone(), job.clone());
    }

    pub fn remove_request(&self, request_id: &str) {
        self.jobs.retain(|_, job| job.request_id != request_id);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn snapshot(&self) -> Vec<JobResponse> {
        let mut jobs: Vec<JobResponse> = self
            .jobs
            .iter()
            .map(|entry| JobResponse::from(entry.value()))
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }
}
