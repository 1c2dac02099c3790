//! Failure kinds of the conversion pipeline.
//!
//! Request-level kinds (`NoFileProvided`, `InvalidPdf`, ...) reject a whole
//! upload before any converter runs. Job-level kinds
//! (`ConversionProcessFailed`, `OutputNotFound`) are recorded per file and
//! only surface as the response error when no file in the batch converted.

use thiserror::Error;

use crate::job::JobOutcome;

const ENVIRONMENT_REMEDIATION: &str = "Run \"python --version\" to check the interpreter version \
     and \"pip install pdf2docx opencv-python-headless\" to install dependencies.";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No PDF file uploaded")]
    NoFileProvided,

    #[error("Too many files: {count} (maximum {max})")]
    TooManyFiles { count: usize, max: usize },

    #[error("File '{file}' exceeds the {limit_mb} MB limit")]
    FileTooLarge { file: String, limit_mb: u64 },

    #[error("Uploaded file is not a valid PDF")]
    InvalidPdf { file: String },

    #[error("Malformed upload: {0}")]
    MalformedUpload(String),

    #[error("Conversion environment unavailable: {reason}. {remediation}")]
    EnvironmentUnavailable { reason: String, remediation: String },

    #[error("Conversion failed for '{file}': {detail}")]
    ConversionProcessFailed { file: String, detail: String },

    #[error("Conversion produced no output for '{file}'")]
    OutputNotFound { file: String, detail: String },

    #[error("All {} conversions failed", outcomes.len())]
    BatchFailed { outcomes: Vec<JobOutcome> },

    #[error("Server error: {0}")]
    ServerFault(String),
}

impl PipelineError {
    pub fn environment(reason: impl Into<String>) -> Self {
        Self::EnvironmentUnavailable {
            reason: reason.into(),
            remediation: ENVIRONMENT_REMEDIATION.to_string(),
        }
    }

    /// Stable identifier for logs and JSON reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoFileProvided => "no_file_provided",
            Self::TooManyFiles { .. } => "too_many_files",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::InvalidPdf { .. } => "invalid_pdf",
            Self::MalformedUpload(_) => "malformed_upload",
            Self::EnvironmentUnavailable { .. } => "environment_unavailable",
            Self::ConversionProcessFailed { .. } => "conversion_process_failed",
            Self::OutputNotFound { .. } => "output_not_found",
            Self::BatchFailed { .. } => "batch_failed",
            Self::ServerFault(_) => "server_fault",
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::ServerFault(format!("{err:#}"))
    }
}
