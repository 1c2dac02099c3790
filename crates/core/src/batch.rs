//! Batch orchestration: one job per uploaded file, admitted through a
//! process-wide semaphore, every job run to completion (partial success),
//! and the request workspace removed afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bundle::{build_payload, ConversionPayload};
use crate::config::{AppConfig, EnvironmentConfig, LimitsConfig};
use crate::converter::ConverterCommand;
use crate::environment::{preflight, EnvironmentReport};
use crate::error::PipelineError;
use crate::job::{ConversionJob, JobOutcome, JobRegistry};
use crate::upload::{validate_batch, UploadedFile};
use crate::workspace::RequestWorkspace;

/// Result of one job: the final job record, the error that failed it and,
/// on success, the DOCX bytes read before cleanup.
#[derive(Debug)]
pub struct JobReport {
    pub job: ConversionJob,
    pub error: Option<PipelineError>,
    pub document: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct BatchResult {
    pub request_id: String,
    /// In upload order.
    pub reports: Vec<JobReport>,
}

impl BatchResult {
    pub fn converted(&self) -> usize {
        self.reports.iter().filter(|r| r.document.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.converted()
    }

    pub fn outcomes(&self) -> Vec<JobOutcome> {
        self.reports.iter().map(|r| r.job.outcome()).collect()
    }
}

#[derive(Clone)]
pub struct ConversionPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    command: ConverterCommand,
    environment: EnvironmentConfig,
    limits: LimitsConfig,
    work_dir: PathBuf,
    permits: Arc<Semaphore>,
    registry: JobRegistry,
    shutdown: CancellationToken,
}

impl ConversionPipeline {
    pub fn new(config: &AppConfig, registry: JobRegistry, shutdown: CancellationToken) -> Self {
        let parallelism = config.converter.effective_parallelism();
        info!(parallelism, "Conversion pipeline ready");
        Self {
            inner: Arc::new(PipelineInner {
                command: ConverterCommand::from_config(&config.environment, &config.converter),
                environment: config.environment.clone(),
                limits: config.limits.clone(),
                work_dir: config.paths.work_dir.clone(),
                permits: Arc::new(Semaphore::new(parallelism)),
                registry,
                shutdown,
            }),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.inner.limits
    }

    pub async fn check_environment(&self) -> Result<EnvironmentReport, PipelineError> {
        preflight(&self.inner.environment, &self.inner.command.script).await
    }

    /// Full request path: validate every file, check the environment when
    /// configured to, convert, then package the result.
    pub async fn process(&self, files: Vec<UploadedFile>) -> Result<ConversionPayload, PipelineError> {
        validate_batch(&files, &self.inner.limits)?;
        if self.inner.environment.check_on_request {
            self.check_environment().await?;
        }
        let result = self.convert(files).await?;
        build_payload(result)
    }

    /// Runs the batch on its own task, so a dropped caller (client
    /// disconnect) never skips cleanup.
    pub async fn convert(&self, files: Vec<UploadedFile>) -> Result<BatchResult, PipelineError> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run_batch(files).await })
            .await
            .map_err(|e| PipelineError::ServerFault(format!("conversion task failed: {e}")))?
    }

    async fn run_batch(&self, files: Vec<UploadedFile>) -> Result<BatchResult, PipelineError> {
        let request_id = Uuid::new_v4().to_string();
        let workspace = RequestWorkspace::create(&self.inner.work_dir, &request_id).await?;

        info!(
            request_id = %request_id,
            files = files.len(),
            jobs_in_flight = self.inner.registry.len(),
            "Conversion batch started"
        );
        let result = self.run_jobs(&request_id, workspace.path(), files).await;

        workspace.cleanup().await;
        self.inner.registry.remove_request(&request_id);

        match &result {
            Ok(batch) => info!(
                request_id = %request_id,
                converted = batch.converted(),
                failed = batch.failed(),
                "Conversion batch finished"
            ),
            Err(err) => warn!(request_id = %request_id, error = %err, "Conversion batch aborted"),
        }
        result
    }

    async fn run_jobs(
        &self,
        request_id: &str,
        workspace: &Path,
        files: Vec<UploadedFile>,
    ) -> Result<BatchResult, PipelineError> {
        let mut jobs = Vec::with_capacity(files.len());
        for file in files {
            let job = ConversionJob::new(request_id, workspace, &file.name);
            tokio::fs::write(&job.input_path, &file.bytes)
                .await
                .map_err(|e| {
                    PipelineError::ServerFault(format!("failed to store upload '{}': {e}", file.name))
                })?;
            self.inner.registry.upsert(&job);
            jobs.push(job);
        }

        let mut tasks = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let pipeline = self.clone();
            tasks.spawn(async move { (index, pipeline.run_job(job).await) });
        }

        let mut reports: Vec<(usize, JobReport)> = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => reports.push(entry),
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "Conversion job task panicked");
                    return Err(PipelineError::ServerFault(format!("conversion job failed: {e}")));
                }
            }
        }
        reports.sort_by_key(|(index, _)| *index);

        Ok(BatchResult {
            request_id: request_id.to_string(),
            reports: reports.into_iter().map(|(_, report)| report).collect(),
        })
    }

    async fn run_job(&self, mut job: ConversionJob) -> JobReport {
        let permit = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => None,
            permit = self.inner.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            let error = PipelineError::ConversionProcessFailed {
                file: job.source_name.clone(),
                detail: "conversion cancelled: server is shutting down".to_string(),
            };
            return self.finish_failed(job, error);
        };

        job.mark_running();
        self.inner.registry.upsert(&job);

        if let Err(error) = self.inner.command.run(&job, &self.inner.shutdown).await {
            return self.finish_failed(job, error);
        }

        match tokio::fs::read(&job.output_path).await {
            Ok(document) => {
                job.mark_succeeded();
                self.inner.registry.upsert(&job);
                info!(
                    job_id = %job.id,
                    file = %job.source_name,
                    bytes = document.len(),
                    duration_ms = job.duration_ms().unwrap_or_default(),
                    "Conversion succeeded"
                );
                JobReport {
                    job,
                    error: None,
                    document: Some(document),
                }
            }
            Err(e) => {
                let error = PipelineError::OutputNotFound {
                    file: job.source_name.clone(),
                    detail: format!("failed to read {}: {e}", job.output_path.display()),
                };
                self.finish_failed(job, error)
            }
        }
    }

    fn finish_failed(&self, mut job: ConversionJob, error: PipelineError) -> JobReport {
        let detail = match &error {
            PipelineError::ConversionProcessFailed { detail, .. }
            | PipelineError::OutputNotFound { detail, .. } => detail.clone(),
            other => other.to_string(),
        };
        warn!(
            job_id = %job.id,
            file = %job.source_name,
            kind = error.kind(),
            detail = %detail,
            "Conversion failed"
        );
        job.mark_failed(error.kind(), detail);
        self.inner.registry.upsert(&job);
        JobReport {
            job,
            error: Some(error),
            document: None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Config whose converter is `sh <script>`; the script sees the input
    /// and output paths as `$1` and `$2`.
    pub fn sh_config(work_dir: &Path, script_body: &str) -> AppConfig {
        let script = work_dir
            .parent()
            .unwrap_or(work_dir)
            .join(format!("convert-{}.sh", Uuid::new_v4()));
        std::fs::write(&script, script_body).expect("write converter script");

        let mut config = AppConfig::default();
        config.paths.work_dir = work_dir.to_path_buf();
        config.environment.interpreter = "sh".to_string();
        config.environment.check_on_request = false;
        config.converter.script = script;
        config.converter.timeout_secs = 10;
        config.converter.output_wait_secs = 0;
        config.converter.output_poll_interval_ms = 20;
        config.converter.max_parallel_jobs = 2;
        config
    }

    pub fn pdf(name: &str) -> UploadedFile {
        UploadedFile::new(name, format!("%PDF-1.7 {name}").into_bytes())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::test_support::{pdf, sh_config};
    use super::*;
    use crate::workspace::ensure_work_dir;

    fn pipeline_for(config: &AppConfig) -> ConversionPipeline {
        std::fs::create_dir_all(&config.paths.work_dir).expect("work dir");
        ConversionPipeline::new(config, JobRegistry::new(), CancellationToken::new())
    }

    fn work_dir_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn every_file_converts_in_upload_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = sh_config(&temp.path().join("work"), "cp \"$1\" \"$2\"\n");
        let pipeline = pipeline_for(&config);

        let result = pipeline
            .convert(vec![pdf("a.pdf"), pdf("b.pdf"), pdf("c.pdf")])
            .await
            .expect("batch");

        assert_eq!(result.converted(), 3);
        let names: Vec<_> = result.reports.iter().map(|r| r.job.output_name.as_str()).collect();
        assert_eq!(names, ["a.docx", "b.docx", "c.docx"]);
        assert_eq!(result.reports[1].document.as_deref(), Some(&b"%PDF-1.7 b.pdf"[..]));
        assert_eq!(work_dir_entries(&config.paths.work_dir), 0);
        assert!(pipeline.registry().is_empty());
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_others() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = "if grep -q broken \"$1\"; then echo 'cannot parse' >&2; exit 2; fi\ncp \"$1\" \"$2\"\n";
        let config = sh_config(&temp.path().join("work"), script);
        let pipeline = pipeline_for(&config);

        let result = pipeline
            .convert(vec![pdf("ok.pdf"), pdf("broken.pdf"), pdf("fine.pdf")])
            .await
            .expect("batch");

        assert_eq!(result.converted(), 2);
        assert_eq!(result.failed(), 1);
        let failed = &result.reports[1];
        assert!(failed.document.is_none());
        assert_eq!(failed.job.error_detail.as_deref(), Some("cannot parse"));
        assert!(matches!(
            failed.error,
            Some(PipelineError::ConversionProcessFailed { .. })
        ));
        assert_eq!(work_dir_entries(&config.paths.work_dir), 0);
    }

    #[tokio::test]
    async fn same_named_uploads_never_collide() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = sh_config(&temp.path().join("work"), "cp \"$1\" \"$2\"\n");
        let pipeline = pipeline_for(&config);

        let first = UploadedFile::new("report.pdf", b"%PDF first".to_vec());
        let second = UploadedFile::new("report.pdf", b"%PDF second".to_vec());
        let (a, b) = tokio::join!(pipeline.convert(vec![first]), pipeline.convert(vec![second]));

        let a = a.expect("first batch");
        let b = b.expect("second batch");
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.reports[0].document.as_deref(), Some(&b"%PDF first"[..]));
        assert_eq!(b.reports[0].document.as_deref(), Some(&b"%PDF second"[..]));
    }

    #[tokio::test]
    async fn parallelism_is_bounded_by_permits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker_dir = temp.path().join("markers");
        std::fs::create_dir_all(&marker_dir).expect("marker dir");
        // Each run records how many peers are active when it starts.
        let script = format!(
            "d='{}'\ntouch \"$d/$$\"\nls \"$d\" | wc -l >> \"$d.log\"\nsleep 0.2\nrm \"$d/$$\"\ncp \"$1\" \"$2\"\n",
            marker_dir.display()
        );
        let mut config = sh_config(&temp.path().join("work"), &script);
        config.converter.max_parallel_jobs = 1;
        let pipeline = pipeline_for(&config);

        let result = pipeline
            .convert(vec![pdf("a.pdf"), pdf("b.pdf"), pdf("c.pdf")])
            .await
            .expect("batch");
        assert_eq!(result.converted(), 3);

        let log = std::fs::read_to_string(format!("{}.log", marker_dir.display())).expect("log");
        assert!(log.lines().all(|line| line.trim() == "1"), "overlap seen: {log}");
    }

    #[tokio::test]
    async fn process_rejects_before_touching_the_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = sh_config(&temp.path().join("work"), "exit 1\n");
        config.environment.interpreter = "no-such-interpreter-on-this-host".to_string();
        config.environment.check_on_request = true;
        let pipeline = pipeline_for(&config);

        let err = pipeline.process(Vec::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoFileProvided));

        let err = pipeline
            .process(vec![UploadedFile::new("fake.pdf", b"hello".to_vec())])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPdf { .. }));

        let err = pipeline.process(vec![pdf("ok.pdf")]).await.unwrap_err();
        assert_eq!(err.kind(), "environment_unavailable");
        assert_eq!(work_dir_entries(&config.paths.work_dir), 0);
    }

    #[tokio::test]
    async fn process_returns_the_document_for_one_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = sh_config(&temp.path().join("work"), "cp \"$1\" \"$2\"\n");
        let pipeline = pipeline_for(&config);

        let payload = pipeline.process(vec![pdf("report.pdf")]).await.expect("payload");
        assert_eq!(payload.file_name(), "report.docx");
    }

    #[tokio::test]
    async fn dropped_caller_still_cleans_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = sh_config(&temp.path().join("work"), "sleep 0.5\ncp \"$1\" \"$2\"\n");
        let pipeline = pipeline_for(&config);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), pipeline.convert(vec![pdf("a.pdf")])).await;
        assert!(abandoned.is_err());
        assert!(!pipeline.registry().is_empty());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !pipeline.registry().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(pipeline.registry().is_empty());
        assert_eq!(work_dir_entries(&config.paths.work_dir), 0);
    }

    #[tokio::test]
    async fn work_dir_preparation_spares_a_running_batch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = sh_config(&temp.path().join("work"), "sleep 0.5\ncp \"$1\" \"$2\"\n");
        let pipeline = pipeline_for(&config);

        let running = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.convert(vec![pdf("a.pdf")]).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        ensure_work_dir(&config.paths.work_dir).expect("ensure work dir");

        let result = running.await.expect("join").expect("batch");
        assert_eq!(result.converted(), 1);
    }

    #[tokio::test]
    async fn shutdown_fails_queued_jobs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = sh_config(&temp.path().join("work"), "cp \"$1\" \"$2\"\n");
        std::fs::create_dir_all(&config.paths.work_dir).expect("work dir");
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let pipeline = ConversionPipeline::new(&config, JobRegistry::new(), shutdown);

        let result = pipeline.convert(vec![pdf("a.pdf")]).await.expect("batch");
        assert_eq!(result.converted(), 0);
        assert!(result.reports[0]
            .job
            .error_detail
            .as_deref()
            .unwrap_or_default()
            .contains("shutting down"));
    }
}
