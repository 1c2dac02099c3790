//! External converter invocation: `<interpreter> <script> <input> <output>`.
//!
//! Success means a zero exit status *and* a regular file at the exact
//! output path the job asked for. Nothing else on disk is consulted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConverterConfig, EnvironmentConfig};
use crate::error::PipelineError;
use crate::job::ConversionJob;
use crate::logging::CONVERTER_OUTPUT_TARGET;
use crate::runtime::command_for;

const STDERR_TAIL_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct ConverterCommand {
    pub interpreter: String,
    pub script: PathBuf,
    pub timeout: Duration,
    pub output_wait: Duration,
    pub poll_interval: Duration,
}

impl ConverterCommand {
    pub fn from_config(environment: &EnvironmentConfig, converter: &ConverterConfig) -> Self {
        Self {
            interpreter: environment.interpreter.clone(),
            script: converter.script.clone(),
            timeout: converter.timeout(),
            output_wait: converter.output_wait(),
            poll_interval: converter.output_poll_interval(),
        }
    }

    /// Human-readable command line for logs and error messages.
    pub fn describe(&self, input: &Path, output: &Path) -> String {
        format!(
            "{} \"{}\" \"{}\" \"{}\"",
            self.interpreter,
            self.script.display(),
            input.display(),
            output.display()
        )
    }

    pub async fn run(
        &self,
        job: &ConversionJob,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let workspace = job.input_path.parent().unwrap_or_else(|| Path::new("."));
        let mut command = command_for(&self.interpreter);
        command
            .arg(&self.script)
            .arg(&job.input_path)
            .arg(&job.output_path)
            .current_dir(workspace);

        info!(
            job_id = %job.id,
            file = %job.source_name,
            command = %self.describe(&job.input_path, &job.output_path),
            "Starting converter"
        );

        let process_failed = |detail: String| PipelineError::ConversionProcessFailed {
            file: job.source_name.clone(),
            detail,
        };

        let child = command.spawn().map_err(|e| {
            process_failed(format!("failed to start '{}': {e}", self.interpreter))
        })?;

        // Dropping the wait future drops the child, and kill_on_drop stops it.
        let output = tokio::select! {
            waited = tokio::time::timeout(self.timeout, child.wait_with_output()) => match waited {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(process_failed(format!("failed to wait for converter: {e}"))),
                Err(_) => {
                    return Err(process_failed(format!(
                        "converter timed out after {}s",
                        self.timeout.as_secs()
                    )))
                }
            },
            _ = cancel.cancelled() => {
                return Err(process_failed("conversion cancelled: server is shutting down".to_string()));
            }
        };

        log_process_output(&job.id, &output.stdout, &output.stderr);

        if !output.status.success() {
            let stderr_tail = tail_text(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_CHARS);
            let detail = if stderr_tail.is_empty() {
                format!("converter exited with {}", output.status)
            } else {
                stderr_tail
            };
            return Err(process_failed(detail));
        }

        if !wait_for_artifact(&job.output_path, self.output_wait, self.poll_interval).await {
            let listing = describe_directory(workspace).await;
            warn!(
                job_id = %job.id,
                expected = %job.output_path.display(),
                workspace = %listing,
                "Converter exited cleanly but produced no output"
            );
            return Err(PipelineError::OutputNotFound {
                file: job.source_name.clone(),
                detail: format!(
                    "expected {}; workspace contains: {listing}",
                    job.output_path.display()
                ),
            });
        }

        Ok(())
    }
}

fn log_process_output(job_id: &str, stdout: &[u8], stderr: &[u8]) {
    for line in String::from_utf8_lossy(stdout).lines() {
        debug!(target: CONVERTER_OUTPUT_TARGET, job_id = %job_id, stream = "stdout", "{line}");
    }
    for line in String::from_utf8_lossy(stderr).lines() {
        debug!(target: CONVERTER_OUTPUT_TARGET, job_id = %job_id, stream = "stderr", "{line}");
    }
}

/// Polls `path` until it is a regular file or `wait` elapses. The check
/// runs at least once, so a zero wait still sees an existing file.
pub async fn wait_for_artifact(path: &Path, wait: Duration, poll_interval: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.is_file() {
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn describe_directory(dir: &Path) -> String {
    let mut names = Vec::new();
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => {
            while let Ok(Some(entry)) = entries.next_entry().await {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Err(e) => return format!("<unreadable: {e}>"),
    }
    names.sort();
    format!("[{}]", names.join(", "))
}

fn tail_text(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - max_chars).collect();
    format!("...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_converter(script: &Path) -> ConverterCommand {
        ConverterCommand {
            interpreter: "sh".to_string(),
            script: script.to_path_buf(),
            timeout: Duration::from_secs(10),
            output_wait: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn job_in(workspace: &Path) -> ConversionJob {
        let job = ConversionJob::new("req", workspace, "report.pdf");
        std::fs::write(&job.input_path, b"%PDF-1.4 body").expect("write input");
        job
    }

    #[test]
    fn tail_text_keeps_the_end() {
        assert_eq!(tail_text("  short \n", 10), "short");
        assert_eq!(tail_text("abcdefghij", 4), "...ghij");
    }

    #[test]
    fn describe_quotes_paths() {
        let cmd = sh_converter(Path::new("/opt/convert.py"));
        let line = cmd.describe(Path::new("/w/a.pdf"), Path::new("/w/a.docx"));
        assert_eq!(line, "sh \"/opt/convert.py\" \"/w/a.pdf\" \"/w/a.docx\"");
    }

    #[tokio::test]
    async fn wait_for_artifact_sees_existing_file_with_zero_wait() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.docx");
        std::fs::write(&path, b"docx").expect("write");
        assert!(wait_for_artifact(&path, Duration::ZERO, Duration::from_millis(10)).await);
        assert!(!wait_for_artifact(&temp.path().join("missing"), Duration::from_millis(30), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_for_artifact_picks_up_late_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("late.docx");
        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::fs::write(writer_path, b"docx").await.expect("late write");
        });
        assert!(wait_for_artifact(&path, Duration::from_secs(2), Duration::from_millis(10)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_run_leaves_output_at_exact_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("convert.sh");
        std::fs::write(&script, "cp \"$1\" \"$2\"\n").expect("write script");
        let job = job_in(temp.path());

        sh_converter(&script)
            .run(&job, &CancellationToken::new())
            .await
            .expect("conversion should succeed");
        assert_eq!(std::fs::read(&job.output_path).expect("output"), b"%PDF-1.4 body");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("convert.sh");
        std::fs::write(&script, "echo 'encrypted pdf' >&2\nexit 1\n").expect("write script");
        let job = job_in(temp.path());

        let err = sh_converter(&script)
            .run(&job, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::ConversionProcessFailed { file, detail } => {
                assert_eq!(file, "report.pdf");
                assert_eq!(detail, "encrypted pdf");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_without_output_is_output_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("convert.sh");
        std::fs::write(&script, "touch elsewhere.docx\nexit 0\n").expect("write script");
        let job = job_in(temp.path());

        let err = sh_converter(&script)
            .run(&job, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::OutputNotFound { detail, .. } => {
                assert!(detail.contains("elsewhere.docx"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_converter_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("convert.sh");
        std::fs::write(&script, "sleep 5\n").expect("write script");
        let job = job_in(temp.path());
        let mut command = sh_converter(&script);
        command.timeout = Duration::from_millis(200);

        let started = std::time::Instant::now();
        let err = command.run(&job, &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_stops_the_converter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("convert.sh");
        std::fs::write(&script, "sleep 5\n").expect("write script");
        let job = job_in(temp.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = sh_converter(&script).run(&job, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("shutting down"));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_process_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let job = job_in(temp.path());
        let mut command = sh_converter(&temp.path().join("convert.py"));
        command.interpreter = "definitely-not-an-interpreter".to_string();

        let err = command.run(&job, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "conversion_process_failed");
        assert!(err.to_string().contains("failed to start"));
    }
}
