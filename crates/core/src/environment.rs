//! Preflight checks for the external conversion environment: the
//! interpreter, its version, the conversion library and the script.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EnvironmentConfig;
use crate::error::PipelineError;
use crate::runtime::{command_for, resolve_binary};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentReport {
    pub interpreter: String,
    pub interpreter_path: PathBuf,
    pub version: String,
    pub library: String,
    pub library_version: Option<String>,
    pub script: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InterpreterVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for InterpreterVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl InterpreterVersion {
    pub fn satisfies(&self, min: (u32, u32)) -> bool {
        (self.major, self.minor) >= min
    }
}

/// Parses `Python X.Y[.Z]` anywhere in `--version` output. Older
/// interpreters print it on stderr, so callers pass both streams.
pub fn parse_interpreter_version(output: &str) -> Option<InterpreterVersion> {
    let start = output.find("Python ")? + "Python ".len();
    let token = output[start..].split_whitespace().next()?;
    let mut parts = token.split('.');

    let major = leading_number(parts.next()?)?;
    let minor = leading_number(parts.next()?)?;
    let patch = parts.next().and_then(leading_number).unwrap_or(0);

    Some(InterpreterVersion {
        major,
        minor,
        patch,
    })
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

pub fn parse_min_version(raw: &str) -> Option<(u32, u32)> {
    let mut parts = raw.trim().split('.');
    let major = leading_number(parts.next()?)?;
    let minor = parts.next().map_or(Some(0), leading_number)?;
    Some((major, minor))
}

/// Looks for `Name: <library>` in `pip show` output and returns the
/// reported version when the package is installed.
pub fn parse_pip_show(output: &str, library: &str) -> Option<Option<String>> {
    let mut found = false;
    let mut version = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "name" if value.trim().eq_ignore_ascii_case(library) => found = true,
            "version" => version = Some(value.trim().to_string()),
            _ => {}
        }
    }

    found.then_some(version)
}

async fn run_probe(program: &Path, args: &[&str]) -> Result<Output, String> {
    let program_str = program.to_string_lossy();
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        command_for(&program_str).args(args).output(),
    )
    .await
    .map_err(|_| {
        format!(
            "'{} {}' timed out after {}s",
            program.display(),
            args.join(" "),
            PROBE_TIMEOUT.as_secs()
        )
    })?
    .map_err(|e| format!("failed to run '{}': {e}", program.display()))?;

    debug!(
        program = %program.display(),
        args = ?args,
        status = ?output.status.code(),
        "Environment probe finished"
    );
    Ok(output)
}

/// Verifies everything a conversion needs. Runs on every request when
/// `check_on_request` is set, so it stays cheap: two short probes and a stat.
pub async fn preflight(
    config: &EnvironmentConfig,
    script: &Path,
) -> Result<EnvironmentReport, PipelineError> {
    let interpreter_path = resolve_binary(&config.interpreter).ok_or_else(|| {
        PipelineError::environment(format!(
            "interpreter '{}' was not found on PATH",
            config.interpreter
        ))
    })?;

    let min_version = parse_min_version(&config.min_version).ok_or_else(|| {
        PipelineError::ServerFault(format!(
            "invalid environment.min_version '{}'",
            config.min_version
        ))
    })?;

    let version_output = run_probe(&interpreter_path, &["--version"])
        .await
        .map_err(PipelineError::environment)?;
    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&version_output.stdout),
        String::from_utf8_lossy(&version_output.stderr)
    );
    let version = parse_interpreter_version(&combined).ok_or_else(|| {
        PipelineError::environment(format!(
            "unable to parse interpreter version from '{}'",
            combined.trim()
        ))
    })?;
    if !version.satisfies(min_version) {
        return Err(PipelineError::environment(format!(
            "Python {}.{}+ is required, found {version}",
            min_version.0, min_version.1
        )));
    }

    let pip_output = run_probe(&interpreter_path, &["-m", "pip", "show", &config.library])
        .await
        .map_err(PipelineError::environment)?;
    let stderr = String::from_utf8_lossy(&pip_output.stderr);
    if !stderr.trim().is_empty() {
        warn!(stderr = %stderr.trim(), "pip show wrote to stderr");
    }
    let library_version = parse_pip_show(&String::from_utf8_lossy(&pip_output.stdout), &config.library)
        .ok_or_else(|| {
            PipelineError::environment(format!("{} is not installed", config.library))
        })?;

    if !script.is_file() {
        return Err(PipelineError::environment(format!(
            "converter script not found at {}",
            script.display()
        )));
    }

    Ok(EnvironmentReport {
        interpreter: config.interpreter.clone(),
        interpreter_path,
        version: version.to_string(),
        library: config.library.clone(),
        library_version,
        script: script.to_path_buf(),
    })
}
