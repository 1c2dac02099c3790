//! Per-request scratch directories under the configured work directory.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

const WRITE_PROBE_NAME: &str = ".write-probe";

/// `<work_dir>/<request_id>/`, holding that request's inputs and outputs.
#[derive(Debug)]
pub struct RequestWorkspace {
    path: PathBuf,
}

impl RequestWorkspace {
    pub async fn create(work_dir: &Path, request_id: &str) -> Result<Self> {
        let path = work_dir.join(request_id);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("failed to create request workspace: {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort removal; failures are logged and swallowed.
    pub async fn cleanup(self) {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                workspace = %self.path.display(),
                error = %e,
                "Failed to remove request workspace"
            ),
        }
    }
}

/// Creates the work directory and proves it is writable.
pub fn ensure_work_dir(work_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("failed to create work directory: {}", work_dir.display()))?;

    let probe = work_dir.join(WRITE_PROBE_NAME);
    std::fs::write(&probe, b"probe")
        .with_context(|| format!("work directory is not writable: {}", work_dir.display()))?;
    std::fs::remove_file(&probe).ok();
    Ok(())
}

/// Server startup preparation: [`ensure_work_dir`], then drop request
/// workspaces left behind by a previous server process. Only directories
/// named by a request UUID are touched.
pub fn prepare_work_dir(work_dir: &Path) -> Result<usize> {
    ensure_work_dir(work_dir)?;

    let mut removed = 0;
    for entry in std::fs::read_dir(work_dir)
        .with_context(|| format!("failed to list work directory: {}", work_dir.display()))?
        .flatten()
    {
        let path = entry.path();
        if !path.is_dir() || !is_request_workspace(&entry.file_name()) {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale workspace"),
        }
    }

    if removed > 0 {
        info!(removed, work_dir = %work_dir.display(), "Removed stale request workspaces");
    }
    Ok(removed)
}

fn is_request_workspace(name: &OsStr) -> bool {
    name.to_str().is_some_and(|name| Uuid::parse_str(name).is_ok())
}
