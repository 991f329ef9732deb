//! External slicing engine invocation
//!
//! The engine is a pinned black-box binary: it is handed a sanitized package
//! and a plate selector, and on success leaves `plate_*.gcode` in the output
//! directory. Invocations are the one CPU-heavy blocking operation in the
//! pipeline, so they queue on a counting semaphore instead of oversubscribing
//! the host. Each job runs in its own uuid-named temp directory that is
//! removed on every exit path, including crash and timeout.

use crate::error::EngineError;
use crate::profile::EngineVersion;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Default wall-clock limit for one engine run
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of concurrent engine processes
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Which plates the engine should slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateSelector {
    /// Slice every plate in the package
    All,
    /// Slice one plate (1-based)
    Plate(usize),
}

impl PlateSelector {
    /// Engine argument form (`0` means all plates)
    fn argument(&self) -> String {
        match self {
            PlateSelector::All => "0".to_string(),
            PlateSelector::Plate(index) => index.to_string(),
        }
    }
}

/// A completed slice job
///
/// Owns the working directory: the G-code file lives inside it and is
/// removed when this value is dropped, so read or move it first.
#[derive(Debug)]
pub struct SliceOutput {
    /// Path to the produced G-code file
    pub gcode_path: PathBuf,
    /// Captured engine standard output
    pub stdout: String,
    /// Captured engine standard error
    pub stderr: String,
    /// Wall-clock duration of the engine run
    pub duration: Duration,
    workspace: TempDir,
}

impl SliceOutput {
    /// The working directory holding the engine's output files
    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    /// Detach the working directory from cleanup and return its path
    ///
    /// The caller becomes responsible for removing it.
    pub fn keep(self) -> PathBuf {
        self.workspace.keep()
    }
}

/// Runs the pinned engine binary with bounded concurrency
#[derive(Debug, Clone)]
pub struct EngineInvoker {
    binary: PathBuf,
    version: EngineVersion,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl EngineInvoker {
    /// Invoker for a pinned binary with default concurrency and timeout
    pub fn new(binary: impl Into<PathBuf>, version: EngineVersion) -> Self {
        EngineInvoker {
            binary: binary.into(),
            version,
            semaphore: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Limit the number of concurrent engine processes
    pub fn with_concurrency(mut self, permits: usize) -> Self {
        self.semaphore = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    /// Override the per-run timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The engine version this invoker is pinned to
    pub fn version(&self) -> &EngineVersion {
        &self.version
    }

    /// Run the engine against a package, waiting for a concurrency permit
    ///
    /// Queued requests wait asynchronously; an in-flight engine process is
    /// never interrupted mid-write except by the timeout.
    pub async fn slice(
        &self,
        package_path: &Path,
        selector: PlateSelector,
    ) -> Result<SliceOutput, EngineError> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Canceled)?;

        let workspace = tempfile::Builder::new()
            .prefix(&format!("slice-{}-", Uuid::new_v4()))
            .tempdir()?;
        let out_dir = workspace.path().to_path_buf();

        info!(
            engine = %self.version,
            package = %package_path.display(),
            selector = %selector.argument(),
            "starting engine"
        );
        let started = Instant::now();

        let child = Command::new(&self.binary)
            .arg("--slice")
            .arg(selector.argument())
            .arg("--outputdir")
            .arg(&out_dir)
            .arg(package_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // kill_on_drop has already taken the process down.
                warn!(seconds = self.timeout.as_secs(), "engine timed out");
                return Err(EngineError::TimedOut {
                    seconds: self.timeout.as_secs(),
                });
            }
        };
        let duration = started.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status.code() {
            Some(0) => {
                let gcode_path = find_gcode_output(&out_dir, selector).await?;
                info!(
                    gcode = %gcode_path.display(),
                    secs = format_args!("{:.1}", duration.as_secs_f64()),
                    "engine finished"
                );
                Ok(SliceOutput {
                    gcode_path,
                    stdout,
                    stderr,
                    duration,
                    workspace,
                })
            }
            Some(exit_code) => {
                warn!(exit_code, "engine failed");
                Err(EngineError::Failed {
                    exit_code,
                    stdout,
                    stderr,
                })
            }
            None => {
                warn!("engine terminated by signal");
                Err(EngineError::Crashed { stdout, stderr })
            }
        }
    }

    /// Start a slice job and return a detached handle
    ///
    /// Abandoning the handle never blocks the caller; the engine process
    /// still runs to completion or timeout.
    pub fn spawn_slice(
        &self,
        package_path: PathBuf,
        selector: PlateSelector,
    ) -> JoinHandle<Result<SliceOutput, EngineError>> {
        let invoker = self.clone();
        tokio::spawn(async move { invoker.slice(&package_path, selector).await })
    }
}

/// Locate the engine's G-code output for a selector
///
/// Exit 0 with no `plate_*.gcode` present is still a failure: the engine
/// occasionally reports success after writing nothing usable.
async fn find_gcode_output(dir: &Path, selector: PlateSelector) -> Result<PathBuf, EngineError> {
    let mut candidates = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("plate_") && name.ends_with(".gcode") {
            candidates.push(entry.path());
        }
    }
    candidates.sort();

    if let PlateSelector::Plate(index) = selector {
        let wanted = format!("plate_{index}.gcode");
        if let Some(path) = candidates
            .iter()
            .find(|p| p.file_name().is_some_and(|n| n.to_string_lossy() == wanted))
        {
            return Ok(path.clone());
        }
    }

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::MissingOutput {
            dir: dir.display().to_string(),
        })
}
