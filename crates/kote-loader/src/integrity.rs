//! Core-file integrity monitor.
//!
//! The first `verify()` records a SHA-256 baseline of the core files;
//! every later call compares against it. The baseline is never
//! refreshed, and once a mismatch is seen the monitor stays tripped for
//! the rest of the process.

use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Baseline value for a file that did not exist.
pub const DELETED: &str = "DELETED";
/// Baseline value for a file that could not be read.
pub const ERROR: &str = "ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TamperReason {
    Deleted,
    Modified,
}

impl fmt::Display for TamperReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TamperReason::Deleted => "deleted",
            TamperReason::Modified => "modified",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    Ok,
    Compromised { file: PathBuf, reason: TamperReason },
}

impl IntegrityStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, IntegrityStatus::Ok)
    }
}

impl fmt::Display for IntegrityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityStatus::Ok => f.write_str("ok"),
            IntegrityStatus::Compromised { file, reason } => {
                write!(f, "{} {reason}", file.display())
            }
        }
    }
}

#[derive(Default)]
struct MonitorState {
    baseline: Option<Vec<(PathBuf, String)>>,
    tripped: Option<IntegrityStatus>,
}

pub struct IntegrityMonitor {
    root: PathBuf,
    files: Vec<PathBuf>,
    state: Mutex<MonitorState>,
}

impl IntegrityMonitor {
    /// `files` are resolved against `root`; absolute paths stay as they are.
    pub fn new(root: impl Into<PathBuf>, files: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Compare core files against the baseline, taking it on first use.
    pub async fn verify(&self) -> IntegrityStatus {
        let mut state = self.state.lock().await;

        if let Some(tripped) = &state.tripped {
            return tripped.clone();
        }

        if state.baseline.is_none() {
            let mut snapshot = Vec::with_capacity(self.files.len());
            for file in &self.files {
                snapshot.push((file.clone(), hash_file(&self.root.join(file)).await));
            }
            tracing::info!(files = snapshot.len(), "integrity baseline recorded");
            state.baseline = Some(snapshot);
            return IntegrityStatus::Ok;
        }

        let mut status = IntegrityStatus::Ok;
        if let Some(baseline) = &state.baseline {
            for (file, expected) in baseline {
                let current = hash_file(&self.root.join(file)).await;
                if &current != expected {
                    let reason = if current == DELETED {
                        TamperReason::Deleted
                    } else {
                        TamperReason::Modified
                    };
                    status = IntegrityStatus::Compromised {
                        file: file.clone(),
                        reason,
                    };
                    break;
                }
            }
        }

        if !status.is_ok() {
            tracing::error!(status = %status, "core file integrity violated");
            state.tripped = Some(status.clone());
        }
        status
    }
}

/// Hex SHA-256 of a file, or one of the [`DELETED`] / [`ERROR`] sentinels.
pub async fn hash_file(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(data) => format!("{:x}", Sha256::digest(&data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DELETED.to_string(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read core file");
            ERROR.to_string()
        }
    }
}
