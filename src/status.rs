/// Status file: a JSON snapshot of every tracked workload, rewritten on each
/// diagnosis through a staged temp file and a rename.
use crate::tracked::{Diagnosis, HealthState, ProcessId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One tracked workload as shown in the status file.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub pid: i32,
    pub pgid: i32,
    pub command: String,
    pub state: HealthState,
    pub last_transition: DateTime<Utc>,
    pub evidence: Option<String>,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    /// Pid of the warden itself.
    pub pid: u32,
    pub last_update: DateTime<Utc>,
    /// Keyed by workload pid.
    pub processes: BTreeMap<i32, ProcessStatus>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Sibling temp path; the rename only stays atomic inside one directory.
    fn staging_path(&self) -> PathBuf {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        dir.join(format!(".loopwarden.status.tmp.{}", std::process::id()))
    }

    /// Replace the snapshot on disk. Readers see the old or the new one, never a mix.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json = serde_json::to_vec_pretty(data).map_err(StatusError::Encode)?;
        let staging = self.staging_path();
        std::fs::write(&staging, json).map_err(|source| StatusError::Stage {
            path: staging.clone(),
            source,
        })?;
        std::fs::rename(&staging, &self.path).map_err(|source| StatusError::Publish {
            path: self.path.clone(),
            source,
        })
    }

    /// Delete the snapshot once nothing is left worth inspecting.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "could not remove status file");
            }
        }
    }
}

/// Keeps the per-process view and rewrites the file on each change.
pub struct StatusTracker {
    file: StatusFile,
    processes: BTreeMap<i32, ProcessStatus>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf) -> Self {
        Self {
            file: StatusFile::new(status_path),
            processes: BTreeMap::new(),
        }
    }

    /// Register a newly tracked workload.
    pub fn track(&mut self, id: ProcessId, command: &str) {
        self.processes.insert(
            id.pid,
            ProcessStatus {
                pid: id.pid,
                pgid: id.pgid,
                command: command.to_string(),
                state: HealthState::Healthy,
                last_transition: Utc::now(),
                evidence: None,
            },
        );
        self.update();
    }

    /// Fold a diagnosis into the view.
    pub fn apply(&mut self, diagnosis: &Diagnosis) {
        let Some(entry) = self.processes.get_mut(&diagnosis.process_id.pid) else {
            tracing::debug!(pid = diagnosis.process_id.pid, "diagnosis for untracked process");
            return;
        };
        entry.state = diagnosis.to_state;
        entry.last_transition = diagnosis.timestamp;
        entry.evidence = Some(diagnosis.evidence.clone());
        self.update();
    }

    /// Rewrite the status file. Failures are logged, never fatal.
    pub fn update(&self) {
        let data = StatusData {
            pid: std::process::id(),
            last_update: Utc::now(),
            processes: self.processes.clone(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn remove(&self) {
        self.file.remove();
    }
}

/// Why a status snapshot could not be published.
#[derive(Debug)]
pub enum StatusError {
    Encode(serde_json::Error),
    /// The temp file next to the status file could not be written.
    Stage { path: PathBuf, source: std::io::Error },
    /// The temp file could not be moved over the status file.
    Publish { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Encode(e) => write!(f, "cannot encode process states as JSON: {e}"),
            StatusError::Stage { path, source } => {
                write!(f, "cannot stage status snapshot at {}: {source}", path.display())
            }
            StatusError::Publish { path, source } => {
                write!(f, "cannot publish status snapshot to {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Encode(e) => Some(e),
            StatusError::Stage { source, .. } | StatusError::Publish { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ID: ProcessId = ProcessId { pid: 4242, pgid: 4242 };

    fn read(path: &Path) -> serde_json::Value {
        let contents = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&contents).unwrap()
    }

    #[test]
    fn test_snapshot_replaces_file_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loopwarden.status");
        let sf = StatusFile::new(path.clone());

        let data = StatusData {
            pid: 12345,
            last_update: Utc::now(),
            processes: BTreeMap::new(),
        };
        sf.write(&data).unwrap();

        let parsed = read(&path);
        assert_eq!(parsed["pid"], 12345);
        assert!(parsed["processes"].as_object().unwrap().is_empty());

        assert!(!sf.staging_path().exists(), "staging file should be renamed away");
    }

    #[test]
    fn test_tracker_records_transitions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loopwarden.status");
        let mut tracker = StatusTracker::new(path.clone());

        tracker.track(ID, "python worker.py");
        let parsed = read(&path);
        assert_eq!(parsed["processes"]["4242"]["state"], "healthy");
        assert_eq!(parsed["processes"]["4242"]["command"], "python worker.py");

        tracker.apply(&Diagnosis {
            process_id: ID,
            from_state: HealthState::Healthy,
            to_state: HealthState::Runaway,
            timestamp: Utc::now(),
            evidence: "cpu 99% sustained".to_string(),
        });
        let parsed = read(&path);
        assert_eq!(parsed["processes"]["4242"]["state"], "runaway");
        assert_eq!(parsed["processes"]["4242"]["evidence"], "cpu 99% sustained");
    }

    #[test]
    fn test_untracked_diagnosis_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loopwarden.status");
        let mut tracker = StatusTracker::new(path.clone());

        tracker.apply(&Diagnosis {
            process_id: ID,
            from_state: HealthState::Healthy,
            to_state: HealthState::Gone,
            timestamp: Utc::now(),
            evidence: String::new(),
        });
        assert!(!path.exists());
    }

    #[test]
    fn test_status_file_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loopwarden.status");
        let mut tracker = StatusTracker::new(path.clone());
        tracker.track(ID, "sleep 1");
        assert!(path.exists());

        tracker.remove();
        assert!(!path.exists());
        // Removing again is quiet.
        tracker.remove();
    }

    #[test]
    fn test_write_into_missing_dir_fails() {
        let sf = StatusFile::new(PathBuf::from("/nonexistent-dir/impossible/loopwarden.status"));
        let data = StatusData {
            pid: 1,
            last_update: Utc::now(),
            processes: BTreeMap::new(),
        };
        let err = sf.write(&data).unwrap_err();
        assert!(matches!(err, StatusError::Stage { .. }));
        assert!(err.to_string().starts_with("cannot stage status snapshot"));
    }
}
