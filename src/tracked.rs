/// Per-workload tracking state: identity, sample windows, health, and diagnoses.
use crate::config::WardenConfig;
use crate::fingerprint::LogFingerprint;
use crate::history::TimedRing;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

/// Native pid plus the process group captured when tracking started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessId {
    pub pid: i32,
    pub pgid: i32,
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pid, self.pgid)
    }
}

/// Health of a tracked workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Bursty,
    Stuck,
    Runaway,
    Leaking,
    Zombie,
    /// Process and every descendant are gone.
    Gone,
    /// The reaper could not confirm termination; tracking was abandoned.
    Unreapable,
}

impl HealthState {
    /// Alarm states that never revert to Healthy/Bursty on their own.
    pub fn is_sticky(self) -> bool {
        matches!(
            self,
            HealthState::Stuck | HealthState::Runaway | HealthState::Leaking | HealthState::Zombie
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HealthState::Gone | HealthState::Unreapable)
    }

    /// Ordering used when one sticky state is replaced by another.
    pub fn severity(self) -> u8 {
        match self {
            HealthState::Healthy | HealthState::Bursty => 0,
            HealthState::Stuck => 1,
            HealthState::Runaway => 2,
            HealthState::Leaking => 3,
            HealthState::Zombie => 4,
            HealthState::Gone | HealthState::Unreapable => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Bursty => "bursty",
            HealthState::Stuck => "stuck",
            HealthState::Runaway => "runaway",
            HealthState::Leaking => "leaking",
            HealthState::Zombie => "zombie",
            HealthState::Gone => "gone",
            HealthState::Unreapable => "unreapable",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state transition, handed to consumers by value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub process_id: ProcessId,
    pub from_state: HealthState,
    pub to_state: HealthState,
    pub timestamp: DateTime<Utc>,
    pub evidence: String,
}

/// One monitored workload and its bounded evidence windows.
#[derive(Debug)]
pub struct TrackedProcess {
    pub id: ProcessId,
    pub started_at: Instant,
    pub cpu_samples: TimedRing<f64>,
    pub mem_samples: TimedRing<u64>,
    pub log_window: TimedRing<LogFingerprint>,
    /// Most recent output line, already redacted.
    pub last_line: Option<String>,
    pub state: HealthState,
    pub last_transition_at: Instant,
}

impl TrackedProcess {
    pub fn new(id: ProcessId, started_at: Instant, config: &WardenConfig) -> Self {
        Self {
            id,
            started_at,
            cpu_samples: TimedRing::new(config.sampler.history_capacity, None),
            mem_samples: TimedRing::new(config.sampler.history_capacity, None),
            log_window: TimedRing::new(config.logs.window_lines, Some(config.logs.window())),
            last_line: None,
            state: HealthState::Healthy,
            last_transition_at: started_at,
        }
    }

    /// Record one metrics reading. Both series share the timestamp.
    pub fn record_sample(&mut self, at: Instant, cpu_percent: f64, resident_bytes: u64) {
        if self.cpu_samples.push(at, cpu_percent) {
            self.mem_samples.push(at, resident_bytes);
        }
    }

    /// Record one fingerprinted line.
    pub fn record_line(&mut self, fingerprint: LogFingerprint, redacted: String) {
        if self.log_window.push(fingerprint.at, fingerprint) {
            self.last_line = Some(redacted);
        }
    }

    /// Apply a diagnosis produced for this process.
    pub fn apply(&mut self, diagnosis: &Diagnosis, at: Instant) {
        self.state = diagnosis.to_state;
        self.last_transition_at = at;
    }
}
