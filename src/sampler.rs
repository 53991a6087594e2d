/// Metrics sampling for one tracked process tree.
///
/// CPU percent is the CPU time consumed by the tracked process and all live
/// descendants since the previous sample, divided by the wall time between
/// samples. 100% means one core fully busy.
use crate::provider::{ProbeError, ProcessProvider};
use crate::tracked::ProcessId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One metrics reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub at: Instant,
    pub cpu_percent: f64,
    pub resident_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    /// The tracked process exited or became unobservable. Tracking should stop.
    ProcessGone,
    /// Metrics could not be read this tick. Skip it without transitioning.
    SamplingUnavailable(String),
}

impl std::fmt::Display for SampleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleError::ProcessGone => write!(f, "tracked process is gone"),
            SampleError::SamplingUnavailable(msg) => write!(f, "sampling unavailable: {msg}"),
        }
    }
}

impl std::error::Error for SampleError {}

pub struct MetricsSampler {
    provider: Arc<dyn ProcessProvider>,
    id: ProcessId,
    previous: Option<(Instant, HashMap<i32, Duration>)>,
    gone: bool,
}

impl MetricsSampler {
    pub fn new(provider: Arc<dyn ProcessProvider>, id: ProcessId) -> Self {
        Self {
            provider,
            id,
            previous: None,
            gone: false,
        }
    }

    /// Take one sample at `at`.
    ///
    /// The first successful call only establishes the CPU baseline and
    /// returns `Ok(None)`.
    pub fn sample(&mut self, at: Instant) -> Result<Option<Reading>, SampleError> {
        if self.gone {
            return Err(SampleError::ProcessGone);
        }

        let usage = match self.provider.tree_usage(self.id.pid, self.id.pgid) {
            Ok(usage) => usage,
            Err(ProbeError::Gone) => {
                self.gone = true;
                tracing::debug!(pid = self.id.pid, "sampler lost tracked process");
                return Err(SampleError::ProcessGone);
            }
            Err(ProbeError::Unavailable(msg)) => {
                return Err(SampleError::SamplingUnavailable(msg));
            }
        };

        let current: HashMap<i32, Duration> =
            usage.members.iter().map(|m| (m.pid, m.cpu_time)).collect();
        let resident_bytes = usage.resident_bytes();

        let Some((prev_at, prev)) = self.previous.replace((at, current.clone())) else {
            return Ok(None);
        };

        let wall = at.saturating_duration_since(prev_at);
        if wall.is_zero() {
            return Err(SampleError::SamplingUnavailable(
                "no wall time elapsed since previous sample".to_string(),
            ));
        }

        // Members seen for the first time contribute all of their CPU time.
        let busy: Duration = current
            .iter()
            .map(|(pid, cpu)| cpu.saturating_sub(prev.get(pid).copied().unwrap_or_default()))
            .sum();

        Ok(Some(Reading {
            at,
            cpu_percent: busy.as_secs_f64() / wall.as_secs_f64() * 100.0,
            resident_bytes,
        }))
    }
}
