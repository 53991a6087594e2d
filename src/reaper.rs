/// Process tree reaping: terminate every live member of a process group.
///
/// Works from the group id captured when tracking started, so it still
/// finds descendants after the tracked parent crashed and they were
/// reparented. SIGTERM first, SIGKILL after the grace period, then confirm
/// the group is empty. An already-empty group is a no-op.
use crate::config::ReaperConfig;
use crate::provider::{ProbeError, ProcessProvider};
use crate::retry::{backoff_delay, RetryDecision, RetryPolicy};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Nothing was alive; no signal was sent.
    AlreadyReaped,
    Terminated { forced: bool, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapError {
    /// Members were still alive after every attempt.
    ReapFailed {
        pgid: i32,
        survivors: Vec<i32>,
        attempts: u32,
    },
}

impl std::fmt::Display for ReapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReapError::ReapFailed {
                pgid,
                survivors,
                attempts,
            } => write!(
                f,
                "process group {pgid} still has {} live member(s) {survivors:?} after {attempts} attempt(s)",
                survivors.len()
            ),
        }
    }
}

impl std::error::Error for ReapError {}

/// How hard to push on the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapMode {
    /// SIGTERM, wait for the grace period, then SIGKILL.
    Graceful,
    /// SIGKILL straight away.
    Immediate,
}

#[derive(Clone)]
pub struct Reaper {
    provider: Arc<dyn ProcessProvider>,
    grace: Duration,
    kill_timeout: Duration,
    poll: Duration,
    max_attempts: u32,
    /// Flips to true when the grace period should be cut short.
    escalation: Option<watch::Receiver<bool>>,
}

impl Reaper {
    pub fn new(provider: Arc<dyn ProcessProvider>, config: &ReaperConfig) -> Self {
        Self {
            provider,
            grace: config.grace(),
            kill_timeout: config.kill_timeout(),
            poll: config.poll(),
            max_attempts: config.max_attempts,
            escalation: None,
        }
    }

    /// Skip the rest of any SIGTERM grace period once `escalation` reads true.
    pub fn with_escalation(mut self, escalation: watch::Receiver<bool>) -> Self {
        self.escalation = Some(escalation);
        self
    }

    pub async fn reap(&self, pgid: i32, mode: ReapMode) -> Result<ReapOutcome, ReapError> {
        if self.live_members(pgid).is_empty() {
            debug!(pgid, "process group already empty");
            return Ok(ReapOutcome::AlreadyReaped);
        }

        let mut policy = RetryPolicy::new(self.max_attempts);
        loop {
            let attempt = match policy.next_attempt() {
                RetryDecision::Retry { attempt } => attempt,
                RetryDecision::GiveUp => {
                    let survivors = self.live_members(pgid);
                    if survivors.is_empty() {
                        // Died during the final backoff.
                        return Ok(ReapOutcome::Terminated {
                            forced: true,
                            attempts: policy.current_attempt(),
                        });
                    }
                    return Err(ReapError::ReapFailed {
                        pgid,
                        survivors,
                        attempts: policy.current_attempt(),
                    });
                }
            };

            if mode == ReapMode::Graceful && attempt == 1 && !self.escalated() {
                self.signal(pgid, Signal::SIGTERM);
                if self.wait_empty(pgid, self.grace, true).await {
                    info!(pgid, "process group exited after SIGTERM");
                    return Ok(ReapOutcome::Terminated {
                        forced: false,
                        attempts: attempt,
                    });
                }
            }

            self.signal(pgid, Signal::SIGKILL);
            if self.wait_empty(pgid, self.kill_timeout, false).await {
                info!(pgid, attempt, "process group killed");
                return Ok(ReapOutcome::Terminated {
                    forced: true,
                    attempts: attempt,
                });
            }

            let delay = backoff_delay(self.poll.as_millis() as u64, attempt, 2000);
            warn!(pgid, attempt, delay_ms = delay, "process group survived SIGKILL, retrying");
            sleep(Duration::from_millis(delay)).await;
        }
    }

    fn signal(&self, pgid: i32, signal: Signal) {
        if let Err(e) = self.provider.signal_group(pgid, signal) {
            warn!(pgid, ?signal, error = %e, "failed to signal process group");
        }
    }

    /// Live members, treating an unreadable process table as "unknown, still alive".
    fn live_members(&self, pgid: i32) -> Vec<i32> {
        match self.provider.group_members(pgid) {
            Ok(members) => members,
            Err(ProbeError::Gone) => Vec::new(),
            Err(e) => {
                warn!(pgid, error = %e, "could not enumerate process group");
                vec![pgid]
            }
        }
    }

    fn escalated(&self) -> bool {
        self.escalation.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Poll until the group is empty. Returns false on timeout, or early when
    /// `interruptible` and an escalation arrives.
    async fn wait_empty(&self, pgid: i32, timeout: Duration, interruptible: bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.live_members(pgid).is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if interruptible && self.escalated() {
                info!(pgid, "escalation requested, skipping rest of grace period");
                return false;
            }
            sleep(self.poll).await;
        }
    }
}
