/// Per-workload monitoring unit.
///
/// Runs alongside one spawned workload. Line readers fingerprint stdout and
/// stderr, a sampler task polls CPU and memory, and a waiter collects the exit
/// status. All of them feed a single loop that owns the `TrackedProcess` and
/// its `HealthClassifier`, runs a classifier tick on a fixed interval, and
/// invokes the reaper when a diagnosis calls for it. Every helper task lives
/// in a `JoinSet` and is torn down on every exit path.
use crate::classifier::{HealthClassifier, Liveness, Observation};
use crate::config::{ActionMode, WardenConfig};
use crate::fingerprint::{fingerprint, redact, LogFingerprint};
use crate::provider::{ProbeError, ProcessProvider};
use crate::reaper::{ReapMode, ReapOutcome, Reaper};
use crate::repetition::RepetitionDetector;
use crate::sampler::{MetricsSampler, Reading, SampleError};
use crate::session::Session;
use crate::tracked::{Diagnosis, HealthState, ProcessId, TrackedProcess};
use crate::trend::TrendEvaluator;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

const FEED_CAPACITY: usize = 1024;
/// How long to wait for the exit status once the group is already empty.
const EXIT_DRAIN: Duration = Duration::from_secs(2);

/// Commands accepted by a running watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Clear a sticky diagnosis and the log window.
    Reset,
    /// Reap the group and stop tracking.
    Shutdown { immediate: bool },
}

/// How tracking ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOutcome {
    pub id: ProcessId,
    pub final_state: HealthState,
    /// Exit code of the tracked process (None if killed by a signal or never observed).
    pub exit_code: Option<i32>,
    /// True if the warden signalled the group.
    pub terminated: bool,
}

/// Handle to a running watchdog task.
pub struct WatchdogHandle {
    pub id: ProcessId,
    control: mpsc::Sender<Control>,
    /// Reaches a reap already in progress, which is not reading `control`.
    escalate: watch::Sender<bool>,
    state: watch::Receiver<HealthState>,
    task: JoinHandle<WatchOutcome>,
}

impl WatchdogHandle {
    pub fn state(&self) -> HealthState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.state.clone()
    }

    /// Send a command. Returns false if tracking has already stopped.
    ///
    /// An immediate shutdown also cuts short the grace period of any
    /// graceful reap that is already running.
    pub async fn send(&self, command: Control) -> bool {
        if command == (Control::Shutdown { immediate: true }) {
            self.escalate.send_replace(true);
        }
        self.control.send(command).await.is_ok()
    }

    /// Wait for tracking to end.
    pub async fn join(self) -> WatchOutcome {
        let id = self.id;
        let last = *self.state.borrow();
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(%id, error = %e, "watchdog task failed");
                WatchOutcome {
                    id,
                    final_state: last,
                    exit_code: None,
                    terminated: false,
                }
            }
        }
    }
}

/// Events delivered to the watchdog loop by its helper tasks.
enum Feed {
    Line(LogFingerprint, String),
    Sample(Result<Reading, SampleError>),
    Exited(Option<i32>),
}

#[derive(Clone)]
pub struct Watchdog {
    config: Arc<WardenConfig>,
    provider: Arc<dyn ProcessProvider>,
    diagnoses: mpsc::UnboundedSender<Diagnosis>,
    passthrough: bool,
}

impl Watchdog {
    pub fn new(
        config: Arc<WardenConfig>,
        provider: Arc<dyn ProcessProvider>,
        diagnoses: mpsc::UnboundedSender<Diagnosis>,
    ) -> Self {
        Self {
            config,
            provider,
            diagnoses,
            passthrough: false,
        }
    }

    /// Copy workload output to the warden's own stdout/stderr.
    pub fn with_passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Start monitoring a spawned workload.
    pub fn start(self, session: Session) -> WatchdogHandle {
        let id = session.id;
        let (control_tx, control_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(HealthState::Healthy);
        let (escalate_tx, escalate_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(session, control_rx, escalate_rx, state_tx));
        WatchdogHandle {
            id,
            control: control_tx,
            escalate: escalate_tx,
            state: state_rx,
            task,
        }
    }

    async fn run(
        self,
        session: Session,
        mut control: mpsc::Receiver<Control>,
        escalation: watch::Receiver<bool>,
        state_tx: watch::Sender<HealthState>,
    ) -> WatchOutcome {
        let Session {
            child,
            id,
            stdout,
            stderr,
        } = session;

        let started = Instant::now();
        let mut tracked = TrackedProcess::new(id, started, &self.config);
        let mut classifier = HealthClassifier::new(id, &self.config);
        let detector = RepetitionDetector::new(&self.config.logs);
        let evaluator = TrendEvaluator::new(&self.config.cpu, &self.config.memory);
        let reaper = Reaper::new(self.provider.clone(), &self.config.reaper).with_escalation(escalation);

        let (feed_tx, mut feed_rx) = mpsc::channel(FEED_CAPACITY);
        let mut tasks = JoinSet::new();
        if let Some(out) = stdout {
            let echo: Option<Box<dyn AsyncWrite + Unpin + Send>> = if self.passthrough {
                Some(Box::new(tokio::io::stdout()))
            } else {
                None
            };
            tasks.spawn(read_lines(out, echo, feed_tx.clone()));
        }
        if let Some(err) = stderr {
            let echo: Option<Box<dyn AsyncWrite + Unpin + Send>> = if self.passthrough {
                Some(Box::new(tokio::io::stderr()))
            } else {
                None
            };
            tasks.spawn(read_lines(err, echo, feed_tx.clone()));
        }
        tasks.spawn(sample_loop(
            MetricsSampler::new(self.provider.clone(), id),
            self.config.sampler.interval(),
            feed_tx.clone(),
        ));
        tasks.spawn(wait_exit(child, id, feed_tx));

        let mut tick = tokio::time::interval(self.config.classifier.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut parent_gone = false;
        let mut exited = false;
        let mut exit_code = None;
        let mut terminated = false;
        let mut control_open = true;

        while !classifier.state().is_terminal() {
            tokio::select! {
                Some(feed) = feed_rx.recv() => match feed {
                    Feed::Line(fp, line) => tracked.record_line(fp, line),
                    Feed::Sample(Ok(reading)) => {
                        tracked.record_sample(reading.at, reading.cpu_percent, reading.resident_bytes);
                    }
                    Feed::Sample(Err(SampleError::ProcessGone)) => parent_gone = true,
                    Feed::Sample(Err(SampleError::SamplingUnavailable(msg))) => {
                        tracing::debug!(%id, reason = %msg, "skipping sample");
                    }
                    Feed::Exited(code) => {
                        parent_gone = true;
                        exited = true;
                        exit_code = code;
                    }
                },
                _ = tick.tick() => {
                    let now = Instant::now();
                    let Some(liveness) = self.liveness(id, parent_gone) else {
                        continue;
                    };
                    tracked.log_window.prune(now);
                    let observation = Observation {
                        at: now,
                        repetition: detector.detect(&tracked.log_window),
                        resources: evaluator.evaluate(&tracked.cpu_samples, &tracked.mem_samples),
                        liveness,
                        last_line: tracked.last_line.clone(),
                    };
                    let Some(diagnosis) = classifier.observe(&observation) else {
                        continue;
                    };
                    let to = diagnosis.to_state;
                    self.emit(&mut tracked, &state_tx, diagnosis, now);
                    if self.calls_for_reap(to) {
                        terminated |= self
                            .reap(&reaper, id, ReapMode::Graceful, &mut classifier, &mut tracked, &state_tx)
                            .await;
                    }
                }
                command = control.recv(), if control_open => match command {
                    Some(Control::Reset) => {
                        let now = Instant::now();
                        tracked.log_window.clear();
                        if let Some(diagnosis) = classifier.reset() {
                            self.emit(&mut tracked, &state_tx, diagnosis, now);
                        }
                    }
                    Some(Control::Shutdown { immediate }) => {
                        tracing::info!(%id, immediate, "shutdown requested, reaping workload");
                        let mode = if immediate { ReapMode::Immediate } else { ReapMode::Graceful };
                        terminated |= self
                            .reap(&reaper, id, mode, &mut classifier, &mut tracked, &state_tx)
                            .await;
                    }
                    None => control_open = false,
                },
            }
        }

        let final_state = classifier.state();
        if !exited && final_state == HealthState::Gone {
            let _ = tokio::time::timeout(EXIT_DRAIN, async {
                while let Some(feed) = feed_rx.recv().await {
                    if let Feed::Exited(code) = feed {
                        exit_code = code;
                        break;
                    }
                }
            })
            .await;
        }
        tasks.shutdown().await;

        tracing::info!(
            %id,
            state = %final_state,
            exit_code = ?exit_code,
            tracked_secs = tracked.started_at.elapsed().as_secs(),
            "tracking stopped"
        );
        WatchOutcome {
            id,
            final_state,
            exit_code,
            terminated,
        }
    }

    /// `None` when the process table could not be read this tick.
    fn liveness(&self, id: ProcessId, parent_gone: bool) -> Option<Liveness> {
        if !parent_gone {
            return Some(Liveness::Running);
        }
        match self.provider.group_members(id.pgid) {
            Ok(members) if members.is_empty() => Some(Liveness::GroupEmpty),
            Ok(members) => Some(Liveness::ParentGone {
                live_descendants: members.len(),
            }),
            Err(ProbeError::Gone) => Some(Liveness::GroupEmpty),
            Err(e) => {
                tracing::debug!(%id, error = %e, "group membership unavailable");
                None
            }
        }
    }

    fn calls_for_reap(&self, state: HealthState) -> bool {
        match state {
            HealthState::Zombie => true,
            HealthState::Runaway | HealthState::Stuck | HealthState::Leaking => {
                self.config.action.mode == ActionMode::Kill
            }
            _ => false,
        }
    }

    /// Reap the group. Returns true if any member was signalled away.
    async fn reap(
        &self,
        reaper: &Reaper,
        id: ProcessId,
        mode: ReapMode,
        classifier: &mut HealthClassifier,
        tracked: &mut TrackedProcess,
        state_tx: &watch::Sender<HealthState>,
    ) -> bool {
        match reaper.reap(id.pgid, mode).await {
            Ok(ReapOutcome::AlreadyReaped) => false,
            Ok(ReapOutcome::Terminated { forced, attempts }) => {
                tracing::info!(%id, forced, attempts, "workload reaped");
                true
            }
            Err(e) => {
                tracing::error!(%id, error = %e, "reap failed, abandoning tracking");
                let now = Instant::now();
                if let Some(diagnosis) = classifier.abandon(e.to_string()) {
                    self.emit(tracked, state_tx, diagnosis, now);
                }
                true
            }
        }
    }

    fn emit(
        &self,
        tracked: &mut TrackedProcess,
        state_tx: &watch::Sender<HealthState>,
        diagnosis: Diagnosis,
        at: Instant,
    ) {
        let id = diagnosis.process_id;
        if diagnosis.to_state.is_sticky() || diagnosis.to_state == HealthState::Unreapable {
            tracing::warn!(
                pid = id.pid,
                pgid = id.pgid,
                from = %diagnosis.from_state,
                to = %diagnosis.to_state,
                evidence = %diagnosis.evidence,
                "health diagnosis"
            );
        } else {
            tracing::info!(
                pid = id.pid,
                pgid = id.pgid,
                from = %diagnosis.from_state,
                to = %diagnosis.to_state,
                evidence = %diagnosis.evidence,
                "health diagnosis"
            );
        }
        tracked.apply(&diagnosis, at);
        state_tx.send_replace(diagnosis.to_state);
        if self.diagnoses.send(diagnosis).is_err() {
            tracing::debug!(%id, "diagnosis receiver dropped");
        }
    }
}

/// Fingerprint every line of one output stream until it closes.
async fn read_lines<R>(
    stream: R,
    mut echo: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    feed: mpsc::Sender<Feed>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "output stream read failed");
                break;
            }
        }
        if let Some(sink) = echo.as_mut() {
            if sink.write_all(&buf).await.is_err() {
                echo = None;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let fp = fingerprint(&line, Instant::now());
        let redacted = redact(line.trim_end_matches(['\r', '\n']));
        if feed.send(Feed::Line(fp, redacted)).await.is_err() {
            break;
        }
    }
    if let Some(sink) = echo.as_mut() {
        let _ = sink.flush().await;
    }
}

async fn sample_loop(mut sampler: MetricsSampler, period: Duration, feed: mpsc::Sender<Feed>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let result = match sampler.sample(Instant::now()) {
            Ok(None) => continue,
            Ok(Some(reading)) => Ok(reading),
            Err(e) => Err(e),
        };
        let gone = matches!(result, Err(SampleError::ProcessGone));
        if feed.send(Feed::Sample(result)).await.is_err() || gone {
            break;
        }
    }
}

async fn wait_exit(mut child: Child, id: ProcessId, feed: mpsc::Sender<Feed>) {
    use std::os::unix::process::ExitStatusExt;

    let code = match child.wait().await {
        Ok(status) => {
            match (status.code(), status.signal()) {
                (Some(124), _) => {
                    tracing::warn!(%id, "workload exited with 124 (self-imposed timeout)")
                }
                (Some(code), _) => tracing::info!(%id, code, "workload exited"),
                (None, Some(signal)) => tracing::info!(%id, signal, "workload killed by signal"),
                (None, None) => tracing::info!(%id, "workload exited"),
            }
            status.code()
        }
        Err(e) => {
            tracing::warn!(%id, error = %e, "failed to wait for workload");
            None
        }
    };
    let _ = feed.send(Feed::Exited(code)).await;
}
