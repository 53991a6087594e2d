/// Signal handling for supervisor teardown.
///
/// First SIGINT: reap workloads gracefully (SIGTERM, grace period, SIGKILL).
/// Second SIGINT within 3s: reap immediately with SIGKILL.
/// SIGTERM: same as a single SIGINT.
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, Signal, SignalKind};

const DOUBLE_TAP: Duration = Duration::from_secs(3);

/// What the supervisor should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    Graceful,
    Immediate,
}

impl ShutdownRequest {
    pub fn is_immediate(self) -> bool {
        self == ShutdownRequest::Immediate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Received {
    Interrupt,
    Terminate,
}

/// Tracks SIGINT timing to detect a double Ctrl-C.
#[derive(Debug, Default)]
struct Escalation {
    last_interrupt: Option<Instant>,
}

impl Escalation {
    fn on(&mut self, received: Received, now: Instant) -> ShutdownRequest {
        match received {
            Received::Terminate => ShutdownRequest::Graceful,
            Received::Interrupt => {
                let repeat = self
                    .last_interrupt
                    .is_some_and(|at| now.saturating_duration_since(at) <= DOUBLE_TAP);
                self.last_interrupt = Some(now);
                if repeat {
                    ShutdownRequest::Immediate
                } else {
                    ShutdownRequest::Graceful
                }
            }
        }
    }
}

pub struct SignalHandler {
    interrupt: Signal,
    terminate: Signal,
    escalation: Escalation,
}

impl SignalHandler {
    /// Register SIGINT and SIGTERM listeners. Must be called inside a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            escalation: Escalation::default(),
        })
    }

    /// Wait for the next shutdown signal.
    pub async fn recv(&mut self) -> ShutdownRequest {
        let received = tokio::select! {
            _ = self.interrupt.recv() => Received::Interrupt,
            _ = self.terminate.recv() => Received::Terminate,
        };
        let request = self.escalation.on(received, Instant::now());
        tracing::info!(signal = ?received, ?request, "shutdown signal received");
        request
    }
}
