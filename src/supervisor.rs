/// Supervisor: owns one watchdog per tracked workload.
///
/// Consumers get two things: the shared `Diagnosis` stream returned by
/// `Supervisor::new`, and `state()` for the current health of any tracked
/// process. Teardown reaps every group that is still alive.
use crate::config::WardenConfig;
use crate::provider::ProcessProvider;
use crate::session::{self, SessionError};
use crate::tracked::{Diagnosis, HealthState, ProcessId};
use crate::watchdog::{Control, WatchOutcome, Watchdog, WatchdogHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub struct Supervisor {
    watchdog: Watchdog,
    workloads: HashMap<ProcessId, WatchdogHandle>,
}

impl Supervisor {
    pub fn new(
        config: WardenConfig,
        provider: Arc<dyn ProcessProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<Diagnosis>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            watchdog: Watchdog::new(Arc::new(config), provider, tx),
            workloads: HashMap::new(),
        };
        (supervisor, rx)
    }

    /// Copy workload output through to the warden's stdout/stderr.
    pub fn with_passthrough(mut self, passthrough: bool) -> Self {
        self.watchdog = self.watchdog.with_passthrough(passthrough);
        self
    }

    /// Spawn `command` in its own process group and start tracking it.
    pub fn track(&mut self, command: &[String]) -> Result<ProcessId, SessionError> {
        let session = session::spawn(command)?;
        let id = session.id;
        let handle = self.watchdog.clone().start(session);
        tracing::info!(%id, command = %command.join(" "), "tracking workload");
        self.workloads.insert(id, handle);
        Ok(id)
    }

    /// Current health of a tracked process. Finished workloads keep their final state.
    pub fn state(&self, id: ProcessId) -> Option<HealthState> {
        self.workloads.get(&id).map(|w| w.state())
    }

    pub fn subscribe(&self, id: ProcessId) -> Option<watch::Receiver<HealthState>> {
        self.workloads.get(&id).map(|w| w.subscribe())
    }

    /// Clear a sticky diagnosis. Returns false if the process is unknown or finished.
    pub async fn reset(&self, id: ProcessId) -> bool {
        match self.workloads.get(&id) {
            Some(w) => w.send(Control::Reset).await,
            None => false,
        }
    }

    /// Ask every watchdog to reap its group without waiting for them to finish.
    pub async fn request_shutdown(&self, immediate: bool) {
        for (id, handle) in &self.workloads {
            if !handle.send(Control::Shutdown { immediate }).await {
                tracing::debug!(%id, "watchdog already stopped");
            }
        }
    }

    /// Stop tracking `id` once its watchdog finishes.
    pub async fn wait(&mut self, id: ProcessId) -> Option<WatchOutcome> {
        let handle = self.workloads.remove(&id)?;
        Some(handle.join().await)
    }

    /// Reap every tracked group and wait for all watchdogs to finish.
    pub async fn shutdown(mut self, immediate: bool) -> Vec<WatchOutcome> {
        self.request_shutdown(immediate).await;
        let mut outcomes = Vec::with_capacity(self.workloads.len());
        for (_, handle) in self.workloads.drain() {
            outcomes.push(handle.join().await);
        }
        outcomes
    }
}
