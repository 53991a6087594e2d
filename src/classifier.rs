/// Health classification state machine.
///
/// Combines the repetition report, the resource verdict, and process
/// liveness into one `HealthState` per tracked process. Every state change
/// yields exactly one `Diagnosis`. Alarm states (stuck, runaway, leaking,
/// zombie) are sticky: they only give way to a more severe state, to `Gone`,
/// or to an explicit `reset`.
use crate::config::WardenConfig;
use crate::repetition::RepetitionReport;
use crate::tracked::{Diagnosis, HealthState, ProcessId};
use crate::trend::{CpuVerdict, MemoryVerdict, ResourceVerdict};
use chrono::Utc;
use std::time::{Duration, Instant};

/// Whether the tracked process and its group are still around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Tracked process is gone but members of its group are still alive.
    ParentGone { live_descendants: usize },
    /// Tracked process and every group member are gone.
    GroupEmpty,
}

/// One classifier tick's worth of evidence.
#[derive(Debug, Clone)]
pub struct Observation {
    pub at: Instant,
    pub repetition: RepetitionReport,
    pub resources: ResourceVerdict,
    pub liveness: Liveness,
    /// Most recent output line, already redacted.
    pub last_line: Option<String>,
}

#[derive(Debug)]
pub struct HealthClassifier {
    process_id: ProcessId,
    state: HealthState,
    loop_since: Option<Instant>,
    sustained_since: Option<Instant>,
    runaway_grace: Duration,
    loop_dwell: Duration,
    cpu_window: Duration,
}

impl HealthClassifier {
    pub fn new(process_id: ProcessId, config: &WardenConfig) -> Self {
        Self {
            process_id,
            state: HealthState::Healthy,
            loop_since: None,
            sustained_since: None,
            runaway_grace: config.cpu.runaway_grace(),
            loop_dwell: config.classifier.loop_dwell(),
            cpu_window: config.cpu.window(),
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Evaluate one tick. Returns the diagnosis if the state changed.
    pub fn observe(&mut self, obs: &Observation) -> Option<Diagnosis> {
        if self.state.is_terminal() {
            return None;
        }

        if obs.repetition.is_loop_evidence() {
            self.loop_since.get_or_insert(obs.at);
        } else {
            self.loop_since = None;
        }
        if obs.resources.cpu == CpuVerdict::Sustained {
            self.sustained_since.get_or_insert(obs.at);
        } else {
            self.sustained_since = None;
        }

        match obs.liveness {
            Liveness::GroupEmpty => self.transition(
                HealthState::Gone,
                format!("process group {} has no live members", self.process_id.pgid),
            ),
            Liveness::ParentGone { live_descendants } => {
                if self.state == HealthState::Zombie {
                    return None;
                }
                self.transition(
                    HealthState::Zombie,
                    format!(
                        "tracked process {} is gone but {} member(s) of group {} are still alive",
                        self.process_id.pid, live_descendants, self.process_id.pgid
                    ),
                )
            }
            Liveness::Running => self.assess_running(obs),
        }
    }

    fn assess_running(&mut self, obs: &Observation) -> Option<Diagnosis> {
        if let Some((alarm, evidence)) = self.alarm(obs) {
            let escalates = if self.state.is_sticky() {
                alarm.severity() > self.state.severity()
            } else {
                true
            };
            if escalates {
                return self.transition(alarm, evidence);
            }
            return None;
        }

        if self.state.is_sticky() {
            return None;
        }

        match obs.resources.cpu {
            CpuVerdict::Spiking => self.transition(HealthState::Bursty, obs.resources.describe_cpu()),
            CpuVerdict::Normal => self.transition(HealthState::Healthy, obs.resources.describe_cpu()),
            // High but still inside the runaway grace period.
            CpuVerdict::Sustained => None,
        }
    }

    /// Most severe alarm the evidence supports, if any.
    fn alarm(&self, obs: &Observation) -> Option<(HealthState, String)> {
        if obs.resources.memory == MemoryVerdict::Leak {
            return Some((HealthState::Leaking, obs.resources.describe_memory()));
        }

        if obs.resources.cpu == CpuVerdict::Sustained {
            if obs.repetition.is_loop_evidence() {
                return Some((
                    HealthState::Runaway,
                    with_line(
                        format!(
                            "{} with {}",
                            obs.resources.describe_cpu(),
                            obs.repetition.describe()
                        ),
                        obs.last_line.as_deref(),
                    ),
                ));
            }
            let sustained_for = self
                .sustained_since
                .map(|since| obs.at.saturating_duration_since(since))
                .unwrap_or_default();
            if sustained_for >= self.runaway_grace {
                return Some((
                    HealthState::Runaway,
                    format!(
                        "{} for {}s without repetitive output",
                        obs.resources.describe_cpu(),
                        sustained_for.as_secs()
                    ),
                ));
            }
        }

        if let Some(since) = self.loop_since {
            let looping_for = obs.at.saturating_duration_since(since);
            // A loop whose CPU is already high but whose window is not yet
            // covered may still turn out to be Runaway. Wait for the window,
            // but never longer than one window past the dwell.
            let cpu_pending =
                obs.resources.cpu_warming && looping_for < self.loop_dwell + self.cpu_window;
            if looping_for >= self.loop_dwell && !cpu_pending {
                return Some((
                    HealthState::Stuck,
                    with_line(
                        format!("{} for {}s", obs.repetition.describe(), looping_for.as_secs()),
                        obs.last_line.as_deref(),
                    ),
                ));
            }
        }

        None
    }

    /// Tracking was abandoned because the group could not be reaped.
    pub fn abandon(&mut self, reason: String) -> Option<Diagnosis> {
        if self.state.is_terminal() {
            return None;
        }
        self.transition(HealthState::Unreapable, reason)
    }

    /// External reset: clears any sticky diagnosis and evidence timers.
    pub fn reset(&mut self) -> Option<Diagnosis> {
        if self.state.is_terminal() {
            return None;
        }
        self.loop_since = None;
        self.sustained_since = None;
        self.transition(HealthState::Healthy, "tracking reset".to_string())
    }

    fn transition(&mut self, to: HealthState, evidence: String) -> Option<Diagnosis> {
        if to == self.state {
            return None;
        }
        let diagnosis = Diagnosis {
            process_id: self.process_id,
            from_state: self.state,
            to_state: to,
            timestamp: Utc::now(),
            evidence,
        };
        self.state = to;
        Some(diagnosis)
    }
}

fn with_line(evidence: String, line: Option<&str>) -> String {
    match line {
        Some(line) => format!("{evidence}; last line: {line:?}"),
        None => evidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::repetition::{RepetitionDetector, RepetitionVerdict};
    use crate::tracked::TrackedProcess;
    use crate::trend::{GrowthRun, TrendEvaluator};

    const ID: ProcessId = ProcessId { pid: 4242, pgid: 4242 };

    struct Harness {
        classifier: HealthClassifier,
        t0: Instant,
        diagnoses: Vec<Diagnosis>,
    }

    impl Harness {
        fn new() -> Self {
            let t0 = Instant::now();
            Self {
                classifier: HealthClassifier::new(ID, &WardenConfig::default()),
                t0,
                diagnoses: Vec::new(),
            }
        }

        fn tick(&mut self, secs: u64, repetition: RepetitionVerdict, cpu: CpuVerdict, memory: MemoryVerdict) {
            self.tick_with(secs, report(repetition), cpu, memory, Liveness::Running);
        }

        fn tick_with(
            &mut self,
            secs: u64,
            repetition: RepetitionReport,
            cpu: CpuVerdict,
            memory: MemoryVerdict,
            liveness: Liveness,
        ) {
            let obs = Observation {
                at: self.t0 + Duration::from_secs(secs),
                repetition,
                resources: resources(cpu, memory),
                liveness,
                last_line: Some("[7] I am stuck in a loop".to_string()),
            };
            if let Some(d) = self.classifier.observe(&obs) {
                self.diagnoses.push(d);
            }
        }

        fn state(&self) -> HealthState {
            self.classifier.state()
        }
    }

    fn report(verdict: RepetitionVerdict) -> RepetitionReport {
        RepetitionReport {
            verdict,
            window_len: 50,
            exact_fraction: if verdict == RepetitionVerdict::ExactLoop { 1.0 } else { 0.1 },
            shape_fraction: if verdict == RepetitionVerdict::Varied { 0.1 } else { 1.0 },
            raw_diversity: 0.5,
            progress_like: false,
        }
    }

    fn resources(cpu: CpuVerdict, memory: MemoryVerdict) -> ResourceVerdict {
        ResourceVerdict {
            cpu,
            memory,
            cpu_mean: if cpu == CpuVerdict::Sustained { 99.0 } else { 10.0 },
            cpu_peak: if cpu == CpuVerdict::Normal { 10.0 } else { 100.0 },
            cpu_warming: false,
            growth: GrowthRun::default(),
        }
    }

    use crate::repetition::RepetitionVerdict as R;
    use crate::trend::CpuVerdict as C;
    use crate::trend::MemoryVerdict as M;

    #[test]
    fn test_varied_low_cpu_stays_healthy_or_bursty() {
        let mut h = Harness::new();
        for s in 0..120 {
            let cpu = if s % 10 < 2 { C::Spiking } else { C::Normal };
            h.tick(s, R::Varied, cpu, M::Normal);
            assert!(matches!(h.state(), HealthState::Healthy | HealthState::Bursty));
        }
        // Free oscillation, one diagnosis per change.
        assert!(h.diagnoses.len() >= 20);
        assert!(h.diagnoses.iter().all(|d| d.from_state != d.to_state));
    }

    #[test]
    fn test_healthy_spike_never_runaway() {
        let mut h = Harness::new();
        for s in 0..3 {
            h.tick(s, R::Varied, C::Spiking, M::Normal);
        }
        for s in 3..10 {
            h.tick(s, R::Varied, C::Normal, M::Normal);
        }
        assert_eq!(h.state(), HealthState::Healthy);
        assert!(h.diagnoses.iter().all(|d| d.to_state != HealthState::Runaway));
        assert_eq!(h.diagnoses[0].to_state, HealthState::Bursty);
    }

    #[test]
    fn test_sustained_cpu_with_exact_loop_is_runaway() {
        let mut h = Harness::new();
        h.tick(0, R::ExactLoop, C::Sustained, M::Normal);
        assert_eq!(h.state(), HealthState::Runaway);
        assert_eq!(h.diagnoses.len(), 1);
        assert_eq!(h.diagnoses[0].from_state, HealthState::Healthy);
        assert!(h.diagnoses[0].evidence.contains("exact loop"));
        assert!(h.diagnoses[0].evidence.contains("last line"));
    }

    #[test]
    fn test_silent_runaway_after_grace() {
        let mut h = Harness::new();
        for s in 0..30 {
            h.tick(s, R::Varied, C::Sustained, M::Normal);
            assert_ne!(h.state(), HealthState::Runaway, "runaway at {s}s is too early");
        }
        h.tick(30, R::Varied, C::Sustained, M::Normal);
        assert_eq!(h.state(), HealthState::Runaway);
    }

    #[test]
    fn test_interrupted_sustained_cpu_restarts_grace() {
        let mut h = Harness::new();
        for s in 0..20 {
            h.tick(s, R::Varied, C::Sustained, M::Normal);
        }
        h.tick(20, R::Varied, C::Spiking, M::Normal);
        for s in 21..45 {
            h.tick(s, R::Varied, C::Sustained, M::Normal);
        }
        assert_ne!(h.state(), HealthState::Runaway);
    }

    #[test]
    fn test_low_cpu_fuzzy_loop_becomes_stuck_after_dwell() {
        let mut h = Harness::new();
        for s in 0..10 {
            h.tick(s, R::FuzzyLoop, C::Normal, M::Normal);
            assert_ne!(h.state(), HealthState::Stuck);
        }
        h.tick(10, R::FuzzyLoop, C::Normal, M::Normal);
        assert_eq!(h.state(), HealthState::Stuck);
        assert!(h.diagnoses.last().unwrap().evidence.contains("fuzzy loop"));
    }

    #[test]
    fn test_progress_like_fuzzy_loop_is_not_stuck() {
        let mut h = Harness::new();
        let mut progress = report(R::FuzzyLoop);
        progress.progress_like = true;
        progress.raw_diversity = 1.0;
        for s in 0..60 {
            h.tick_with(s, progress, C::Normal, M::Normal, Liveness::Running);
        }
        assert_eq!(h.state(), HealthState::Healthy);
    }

    #[test]
    fn test_leak_transitions_to_leaking() {
        let mut h = Harness::new();
        h.tick(0, R::Varied, C::Normal, M::Normal);
        h.tick(1, R::Varied, C::Normal, M::Leak);
        assert_eq!(h.state(), HealthState::Leaking);
        assert_eq!(h.diagnoses.len(), 1);
    }

    #[test]
    fn test_alarm_states_are_sticky() {
        for (rep, cpu, mem, expected) in [
            (R::ExactLoop, C::Sustained, M::Normal, HealthState::Runaway),
            (R::Varied, C::Normal, M::Leak, HealthState::Leaking),
        ] {
            let mut h = Harness::new();
            h.tick(0, rep, cpu, mem);
            assert_eq!(h.state(), expected);
            for s in 1..100 {
                h.tick(s, R::Varied, C::Normal, M::Normal);
            }
            assert_eq!(h.state(), expected);
            assert_eq!(h.diagnoses.len(), 1);
        }

        let mut h = Harness::new();
        for s in 0..=10 {
            h.tick(s, R::ExactLoop, C::Normal, M::Normal);
        }
        assert_eq!(h.state(), HealthState::Stuck);
        for s in 11..100 {
            h.tick(s, R::Varied, C::Spiking, M::Normal);
        }
        assert_eq!(h.state(), HealthState::Stuck);
    }

    #[test]
    fn test_zombie_is_sticky_until_gone() {
        let mut h = Harness::new();
        h.tick_with(0, report(R::Varied), C::Normal, M::Normal, Liveness::ParentGone { live_descendants: 1 });
        assert_eq!(h.state(), HealthState::Zombie);
        h.tick_with(1, report(R::Varied), C::Normal, M::Normal, Liveness::ParentGone { live_descendants: 1 });
        h.tick_with(2, report(R::Varied), C::Normal, M::Normal, Liveness::Running);
        assert_eq!(h.state(), HealthState::Zombie);
        assert_eq!(h.diagnoses.len(), 1);
        assert!(h.diagnoses[0].evidence.contains("1 member"));

        h.tick_with(3, report(R::Varied), C::Normal, M::Normal, Liveness::GroupEmpty);
        assert_eq!(h.state(), HealthState::Gone);
        assert_eq!(h.diagnoses[1].from_state, HealthState::Zombie);
    }

    #[test]
    fn test_gone_is_terminal() {
        let mut h = Harness::new();
        h.tick_with(0, report(R::Varied), C::Normal, M::Normal, Liveness::GroupEmpty);
        assert_eq!(h.state(), HealthState::Gone);
        h.tick(1, R::ExactLoop, C::Sustained, M::Leak);
        assert_eq!(h.state(), HealthState::Gone);
        assert_eq!(h.diagnoses.len(), 1);
        assert!(h.classifier.reset().is_none());
    }

    #[test]
    fn test_sticky_states_escalate_by_severity() {
        let mut h = Harness::new();
        for s in 0..=10 {
            h.tick(s, R::FuzzyLoop, C::Normal, M::Normal);
        }
        assert_eq!(h.state(), HealthState::Stuck);
        h.tick(11, R::FuzzyLoop, C::Sustained, M::Normal);
        assert_eq!(h.state(), HealthState::Runaway);
        h.tick(12, R::FuzzyLoop, C::Sustained, M::Leak);
        assert_eq!(h.state(), HealthState::Leaking);
        // Runaway evidence no longer moves a leaking process.
        h.tick(13, R::ExactLoop, C::Sustained, M::Normal);
        assert_eq!(h.state(), HealthState::Leaking);
        assert_eq!(h.diagnoses.len(), 3);
    }

    #[test]
    fn test_reset_clears_sticky_state() {
        let mut h = Harness::new();
        h.tick(0, R::Varied, C::Normal, M::Leak);
        assert_eq!(h.state(), HealthState::Leaking);
        let d = h.classifier.reset().unwrap();
        assert_eq!(d.from_state, HealthState::Leaking);
        assert_eq!(d.to_state, HealthState::Healthy);
        h.tick(2, R::Varied, C::Spiking, M::Normal);
        assert_eq!(h.state(), HealthState::Bursty);
    }

    #[test]
    fn test_abandon_is_terminal() {
        let mut h = Harness::new();
        h.tick(0, R::ExactLoop, C::Sustained, M::Normal);
        let d = h
            .classifier
            .abandon("reap failed".to_string())
            .unwrap();
        assert_eq!(d.to_state, HealthState::Unreapable);
        assert!(h.classifier.abandon("again".to_string()).is_none());
        h.tick_with(1, report(R::Varied), C::Normal, M::Normal, Liveness::GroupEmpty);
        assert_eq!(h.state(), HealthState::Unreapable);
    }


    #[test]
    fn test_warming_cpu_holds_stuck_only_for_one_window() {
        let mut h = Harness::new();
        let mut warming = resources(C::Spiking, M::Normal);
        warming.cpu_mean = 100.0;
        warming.cpu_warming = true;
        for s in 0..20 {
            let obs = Observation {
                at: h.t0 + Duration::from_secs(s),
                repetition: report(R::ExactLoop),
                resources: warming,
                liveness: Liveness::Running,
                last_line: None,
            };
            h.classifier.observe(&obs);
            assert_ne!(h.state(), HealthState::Stuck, "stuck at {s}s while cpu warming");
        }
        let obs = Observation {
            at: h.t0 + Duration::from_secs(20),
            repetition: report(R::ExactLoop),
            resources: warming,
            liveness: Liveness::Running,
            last_line: None,
        };
        assert_eq!(h.classifier.observe(&obs).map(|d| d.to_state), Some(HealthState::Stuck));
    }

    /// Drives the real detector and evaluator the way the watchdog does: a
    /// flood of identical lines and one 100% CPU sample per second, landing
    /// just before or just after each one-second classifier tick.
    fn busy_loop_transitions(sample_before_tick: bool) -> Vec<(u64, HealthState)> {
        let config = WardenConfig::default();
        let t0 = Instant::now();
        let mut tracked = TrackedProcess::new(ID, t0, &config);
        let mut classifier = HealthClassifier::new(ID, &config);
        let detector = RepetitionDetector::new(&config.logs);
        let evaluator = TrendEvaluator::new(&config.cpu, &config.memory);
        let line = "retrying the same request";

        let mut transitions = Vec::new();
        for s in 1..=20u64 {
            let tick = t0 + Duration::from_secs(s);
            for i in 0..60u64 {
                let at = tick - Duration::from_secs(1) + Duration::from_millis(i * 15);
                tracked.record_line(fingerprint(line, at), line.to_string());
            }
            if sample_before_tick {
                tracked.record_sample(tick - Duration::from_millis(1), 100.0, 50_000_000);
            }

            tracked.log_window.prune(tick);
            let obs = Observation {
                at: tick,
                repetition: detector.detect(&tracked.log_window),
                resources: evaluator.evaluate(&tracked.cpu_samples, &tracked.mem_samples),
                liveness: Liveness::Running,
                last_line: tracked.last_line.clone(),
            };
            if let Some(d) = classifier.observe(&obs) {
                transitions.push((s, d.to_state));
            }

            if !sample_before_tick {
                tracked.record_sample(tick + Duration::from_millis(1), 100.0, 50_000_000);
            }
        }
        transitions
    }

    #[test]
    fn test_busy_exact_loop_is_runaway_whatever_the_sample_timing() {
        for sample_before_tick in [true, false] {
            let transitions = busy_loop_transitions(sample_before_tick);
            assert!(
                transitions.iter().all(|(_, state)| *state != HealthState::Stuck),
                "sample_before_tick={sample_before_tick}: {transitions:?}"
            );
            assert_eq!(
                transitions.last().map(|(_, state)| *state),
                Some(HealthState::Runaway),
                "sample_before_tick={sample_before_tick}: {transitions:?}"
            );
        }
    }

    fn memory_trace_state(rss: impl Fn(u64) -> u64) -> HealthState {
        let config = WardenConfig::default();
        let t0 = Instant::now();
        let mut tracked = TrackedProcess::new(ID, t0, &config);
        let mut classifier = HealthClassifier::new(ID, &config);
        let detector = RepetitionDetector::new(&config.logs);
        let evaluator = TrendEvaluator::new(&config.cpu, &config.memory);

        for s in 0..30u64 {
            let at = t0 + Duration::from_secs(s);
            tracked.record_sample(at, 5.0, rss(s));
            let obs = Observation {
                at,
                repetition: detector.detect(&tracked.log_window),
                resources: evaluator.evaluate(&tracked.cpu_samples, &tracked.mem_samples),
                liveness: Liveness::Running,
                last_line: None,
            };
            classifier.observe(&obs);
        }
        classifier.state()
    }

    #[test]
    fn test_steady_memory_growth_trace_is_leaking() {
        let state = memory_trace_state(|s| 20_000_000 + s * 4_194_304);
        assert_eq!(state, HealthState::Leaking);
    }

    #[test]
    fn test_memory_growth_then_plateau_is_not_leaking() {
        let state = memory_trace_state(|s| if s < 3 { 20_000_000 + s * 4_194_304 } else { 200_000_000 });
        assert_eq!(state, HealthState::Healthy);
    }

    #[test]
    fn test_short_memory_growth_run_is_not_leaking() {
        // Six rising samples, then a drop, over and over.
        let state = memory_trace_state(|s| 20_000_000 + (s % 6) * 1_000_000);
        assert_eq!(state, HealthState::Healthy);
    }
}
