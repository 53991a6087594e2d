/// CPU and memory trend evaluation over a process's sample history.
///
/// CPU is judged on a short sliding window: a high mean across the whole
/// window is `Sustained`, a high peak with a lower mean is `Spiking`.
/// Memory is judged on the full history, since leaks are slow: the trailing
/// run of strictly increasing resident-set readings must be long enough in
/// both sample count and wall time before it is called a `Leak`.
use crate::config::{CpuConfig, MemoryConfig};
use crate::history::TimedRing;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVerdict {
    Normal,
    Spiking,
    Sustained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryVerdict {
    Normal,
    Leak,
}

/// Trailing run of strictly increasing memory readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GrowthRun {
    pub samples: usize,
    pub span: Duration,
    pub growth_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceVerdict {
    pub cpu: CpuVerdict,
    pub memory: MemoryVerdict,
    pub cpu_mean: f64,
    pub cpu_peak: f64,
    /// Mean is already at the sustained threshold but the history does not
    /// yet cover a full window.
    pub cpu_warming: bool,
    pub growth: GrowthRun,
}

impl ResourceVerdict {
    pub fn describe_cpu(&self) -> String {
        format!(
            "cpu {:?}: window mean {:.1}%, peak {:.1}%",
            self.cpu, self.cpu_mean, self.cpu_peak
        )
    }

    pub fn describe_memory(&self) -> String {
        format!(
            "memory grew {} bytes across {} consecutive samples over {}s",
            self.growth.growth_bytes,
            self.growth.samples,
            self.growth.span.as_secs()
        )
    }
}

#[derive(Debug, Clone)]
pub struct TrendEvaluator {
    sustained_percent: f64,
    window: Duration,
    leak_min_samples: usize,
    leak_min_span: Duration,
}

impl TrendEvaluator {
    pub fn new(cpu: &CpuConfig, memory: &MemoryConfig) -> Self {
        Self {
            sustained_percent: cpu.sustained_percent,
            window: cpu.window(),
            leak_min_samples: memory.leak_min_samples,
            leak_min_span: memory.leak_min_span(),
        }
    }

    pub fn evaluate(&self, cpu: &TimedRing<f64>, memory: &TimedRing<u64>) -> ResourceVerdict {
        let (cpu_verdict, cpu_mean, cpu_peak, cpu_warming) = self.evaluate_cpu(cpu);
        let growth = trailing_growth(memory);
        let memory_verdict =
            if growth.samples >= self.leak_min_samples && growth.span >= self.leak_min_span {
                MemoryVerdict::Leak
            } else {
                MemoryVerdict::Normal
            };

        ResourceVerdict {
            cpu: cpu_verdict,
            memory: memory_verdict,
            cpu_mean,
            cpu_peak,
            cpu_warming,
            growth,
        }
    }

    fn evaluate_cpu(&self, samples: &TimedRing<f64>) -> (CpuVerdict, f64, f64, bool) {
        let recent: Vec<f64> = samples.recent(self.window).map(|(_, v)| *v).collect();
        if recent.is_empty() {
            return (CpuVerdict::Normal, 0.0, 0.0, false);
        }
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let peak = recent.iter().copied().fold(f64::MIN, f64::max);

        // History must reach back a full window before a mean can be "sustained".
        let covered = match (samples.iter().next(), samples.newest()) {
            (Some((oldest, _)), Some((newest, _))) => {
                newest.saturating_duration_since(*oldest) >= self.window
            }
            _ => false,
        };

        let high = mean >= self.sustained_percent;
        let verdict = if covered && high {
            CpuVerdict::Sustained
        } else if peak >= self.sustained_percent {
            CpuVerdict::Spiking
        } else {
            CpuVerdict::Normal
        };
        (verdict, mean, peak, high && !covered)
    }
}

fn trailing_growth(samples: &TimedRing<u64>) -> GrowthRun {
    let mut iter = samples.iter().rev();
    let Some(&(newest_at, newest)) = iter.next() else {
        return GrowthRun::default();
    };

    let mut run = GrowthRun {
        samples: 1,
        ..Default::default()
    };
    let mut later = newest;
    for &(at, value) in iter {
        if value >= later {
            break;
        }
        run.samples += 1;
        run.span = newest_at.saturating_duration_since(at);
        run.growth_bytes = newest - value;
        later = value;
    }
    run
}
