use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from warden.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WardenConfig {
    pub sampler: SamplerConfig,
    pub logs: LogConfig,
    pub cpu: CpuConfig,
    pub memory: MemoryConfig,
    pub classifier: ClassifierConfig,
    pub reaper: ReaperConfig,
    pub action: ActionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_ms: u64,
    /// Number of cpu/memory samples retained per process.
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub window_lines: usize,
    pub window_secs: u64,
    /// Lines required before an age-evicted window counts as full.
    pub min_lines: usize,
    pub exact_threshold: f64,
    pub fuzzy_threshold: f64,
    pub progress_diversity: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub sustained_percent: f64,
    pub window_secs: u64,
    pub runaway_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub leak_min_samples: usize,
    pub leak_min_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub tick_ms: u64,
    pub loop_dwell_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub grace_ms: u64,
    pub kill_timeout_ms: u64,
    pub poll_ms: u64,
    pub max_attempts: u32,
}

/// What the watchdog does once a workload is diagnosed runaway, stuck, or leaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    /// Reap the process group.
    Kill,
    /// Report only.
    Observe,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    pub mode: ActionMode,
}

// --- Default implementations ---

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            history_capacity: 600,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            window_lines: 50,
            window_secs: 30,
            min_lines: 10,
            exact_threshold: 0.70,
            fuzzy_threshold: 0.60,
            progress_diversity: 0.85,
        }
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            sustained_percent: 90.0,
            window_secs: 10,
            runaway_grace_secs: 30,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            leak_min_samples: 10,
            leak_min_secs: 10,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            loop_dwell_secs: 10,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            grace_ms: 5000,
            kill_timeout_ms: 2000,
            poll_ms: 100,
            max_attempts: 3,
        }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            mode: ActionMode::Kill,
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl LogConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl CpuConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn runaway_grace(&self) -> Duration {
        Duration::from_secs(self.runaway_grace_secs)
    }
}

impl MemoryConfig {
    pub fn leak_min_span(&self) -> Duration {
        Duration::from_secs(self.leak_min_secs)
    }
}

impl ClassifierConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn loop_dwell(&self) -> Duration {
        Duration::from_secs(self.loop_dwell_secs)
    }
}

impl ReaperConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

impl WardenConfig {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: WardenConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a detector meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("sampler.interval_ms", self.sampler.interval_ms as f64, 50.0, 60000.0)?;
        check_range("classifier.tick_ms", self.classifier.tick_ms as f64, 50.0, 60000.0)?;
        check_range("logs.window_lines", self.logs.window_lines as f64, 2.0, 10000.0)?;
        check_range("logs.min_lines", self.logs.min_lines as f64, 1.0, self.logs.window_lines as f64)?;
        check_fraction("logs.exact_threshold", self.logs.exact_threshold)?;
        check_fraction("logs.fuzzy_threshold", self.logs.fuzzy_threshold)?;
        check_fraction("logs.progress_diversity", self.logs.progress_diversity)?;
        check_range("cpu.sustained_percent", self.cpu.sustained_percent, 1.0, 100.0)?;
        check_range("cpu.window_secs", self.cpu.window_secs as f64, 1.0, 3600.0)?;
        check_range("memory.leak_min_samples", self.memory.leak_min_samples as f64, 2.0, self.sampler.history_capacity as f64)?;
        check_range("reaper.max_attempts", self.reaper.max_attempts as f64, 1.0, 10.0)?;
        check_range("reaper.poll_ms", self.reaper.poll_ms as f64, 10.0, 10000.0)?;
        Ok(())
    }
}

fn check_range(key: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Invalid {
            key,
            message: format!("must be between {min} and {max}, got {value}"),
        });
    }
    Ok(())
}

fn check_fraction(key: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(ConfigError::Invalid {
            key,
            message: format!("must be a fraction in (0, 1], got {value}"),
        });
    }
    Ok(())
}

/// Errors from loading warden.toml.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        key: &'static str,
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid { key, message } => {
                write!(f, "invalid config: {key} {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}
