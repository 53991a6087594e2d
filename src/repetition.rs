/// Repetition detection over a process's recent log fingerprints.
use crate::config::LogConfig;
use crate::fingerprint::LogFingerprint;
use crate::history::TimedRing;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepetitionVerdict {
    Varied,
    ExactLoop,
    FuzzyLoop,
}

/// Verdict plus the measurements behind it, for evidence strings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepetitionReport {
    pub verdict: RepetitionVerdict,
    pub window_len: usize,
    /// Share of lines in the largest exact-hash group.
    pub exact_fraction: f64,
    /// Share of lines in the largest shape-key group.
    pub shape_fraction: f64,
    /// Distinct exact hashes divided by window length.
    pub raw_diversity: f64,
    /// FuzzyLoop whose lines read as forward progress rather than a loop.
    pub progress_like: bool,
}

impl RepetitionReport {
    fn varied(window_len: usize) -> Self {
        Self {
            verdict: RepetitionVerdict::Varied,
            window_len,
            exact_fraction: 0.0,
            shape_fraction: 0.0,
            raw_diversity: 1.0,
            progress_like: false,
        }
    }

    /// Whether this report counts toward Stuck/Runaway.
    pub fn is_loop_evidence(&self) -> bool {
        match self.verdict {
            RepetitionVerdict::ExactLoop => true,
            RepetitionVerdict::FuzzyLoop => !self.progress_like,
            RepetitionVerdict::Varied => false,
        }
    }

    pub fn describe(&self) -> String {
        match self.verdict {
            RepetitionVerdict::ExactLoop => format!(
                "exact loop: {:.0}% of {} lines identical",
                self.exact_fraction * 100.0,
                self.window_len
            ),
            RepetitionVerdict::FuzzyLoop => format!(
                "fuzzy loop: {:.0}% of {} lines share one shape",
                self.shape_fraction * 100.0,
                self.window_len
            ),
            RepetitionVerdict::Varied => format!("varied output over {} lines", self.window_len),
        }
    }
}

/// Decides whether the log window is looping.
#[derive(Debug, Clone)]
pub struct RepetitionDetector {
    exact_threshold: f64,
    fuzzy_threshold: f64,
    progress_diversity: f64,
    min_lines: usize,
}

impl RepetitionDetector {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            exact_threshold: config.exact_threshold,
            fuzzy_threshold: config.fuzzy_threshold,
            progress_diversity: config.progress_diversity,
            min_lines: config.min_lines,
        }
    }

    /// A window counts as full once it holds its line capacity, or once age
    /// eviction has started and at least `min_lines` remain.
    fn is_full(&self, window: &TimedRing<LogFingerprint>) -> bool {
        window.is_at_capacity() || (window.has_evicted() && window.len() >= self.min_lines)
    }

    pub fn detect(&self, window: &TimedRing<LogFingerprint>) -> RepetitionReport {
        let len = window.len();
        if len == 0 || !self.is_full(window) {
            return RepetitionReport::varied(len);
        }

        let exact = dominant_group(window.iter().map(|(_, fp)| fp.exact_hash));
        let shape = dominant_group(window.iter().map(|(_, fp)| fp.shape_key));
        let distinct_exact = distinct(window.iter().map(|(_, fp)| fp.exact_hash));

        let exact_fraction = exact.count as f64 / len as f64;
        let shape_fraction = shape.count as f64 / len as f64;
        let raw_diversity = distinct_exact as f64 / len as f64;

        let verdict = if exact_fraction >= self.exact_threshold {
            RepetitionVerdict::ExactLoop
        } else if shape_fraction >= self.fuzzy_threshold {
            RepetitionVerdict::FuzzyLoop
        } else {
            RepetitionVerdict::Varied
        };

        let progress_like = verdict == RepetitionVerdict::FuzzyLoop
            && raw_diversity >= self.progress_diversity
            && {
                let members: Vec<&LogFingerprint> = window
                    .iter()
                    .map(|(_, fp)| fp)
                    .filter(|fp| fp.shape_key == shape.key)
                    .collect();
                let marked = members.iter().filter(|fp| fp.progress_like).count();
                marked * 2 >= members.len()
            };

        RepetitionReport {
            verdict,
            window_len: len,
            exact_fraction,
            shape_fraction,
            raw_diversity,
            progress_like,
        }
    }
}

struct Group {
    key: u64,
    count: usize,
}

/// Most common key. Ties go to the group whose latest member is most recent.
fn dominant_group(keys: impl Iterator<Item = u64>) -> Group {
    let mut groups: HashMap<u64, (usize, usize)> = HashMap::new();
    for (index, key) in keys.enumerate() {
        let entry = groups.entry(key).or_insert((0, index));
        entry.0 += 1;
        entry.1 = index;
    }
    groups
        .into_iter()
        .max_by_key(|(_, (count, last_index))| (*count, *last_index))
        .map(|(key, (count, _))| Group { key, count })
        .unwrap_or(Group { key: 0, count: 0 })
}

fn distinct(keys: impl Iterator<Item = u64>) -> usize {
    let mut seen: Vec<u64> = keys.collect();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}
