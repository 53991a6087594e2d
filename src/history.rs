/// Bounded, time-ordered sample storage shared by the metrics and log windows.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Fixed-capacity ring of timestamped entries, optionally bounded by age.
///
/// Entries are kept in timestamp order: a push older than the newest entry
/// is rejected, and eviction only ever removes from the front.
#[derive(Debug, Clone)]
pub struct TimedRing<T> {
    entries: VecDeque<(Instant, T)>,
    capacity: usize,
    max_age: Option<Duration>,
    evicted: bool,
}

impl<T> TimedRing<T> {
    pub fn new(capacity: usize, max_age: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            max_age,
            evicted: false,
        }
    }

    /// Append an entry. Returns false (and drops the value) if `at` is older
    /// than the newest retained entry.
    pub fn push(&mut self, at: Instant, value: T) -> bool {
        if let Some((last, _)) = self.entries.back() {
            if at < *last {
                return false;
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted = true;
        }
        self.entries.push_back((at, value));
        self.prune(at);
        true
    }

    /// Drop entries older than `max_age` relative to `now`.
    pub fn prune(&mut self, now: Instant) {
        let Some(max_age) = self.max_age else {
            return;
        };
        while let Some((at, _)) = self.entries.front() {
            if now.saturating_duration_since(*at) > max_age {
                self.entries.pop_front();
                self.evicted = true;
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_at_capacity(&self) -> bool {
        self.entries.len() == self.capacity
    }

    /// Whether anything has ever been evicted, by capacity or by age.
    pub fn has_evicted(&self) -> bool {
        self.evicted
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &(Instant, T)> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn newest(&self) -> Option<&(Instant, T)> {
        self.entries.back()
    }

    /// Entries whose timestamp falls within `window` of the newest entry.
    pub fn recent(&self, window: Duration) -> impl Iterator<Item = &(Instant, T)> {
        let cutoff = self.entries.back().map(|(at, _)| *at);
        self.entries.iter().filter(move |(at, _)| match cutoff {
            Some(newest) => newest.saturating_duration_since(*at) <= window,
            None => false,
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.evicted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_evicts_oldest_in_order() {
        let t0 = Instant::now();
        let mut ring = TimedRing::new(3, None);
        for i in 0..5u64 {
            assert!(ring.push(t0 + Duration::from_secs(i), i));
        }
        let values: Vec<u64> = ring.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![2, 3, 4]);
        assert!(ring.is_at_capacity());
        assert!(ring.has_evicted());
    }

    #[test]
    fn test_out_of_order_push_rejected() {
        let t0 = Instant::now();
        let mut ring = TimedRing::new(4, None);
        assert!(ring.push(t0 + Duration::from_secs(2), "late"));
        assert!(!ring.push(t0 + Duration::from_secs(1), "early"));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_age_bound_prunes_stale_entries() {
        let t0 = Instant::now();
        let mut ring = TimedRing::new(100, Some(Duration::from_secs(5)));
        ring.push(t0, 'a');
        ring.push(t0 + Duration::from_secs(3), 'b');
        assert!(!ring.has_evicted());

        ring.push(t0 + Duration::from_secs(7), 'c');
        let values: Vec<char> = ring.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec!['b', 'c']);
        assert!(ring.has_evicted());
        assert!(!ring.is_at_capacity());
    }

    #[test]
    fn test_recent_is_relative_to_newest_entry() {
        let t0 = Instant::now();
        let mut ring = TimedRing::new(100, None);
        for i in 0..10u64 {
            ring.push(t0 + Duration::from_secs(i), i);
        }
        let recent: Vec<u64> = ring.recent(Duration::from_secs(3)).map(|(_, v)| *v).collect();
        assert_eq!(recent, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_recent_on_empty_ring() {
        let ring: TimedRing<u8> = TimedRing::new(4, None);
        assert_eq!(ring.recent(Duration::from_secs(1)).count(), 0);
        assert!(ring.newest().is_none());
    }

    #[test]
    fn test_clear_resets_eviction_flag() {
        let t0 = Instant::now();
        let mut ring = TimedRing::new(1, None);
        ring.push(t0, 1);
        ring.push(t0, 2);
        assert!(ring.has_evicted());
        ring.clear();
        assert!(ring.is_empty());
        assert!(!ring.has_evicted());
    }
}
