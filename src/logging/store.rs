//! Log storage
//!
//! Pure ring buffer with a fixed capacity; old entries rotate out. No I/O
//! side effects.

use super::LogEntry;
use std::collections::VecDeque;

/// Capped in-memory log store
pub struct LogStore {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
}

impl LogStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(4096)),
            max_entries: max_entries.max(1),
        }
    }

    /// Add an entry, rotating out the oldest when at capacity
    pub fn add(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent `max` entries, oldest first
    pub fn recent(&self, max: usize) -> Vec<LogEntry> {
        let start = self.entries.len().saturating_sub(max);
        self.entries.iter().skip(start).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{entry::codes, LogLevel};

    fn entry(message: &str) -> LogEntry {
        LogEntry::new("test", codes::STARTED, LogLevel::Info, message)
    }

    #[test]
    fn test_add_rotates_when_full() {
        let mut store = LogStore::new(3);
        for i in 0..4 {
            store.add(entry(&i.to_string()));
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.recent(10)[0].message, "1");
    }

    #[test]
    fn test_recent_limits_and_orders() {
        let mut store = LogStore::new(10);
        for i in 0..5 {
            store.add(entry(&i.to_string()));
        }
        let recent = store.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "3");
        assert_eq!(recent[1].message, "4");
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut store = LogStore::new(0);
        store.add(entry("a"));
        assert_eq!(store.len(), 1);
    }
}
