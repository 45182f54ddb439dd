use std::collections::VecDeque;
use tap_proto::LogEntry;

/// Bounded, insertion-ordered record of captured traffic.
///
/// The oldest entry is evicted first once `capacity` is reached.
#[derive(Debug)]
pub struct LogLedger {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Returns how many entries were evicted to make room.
    pub fn append(&mut self, entry: LogEntry) -> usize {
        self.entries.push_back(entry);
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entry(n: usize) -> LogEntry {
        LogEntry::request(format!("req-{n}"), "GET", "http://t/", BTreeMap::new(), None)
    }

    fn ids(ledger: &LogLedger) -> Vec<String> {
        ledger.snapshot().into_iter().map(|e| e.id).collect()
    }

    #[test]
    fn keeps_everything_under_capacity() {
        let mut ledger = LogLedger::new(5);
        for n in 0..3 {
            assert_eq!(ledger.append(entry(n)), 0);
        }
        assert_eq!(ids(&ledger), vec!["req-0", "req-1", "req-2"]);
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let mut ledger = LogLedger::new(3);
        let mut evicted = 0;
        for n in 0..10 {
            evicted += ledger.append(entry(n));
        }
        assert_eq!(evicted, 7);
        assert_eq!(ledger.len(), 3);
        assert_eq!(ids(&ledger), vec!["req-7", "req-8", "req-9"]);
    }

    #[test]
    fn default_capacity_bound_holds() {
        let mut ledger = LogLedger::new(crate::config::DEFAULT_LOG_CAPACITY);
        for n in 0..1500 {
            ledger.append(entry(n));
        }
        let snapshot = ids(&ledger);
        assert_eq!(snapshot.len(), 1000);
        assert_eq!(snapshot.first().map(String::as_str), Some("req-500"));
        assert_eq!(snapshot.last().map(String::as_str), Some("req-1499"));
    }

    #[test]
    fn snapshot_is_independent_of_later_appends() {
        let mut ledger = LogLedger::new(4);
        ledger.append(entry(0));
        let before = ledger.snapshot();
        ledger.append(entry(1));
        assert_eq!(before.len(), 1);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn clear_empties_and_zero_capacity_is_clamped() {
        let mut ledger = LogLedger::new(0);
        assert_eq!(ledger.capacity, 1);
        ledger.append(entry(0));
        ledger.append(entry(1));
        assert_eq!(ids(&ledger), vec!["req-1"]);
        assert_eq!(ledger.clear(), 1);
        assert!(ledger.is_empty());
    }
}
