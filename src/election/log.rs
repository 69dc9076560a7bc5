use serde::{Deserialize, Serialize};

/// A single entry in the replicated log.
///
/// `index` is the zero-based position of the entry in the log. `command` is
/// an opaque payload this crate never interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: serde_json::Value,
}

/// Outcome of matching a leader's `prev_log_index`/`prev_log_term` against
/// the local log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMatch {
    Matched,
    /// The local log has no entry at the requested position.
    Missing,
    /// The entry exists with a different term; the suffix starting at the
    /// conflicting position was discarded.
    Conflict,
}

/// Minimal in-memory log used for vote comparison and entry bookkeeping.
///
/// Invariants: entry `i` sits at position `i`, there are no gaps, and two
/// entries at the same index never carry different terms (conflicts are
/// resolved by truncating the local suffix before appending).
#[derive(Debug, Clone, Default)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry, `None` for an empty log.
    pub fn last_index(&self) -> Option<u64> {
        self.entries.last().map(|e| e.index)
    }

    /// Term of the last entry, 0 for an empty log.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries starting at `start` (inclusive), at most `limit` of them.
    pub fn entries_from(&self, start: u64, limit: usize) -> Vec<LogEntry> {
        let start = match usize::try_from(start) {
            Ok(s) if s < self.entries.len() => s,
            _ => return Vec::new(),
        };
        self.entries[start..].iter().take(limit).cloned().collect()
    }

    /// Append a new command under `term`, returning the new entry's index.
    pub fn append(&mut self, term: u64, command: serde_json::Value) -> u64 {
        let index = self.entries.len() as u64;
        self.entries.push(LogEntry {
            term,
            index,
            command,
        });
        index
    }

    /// Check that the candidate's log is at least as up-to-date as ours:
    /// the later last term wins, and on equal terms the longer log wins.
    pub fn is_up_to_date(&self, last_log_index: Option<u64>, last_log_term: u64) -> bool {
        let our_term = self.last_term();
        if last_log_term != our_term {
            return last_log_term > our_term;
        }
        last_log_index >= self.last_index()
    }

    /// Match the entry preceding a batch sent by the leader.
    pub fn match_prev(&mut self, prev_log_index: Option<u64>, prev_log_term: u64) -> LogMatch {
        let Some(prev) = prev_log_index else {
            return LogMatch::Matched;
        };
        match self.term_at(prev) {
            None => LogMatch::Missing,
            Some(term) if term == prev_log_term => LogMatch::Matched,
            Some(_) => {
                self.truncate_from(prev);
                LogMatch::Conflict
            }
        }
    }

    /// Merge entries received from a leader. Matching entries are kept, the
    /// first conflicting entry and everything after it is replaced.
    pub fn merge(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => self.truncate_from(entry.index),
                None => {}
            }
            if entry.index != self.entries.len() as u64 {
                // Out-of-order batch; never leave a gap.
                tracing::debug!(
                    index = entry.index,
                    len = self.entries.len(),
                    "Dropping non-contiguous log entry"
                );
                break;
            }
            self.entries.push(entry);
        }
    }

    fn truncate_from(&mut self, index: u64) {
        if let Ok(i) = usize::try_from(index) {
            self.entries.truncate(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: json!(null),
        }
    }

    #[test]
    fn test_empty_log() {
        let log = ReplicatedLog::new();
        assert!(log.is_empty());
        assert_eq!(log.last_index(), None);
        assert_eq!(log.last_term(), 0);
        assert!(log.get(0).is_none());
    }

    #[test]
    fn test_append_is_zero_based() {
        let mut log = ReplicatedLog::new();
        assert_eq!(log.append(1, json!("a")), 0);
        assert_eq!(log.append(2, json!("b")), 1);
        assert_eq!(log.last_index(), Some(1));
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.get(0).unwrap().command, json!("a"));
    }

    #[test]
    fn test_entries_from() {
        let mut log = ReplicatedLog::new();
        for term in 1..=3 {
            log.append(term, json!(term));
        }
        let tail = log.entries_from(1, 10);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 1);
        assert_eq!(log.entries_from(0, 2).len(), 2);
        assert!(log.entries_from(3, 10).is_empty());
    }

    #[test]
    fn test_is_up_to_date() {
        let mut log = ReplicatedLog::new();

        // Empty log: everything is at least as up-to-date
        assert!(log.is_up_to_date(None, 0));
        assert!(log.is_up_to_date(Some(0), 1));

        log.append(1, json!(null));
        log.append(2, json!(null));
        // Ours: last_term=2, last_index=1

        assert!(log.is_up_to_date(Some(0), 3));
        assert!(log.is_up_to_date(Some(1), 2));
        assert!(log.is_up_to_date(Some(5), 2));
        assert!(!log.is_up_to_date(Some(9), 1));
        assert!(!log.is_up_to_date(Some(0), 2));
        assert!(!log.is_up_to_date(None, 0));
    }

    #[test]
    fn test_match_prev() {
        let mut log = ReplicatedLog::new();
        log.append(1, json!(null));
        log.append(1, json!(null));
        log.append(2, json!(null));

        assert_eq!(log.match_prev(None, 0), LogMatch::Matched);
        assert_eq!(log.match_prev(Some(1), 1), LogMatch::Matched);
        assert_eq!(log.match_prev(Some(7), 1), LogMatch::Missing);
        assert_eq!(log.len(), 3);

        assert_eq!(log.match_prev(Some(2), 3), LogMatch::Conflict);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_merge_replaces_conflicting_suffix() {
        let mut log = ReplicatedLog::new();
        log.append(1, json!(null));
        log.append(1, json!(null));
        log.append(1, json!(null));

        log.merge(vec![entry(1, 1), entry(2, 2), entry(2, 3)]);

        let terms: Vec<u64> = log.entries().iter().map(|e| e.term).collect();
        assert_eq!(terms, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_merge_keeps_longer_matching_log() {
        let mut log = ReplicatedLog::new();
        log.append(1, json!(null));
        log.append(1, json!(null));
        log.append(1, json!(null));

        // A stale, shorter batch must not truncate matching entries
        log.merge(vec![entry(1, 0), entry(1, 1)]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_merge_never_leaves_gaps() {
        let mut log = ReplicatedLog::new();
        log.append(1, json!(null));
        log.merge(vec![entry(1, 3)]);
        assert_eq!(log.len(), 1);
    }
}
