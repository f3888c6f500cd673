//! In-memory Raft log with an absolute index space.
//!
//! The log always begins with a dummy entry whose index and term are the
//! last-snapshotted index and term (0/0 before any snapshot). The dummy
//! is never delivered to the state machine; it exists so that every
//! consistency check against the position just before the first real
//! entry has something to compare terms with. External callers use
//! absolute indices; the vector offset is `index - dummy_index`.

use bytes::Bytes;

/// One replicated log slot. Immutable once committed at its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    /// Opaque command payload. The service layer owns the encoding.
    pub command: Bytes,
}

#[derive(Debug)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry {
                index: 0,
                term: 0,
                command: Bytes::new(),
            }],
        }
    }

    /// Rebuild from persisted entries. The slice must start with the
    /// dummy entry.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        assert!(!entries.is_empty(), "persisted log missing dummy entry");
        Self { entries }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn dummy_index(&self) -> u64 {
        self.entries[0].index
    }

    pub fn dummy_term(&self) -> u64 {
        self.entries[0].term
    }

    pub fn last_index(&self) -> u64 {
        self.entries[self.entries.len() - 1].index
    }

    pub fn last_term(&self) -> u64 {
        self.entries[self.entries.len() - 1].term
    }

    /// Vector offset of an absolute index. An index below the dummy means
    /// the caller lost track of the snapshot boundary; that is state
    /// corruption, not a recoverable condition.
    fn offset(&self, index: u64) -> usize {
        assert!(
            index >= self.dummy_index(),
            "log index {index} below snapshot boundary {}",
            self.dummy_index()
        );
        (index - self.dummy_index()) as usize
    }

    /// Entry at an absolute index. Panics if the index is outside the
    /// retained window.
    pub fn entry(&self, index: u64) -> &LogEntry {
        &self.entries[self.offset(index)]
    }

    pub fn term_at(&self, index: u64) -> u64 {
        self.entry(index).term
    }

    pub fn append(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        self.entries.extend(entries);
    }

    /// Drops the entry at `high` and everything after it.
    pub fn truncate(&mut self, high: u64) {
        let off = self.offset(high);
        self.entries.truncate(off);
    }

    /// Entries from `low` (absolute) through the end.
    pub fn tail(&self, low: u64) -> &[LogEntry] {
        &self.entries[self.offset(low)..]
    }

    /// Entries in `[low, high)` (absolute).
    pub fn range(&self, low: u64, high: u64) -> &[LogEntry] {
        &self.entries[self.offset(low)..self.offset(high)]
    }

    /// True iff the log holds an entry at `index` with the given term.
    /// The dummy entry participates: `index == dummy_index` matches iff
    /// `term == dummy_term`.
    pub fn match_term(&self, term: u64, index: u64) -> bool {
        if index > self.last_index() {
            return false;
        }
        self.term_at(index) == term
    }

    /// Raft §5.4.1: a candidate's log is at least as up to date as ours
    /// if its last term is higher, or terms are equal and its last index
    /// is no smaller.
    pub fn is_up_to_date(&self, last_term: u64, last_index: u64) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            command: Bytes::from(format!("cmd-{index}")),
        }
    }

    #[test]
    fn fresh_log_has_zero_dummy() {
        let log = RaftLog::new();
        assert_eq!(log.dummy_index(), 0);
        assert_eq!(log.dummy_term(), 0);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn append_and_lookup() {
        let mut log = RaftLog::new();
        log.append([entry(1, 1), entry(2, 1), entry(3, 2)]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.entry(2).term, 1);
        assert_eq!(log.tail(2).len(), 2);
        assert_eq!(log.range(1, 3).len(), 2);
    }

    #[test]
    fn truncate_drops_suffix() {
        let mut log = RaftLog::new();
        log.append([entry(1, 1), entry(2, 1), entry(3, 2)]);
        log.truncate(2);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn match_term_covers_dummy_boundary() {
        let mut log = RaftLog::new();
        log.append([entry(1, 1)]);
        // prev_log_index == dummy_index is valid and matches iff the
        // terms agree.
        assert!(log.match_term(0, 0));
        assert!(!log.match_term(3, 0));
        assert!(log.match_term(1, 1));
        assert!(!log.match_term(2, 1));
        // past the end never matches
        assert!(!log.match_term(1, 2));
    }

    #[test]
    fn up_to_date_comparison() {
        let mut log = RaftLog::new();
        log.append([entry(1, 1), entry(2, 3)]);
        // higher last term wins regardless of index
        assert!(log.is_up_to_date(4, 1));
        // same term needs at least our index
        assert!(log.is_up_to_date(3, 2));
        assert!(!log.is_up_to_date(3, 1));
        // lower term always loses
        assert!(!log.is_up_to_date(2, 100));
    }

    #[test]
    #[should_panic(expected = "below snapshot boundary")]
    fn index_below_dummy_aborts() {
        let log = RaftLog::from_entries(vec![LogEntry {
            index: 5,
            term: 2,
            command: Bytes::new(),
        }]);
        let _ = log.entry(4);
    }
}
