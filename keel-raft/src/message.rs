//! RPC schemas and the apply-channel message.
//!
//! These are plain in-process values; the transport decides how (and
//! whether) to put them on a wire. Persistence has its own codec in
//! `persist`.

use bytes::Bytes;

use crate::log::LogEntry;

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: usize,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: usize,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Fast-backup hint: where the leader should resume probing after a
    /// log mismatch. Zero on success.
    pub conflict_index: u64,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: usize,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// Ordered delivery from consensus to the state machine. Commands arrive
/// strictly in increasing index order, each at most once per node.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    Command {
        index: u64,
        term: u64,
        command: Bytes,
    },
    Snapshot {
        index: u64,
        term: u64,
        data: Bytes,
    },
}
