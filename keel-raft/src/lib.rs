#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod election;
mod log;
mod message;
mod node;
mod persist;
mod replicate;
mod transport;

pub use config::RaftConfig;
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyMsg, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
pub use node::{Raft, Role};
pub use persist::{HardState, Persister};
pub use transport::{MemoryNetwork, MemoryTransport, RaftHandler, RaftTransport};
