//! The consensus node: shared state, lifecycle tasks, and the public API.
//!
//! One `Raft` value is shared by handle between its ticker, its per-peer
//! replicators, its applier, and the inbound RPC handlers. All mutable
//! state sits behind a single node-wide `RwLock`; the replicator and
//! applier conditions are `Notify` values outside it. A stored-permit
//! notify may drop signals raised while nobody is waiting, which is safe
//! here because every waiter re-reads fresh state before sleeping again.
//!
//! Lock discipline: requests are built under the read lock, sent with no
//! lock held, and their replies processed under the write lock. The
//! applier likewise releases the lock while pushing to the apply channel,
//! since the service on the far end calls back into this node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use keel_core::NodeId;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;

use crate::config::RaftConfig;
use crate::log::{LogEntry, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyMsg, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use crate::persist::{HardState, Persister};
use crate::transport::{RaftHandler, RaftTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

pub(crate) struct RaftState {
    pub(crate) role: Role,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) log: RaftLog,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    pub(crate) next_index: HashMap<NodeId, u64>,
    pub(crate) match_index: HashMap<NodeId, u64>,
    pub(crate) election_deadline: Instant,
    pub(crate) heartbeat_deadline: Instant,
}

pub struct Raft {
    pub(crate) me: NodeId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) config: RaftConfig,
    pub(crate) state: RwLock<RaftState>,
    pub(crate) persister: Arc<Persister>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) apply_tx: mpsc::Sender<ApplyMsg>,
    pub(crate) apply_notify: Notify,
    pub(crate) replicator_notify: HashMap<NodeId, Notify>,
    killed: AtomicBool,
    kill_notify: Notify,
}

impl Raft {
    /// Brings up a node and starts its ticker, applier, and one
    /// replicator per peer. `peers` lists every cluster member including
    /// `me`. Committed entries flow out on `apply_tx` in index order.
    ///
    /// Panics if the persisted raft state fails to decode; a corrupt
    /// blob means the storage layer lost consensus state and continuing
    /// could violate promises made to other nodes.
    pub fn spawn(
        peers: Vec<NodeId>,
        me: NodeId,
        persister: Arc<Persister>,
        transport: Arc<dyn RaftTransport>,
        apply_tx: mpsc::Sender<ApplyMsg>,
        config: RaftConfig,
    ) -> Arc<Self> {
        let blob = persister.read_raft_state();
        let restored = if blob.is_empty() {
            None
        } else {
            match HardState::decode(&blob) {
                Ok(state) => Some(state),
                Err(err) => panic!("node {me}: persisted raft state unusable: {err}"),
            }
        };
        let (current_term, voted_for, log) = match restored {
            Some(hard) => (
                hard.current_term,
                hard.voted_for,
                RaftLog::from_entries(hard.entries),
            ),
            None => (0, None, RaftLog::new()),
        };

        let now = Instant::now();
        let election_deadline =
            now + keel_core::duration_in_range(config.election_timeout_min, config.election_timeout_max);
        let heartbeat_deadline = now + config.heartbeat_interval;

        let others: Vec<NodeId> = peers.iter().copied().filter(|&p| p != me).collect();
        let dummy = log.dummy_index();
        let state = RaftState {
            role: Role::Follower,
            current_term,
            voted_for,
            commit_index: dummy,
            last_applied: dummy,
            next_index: others.iter().map(|&p| (p, log.last_index() + 1)).collect(),
            match_index: others.iter().map(|&p| (p, 0)).collect(),
            log,
            election_deadline,
            heartbeat_deadline,
        };

        let node = Arc::new(Self {
            me,
            peers,
            config,
            state: RwLock::new(state),
            persister,
            transport,
            apply_tx,
            apply_notify: Notify::new(),
            replicator_notify: others.iter().map(|&p| (p, Notify::new())).collect(),
            killed: AtomicBool::new(false),
            kill_notify: Notify::new(),
        });

        tokio::spawn(Arc::clone(&node).run_ticker());
        tokio::spawn(Arc::clone(&node).run_applier());
        for peer in others {
            tokio::spawn(Arc::clone(&node).run_replicator(peer));
        }
        node
    }

    /// Proposes a command. Returns the slot `(index, term)` it was
    /// appended at, or `None` when this node is not the leader. Returns
    /// as soon as the entry is in the local log; commitment happens in
    /// the background.
    pub async fn submit(&self, command: Bytes) -> Option<(u64, u64)> {
        let mut st = self.state.write().await;
        if st.role != Role::Leader {
            return None;
        }
        let index = st.log.last_index() + 1;
        let term = st.current_term;
        st.log.append([LogEntry {
            index,
            term,
            command,
        }]);
        self.persist(&st);
        tracing::debug!(
            target: "keel::raft",
            node = self.me,
            index,
            term,
            "accepted command"
        );
        drop(st);
        self.wake_replicators();
        Some((index, term))
    }

    pub async fn get_state(&self) -> (u64, bool) {
        let st = self.state.read().await;
        (st.current_term, st.role == Role::Leader)
    }

    /// Stops every background task. Idempotent; in-flight RPCs are
    /// abandoned by their callers.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.kill_notify.notify_waiters();
        self.apply_notify.notify_one();
        for notify in self.replicator_notify.values() {
            notify.notify_one();
        }
        tracing::debug!(target: "keel::raft", node = self.me, "node killed");
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// The service says everything up to and including `index` is
    /// captured in `data`, so the log prefix could be released.
    ///
    /// TODO(compaction): trim the log to `index` (installing a new dummy
    /// carrying that index/term), then persist state and snapshot
    /// together.
    pub async fn snapshot(&self, _index: u64, _data: Bytes) {}

    /// Asks whether the service should switch to a snapshot received on
    /// the apply channel. Always yes until log trimming lands; the
    /// service's own `last_applied` guard keeps this monotone.
    pub async fn cond_install_snapshot(
        &self,
        _last_included_term: u64,
        _last_included_index: u64,
        _data: Bytes,
    ) -> bool {
        true
    }

    // ---- internals shared by election and replication ----

    pub(crate) fn persist(&self, st: &RaftState) {
        let hard = HardState {
            current_term: st.current_term,
            voted_for: st.voted_for,
            entries: st.log.entries().to_vec(),
        };
        self.persister.save_raft_state(hard.encode());
    }

    pub(crate) fn election_timeout(&self) -> Duration {
        keel_core::duration_in_range(
            self.config.election_timeout_min,
            self.config.election_timeout_max,
        )
    }

    /// Adopts `term` if it is newer and falls back to follower. Rearms
    /// the election timer. Callers persist.
    pub(crate) fn become_follower(&self, st: &mut RaftState, term: u64) {
        if term > st.current_term {
            st.current_term = term;
            st.voted_for = None;
        }
        if st.role == Role::Leader {
            tracing::info!(
                target: "keel::raft",
                node = self.me,
                term = st.current_term,
                "stepped down"
            );
        }
        st.role = Role::Follower;
        st.election_deadline = Instant::now() + self.election_timeout();
    }

    pub(crate) fn become_leader(&self, st: &mut RaftState) {
        st.role = Role::Leader;
        let next = st.log.last_index() + 1;
        for peer in self.peers.iter().filter(|&&p| p != self.me) {
            st.next_index.insert(*peer, next);
            st.match_index.insert(*peer, 0);
        }
        st.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval;
        tracing::info!(
            target: "keel::raft",
            node = self.me,
            term = st.current_term,
            last_index = st.log.last_index(),
            "became leader"
        );
    }

    // ---- lifecycle tasks ----

    /// Single loop driving both timers. Deadlines only ever move
    /// forward, so waking at a deadline that has since been pushed out
    /// just re-reads and sleeps again.
    async fn run_ticker(self: Arc<Self>) {
        loop {
            if self.is_killed() {
                return;
            }
            let wake_at = {
                let st = self.state.read().await;
                st.election_deadline.min(st.heartbeat_deadline)
            };
            tokio::select! {
                () = tokio::time::sleep_until(wake_at) => {}
                () = self.kill_notify.notified() => return,
            }
            if self.is_killed() {
                return;
            }

            let now = Instant::now();
            let mut heartbeat_due = false;
            let mut election_round = None;
            {
                let mut st = self.state.write().await;
                if now >= st.election_deadline {
                    st.election_deadline = now + self.election_timeout();
                    if st.role != Role::Leader {
                        election_round = Some(self.start_election(&mut st));
                    }
                }
                if now >= st.heartbeat_deadline {
                    st.heartbeat_deadline = now + self.config.heartbeat_interval;
                    heartbeat_due = st.role == Role::Leader;
                }
            }
            if let Some(request) = election_round {
                Arc::clone(&self).solicit_votes(request);
            }
            if heartbeat_due {
                Arc::clone(&self).broadcast_heartbeat();
            }
        }
    }

    /// Delivers committed entries on the apply channel, in index order,
    /// exactly once. The lock is dropped for the channel sends; the
    /// trailing `max` keeps a concurrent snapshot install from rolling
    /// `last_applied` backwards.
    async fn run_applier(self: Arc<Self>) {
        loop {
            if self.is_killed() {
                return;
            }
            let window = {
                let st = self.state.read().await;
                if st.last_applied >= st.commit_index {
                    None
                } else {
                    let low = st.last_applied + 1;
                    let high = st.commit_index;
                    Some((high, st.log.range(low, high + 1).to_vec()))
                }
            };
            let Some((high, entries)) = window else {
                self.apply_notify.notified().await;
                continue;
            };
            for entry in entries {
                let msg = ApplyMsg::Command {
                    index: entry.index,
                    term: entry.term,
                    command: entry.command,
                };
                if self.apply_tx.send(msg).await.is_err() {
                    return;
                }
            }
            let mut st = self.state.write().await;
            st.last_applied = st.last_applied.max(high);
            tracing::trace!(
                target: "keel::raft",
                node = self.me,
                applied_through = st.last_applied,
                "delivered committed entries"
            );
        }
    }
}

#[async_trait]
impl RaftHandler for Raft {
    async fn handle_request_vote(&self, request: VoteRequest) -> VoteResponse {
        self.request_vote_locked(request).await
    }

    async fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        self.append_entries_locked(request).await
    }

    async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        self.install_snapshot_locked(request).await
    }
}
