//! The replicated key-value server.
//!
//! Every client operation goes through `Raft::submit` and is applied
//! only when it comes back on the apply channel, so all replicas apply
//! the same operations in the same order. Writes are deduplicated by
//! `(client_id, command_id)`: a retried command re-replicates but
//! mutates the store at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_core::NodeId;
use keel_raft::{ApplyMsg, Persister, Raft, RaftConfig, RaftTransport};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::op::{CommandError, CommandRequest, Op, OpKind};
use crate::snapshot::{decode_snapshot, encode_snapshot};
use crate::store::MemoryStore;

/// How long a request waits for its operation to come back on the apply
/// channel. Sits just below one heartbeat interval: a committed entry
/// reaches followers within a heartbeat, so waiting longer only delays
/// the retry that the dedupe table makes free.
const CLIENT_WAIT: Duration = Duration::from_millis(99);

/// Snapshot once the persisted raft state passes this share of the
/// configured limit.
const SNAPSHOT_HEADROOM: f64 = 0.8;

struct KvState {
    store: MemoryStore,
    /// Highest command id applied per client.
    latest_cmd: HashMap<u64, u64>,
    /// Requests parked until their submission is applied, keyed by the
    /// submission's `seq` token.
    waiters: HashMap<u64, oneshot::Sender<()>>,
    last_applied: u64,
}

pub struct KvServer {
    me: NodeId,
    raft: Arc<Raft>,
    persister: Arc<Persister>,
    max_raft_state: Option<usize>,
    state: RwLock<KvState>,
    killed: AtomicBool,
}

impl KvServer {
    /// Brings up one replica: its raft node, its apply listener, and any
    /// state recovered from a persisted snapshot.
    pub fn spawn(
        peers: Vec<NodeId>,
        me: NodeId,
        persister: Arc<Persister>,
        transport: Arc<dyn RaftTransport>,
        max_raft_state: Option<usize>,
        config: RaftConfig,
    ) -> Arc<Self> {
        let (apply_tx, apply_rx) = mpsc::channel(1);
        let raft = Raft::spawn(
            peers,
            me,
            Arc::clone(&persister),
            transport,
            apply_tx,
            config,
        );

        let mut state = KvState {
            store: MemoryStore::new(),
            latest_cmd: HashMap::new(),
            waiters: HashMap::new(),
            last_applied: 0,
        };
        let blob = persister.read_snapshot();
        if !blob.is_empty() {
            match decode_snapshot(&blob) {
                Ok((map, latest)) => {
                    state.store.restore(map);
                    state.latest_cmd = latest;
                }
                Err(err) => panic!("node {me}: persisted kv snapshot unusable: {err}"),
            }
        }

        let server = Arc::new(Self {
            me,
            raft,
            persister,
            max_raft_state,
            state: RwLock::new(state),
            killed: AtomicBool::new(false),
        });
        tokio::spawn(Arc::clone(&server).listen_apply(apply_rx));
        server
    }

    /// The raft node backing this replica, for transport registration
    /// and state inspection.
    pub fn raft(&self) -> &Arc<Raft> {
        &self.raft
    }

    /// Reads this replica's local copy directly, bypassing consensus.
    /// Not linearizable; inspection surface for tests and tooling.
    pub async fn local_get(&self, key: &str) -> Option<String> {
        self.state.read().await.store.get(key).cloned()
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.raft.kill();
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Executes one client operation. `WrongLeader` and `Timeout` are
    /// retry signals, not failures: the operation may still commit after
    /// a timeout, and the dedupe table makes the retry harmless.
    pub async fn command(&self, request: CommandRequest) -> Result<String, CommandError> {
        let op = Op {
            kind: request.kind,
            key: request.key.clone(),
            value: request.value,
            client_id: request.client_id,
            command_id: request.command_id,
            seq: keel_core::random_u64(),
        };

        let (tx, rx) = oneshot::channel();
        self.state.write().await.waiters.insert(op.seq, tx);

        if self.raft.submit(op.encode()).await.is_none() {
            self.state.write().await.waiters.remove(&op.seq);
            return Err(CommandError::WrongLeader);
        }

        match tokio::time::timeout(CLIENT_WAIT, rx).await {
            Ok(Ok(())) => {
                let st = self.state.read().await;
                tracing::debug!(
                    target: "keel::kv",
                    node = self.me,
                    client = request.client_id,
                    command = request.command_id,
                    "command applied"
                );
                st.store
                    .get(&request.key)
                    .cloned()
                    .ok_or(CommandError::NoKey)
            }
            _ => {
                self.state.write().await.waiters.remove(&op.seq);
                Err(CommandError::Timeout)
            }
        }
    }

    /// Consumes the apply channel. This is the only task that mutates
    /// the store, which is what makes application exactly-once and
    /// identically ordered on every replica.
    async fn listen_apply(self: Arc<Self>, mut apply_rx: mpsc::Receiver<ApplyMsg>) {
        while let Some(msg) = apply_rx.recv().await {
            if self.is_killed() {
                return;
            }
            match msg {
                ApplyMsg::Command {
                    index,
                    term,
                    command,
                } => self.apply_command(index, term, &command).await,
                ApplyMsg::Snapshot { index, term, data } => {
                    self.apply_snapshot(index, term, data).await;
                }
            }
        }
    }

    async fn apply_command(&self, index: u64, term: u64, command: &[u8]) {
        let op = match Op::decode(command) {
            Ok(op) => op,
            // We encoded this blob ourselves when submitting it.
            Err(err) => panic!("node {}: undecodable op at index {index}: {err}", self.me),
        };

        let mut st = self.state.write().await;
        if index <= st.last_applied {
            return;
        }
        st.last_applied = index;

        let duplicate = st
            .latest_cmd
            .get(&op.client_id)
            .is_some_and(|&latest| op.command_id <= latest);
        if op.kind != OpKind::Get && !duplicate {
            match op.kind {
                OpKind::Put => st.store.put(op.key.clone(), op.value.clone()),
                OpKind::Append => st.store.append(op.key.clone(), op.value.clone()),
                OpKind::Get => {}
            }
            st.latest_cmd.insert(op.client_id, op.command_id);
        }

        // Only the leader answers clients, and only for entries of its
        // own term: an entry submitted under an older term may sit at a
        // different index than the waiter was promised.
        let (current_term, is_leader) = self.raft.get_state().await;
        if is_leader && term == current_term {
            if let Some(tx) = st.waiters.remove(&op.seq) {
                let _ = tx.send(());
            }
        }

        if self.snapshot_due() {
            let blob = encode_snapshot(st.store.export(), &st.latest_cmd);
            self.raft.snapshot(index, blob).await;
        }
    }

    async fn apply_snapshot(&self, index: u64, term: u64, data: bytes::Bytes) {
        let mut st = self.state.write().await;
        if index <= st.last_applied {
            return;
        }
        if !self
            .raft
            .cond_install_snapshot(term, index, data.clone())
            .await
        {
            return;
        }
        match decode_snapshot(&data) {
            Ok((map, latest)) => {
                st.store.restore(map);
                st.latest_cmd = latest;
                st.last_applied = index;
                tracing::info!(
                    target: "keel::kv",
                    node = self.me,
                    index,
                    "installed snapshot"
                );
            }
            Err(err) => panic!("node {}: undecodable snapshot at index {index}: {err}", self.me),
        }
    }

    fn snapshot_due(&self) -> bool {
        let Some(limit) = self.max_raft_state else {
            return false;
        };
        self.persister.raft_state_size() as f64 > limit as f64 * SNAPSHOT_HEADROOM
    }
}
