//! Multi-node test harness over the in-memory transport.
//!
//! Every node's apply channel drains into a per-node sheet of
//! `index -> command`. The collector asserts the delivery contract as it
//! goes: strictly increasing indices, no index delivered twice.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use keel_raft::{ApplyMsg, MemoryNetwork, Persister, Raft, RaftConfig, RaftHandler};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub struct Cluster {
    pub network: MemoryNetwork,
    nodes: Vec<Arc<Raft>>,
    persisters: Vec<Arc<Persister>>,
    connected: Vec<bool>,
    applied: Arc<Mutex<Vec<BTreeMap<u64, Bytes>>>>,
    config: RaftConfig,
}

/// `RUST_LOG=keel::raft=debug` shows the cluster's internal timeline
/// when a test fails.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        init_tracing();
        let mut cluster = Self {
            network: MemoryNetwork::new(),
            nodes: Vec::new(),
            persisters: (0..n).map(|_| Arc::new(Persister::new())).collect(),
            connected: vec![true; n],
            applied: Arc::new(Mutex::new(vec![BTreeMap::new(); n])),
            config: RaftConfig::fast(),
        };
        for me in 0..n {
            let node = cluster.boot(me);
            cluster.nodes.push(node);
        }
        cluster
    }

    pub fn n(&self) -> usize {
        self.persisters.len()
    }

    pub fn node(&self, id: usize) -> &Arc<Raft> {
        &self.nodes[id]
    }

    fn boot(&self, me: usize) -> Arc<Raft> {
        let (apply_tx, mut apply_rx) = mpsc::channel(32);
        let node = Raft::spawn(
            (0..self.n()).collect(),
            me,
            Arc::clone(&self.persisters[me]),
            self.network.transport(me),
            apply_tx,
            self.config.clone(),
        );
        self.network
            .register(me, Arc::clone(&node) as Arc<dyn RaftHandler>);

        let applied = Arc::clone(&self.applied);
        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                if let ApplyMsg::Command { index, command, .. } = msg {
                    let mut sheets = applied.lock().unwrap();
                    let highest = sheets[me].keys().next_back().copied().unwrap_or(0);
                    assert_eq!(
                        index,
                        highest + 1,
                        "node {me} delivered index {index} after {highest}"
                    );
                    sheets[me].insert(index, command);
                }
            }
        });
        node
    }

    pub fn disconnect(&mut self, id: usize) {
        self.connected[id] = false;
        self.network.set_connected(id, false);
    }

    pub fn connect(&mut self, id: usize) {
        self.connected[id] = true;
        self.network.set_connected(id, true);
    }

    /// Kills a node and forgets what it had applied; a restarted node
    /// re-delivers its whole log.
    pub async fn crash(&mut self, id: usize) {
        self.disconnect(id);
        self.nodes[id].kill();
        // Let the applier observe the kill before the sheet resets.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.applied.lock().unwrap()[id].clear();
    }

    /// Boots a fresh node over the crashed node's persister. The caller
    /// reconnects it when ready.
    pub fn restart(&mut self, id: usize) {
        let node = self.boot(id);
        self.nodes[id] = node;
    }

    /// The connected leader with the highest term, if any.
    pub async fn leader(&self) -> Option<usize> {
        let mut best: Option<(u64, usize)> = None;
        for id in 0..self.n() {
            if !self.connected[id] {
                continue;
            }
            let (term, is_leader) = self.nodes[id].get_state().await;
            if is_leader && best.map_or(true, |(t, _)| term > t) {
                best = Some((term, id));
            }
        }
        best.map(|(_, id)| id)
    }

    pub async fn wait_for_leader(&self) -> usize {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(leader) = self.leader().await {
                return leader;
            }
            assert!(Instant::now() < deadline, "no leader elected within 5s");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn leader_count(&self) -> usize {
        let mut highest_term = 0;
        let mut leaders = Vec::new();
        for id in 0..self.n() {
            if !self.connected[id] {
                continue;
            }
            let (term, is_leader) = self.nodes[id].get_state().await;
            if is_leader {
                leaders.push((term, id));
                highest_term = highest_term.max(term);
            }
        }
        leaders.iter().filter(|(t, _)| *t == highest_term).count()
    }

    /// How many nodes have applied `index`, and the command they agree
    /// on. Divergence at a shared index is an immediate failure.
    pub fn committed(&self, index: u64) -> (usize, Option<Bytes>) {
        let sheets = self.applied.lock().unwrap();
        let mut count = 0;
        let mut command = None;
        for sheet in sheets.iter() {
            if let Some(found) = sheet.get(&index) {
                if let Some(previous) = &command {
                    assert_eq!(
                        previous, found,
                        "nodes disagree about committed index {index}"
                    );
                }
                command = Some(found.clone());
                count += 1;
            }
        }
        (count, command)
    }

    /// Drives one command to commitment on at least `expected` nodes and
    /// returns its index. Retries across leader changes, like a client
    /// would.
    pub async fn one(&self, command: &[u8], expected: usize) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let mut index = None;
            for id in 0..self.n() {
                if !self.connected[id] {
                    continue;
                }
                if let Some((at, _term)) =
                    self.nodes[id].submit(Bytes::copy_from_slice(command)).await
                {
                    index = Some(at);
                    break;
                }
            }
            let Some(at) = index else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };

            let settle = Instant::now() + Duration::from_secs(2);
            while Instant::now() < settle {
                let (count, stored) = self.committed(at);
                if count >= expected {
                    if stored.as_deref() == Some(command) {
                        return at;
                    }
                    // Some other command won this slot; resubmit.
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        panic!("command failed to commit on {expected} nodes within 10s");
    }

    /// Polls until `id` has applied through `index`.
    pub async fn wait_applied(&self, id: usize, index: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if self.applied.lock().unwrap()[id].contains_key(&index) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "node {id} never applied index {index}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn terms_agree(&self) -> u64 {
        let mut term = None;
        for id in 0..self.n() {
            if !self.connected[id] {
                continue;
            }
            let (node_term, _) = self.nodes[id].get_state().await;
            match term {
                None => term = Some(node_term),
                Some(seen) => assert_eq!(seen, node_term, "connected nodes disagree on term"),
            }
        }
        term.unwrap_or(0)
    }
}
