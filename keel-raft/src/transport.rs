//! The RPC boundary and an in-process mesh implementation.
//!
//! Consensus assumes nothing of the transport beyond best-effort unicast:
//! requests may be dropped, delayed, reordered, or duplicated, and an
//! `Err` simply means the reply never arrived. The sender never retries
//! inline; the heartbeat timer and the per-peer replicators own retry.
//!
//! `MemoryNetwork` routes requests between nodes registered in the same
//! process, with per-node disconnection and probabilistic loss and delay
//! for fault-injection tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{KeelError, NodeId, Result};

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};

/// Outbound unicast used by a consensus node.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, to: NodeId, request: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        to: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// Inbound RPC surface of a node, as seen by a transport.
#[async_trait]
pub trait RaftHandler: Send + Sync {
    async fn handle_request_vote(&self, request: VoteRequest) -> VoteResponse;

    async fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse;

    async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse;
}

#[derive(Default)]
struct MeshState {
    handlers: HashMap<NodeId, Arc<dyn RaftHandler>>,
    disconnected: HashMap<NodeId, bool>,
    /// Probability (0-100) that any single request or reply is lost.
    loss_pct: u8,
    /// Added one-way latency range, when set.
    delay: Option<(Duration, Duration)>,
}

/// In-process mesh connecting every node of a test cluster. Cloning
/// yields another handle to the same mesh.
#[derive(Default, Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<MeshState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the inbound handler for a node. Must happen before any
    /// peer addresses it.
    pub fn register(&self, id: NodeId, handler: Arc<dyn RaftHandler>) {
        self.lock().handlers.insert(id, handler);
    }

    /// Connects or disconnects a node. A disconnected node can neither
    /// send nor receive, which is how tests carve partitions.
    pub fn set_connected(&self, id: NodeId, connected: bool) {
        self.lock().disconnected.insert(id, !connected);
    }

    /// Drops each request/reply independently with the given probability.
    pub fn set_loss_pct(&self, pct: u8) {
        self.lock().loss_pct = pct.min(100);
    }

    /// Adds a random one-way delay to every delivery.
    pub fn set_delay(&self, min: Duration, max: Duration) {
        self.lock().delay = Some((min, max));
    }

    /// A transport handle bound to one sender.
    pub fn transport(&self, from: NodeId) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            from,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MeshState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Resolves the target handler if the link is usable right now, and
    /// picks this delivery's injected delay. Loss is rolled twice: once
    /// for the request leg, once for the reply leg.
    fn open_link(
        &self,
        from: NodeId,
        to: NodeId,
    ) -> Result<(Arc<dyn RaftHandler>, Option<Duration>)> {
        let state = self.lock();
        let down = |id: NodeId| state.disconnected.get(&id).copied().unwrap_or(false);
        if down(from) || down(to) {
            return Err(KeelError::PeerUnreachable(to));
        }
        if state.loss_pct > 0 && (keel_core::random_u64() % 100) < state.loss_pct as u64 {
            return Err(KeelError::PeerUnreachable(to));
        }
        let handler = state
            .handlers
            .get(&to)
            .cloned()
            .ok_or(KeelError::PeerUnreachable(to))?;
        let delay = state
            .delay
            .map(|(min, max)| keel_core::duration_in_range(min, max));
        Ok((handler, delay))
    }
}

/// One node's view of the mesh.
pub struct MemoryTransport {
    network: MemoryNetwork,
    from: NodeId,
}

impl MemoryTransport {
    async fn deliver<Req, Resp, F, Fut>(&self, to: NodeId, request: Req, call: F) -> Result<Resp>
    where
        F: FnOnce(Arc<dyn RaftHandler>, Req) -> Fut,
        Fut: std::future::Future<Output = Resp>,
    {
        let (handler, delay) = self.network.open_link(self.from, to)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let response = call(handler, request).await;
        // The reply leg races the sender's disconnection too: a node cut
        // off mid-flight must not observe the answer.
        let (_, delay) = self.network.open_link(self.from, to)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(response)
    }
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn request_vote(&self, to: NodeId, request: VoteRequest) -> Result<VoteResponse> {
        self.deliver(to, request, |handler, req| async move {
            handler.handle_request_vote(req).await
        })
        .await
    }

    async fn append_entries(
        &self,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.deliver(to, request, |handler, req| async move {
            handler.handle_append_entries(req).await
        })
        .await
    }

    async fn install_snapshot(
        &self,
        to: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.deliver(to, request, |handler, req| async move {
            handler.handle_install_snapshot(req).await
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct EchoHandler {
        term: u64,
    }

    #[async_trait]
    impl RaftHandler for EchoHandler {
        async fn handle_request_vote(&self, _request: VoteRequest) -> VoteResponse {
            VoteResponse {
                term: self.term,
                vote_granted: true,
            }
        }

        async fn handle_append_entries(
            &self,
            _request: AppendEntriesRequest,
        ) -> AppendEntriesResponse {
            AppendEntriesResponse {
                term: self.term,
                success: true,
                conflict_index: 0,
            }
        }

        async fn handle_install_snapshot(
            &self,
            _request: InstallSnapshotRequest,
        ) -> InstallSnapshotResponse {
            InstallSnapshotResponse { term: self.term }
        }
    }

    fn vote_request() -> VoteRequest {
        VoteRequest {
            term: 1,
            candidate_id: 0,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[tokio::test]
    async fn routes_between_registered_nodes() {
        let network = MemoryNetwork::new();
        network.register(1, Arc::new(EchoHandler { term: 9 }));
        let transport = network.transport(0);
        let response = transport.request_vote(1, vote_request()).await.unwrap();
        assert_eq!(response.term, 9);
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let network = MemoryNetwork::new();
        let transport = network.transport(0);
        assert!(transport.request_vote(7, vote_request()).await.is_err());
    }

    #[tokio::test]
    async fn disconnection_cuts_both_directions() {
        let network = MemoryNetwork::new();
        network.register(0, Arc::new(EchoHandler { term: 1 }));
        network.register(1, Arc::new(EchoHandler { term: 1 }));

        network.set_connected(1, false);
        assert!(network.transport(0).request_vote(1, vote_request()).await.is_err());
        assert!(network.transport(1).request_vote(0, vote_request()).await.is_err());

        network.set_connected(1, true);
        assert!(network.transport(0).request_vote(1, vote_request()).await.is_ok());
    }

    #[tokio::test]
    async fn full_loss_drops_everything() {
        let network = MemoryNetwork::new();
        network.register(1, Arc::new(EchoHandler { term: 1 }));
        network.set_loss_pct(100);
        assert!(network.transport(0).request_vote(1, vote_request()).await.is_err());
    }
}
