//! Leader election: the candidate side and the vote handler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use keel_core::NodeId;
use tokio::time::Instant;

use crate::message::{VoteRequest, VoteResponse};
use crate::node::{Raft, RaftState, Role};

impl Raft {
    /// Enters candidate state under the caller's write lock and returns
    /// the vote request to fan out once the lock is released.
    pub(crate) fn start_election(&self, st: &mut RaftState) -> VoteRequest {
        st.role = Role::Candidate;
        st.current_term += 1;
        st.voted_for = Some(self.me);
        self.persist(st);

        tracing::info!(
            target: "keel::raft",
            node = self.me,
            term = st.current_term,
            "starting election"
        );
        VoteRequest {
            term: st.current_term,
            candidate_id: self.me,
            last_log_index: st.log.last_index(),
            last_log_term: st.log.last_term(),
        }
    }

    /// Fans one election round out to every peer. Each vote task sends
    /// with no lock held and processes the reply under the write lock.
    pub(crate) fn solicit_votes(self: Arc<Self>, request: VoteRequest) {
        let votes = Arc::new(AtomicUsize::new(1));
        for &peer in self.peers.iter().filter(|&&p| p != self.me) {
            let node = Arc::clone(&self);
            let votes = Arc::clone(&votes);
            let request = request.clone();
            tokio::spawn(async move {
                let sent = tokio::time::timeout(
                    node.config.rpc_timeout,
                    node.transport.request_vote(peer, request.clone()),
                )
                .await;
                match sent {
                    Ok(Ok(response)) => {
                        if node.process_vote(peer, &request, response, &votes).await {
                            Arc::clone(&node).broadcast_heartbeat();
                        }
                    }
                    // Lost RPC; the election either completes on other
                    // votes or times out and restarts.
                    _ => {}
                }
            });
        }
    }

    /// Returns true when this reply is the one that wins the election.
    async fn process_vote(
        &self,
        peer: NodeId,
        request: &VoteRequest,
        response: VoteResponse,
        votes: &AtomicUsize,
    ) -> bool {
        let mut st = self.state.write().await;
        if response.term > st.current_term {
            self.become_follower(&mut st, response.term);
            self.persist(&st);
            return false;
        }
        // Count only while the election that sent this request is still
        // live: same term, still a candidate.
        if st.role != Role::Candidate || st.current_term != request.term || !response.vote_granted {
            return false;
        }
        let granted = votes.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(
            target: "keel::raft",
            node = self.me,
            term = st.current_term,
            from = peer,
            granted,
            "vote granted"
        );
        if granted > self.peers.len() / 2 {
            self.become_leader(&mut st);
            return true;
        }
        false
    }

    /// Inbound RequestVote. Grants at most one vote per term, and only
    /// to candidates whose log is at least as up to date as ours.
    pub(crate) async fn request_vote_locked(&self, request: VoteRequest) -> VoteResponse {
        let mut st = self.state.write().await;
        let response = self.decide_vote(&mut st, &request);
        self.persist(&st);
        response
    }

    fn decide_vote(&self, st: &mut RaftState, request: &VoteRequest) -> VoteResponse {
        if request.term < st.current_term {
            return VoteResponse {
                term: st.current_term,
                vote_granted: false,
            };
        }
        if request.term > st.current_term {
            self.become_follower(st, request.term);
        }

        let unspent = st.voted_for.is_none() || st.voted_for == Some(request.candidate_id);
        let up_to_date = st
            .log
            .is_up_to_date(request.last_log_term, request.last_log_index);
        if !(unspent && up_to_date) {
            return VoteResponse {
                term: st.current_term,
                vote_granted: false,
            };
        }

        st.voted_for = Some(request.candidate_id);
        st.election_deadline = Instant::now() + self.election_timeout();
        tracing::debug!(
            target: "keel::raft",
            node = self.me,
            term = st.current_term,
            candidate = request.candidate_id,
            "vote cast"
        );
        VoteResponse {
            term: st.current_term,
            vote_granted: true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::config::RaftConfig;
    use crate::log::LogEntry;
    use crate::message::VoteRequest;
    use crate::node::Raft;
    use crate::persist::Persister;
    use crate::transport::MemoryNetwork;

    fn quiet_config() -> RaftConfig {
        RaftConfig {
            election_timeout_min: Duration::from_secs(60),
            election_timeout_max: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            rpc_timeout: Duration::from_millis(50),
        }
    }

    fn quiet_node() -> Arc<Raft> {
        let network = MemoryNetwork::new();
        let (apply_tx, mut apply_rx) = mpsc::channel(16);
        // The receiver half is parked in a task so applies never block.
        tokio::spawn(async move { while apply_rx.recv().await.is_some() {} });
        Raft::spawn(
            vec![0, 1, 2],
            0,
            Arc::new(Persister::new()),
            network.transport(0),
            apply_tx,
            quiet_config(),
        )
    }

    fn vote_request(term: u64, candidate_id: usize, last_index: u64, last_term: u64) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id,
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let node = quiet_node();
        let first = node.request_vote_locked(vote_request(1, 1, 0, 0)).await;
        assert!(first.vote_granted);

        // Same term, different candidate: the vote is spent.
        let second = node.request_vote_locked(vote_request(1, 2, 0, 0)).await;
        assert!(!second.vote_granted);

        // Re-asking by the voted-for candidate is fine (its first
        // request may have been a duplicate).
        let again = node.request_vote_locked(vote_request(1, 1, 0, 0)).await;
        assert!(again.vote_granted);
    }

    #[tokio::test]
    async fn higher_term_reopens_vote() {
        let node = quiet_node();
        assert!(node.request_vote_locked(vote_request(1, 1, 0, 0)).await.vote_granted);
        let response = node.request_vote_locked(vote_request(2, 2, 0, 0)).await;
        assert!(response.vote_granted);
        assert_eq!(response.term, 2);
    }

    #[tokio::test]
    async fn stale_term_is_rejected() {
        let node = quiet_node();
        assert!(node.request_vote_locked(vote_request(5, 1, 0, 0)).await.vote_granted);
        let response = node.request_vote_locked(vote_request(3, 2, 0, 0)).await;
        assert!(!response.vote_granted);
        assert_eq!(response.term, 5);
    }

    #[tokio::test]
    async fn outdated_log_is_refused() {
        let node = quiet_node();
        {
            let mut st = node.state.write().await;
            st.current_term = 2;
            st.log.append([LogEntry {
                index: 1,
                term: 2,
                command: Bytes::new(),
            }]);
        }

        // Lower last term loses regardless of index.
        let behind = node.request_vote_locked(vote_request(3, 1, 9, 1)).await;
        assert!(!behind.vote_granted);
        // The term bump must stick even though the vote was refused.
        assert_eq!(node.state.read().await.current_term, 3);

        // Equal term, equal index is up to date.
        let even = node.request_vote_locked(vote_request(3, 2, 1, 2)).await;
        assert!(even.vote_granted);
    }

    #[tokio::test]
    async fn refused_vote_persists_term_bump() {
        let network = MemoryNetwork::new();
        let (apply_tx, _apply_rx) = mpsc::channel(16);
        let persister = Arc::new(Persister::new());
        let node = Raft::spawn(
            vec![0, 1, 2],
            0,
            Arc::clone(&persister),
            network.transport(0),
            apply_tx,
            quiet_config(),
        );
        {
            let mut st = node.state.write().await;
            st.log.append([LogEntry {
                index: 1,
                term: 1,
                command: Bytes::new(),
            }]);
        }
        let refused = node.request_vote_locked(vote_request(4, 1, 0, 0)).await;
        assert!(!refused.vote_granted);

        let hard = crate::persist::HardState::decode(&persister.read_raft_state()).unwrap();
        assert_eq!(hard.current_term, 4);
        assert_eq!(hard.voted_for, None);
    }
}
