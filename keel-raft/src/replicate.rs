//! Log replication: the leader's per-peer push loops, reply processing,
//! commit advancement, and the follower-side AppendEntries handler.

use std::sync::Arc;

use keel_core::NodeId;

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyMsg, InstallSnapshotRequest,
    InstallSnapshotResponse,
};
use crate::node::{Raft, RaftState, Role};

impl Raft {
    /// One unconditional round to every peer, not gated by the
    /// replicator condition. Fire-and-forget tasks; lost rounds are
    /// re-sent on the next heartbeat tick.
    pub(crate) fn broadcast_heartbeat(self: Arc<Self>) {
        for &peer in self.peers.iter().filter(|&&p| p != self.me) {
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                node.append_one_round(peer).await;
            });
        }
    }

    /// Wakes every replicator. However many signals pile up while a
    /// replicator is mid-round coalesce into one round against fresh
    /// state.
    pub(crate) fn wake_replicators(&self) {
        for notify in self.replicator_notify.values() {
            notify.notify_one();
        }
    }

    /// One replicator loop. Sleeps until there is something to push for
    /// this peer, then runs rounds until the peer is caught up again.
    pub(crate) async fn run_replicator(self: Arc<Self>, peer: NodeId) {
        loop {
            while !self.need_append(peer).await {
                if self.is_killed() {
                    return;
                }
                self.replicator_notify[&peer].notified().await;
                if self.is_killed() {
                    return;
                }
            }
            if !self.append_one_round(peer).await {
                // No reply came back. Pace the retry so a dead peer does
                // not turn this loop into a busy spin.
                tokio::time::sleep(self.config.rpc_timeout).await;
            }
        }
    }

    async fn need_append(&self, peer: NodeId) -> bool {
        let st = self.state.read().await;
        st.role == Role::Leader && st.match_index[&peer] < st.log.last_index()
    }

    /// One push to one peer: build the request under the read lock, send
    /// with the lock released, process the reply under the write lock.
    /// A peer whose next slot fell behind the snapshot boundary gets the
    /// snapshot instead of entries. Returns whether a reply was
    /// processed; a lost RPC is simply dropped.
    pub(crate) async fn append_one_round(&self, peer: NodeId) -> bool {
        enum Round {
            Entries(AppendEntriesRequest),
            Snapshot(InstallSnapshotRequest),
        }

        let round = {
            let st = self.state.read().await;
            if st.role != Role::Leader {
                return true;
            }
            let prev = st.next_index[&peer] - 1;
            if prev < st.log.dummy_index() {
                Round::Snapshot(InstallSnapshotRequest {
                    term: st.current_term,
                    leader_id: self.me,
                    last_included_index: st.log.dummy_index(),
                    last_included_term: st.log.dummy_term(),
                    data: self.persister.read_snapshot(),
                })
            } else {
                // next_index never exceeds last_index+1, so the clamp is
                // a guard against an impossible probe, not a code path.
                let prev = prev.min(st.log.last_index());
                Round::Entries(AppendEntriesRequest {
                    term: st.current_term,
                    leader_id: self.me,
                    prev_log_index: prev,
                    prev_log_term: st.log.term_at(prev),
                    entries: st.log.tail(prev + 1).to_vec(),
                    leader_commit: st.commit_index,
                })
            }
        };

        match round {
            Round::Entries(request) => {
                let sent = tokio::time::timeout(
                    self.config.rpc_timeout,
                    self.transport.append_entries(peer, request.clone()),
                )
                .await;
                if let Ok(Ok(response)) = sent {
                    let mut st = self.state.write().await;
                    self.process_append_response(&mut st, peer, &request, &response);
                    true
                } else {
                    false
                }
            }
            Round::Snapshot(request) => {
                let sent = tokio::time::timeout(
                    self.config.rpc_timeout,
                    self.transport.install_snapshot(peer, request.clone()),
                )
                .await;
                if let Ok(Ok(response)) = sent {
                    let mut st = self.state.write().await;
                    self.process_snapshot_response(&mut st, peer, &request, &response);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Applies one AppendEntries reply. Replies are only honored while
    /// the round that produced them is still current: same term on both
    /// sides and `prev_log_index` still one below `next_index`, so
    /// duplicated or reordered replies fall through without effect.
    fn process_append_response(
        &self,
        st: &mut RaftState,
        peer: NodeId,
        request: &AppendEntriesRequest,
        response: &AppendEntriesResponse,
    ) {
        if response.term > st.current_term {
            self.become_follower(st, response.term);
            self.persist(st);
            return;
        }
        if st.role != Role::Leader
            || response.term != st.current_term
            || request.term != st.current_term
            || request.prev_log_index != st.next_index[&peer] - 1
        {
            return;
        }

        if response.success {
            let new_match = request.prev_log_index + request.entries.len() as u64;
            let new_next = new_match + 1;
            if let Some(m) = st.match_index.get_mut(&peer) {
                *m = (*m).max(new_match);
            }
            if let Some(n) = st.next_index.get_mut(&peer) {
                *n = (*n).max(new_next);
            }
            self.advance_commit(st);
        } else {
            let floor = st.log.dummy_index() + 1;
            st.next_index.insert(peer, response.conflict_index.max(floor));
            tracing::debug!(
                target: "keel::raft",
                node = self.me,
                peer,
                next = st.next_index[&peer],
                "log probe backed off"
            );
        }

        if st.next_index[&peer] <= st.log.last_index() {
            self.replicator_notify[&peer].notify_one();
        }
    }

    fn process_snapshot_response(
        &self,
        st: &mut RaftState,
        peer: NodeId,
        request: &InstallSnapshotRequest,
        response: &InstallSnapshotResponse,
    ) {
        if response.term > st.current_term {
            self.become_follower(st, response.term);
            self.persist(st);
            return;
        }
        if st.role != Role::Leader || request.term != st.current_term {
            return;
        }
        if let Some(n) = st.next_index.get_mut(&peer) {
            *n = (*n).max(request.last_included_index + 1);
        }
        if let Some(m) = st.match_index.get_mut(&peer) {
            *m = (*m).max(request.last_included_index);
        }
    }

    /// Raft §5.3/§5.4.2 commit rule: find the highest index replicated
    /// on a strict majority, but only ever commit entries of the current
    /// term; earlier-term entries commit with them as a prefix.
    pub(crate) fn advance_commit(&self, st: &mut RaftState) {
        if st.role != Role::Leader {
            return;
        }
        let majority = self.peers.len() / 2 + 1;
        let mut index = st.log.last_index();
        while index > st.commit_index {
            let replicas = 1 + self
                .peers
                .iter()
                .filter(|&&p| p != self.me && st.match_index[&p] >= index)
                .count();
            if replicas >= majority && st.log.term_at(index) == st.current_term {
                st.commit_index = index;
                tracing::debug!(
                    target: "keel::raft",
                    node = self.me,
                    term = st.current_term,
                    commit = index,
                    "commit index advanced"
                );
                self.apply_notify.notify_one();
                break;
            }
            index -= 1;
        }
    }

    /// Inbound AppendEntries: consistency check, fast-backup conflict
    /// hint, per-entry truncation, and commit propagation.
    pub(crate) async fn append_entries_locked(
        &self,
        request: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        let mut st = self.state.write().await;
        let response = self.accept_entries(&mut st, request);
        self.persist(&st);
        response
    }

    fn accept_entries(
        &self,
        st: &mut RaftState,
        request: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        if request.term < st.current_term {
            return AppendEntriesResponse {
                term: st.current_term,
                success: false,
                conflict_index: 0,
            };
        }
        if request.term > st.current_term {
            st.current_term = request.term;
            st.voted_for = None;
        }
        // A live leader for this term: whatever we were, we follow now.
        self.become_follower(st, request.term);

        if request.prev_log_index < st.log.dummy_index() {
            // The probe fell behind our snapshot; only InstallSnapshot
            // can reconcile. Term 0 makes the reply self-invalidating at
            // the leader.
            return AppendEntriesResponse {
                term: 0,
                success: false,
                conflict_index: st.log.dummy_index() + 1,
            };
        }

        if !st
            .log
            .match_term(request.prev_log_term, request.prev_log_index)
        {
            let conflict_index = if request.prev_log_index > st.log.last_index() {
                st.log.last_index() + 1
            } else {
                // Skip the whole conflicting term instead of probing one
                // entry at a time, staying above the dummy.
                let floor = st.log.dummy_index() + 1;
                let conflict_term = st.log.term_at(request.prev_log_index);
                let mut index = request.prev_log_index;
                while index > floor && st.log.term_at(index) == conflict_term {
                    index -= 1;
                }
                index
            };
            return AppendEntriesResponse {
                term: st.current_term,
                success: false,
                conflict_index,
            };
        }

        // Per-entry conflict scan: only truncate at the first real
        // disagreement. A stale or reordered request whose entries all
        // match must not erase a longer suffix we already hold.
        for (offset, entry) in request.entries.iter().enumerate() {
            if entry.index > st.log.last_index() || st.log.term_at(entry.index) != entry.term {
                st.log.truncate(entry.index);
                st.log
                    .append(request.entries[offset..].iter().cloned());
                break;
            }
        }

        if request.leader_commit > st.commit_index {
            st.commit_index = request.leader_commit.min(st.log.last_index());
            self.apply_notify.notify_one();
        }

        AppendEntriesResponse {
            term: st.current_term,
            success: true,
            conflict_index: 0,
        }
    }

    /// Inbound InstallSnapshot. Stale snapshots (at or below our commit
    /// point) are acknowledged and dropped; fresh ones are forwarded on
    /// the apply channel for the service to adopt.
    pub(crate) async fn install_snapshot_locked(
        &self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let mut st = self.state.write().await;
        if request.term < st.current_term {
            return InstallSnapshotResponse {
                term: st.current_term,
            };
        }
        if request.term > st.current_term {
            st.current_term = request.term;
            st.voted_for = None;
        }
        self.become_follower(&mut st, request.term);
        self.persist(&st);
        let term = st.current_term;

        if request.last_included_index <= st.commit_index {
            return InstallSnapshotResponse { term };
        }
        drop(st);

        // Forwarded from a spawned task so the handler never blocks on
        // the apply channel while holding the write lock; the service
        // may be mid-callback into this node.
        let apply_tx = self.apply_tx.clone();
        tokio::spawn(async move {
            let _ = apply_tx
                .send(ApplyMsg::Snapshot {
                    index: request.last_included_index,
                    term: request.last_included_term,
                    data: request.data,
                })
                .await;
        });
        InstallSnapshotResponse { term }
    }
}
