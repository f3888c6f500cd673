//! A retrying client for the replicated store.
//!
//! The clerk remembers the last server that answered as the probable
//! leader and walks the ring on `WrongLeader` or `Timeout`. Retries
//! reuse the same `(client_id, command_id)` so the servers' dedupe table
//! collapses them into one application.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::op::{CommandError, CommandRequest, OpKind};
use crate::server::KvServer;

/// Pause before trying the next server, so a cluster that is mid-election
/// is not hammered.
const RETRY_BACKOFF: Duration = Duration::from_millis(20);

pub struct Clerk {
    servers: Vec<Arc<KvServer>>,
    client_id: u64,
    next_command_id: AtomicU64,
    leader_hint: AtomicUsize,
}

impl Clerk {
    pub fn new(servers: Vec<Arc<KvServer>>) -> Self {
        assert!(!servers.is_empty(), "clerk needs at least one server");
        Self {
            servers,
            client_id: keel_core::random_u64(),
            next_command_id: AtomicU64::new(0),
            leader_hint: AtomicUsize::new(0),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.run(OpKind::Get, key, "").await
    }

    pub async fn put(&self, key: &str, value: &str) {
        self.run(OpKind::Put, key, value).await;
    }

    pub async fn append(&self, key: &str, value: &str) {
        self.run(OpKind::Append, key, value).await;
    }

    /// Retries until some server applies the command. Loops forever if
    /// the cluster never regains a leader, like any client with nowhere
    /// else to go.
    async fn run(&self, kind: OpKind, key: &str, value: &str) -> Option<String> {
        let command_id = self.next_command_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut server = self.leader_hint.load(Ordering::Relaxed) % self.servers.len();
        loop {
            let request = CommandRequest {
                kind,
                key: key.to_string(),
                value: value.to_string(),
                client_id: self.client_id,
                command_id,
            };
            match self.servers[server].command(request).await {
                Ok(found) => {
                    self.leader_hint.store(server, Ordering::Relaxed);
                    return Some(found);
                }
                Err(CommandError::NoKey) => {
                    self.leader_hint.store(server, Ordering::Relaxed);
                    return None;
                }
                Err(CommandError::WrongLeader | CommandError::Timeout) => {
                    server = (server + 1) % self.servers.len();
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }
}
