#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod client;
mod op;
mod server;
mod snapshot;
mod store;

pub use client::Clerk;
pub use op::{CommandError, CommandRequest, Op, OpKind};
pub use server::KvServer;
pub use store::MemoryStore;
