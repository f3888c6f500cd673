//! Durable state boundary.
//!
//! The node persists `(current_term, voted_for, log)` as one opaque blob
//! before replying to any RPC whose reply depends on those fields, and
//! before `submit` returns. The store only moves byte blobs; the node
//! owns the encoding.
//!
//! Blob layout:
//! `[magic 4][term u64][vote_flag u8][vote u64][entry_count u32]`
//! then per entry `[index u64][term u64][cmd_len u32][cmd bytes]`,
//! then a CRC32 trailer over everything before it. A failed CRC or a
//! short read means storage corruption; callers abort on it rather than
//! guessing at consensus state.

use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use keel_core::{KeelError, Result};

use crate::log::LogEntry;

const STATE_MAGIC: [u8; 4] = *b"KEEL";

/// The persisted hard state of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<usize>,
    pub entries: Vec<LogEntry>,
}

impl HardState {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.entries.len() * 32);
        buf.put_slice(&STATE_MAGIC);
        buf.put_u64_le(self.current_term);
        match self.voted_for {
            Some(id) => {
                buf.put_u8(1);
                buf.put_u64_le(id as u64);
            }
            None => {
                buf.put_u8(0);
                buf.put_u64_le(0);
            }
        }
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u64_le(entry.index);
            buf.put_u64_le(entry.term);
            buf.put_u32_le(entry.command.len() as u32);
            buf.put_slice(&entry.command);
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.put_u32_le(hasher.finalize());
        buf.freeze()
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        let mut cursor = Reader::new(blob);
        let body_len = blob
            .len()
            .checked_sub(4)
            .ok_or_else(|| corrupt("blob shorter than checksum trailer"))?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&blob[..body_len]);
        let expected = hasher.finalize();
        let stored = u32::from_le_bytes(
            blob[body_len..]
                .try_into()
                .map_err(|_| corrupt("truncated checksum trailer"))?,
        );
        if stored != expected {
            return Err(corrupt(&format!(
                "checksum mismatch: stored {stored:#x}, computed {expected:#x}"
            )));
        }

        let magic = cursor.bytes(4)?;
        if magic != STATE_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let current_term = cursor.u64()?;
        let vote_flag = cursor.u8()?;
        let vote = cursor.u64()?;
        let voted_for = match vote_flag {
            0 => None,
            1 => Some(vote as usize),
            other => return Err(corrupt(&format!("bad vote flag {other}"))),
        };
        let count = cursor.u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let index = cursor.u64()?;
            let term = cursor.u64()?;
            let len = cursor.u32()? as usize;
            let command = Bytes::copy_from_slice(cursor.bytes(len)?);
            entries.push(LogEntry {
                index,
                term,
                command,
            });
        }
        Ok(Self {
            current_term,
            voted_for,
            entries,
        })
    }
}

fn corrupt(reason: &str) -> KeelError {
    KeelError::Corrupt {
        reason: reason.to_string(),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| corrupt("truncated blob"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(
            self.bytes(4)?.try_into().map_err(|_| corrupt("short u32"))?,
        ))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(
            self.bytes(8)?.try_into().map_err(|_| corrupt("short u64"))?,
        ))
    }
}

/// In-memory blob store holding one node's raft state and service
/// snapshot. Stands in for whatever durable medium a deployment wires
/// up; the interface is load/save only.
#[derive(Debug, Default)]
pub struct Persister {
    inner: Mutex<Blobs>,
}

#[derive(Debug, Default)]
struct Blobs {
    raft_state: Bytes,
    snapshot: Bytes,
}

impl Persister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_raft_state(&self, state: Bytes) {
        let mut inner = self.lock();
        inner.raft_state = state;
    }

    pub fn read_raft_state(&self) -> Bytes {
        self.lock().raft_state.clone()
    }

    /// Atomically replaces both blobs, so a crash between the two writes
    /// can never pair a snapshot with a pre-snapshot raft state.
    pub fn save_state_and_snapshot(&self, state: Bytes, snapshot: Bytes) {
        let mut inner = self.lock();
        inner.raft_state = state;
        inner.snapshot = snapshot;
    }

    pub fn read_snapshot(&self) -> Bytes {
        self.lock().snapshot.clone()
    }

    /// Size in bytes of the persisted raft state. The service layer
    /// compares this against its snapshot threshold.
    pub fn raft_state_size(&self) -> usize {
        self.lock().raft_state.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Blobs> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
