//! Client operations and their wire form inside the raft log.
//!
//! The consensus layer carries commands as opaque bytes; this codec is
//! the service's private encoding of one operation. Every field is
//! length-checked on decode, but a decode failure on an applied entry is
//! still fatal: the service wrote those bytes itself, so a mismatch
//! means the log or the codec is broken.

use bytes::{BufMut, Bytes, BytesMut};
use keel_core::{KeelError, Result};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Get = 0,
    Put = 1,
    Append = 2,
}

impl OpKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Get),
            1 => Some(Self::Put),
            2 => Some(Self::Append),
            _ => None,
        }
    }
}

/// One client operation as replicated through the log.
///
/// `(client_id, command_id)` identifies the operation for dedupe across
/// retries; `seq` is a per-submission token that routes the apply-side
/// wakeup back to the request that is actually waiting, so a retry never
/// steals the reply of an earlier submission of the same command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub key: String,
    pub value: String,
    pub client_id: u64,
    pub command_id: u64,
    pub seq: u64,
}

impl Op {
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(1 + 24 + 2 + self.key.len() + 4 + self.value.len());
        buf.put_u8(self.kind as u8);
        buf.put_u64_le(self.client_id);
        buf.put_u64_le(self.command_id);
        buf.put_u64_le(self.seq);
        buf.put_u16_le(self.key.len() as u16);
        buf.put_slice(self.key.as_bytes());
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(self.value.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| KeelError::Corrupt {
            reason: reason.to_string(),
        };
        if data.len() < 1 + 24 + 2 {
            return Err(corrupt("op shorter than fixed header"));
        }
        let kind = OpKind::from_u8(data[0]).ok_or_else(|| corrupt("unknown op kind"))?;
        let client_id = u64::from_le_bytes(data[1..9].try_into().map_err(|_| corrupt("client id"))?);
        let command_id =
            u64::from_le_bytes(data[9..17].try_into().map_err(|_| corrupt("command id"))?);
        let seq = u64::from_le_bytes(data[17..25].try_into().map_err(|_| corrupt("seq"))?);
        let key_len =
            u16::from_le_bytes(data[25..27].try_into().map_err(|_| corrupt("key len"))?) as usize;
        let mut at = 27;
        if data.len() < at + key_len + 4 {
            return Err(corrupt("truncated key"));
        }
        let key = String::from_utf8(data[at..at + key_len].to_vec())
            .map_err(|_| corrupt("key not utf-8"))?;
        at += key_len;
        let value_len = u32::from_le_bytes(
            data[at..at + 4].try_into().map_err(|_| corrupt("value len"))?,
        ) as usize;
        at += 4;
        if data.len() != at + value_len {
            return Err(corrupt("value length mismatch"));
        }
        let value = String::from_utf8(data[at..].to_vec())
            .map_err(|_| corrupt("value not utf-8"))?;
        Ok(Self {
            kind,
            key,
            value,
            client_id,
            command_id,
            seq,
        })
    }
}

/// A client-facing operation, before the service attaches its `seq`.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub kind: OpKind,
    pub key: String,
    pub value: String,
    pub client_id: u64,
    pub command_id: u64,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    #[error("no such key")]
    NoKey,
    #[error("not the leader")]
    WrongLeader,
    #[error("timed out waiting for commit")]
    Timeout,
}
