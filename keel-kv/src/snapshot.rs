//! Service snapshot blob: the string map plus the dedupe table.
//!
//! Same framing discipline as the raft hard-state blob: length-prefixed
//! fields with a CRC32 trailer. The dedupe table must travel with the
//! data — restoring the map without the highest-applied command ids
//! would re-open the door to double-applying retried commands.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use keel_core::{KeelError, Result};

const SNAPSHOT_MAGIC: [u8; 4] = *b"KLKV";

pub(crate) fn encode_snapshot(
    store: &HashMap<String, String>,
    latest_cmd: &HashMap<u64, u64>,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(&SNAPSHOT_MAGIC);
    buf.put_u32_le(store.len() as u32);
    for (key, value) in store {
        buf.put_u16_le(key.len() as u16);
        buf.put_slice(key.as_bytes());
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
    buf.put_u32_le(latest_cmd.len() as u32);
    for (client, command) in latest_cmd {
        buf.put_u64_le(*client);
        buf.put_u64_le(*command);
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    buf.put_u32_le(hasher.finalize());
    buf.freeze()
}

pub(crate) fn decode_snapshot(
    blob: &[u8],
) -> Result<(HashMap<String, String>, HashMap<u64, u64>)> {
    let body_len = blob
        .len()
        .checked_sub(4)
        .ok_or_else(|| corrupt("snapshot shorter than checksum"))?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&blob[..body_len]);
    let stored = u32::from_le_bytes(
        blob[body_len..]
            .try_into()
            .map_err(|_| corrupt("snapshot checksum"))?,
    );
    if stored != hasher.finalize() {
        return Err(corrupt("snapshot checksum mismatch"));
    }

    let mut reader = Reader {
        buf: &blob[..body_len],
        at: 0,
    };
    if reader.take(4)? != SNAPSHOT_MAGIC {
        return Err(corrupt("snapshot magic"));
    }
    let store_len = reader.u32()? as usize;
    let mut store = HashMap::with_capacity(store_len);
    for _ in 0..store_len {
        let key_len = reader.u16()? as usize;
        let key = String::from_utf8(reader.take(key_len)?.to_vec())
            .map_err(|_| corrupt("key utf-8"))?;
        let value_len = reader.u32()? as usize;
        let value = String::from_utf8(reader.take(value_len)?.to_vec())
            .map_err(|_| corrupt("value utf-8"))?;
        store.insert(key, value);
    }
    let cmd_len = reader.u32()? as usize;
    let mut latest_cmd = HashMap::with_capacity(cmd_len);
    for _ in 0..cmd_len {
        let client = reader.u64()?;
        let command = reader.u64()?;
        latest_cmd.insert(client, command);
    }
    if reader.at != body_len {
        return Err(corrupt("trailing bytes in snapshot"));
    }
    Ok((store, latest_cmd))
}

fn corrupt(reason: &str) -> KeelError {
    KeelError::Corrupt {
        reason: reason.to_string(),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .at
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| corrupt("truncated snapshot"))?;
        let out = &self.buf[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(
            self.take(2)?.try_into().map_err(|_| corrupt("short u16"))?,
        ))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(
            self.take(4)?.try_into().map_err(|_| corrupt("short u32"))?,
        ))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(
            self.take(8)?.try_into().map_err(|_| corrupt("short u64"))?,
        ))
    }
}
