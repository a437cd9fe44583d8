//! Transaction group serialization.
//!
//! ```text
//! TG      = [tgid i64][count i64] command*count
//! command = [rt i8][keyLen i16][key][dataLen i32][varRecLen i32]
//!           [offset i64][index i64][data][shapes]
//! shapes  = [n u8] ([nameLen u8][name][type u8])*n
//! ```
//!
//! The TGDATA frame stores `len` before the bytes and an MD5 digest of
//! `len ‖ bytes` after them.

use super::message::MessageId;
use crate::error::{Result, StoreError};
use crate::format::{DataShape, RecordType};
use crate::txn::WriteCommand;
use md5::{Digest, Md5};
use std::io::Write;

/// A decoded transaction group.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionGroup {
    /// Transaction group ID.
    pub tgid: i64,
    /// Commands in commit order.
    pub commands: Vec<WriteCommand>,
}

impl TransactionGroup {
    /// Serializes a group of commands under `tgid`.
    pub fn serialize(tgid: i64, commands: &[WriteCommand]) -> Vec<u8> {
        let payload: usize = commands
            .iter()
            .map(|c| 35 + c.wal_key_path.len() + c.data.len())
            .sum();
        let mut buf = Vec::with_capacity(16 + payload);
        buf.extend_from_slice(&tgid.to_le_bytes());
        buf.extend_from_slice(&(commands.len() as i64).to_le_bytes());
        for cmd in commands {
            buf.push(cmd.record_type as i8 as u8);
            buf.extend_from_slice(&(cmd.wal_key_path.len() as i16).to_le_bytes());
            buf.extend_from_slice(cmd.wal_key_path.as_bytes());
            buf.extend_from_slice(&(cmd.data.len() as i32).to_le_bytes());
            buf.extend_from_slice(&cmd.var_rec_len.to_le_bytes());
            buf.extend_from_slice(&cmd.offset.to_le_bytes());
            buf.extend_from_slice(&cmd.index.to_le_bytes());
            buf.extend_from_slice(&cmd.data);
            DataShape::encode_list(&cmd.shapes, &mut buf);
        }
        buf
    }

    /// Parses serialized TG bytes.
    ///
    /// # Errors
    ///
    /// Returns `ShortRead` if the bytes end early, or `InvalidFormat` for
    /// bad tags or negative lengths.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor { buf: bytes, pos: 0 };
        let tgid = cur.i64()?;
        let count = cur.i64()?;
        let count = usize::try_from(count)
            .map_err(|_| StoreError::InvalidFormat(format!("negative command count {count}")))?;

        let mut commands = Vec::with_capacity(count.min(bytes.len() / 35 + 1));
        for _ in 0..count {
            let record_type = RecordType::from_tag(i64::from(cur.take(1)?[0] as i8))?;
            let key_len = usize::try_from(cur.i16()?)
                .map_err(|_| StoreError::InvalidFormat("negative key length".into()))?;
            let wal_key_path = String::from_utf8_lossy(cur.take(key_len)?).into_owned();
            let data_len = usize::try_from(cur.i32()?)
                .map_err(|_| StoreError::InvalidFormat("negative data length".into()))?;
            let var_rec_len = cur.i32()?;
            let offset = cur.i64()?;
            let index = cur.i64()?;
            let data = cur.take(data_len)?.to_vec();
            let (shapes, used) = DataShape::decode_list(&bytes[cur.pos..])?;
            cur.pos += used;
            commands.push(WriteCommand {
                record_type,
                wal_key_path,
                var_rec_len,
                offset,
                index,
                data,
                shapes,
            });
        }
        Ok(Self { tgid, commands })
    }
}

/// MD5 digest of `len ‖ tg_bytes`, as stored after a TGDATA frame.
pub fn checksum(tg_bytes: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update((tg_bytes.len() as i64).to_le_bytes());
    hasher.update(tg_bytes);
    hasher.finalize().into()
}

/// Writes a complete TGDATA frame.
///
/// # Errors
///
/// Returns an error if the underlying write fails.
pub fn write_frame<W: Write>(writer: &mut W, tg_bytes: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(1 + 8 + tg_bytes.len() + 16);
    buf.push(MessageId::TgData as u8);
    buf.extend_from_slice(&(tg_bytes.len() as i64).to_le_bytes());
    buf.extend_from_slice(tg_bytes);
    buf.extend_from_slice(&checksum(tg_bytes));
    writer.write_all(&buf)?;
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(StoreError::ShortRead {
                expected: self.pos.saturating_add(n),
                actual: self.buf.len(),
            }),
        }
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}
