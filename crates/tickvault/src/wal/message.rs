//! WAL message framing.
//!
//! Every message starts with a one-byte [`MessageId`]:
//!
//! ```text
//! STATUS  (offset 0 only)  [2][file status i8][replay state i8][owner i64]
//! TXNINFO                  [1][tgid i64][destination u8][txn status u8]
//! TGDATA                   [0][len i64][tg bytes ...][md5 16 bytes]
//! ```

use crate::error::{Result, StoreError};
use std::io::{Read, Write};

/// Length of the STATUS message including its ID byte.
pub const STATUS_MESSAGE_LEN: u64 = 11;

/// Length of the STATUS payload. A WAL file no longer than this holds no
/// transaction data.
pub const STATUS_PAYLOAD_LEN: u64 = 10;

/// Leading byte of every WAL message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    /// Serialized transaction group.
    TgData = 0,
    /// Transaction state change.
    TxnInfo = 1,
    /// File status header.
    Status = 2,
}

impl MessageId {
    /// Decodes a message ID byte.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessageId` for unknown values.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::TgData),
            1 => Ok(Self::TxnInfo),
            2 => Ok(Self::Status),
            other => Err(StoreError::InvalidMessageId(other)),
        }
    }
}

/// Where a transaction is being committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Destination {
    /// Into the WAL itself.
    Wal = 0,
    /// Into the primary files.
    Checkpoint = 1,
}

/// Transaction state recorded by TXNINFO messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnStatus {
    /// Commit has started.
    Preparing = 0,
    /// Commit is about to complete.
    CommitIntended = 1,
    /// Commit is durable.
    CommitComplete = 2,
}

/// Open/closed state of a WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum FileStatus {
    /// Owned and writable.
    Open = 1,
    /// Closed by its owner.
    Closed = 2,
}

/// Replay state of a WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ReplayState {
    /// Content may not be in the primary files yet.
    NotReplayed = 1,
    /// A replay started and did not finish.
    ReplayInProcess = 2,
    /// Content is in the primary files.
    Replayed = 3,
}

/// Decoded STATUS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMessage {
    /// File state.
    pub file_status: FileStatus,
    /// Replay state.
    pub replay_state: ReplayState,
    /// Instance ID of the owner.
    pub owner: i64,
}

impl StatusMessage {
    /// Writes the message including its ID byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = [0u8; STATUS_MESSAGE_LEN as usize];
        buf[0] = MessageId::Status as u8;
        buf[1] = self.file_status as i8 as u8;
        buf[2] = self.replay_state as i8 as u8;
        buf[3..11].copy_from_slice(&self.owner.to_le_bytes());
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Reads the message including its ID byte.
    ///
    /// # Errors
    ///
    /// Returns an error on a short read, a wrong message ID or an unknown
    /// status value.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; STATUS_MESSAGE_LEN as usize];
        reader.read_exact(&mut buf)?;
        if MessageId::from_u8(buf[0])? != MessageId::Status {
            return Err(StoreError::InvalidMessageId(buf[0]));
        }
        let file_status = match buf[1] as i8 {
            1 => FileStatus::Open,
            2 => FileStatus::Closed,
            other => {
                return Err(StoreError::InvalidFormat(format!(
                    "unknown WAL file status {other}"
                )))
            }
        };
        let replay_state = match buf[2] as i8 {
            1 => ReplayState::NotReplayed,
            2 => ReplayState::ReplayInProcess,
            3 => ReplayState::Replayed,
            other => {
                return Err(StoreError::InvalidFormat(format!(
                    "unknown WAL replay state {other}"
                )))
            }
        };
        Ok(Self {
            file_status,
            replay_state,
            owner: i64::from_le_bytes(buf[3..11].try_into().unwrap()),
        })
    }
}

/// Decoded TXNINFO message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnInfo {
    /// Transaction group ID.
    pub tgid: i64,
    /// Commit destination.
    pub destination: Destination,
    /// Commit state.
    pub status: TxnStatus,
}

impl TxnInfo {
    /// Payload length, excluding the ID byte.
    pub const PAYLOAD_LEN: usize = 10;

    /// Writes the message including its ID byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = [0u8; 1 + Self::PAYLOAD_LEN];
        buf[0] = MessageId::TxnInfo as u8;
        buf[1..9].copy_from_slice(&self.tgid.to_le_bytes());
        buf[9] = self.destination as u8;
        buf[10] = self.status as u8;
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Reads the payload that follows a TXNINFO ID byte.
    ///
    /// # Errors
    ///
    /// Returns an error on a short read or unknown enum values.
    pub fn read_payload<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; Self::PAYLOAD_LEN];
        reader.read_exact(&mut buf)?;
        let destination = match buf[8] {
            0 => Destination::Wal,
            1 => Destination::Checkpoint,
            other => {
                return Err(StoreError::InvalidFormat(format!(
                    "unknown TXNINFO destination {other}"
                )))
            }
        };
        let status = match buf[9] {
            0 => TxnStatus::Preparing,
            1 => TxnStatus::CommitIntended,
            2 => TxnStatus::CommitComplete,
            other => {
                return Err(StoreError::InvalidFormat(format!(
                    "unknown TXNINFO status {other}"
                )))
            }
        };
        Ok(Self {
            tgid: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            destination,
            status,
        })
    }
}
