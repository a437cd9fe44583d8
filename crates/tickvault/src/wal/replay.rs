//! Two-pass recovery of a WAL file.
//!
//! Pass one reads every message and keeps the TG bytes by TGID, dropping
//! groups covered by a completed checkpoint. Pass two applies the survivors
//! in TGID order, checkpointing after each one, so an interrupted replay can
//! simply be run again.

use super::message::{Destination, MessageId, ReplayState, TxnInfo, TxnStatus, STATUS_PAYLOAD_LEN};
use super::tg::{self, TransactionGroup};
use super::{group_by_file, WalFile};
use crate::error::{Result, StoreError};
use crate::format::BucketInfo;
use crate::key::BucketKey;
use crate::txn::WriteCommand;
use std::collections::BTreeMap;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Description of buckets recreated from WAL content.
pub const REPLAY_BUCKET_DESCRIPTION: &str = "Created By Replay";

impl WalFile {
    /// Replays the file into the primary files and marks it REPLAYED.
    ///
    /// With `dry_run` the file is parsed and logged, but neither the primary
    /// files nor the WAL status are touched. Returns the number of groups
    /// replayed (or found, for a dry run).
    ///
    /// # Errors
    ///
    /// Returns `Replay { cont: true }` if the file does not need replay, holds
    /// a duplicate TGID, a corrupt or unparsable group, or names a file that
    /// cannot be recreated; or an I/O error.
    pub fn replay(&mut self, dry_run: bool) -> Result<usize> {
        self.read_status()?;
        if !self.needs_replay() {
            return Err(StoreError::replay(
                format!("{} does not need replay", self.path.display()),
                true,
            ));
        }
        if !dry_run {
            self.write_status(self.status.file_status, ReplayState::ReplayInProcess)?;
        }
        info!(path = ?self.path, dry_run, "beginning WAL replay");

        let groups = self.read_groups().map_err(corrupt_wal)?;
        debug!(groups = groups.len(), "WAL groups pending replay");

        let mut replayed = 0;
        for (tgid, bytes) in groups {
            let group = TransactionGroup::parse(&bytes).map_err(corrupt_wal)?;
            if dry_run {
                info!(tgid, commands = group.commands.len(), "would replay transaction group");
            } else {
                self.replay_group(&group)?;
            }
            replayed += 1;
        }

        if !dry_run {
            self.write_status(self.status.file_status, ReplayState::Replayed)?;
        }
        info!(path = ?self.path, replayed, "finished WAL replay");
        Ok(replayed)
    }

    fn read_groups(&mut self) -> Result<BTreeMap<i64, Vec<u8>>> {
        let file_len = self.file.metadata()?.len();
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut groups: BTreeMap<i64, Vec<u8>> = BTreeMap::new();
        let mut checkpointed = i64::MIN;
        loop {
            let mut id = [0u8; 1];
            if reader.read(&mut id)? == 0 {
                break;
            }
            let step = match MessageId::from_u8(id[0]) {
                Ok(MessageId::TgData) => read_tg_data(&mut reader, file_len).map(|frame| {
                    frame.map(|(tgid, bytes)| Message::Group(tgid, bytes))
                }),
                Ok(MessageId::TxnInfo) => TxnInfo::read_payload(&mut reader).map(|i| Some(Message::Info(i))),
                Ok(MessageId::Status) => {
                    let mut payload = [0u8; STATUS_PAYLOAD_LEN as usize];
                    reader
                        .read_exact(&mut payload)
                        .map(|_| Some(Message::Status))
                        .map_err(StoreError::from)
                }
                Err(e) => {
                    warn!(error = %e, "stopping WAL read at unknown message");
                    break;
                }
            };
            let message = match step {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) if e.is_short_read() => {
                    debug!("partial message at end of WAL");
                    break;
                }
                Err(e) => return Err(e),
            };

            match message {
                Message::Group(tgid, bytes) => {
                    if groups.insert(tgid, bytes).is_some() {
                        return Err(StoreError::replay(
                            format!("duplicate TG data in WAL, tgid={tgid}"),
                            true,
                        ));
                    }
                }
                Message::Info(TxnInfo {
                    tgid,
                    destination: Destination::Checkpoint,
                    status: TxnStatus::CommitComplete,
                }) => {
                    checkpointed = checkpointed.max(tgid);
                    groups.retain(|id, _| *id > tgid);
                }
                Message::Info(_) | Message::Status => {}
            }
        }
        groups.retain(|id, _| *id > checkpointed);
        Ok(groups)
    }

    fn replay_group(&mut self, group: &TransactionGroup) -> Result<()> {
        if group.commands.is_empty() {
            return Ok(());
        }
        for (key_path, cmds) in group_by_file(&group.commands) {
            self.ensure_bucket(cmds[0]).map_err(|e| {
                StoreError::replay(format!("cannot open {key_path}: {e}"), true)
            })?;
            self.primary.write_file(key_path, &cmds)?;
        }
        self.last_committed = group.tgid;
        self.create_checkpoint()?;
        debug!(tgid = group.tgid, commands = group.commands.len(), "replayed transaction group");
        Ok(())
    }

    /// Makes sure the target year file exists, recreating the bucket from
    /// the shapes carried by the command if needed.
    fn ensure_bucket(&self, cmd: &WriteCommand) -> Result<()> {
        let catalog = &self.shared.catalog;
        match catalog.path_to_bucket_info(&cmd.wal_key_path) {
            Ok(_) => return Ok(()),
            Err(StoreError::BucketNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let (key, year) = BucketKey::from_wal_key_path(&cmd.wal_key_path)?;
        if catalog.contains(&key) {
            catalog.add_year_file(&key, year)?;
            return Ok(());
        }
        let info = BucketInfo::new(
            PathBuf::new(),
            REPLAY_BUCKET_DESCRIPTION,
            year,
            key.timeframe()?,
            cmd.shapes.clone(),
            cmd.record_type,
        );
        catalog.add_time_bucket(&key, info)?;
        warn!(key = %key, year, "recreated missing bucket during replay");
        Ok(())
    }
}

/// Corrupt log content fails this file only; the caller moves it aside.
fn corrupt_wal(e: StoreError) -> StoreError {
    match e {
        StoreError::ChecksumMismatch { .. }
        | StoreError::InvalidFormat(_)
        | StoreError::InvalidMessageId(_)
        | StoreError::ShortRead { .. } => StoreError::replay(format!("corrupt WAL content: {e}"), true),
        other => other,
    }
}

enum Message {
    Group(i64, Vec<u8>),
    Info(TxnInfo),
    Status,
}

/// Reads the rest of a TGDATA frame. Returns `None` when the declared length
/// cannot be right, which ends the read.
fn read_tg_data<R: Read>(reader: &mut R, file_len: u64) -> Result<Option<(i64, Vec<u8>)>> {
    let mut word = [0u8; 8];
    reader.read_exact(&mut word)?;
    let len = i64::from_le_bytes(word);
    if len < 16 || len as u64 > file_len {
        warn!(len, file_len, "implausible TG length, stopping WAL read");
        return Ok(None);
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    let mut expected = [0u8; 16];
    reader.read_exact(&mut expected)?;
    let actual = tg::checksum(&bytes);
    if actual != expected {
        return Err(StoreError::ChecksumMismatch { expected, actual });
    }
    let tgid = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
    Ok(Some((tgid, bytes)))
}
