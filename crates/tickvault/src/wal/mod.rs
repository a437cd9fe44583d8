//! Write-Ahead Log (WAL) and commit protocol.
//!
//! Every flush turns the commands queued in the [`TransactionPipe`] into one
//! transaction group (TG), makes it durable in the WAL and then applies it to
//! the primary year files:
//!
//! ```text
//! TXNINFO(tgid, WAL, PREPARING)
//! TGDATA [len][tg bytes][md5]          ── fsync
//! TXNINFO(tgid, WAL, COMMITCOMPLETE)   ── replication.send(tg bytes)
//! primary writes (per file)            ── triggers
//! ```
//!
//! Primary files are only synced at checkpoints. A checkpoint records that
//! everything up to a TGID reached the primary files, which lets replay skip
//! those groups:
//!
//! ```text
//! TXNINFO(tgid, CHECKPOINT, PREPARING)
//! sync primary files
//! TXNINFO(tgid, CHECKPOINT, COMMITCOMPLETE)
//! ```
//!
//! Every `wal_rotate_interval` checkpoints the file is truncated and starts
//! over with a fresh STATUS message.
//!
//! # File Layout
//!
//! ```text
//! ROOT/WALFile.<unix nanos>.walfile
//! [STATUS][message]*
//! ```
//!
//! Files left behind by a crashed instance are replayed at startup by the
//! [`cleaner`].

pub mod cleaner;
pub mod flusher;
pub mod message;
pub mod primary;
pub mod replay;
pub mod tg;

pub use cleaner::WalCleaner;
pub use flusher::Flusher;
pub use message::{
    Destination, FileStatus, MessageId, ReplayState, StatusMessage, TxnInfo, TxnStatus,
};
pub use primary::PrimaryWriter;
pub use tg::TransactionGroup;

use crate::catalog::Catalog;
use crate::config::{StorageConfig, SyncMode};
use crate::error::{Result, StoreError};
use crate::scan::ReadHints;
use crate::trigger::{Dispatcher, Record};
use crate::txn::{TransactionPipe, WriteCommand};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// File name prefix of WAL files.
pub const WAL_FILE_PREFIX: &str = "WALFile";

/// File name extension of WAL files.
pub const WAL_FILE_EXTENSION: &str = "walfile";

/// Receives every committed TG, e.g. to ship it to replicas.
pub trait ReplicationSender: Send + Sync {
    /// Called with the serialized TG after it became durable.
    fn send(&self, tg_bytes: &[u8]);
}

/// State shared between the WAL, writers and readers of one context.
#[derive(Clone)]
pub struct WalShared {
    /// Bucket catalog.
    pub catalog: Arc<Catalog>,
    /// Queue of pending write commands.
    pub pipe: Arc<TransactionPipe>,
    /// Read hints raised by primary writes.
    pub hints: Arc<ReadHints>,
    /// Post-write trigger dispatcher.
    pub triggers: Arc<Dispatcher>,
    /// Optional replication hook.
    pub replication: Option<Arc<dyn ReplicationSender>>,
}

impl std::fmt::Debug for WalShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalShared")
            .field("root", &self.catalog.root())
            .field("queued", &self.pipe.len())
            .field("replication", &self.replication.is_some())
            .finish()
    }
}

impl WalShared {
    /// Bundles the shared state, without replication.
    pub fn new(
        catalog: Arc<Catalog>,
        pipe: Arc<TransactionPipe>,
        hints: Arc<ReadHints>,
        triggers: Arc<Dispatcher>,
    ) -> Self {
        Self {
            catalog,
            pipe,
            hints,
            triggers,
            replication: None,
        }
    }

    /// Sets the replication hook.
    pub fn with_replication(mut self, sender: Arc<dyn ReplicationSender>) -> Self {
        self.replication = Some(sender);
        self
    }
}

/// Lists the WAL files directly below `root`, sorted by name.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn list_wal_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == WAL_FILE_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// One WAL file and the commit protocol running on it.
#[derive(Debug)]
pub struct WalFile {
    path: PathBuf,
    file: File,
    status: StatusMessage,
    instance_id: i64,
    bypass: bool,
    sync_mode: SyncMode,
    rotate_interval: u32,
    primary_cycles: u32,
    last_committed: i64,
    primary: PrimaryWriter,
    shared: WalShared,
}

impl WalFile {
    /// Creates a new WAL file in the root directory, owned by `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or its STATUS written.
    pub fn create(config: &StorageConfig, instance_id: i64, shared: WalShared) -> Result<Self> {
        let root = shared.catalog.root().to_path_buf();
        let mut stamp = Utc::now().timestamp_nanos_opt().unwrap_or(instance_id);
        let (path, file) = loop {
            let path = root.join(format!("{WAL_FILE_PREFIX}.{stamp}.{WAL_FILE_EXTENSION}"));
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => stamp += 1,
                Err(e) => return Err(e.into()),
            }
        };

        let mut wal = Self::from_parts(path, file, config, instance_id, config.wal_bypass, shared);
        wal.write_status(FileStatus::Open, ReplayState::NotReplayed)?;
        info!(path = ?wal.path, instance_id, "created WAL file");
        Ok(wal)
    }

    /// Takes ownership of an existing WAL file, typically one left behind by
    /// a crashed instance. File and replay states are kept.
    ///
    /// # Errors
    ///
    /// Returns `WalState` if the file is already owned by `instance_id`, or
    /// an error if its STATUS cannot be read or rewritten.
    pub fn take_over(
        path: impl Into<PathBuf>,
        config: &StorageConfig,
        instance_id: i64,
        shared: WalShared,
    ) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::Start(0))?;
        let status = StatusMessage::read_from(&mut file)?;
        if status.owner == instance_id {
            return Err(StoreError::WalState(format!(
                "{} is already owned by instance {instance_id}",
                path.display()
            )));
        }

        let mut wal = Self::from_parts(path, file, config, instance_id, false, shared);
        wal.write_status(status.file_status, status.replay_state)?;
        debug!(path = ?wal.path, previous_owner = status.owner, instance_id, "took over WAL file");
        Ok(wal)
    }

    fn from_parts(
        path: PathBuf,
        file: File,
        config: &StorageConfig,
        instance_id: i64,
        bypass: bool,
        shared: WalShared,
    ) -> Self {
        let primary = PrimaryWriter::new(
            shared.catalog.root(),
            Arc::clone(&shared.hints),
            !config.disable_variable_compression,
            config.sync_mode,
        );
        Self {
            path,
            file,
            status: StatusMessage {
                file_status: FileStatus::Open,
                replay_state: ReplayState::NotReplayed,
                owner: instance_id,
            },
            instance_id,
            bypass,
            sync_mode: config.sync_mode,
            rotate_interval: config.wal_rotate_interval,
            primary_cycles: 0,
            last_committed: 0,
            primary,
            shared,
        }
    }

    /// Path of the WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current STATUS.
    pub fn status(&self) -> StatusMessage {
        self.status
    }

    /// Instance ID this handle writes as.
    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    /// TGID of the last group committed since the previous checkpoint, or
    /// zero if nothing is pending.
    pub fn last_committed(&self) -> i64 {
        self.last_committed
    }

    /// Returns true if the WAL is skipped.
    pub fn is_bypass(&self) -> bool {
        self.bypass
    }

    /// Shared state this WAL writes through.
    pub fn shared(&self) -> &WalShared {
        &self.shared
    }

    /// Rewrites the STATUS message at offset 0 and syncs it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails.
    pub fn write_status(&mut self, file_status: FileStatus, replay_state: ReplayState) -> Result<()> {
        let status = StatusMessage {
            file_status,
            replay_state,
            owner: self.instance_id,
        };
        self.file.seek(SeekFrom::Start(0))?;
        status.write_to(&mut self.file)?;
        self.sync_mode.sync(&self.file)?;
        self.file.seek(SeekFrom::End(0))?;
        self.status = status;
        Ok(())
    }

    /// Re-reads the STATUS message from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the STATUS cannot be decoded.
    pub fn read_status(&mut self) -> Result<StatusMessage> {
        self.file.seek(SeekFrom::Start(0))?;
        let status = StatusMessage::read_from(&mut self.file)?;
        self.file.seek(SeekFrom::End(0))?;
        self.status = status;
        Ok(status)
    }

    fn write_txn_info(&mut self, tgid: i64, destination: Destination, status: TxnStatus) -> Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        TxnInfo {
            tgid,
            destination,
            status,
        }
        .write_to(&mut self.file)
    }

    /// Returns true if the file is OPEN.
    pub fn is_open(&self) -> bool {
        self.status.file_status == FileStatus::Open
    }

    /// Returns true if `caller` is actively writing this file.
    pub fn is_active(&self, caller: i64) -> bool {
        self.is_open()
            && self.status.owner == caller
            && self.status.replay_state == ReplayState::NotReplayed
    }

    /// Returns true if the content may be missing from the primary files.
    pub fn needs_replay(&self) -> bool {
        matches!(
            self.status.replay_state,
            ReplayState::NotReplayed | ReplayState::ReplayInProcess
        )
    }

    /// Returns true if this handle may append transaction groups.
    pub fn can_write(&self) -> bool {
        self.is_active(self.instance_id)
    }

    /// Flushes everything queued in the transaction pipe as one TG.
    ///
    /// Once the queued commands are drained they exist nowhere else, so a
    /// failure from that point on (announcing, writing or syncing the TG, or
    /// syncing primary files in bypass mode) leaves their durability unknown.
    /// Such a failure is logged and the process is aborted, whether the flush
    /// runs on the flusher thread or inline.
    ///
    /// # Errors
    ///
    /// Returns `WalState` if this handle does not own the file. Nothing is
    /// drained in that case. Primary-write failures are only logged since the
    /// TG can be replayed.
    pub fn flush_to_wal(&mut self) -> Result<()> {
        let pipe = Arc::clone(&self.shared.pipe);
        let count = pipe.len();
        if count == 0 {
            pipe.new_tgid();
            return Ok(());
        }
        if !self.bypass && !self.can_write() {
            return Err(StoreError::WalState(format!(
                "instance {} cannot write to {}",
                self.instance_id,
                self.path.display()
            )));
        }

        let tgid = pipe.tgid();
        let commands = pipe.drain(count);
        if let Err(e) = self.commit(tgid, &commands) {
            error!(tgid, error = %e, "failed to commit transaction group, durability state unknown");
            std::process::abort();
        }
        debug!(tgid, commands = commands.len(), "flushed transaction group");
        pipe.new_tgid();
        Ok(())
    }

    fn commit(&mut self, tgid: i64, commands: &[WriteCommand]) -> Result<()> {
        if !self.bypass {
            self.write_txn_info(tgid, Destination::Wal, TxnStatus::Preparing)?;
            let tg_bytes = TransactionGroup::serialize(tgid, commands);
            self.commit_tg(tgid, &tg_bytes)?;
            if let Some(sender) = &self.shared.replication {
                sender.send(&tg_bytes);
            }
        }

        self.apply(commands);

        if self.bypass {
            self.last_committed = tgid;
            self.primary.sync()?;
        }
        Ok(())
    }

    fn commit_tg(&mut self, tgid: i64, tg_bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        tg::write_frame(&mut self.file, tg_bytes)?;
        self.sync_mode.sync(&self.file)?;
        self.write_txn_info(tgid, Destination::Wal, TxnStatus::CommitComplete)?;
        self.last_committed = tgid;
        Ok(())
    }

    fn apply(&mut self, commands: &[WriteCommand]) {
        let triggers = Arc::clone(&self.shared.triggers);
        for (key_path, cmds) in group_by_file(commands) {
            if let Err(e) = self.primary.write_file(key_path, &cmds) {
                error!(key_path, error = %e, "failed to write primary file");
                continue;
            }
            if triggers.is_enabled() {
                for cmd in &cmds {
                    triggers.append_record(key_path, Record::new(cmd.index, cmd.data.clone()));
                }
            }
        }
        triggers.dispatch_records();
    }

    /// Records that every committed TG reached the primary files.
    ///
    /// # Errors
    ///
    /// Returns an error if a primary file or the WAL cannot be synced.
    pub fn create_checkpoint(&mut self) -> Result<()> {
        if self.last_committed == 0 {
            return Ok(());
        }
        let tgid = self.last_committed;
        if !self.bypass {
            self.write_txn_info(tgid, Destination::Checkpoint, TxnStatus::Preparing)?;
        }
        self.primary.sync()?;
        if !self.bypass {
            self.write_txn_info(tgid, Destination::Checkpoint, TxnStatus::CommitComplete)?;
            self.sync_mode.sync(&self.file)?;
        }
        self.last_committed = 0;
        debug!(tgid, "created checkpoint");
        Ok(())
    }

    /// Truncates the file and starts over with a fresh STATUS.
    ///
    /// Only valid right after a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation or the STATUS write fails.
    pub fn rotate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.write_status(FileStatus::Open, ReplayState::NotReplayed)?;
        debug!(path = ?self.path, "rotated WAL file");
        Ok(())
    }

    /// Runs on every primary flush interval: checkpoints, and rotates every
    /// `wal_rotate_interval` cycles.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint or rotation fails.
    pub fn primary_cycle(&mut self) -> Result<()> {
        self.create_checkpoint()?;
        self.primary_cycles += 1;
        if self.rotate_interval > 0 && self.primary_cycles >= self.rotate_interval {
            self.rotate()?;
            self.primary_cycles = 0;
        }
        Ok(())
    }

    /// Closes and removes a WAL file that no longer needs replay.
    ///
    /// # Errors
    ///
    /// Returns `WalState` if the file is closed, actively used by `caller`
    /// or still needs replay.
    pub fn delete(mut self, caller: i64) -> Result<()> {
        self.read_status()?;
        if !self.is_open() {
            return Err(StoreError::WalState(format!("{} is not open", self.path.display())));
        }
        if self.is_active(caller) {
            return Err(StoreError::WalState(format!("{} is active", self.path.display())));
        }
        if self.needs_replay() {
            return Err(StoreError::WalState(format!(
                "{} needs replay",
                self.path.display()
            )));
        }
        self.write_status(FileStatus::Closed, ReplayState::Replayed)?;
        let Self { path, file, .. } = self;
        drop(file);
        fs::remove_file(&path)?;
        info!(path = ?path, "deleted WAL file");
        Ok(())
    }
}

/// Groups commands per target file, keeping their order within each file.
pub(crate) fn group_by_file(commands: &[WriteCommand]) -> BTreeMap<&str, Vec<&WriteCommand>> {
    let mut by_file: BTreeMap<&str, Vec<&WriteCommand>> = BTreeMap::new();
    for cmd in commands {
        by_file.entry(cmd.wal_key_path.as_str()).or_default().push(cmd);
    }
    by_file
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::{BucketInfo, DataShape, ElementType, RecordType, Timeframe, HEADER_SIZE};
    use crate::key::BucketKey;
    use parking_lot::Mutex;
    use std::io::Read;
    use tempfile::TempDir;

    pub(crate) fn create_test_shared(temp_dir: &TempDir) -> WalShared {
        let catalog = Arc::new(Catalog::open(temp_dir.path()).unwrap());
        WalShared::new(
            catalog,
            Arc::new(TransactionPipe::new(1024)),
            Arc::new(ReadHints::new()),
            Arc::new(Dispatcher::new(Vec::new())),
        )
    }

    pub(crate) fn create_test_config(temp_dir: &TempDir) -> StorageConfig {
        StorageConfig::new(temp_dir.path())
            .with_sync_mode(SyncMode::None)
            .with_background_flusher(false)
    }

    fn create_test_wal() -> (TempDir, WalFile) {
        let temp_dir = TempDir::new().unwrap();
        let shared = create_test_shared(&temp_dir);
        let wal = WalFile::create(&create_test_config(&temp_dir), 1, shared).unwrap();
        (temp_dir, wal)
    }

    pub(crate) fn create_test_bucket(shared: &WalShared) -> Arc<BucketInfo> {
        let key = BucketKey::new("AAPL", "1Min", "OHLCV").unwrap();
        let info = BucketInfo::new(
            PathBuf::new(),
            "test",
            2020,
            Timeframe::parse("1Min").unwrap(),
            vec![
                DataShape::new("Open", ElementType::Float32),
                DataShape::new("Close", ElementType::Float32),
            ],
            RecordType::Fixed,
        );
        shared.catalog.add_time_bucket(&key, info).unwrap()
    }

    pub(crate) fn fixed_command(info: &BucketInfo, index: i64, fill: u8) -> WriteCommand {
        WriteCommand {
            record_type: RecordType::Fixed,
            wal_key_path: "AAPL/1Min/OHLCV/2020.bin".into(),
            var_rec_len: 0,
            offset: HEADER_SIZE + (index - 1) * i64::from(info.record_length()),
            index,
            data: vec![fill; 8],
            shapes: info.shapes().to_vec(),
        }
    }

    #[test]
    fn test_create_writes_status() {
        let (_temp_dir, wal) = create_test_wal();
        let name = wal.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("WALFile.") && name.ends_with(".walfile"));

        let mut buf = Vec::new();
        File::open(wal.path()).unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, message::STATUS_MESSAGE_LEN);
        let status = StatusMessage::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(status.file_status, FileStatus::Open);
        assert_eq!(status.replay_state, ReplayState::NotReplayed);
        assert_eq!(status.owner, 1);
        assert!(wal.can_write());
        assert!(wal.needs_replay());
    }

    #[test]
    fn test_flush_writes_tg_and_primary() {
        let (temp_dir, mut wal) = create_test_wal();
        let info = create_test_bucket(wal.shared());
        let pipe = Arc::clone(&wal.shared().pipe);
        pipe.enqueue(fixed_command(&info, 1, 0xAB));
        pipe.enqueue(fixed_command(&info, 2, 0xCD));
        let tgid = pipe.tgid();

        wal.flush_to_wal().unwrap();
        assert!(pipe.is_empty());
        assert_eq!(wal.last_committed(), tgid);
        assert!(pipe.tgid() > tgid);

        let primary = std::fs::read(temp_dir.path().join("AAPL/1Min/OHLCV/2020.bin")).unwrap();
        let at = HEADER_SIZE as usize;
        assert_eq!(&primary[at..at + 8], &1i64.to_le_bytes());
        assert_eq!(&primary[at + 8..at + 16], &[0xAB; 8]);

        let log = std::fs::read(wal.path()).unwrap();
        let mut pos = message::STATUS_MESSAGE_LEN as usize;
        assert_eq!(log[pos], MessageId::TxnInfo as u8);
        let prepare = TxnInfo::read_payload(&mut &log[pos + 1..]).unwrap();
        assert_eq!(prepare.status, TxnStatus::Preparing);
        assert_eq!(prepare.tgid, tgid);
        pos += 1 + TxnInfo::PAYLOAD_LEN;
        assert_eq!(log[pos], MessageId::TgData as u8);
        let len = i64::from_le_bytes(log[pos + 1..pos + 9].try_into().unwrap()) as usize;
        let tg = TransactionGroup::parse(&log[pos + 9..pos + 9 + len]).unwrap();
        assert_eq!(tg.tgid, tgid);
        assert_eq!(tg.commands.len(), 2);
        pos += 9 + len + 16;
        let complete = TxnInfo::read_payload(&mut &log[pos + 1..]).unwrap();
        assert_eq!(complete.status, TxnStatus::CommitComplete);
        assert_eq!(pos + 1 + TxnInfo::PAYLOAD_LEN, log.len());
    }

    #[test]
    fn test_refused_flush_keeps_commands_queued() {
        let (_temp_dir, mut wal) = create_test_wal();
        let info = create_test_bucket(wal.shared());
        let pipe = Arc::clone(&wal.shared().pipe);
        wal.write_status(FileStatus::Open, ReplayState::Replayed).unwrap();
        pipe.enqueue(fixed_command(&info, 1, 0xAB));

        assert!(matches!(wal.flush_to_wal(), Err(StoreError::WalState(_))));
        assert_eq!(pipe.len(), 1);
        assert_eq!(wal.last_committed(), 0);
        let len = std::fs::metadata(wal.path()).unwrap().len();
        assert_eq!(len, message::STATUS_MESSAGE_LEN);
    }

    #[test]
    fn test_empty_flush_advances_tgid() {
        let (_temp_dir, mut wal) = create_test_wal();
        let before = wal.shared().pipe.tgid();
        wal.flush_to_wal().unwrap();
        assert!(wal.shared().pipe.tgid() > before);
        assert_eq!(wal.last_committed(), 0);
        let len = std::fs::metadata(wal.path()).unwrap().len();
        assert_eq!(len, message::STATUS_MESSAGE_LEN);
    }

    #[test]
    fn test_checkpoint_and_rotate() {
        let temp_dir = TempDir::new().unwrap();
        let shared = create_test_shared(&temp_dir);
        let config = create_test_config(&temp_dir).with_wal_rotate_interval(2);
        let mut wal = WalFile::create(&config, 1, shared).unwrap();
        let info = create_test_bucket(wal.shared());

        // Nothing committed yet.
        wal.create_checkpoint().unwrap();
        assert_eq!(std::fs::metadata(wal.path()).unwrap().len(), message::STATUS_MESSAGE_LEN);

        wal.shared().pipe.enqueue(fixed_command(&info, 1, 1));
        wal.flush_to_wal().unwrap();
        let tgid = wal.last_committed();
        let before = std::fs::metadata(wal.path()).unwrap().len();
        wal.primary_cycle().unwrap();
        assert_eq!(wal.last_committed(), 0);

        let log = std::fs::read(wal.path()).unwrap();
        assert_eq!(log.len() as u64, before + 2 * (1 + TxnInfo::PAYLOAD_LEN as u64));
        let tail = &log[before as usize..];
        let prepare = TxnInfo::read_payload(&mut &tail[1..]).unwrap();
        assert_eq!(prepare.destination, Destination::Checkpoint);
        assert_eq!(prepare.tgid, tgid);
        let complete = TxnInfo::read_payload(&mut &tail[12..]).unwrap();
        assert_eq!(complete.status, TxnStatus::CommitComplete);

        // Second cycle rotates.
        wal.primary_cycle().unwrap();
        assert_eq!(std::fs::metadata(wal.path()).unwrap().len(), message::STATUS_MESSAGE_LEN);
        assert!(wal.can_write());
    }

    #[test]
    fn test_bypass_skips_log() {
        let temp_dir = TempDir::new().unwrap();
        let shared = create_test_shared(&temp_dir);
        let config = create_test_config(&temp_dir).with_wal_bypass(true);
        let mut wal = WalFile::create(&config, 1, shared).unwrap();
        let info = create_test_bucket(wal.shared());

        wal.shared().pipe.enqueue(fixed_command(&info, 3, 9));
        wal.flush_to_wal().unwrap();
        wal.create_checkpoint().unwrap();
        assert_eq!(std::fs::metadata(wal.path()).unwrap().len(), message::STATUS_MESSAGE_LEN);

        let primary = std::fs::read(&info.path).unwrap();
        let at = (HEADER_SIZE + 2 * i64::from(info.record_length())) as usize;
        assert_eq!(&primary[at..at + 8], &3i64.to_le_bytes());
    }

    #[test]
    fn test_replication_receives_committed_tg() {
        #[derive(Default)]
        struct Capture(Mutex<Vec<Vec<u8>>>);
        impl ReplicationSender for Capture {
            fn send(&self, tg_bytes: &[u8]) {
                self.0.lock().push(tg_bytes.to_vec());
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let capture = Arc::new(Capture::default());
        let shared = create_test_shared(&temp_dir).with_replication(capture.clone());
        let mut wal = WalFile::create(&create_test_config(&temp_dir), 1, shared).unwrap();
        let info = create_test_bucket(wal.shared());
        wal.shared().pipe.enqueue(fixed_command(&info, 1, 1));
        let tgid = wal.shared().pipe.tgid();
        wal.flush_to_wal().unwrap();

        let sent = capture.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(TransactionGroup::parse(&sent[0]).unwrap().tgid, tgid);
    }

    #[test]
    fn test_take_over_and_delete() {
        let (temp_dir, wal) = create_test_wal();
        let path = wal.path().to_path_buf();
        drop(wal);

        let shared = create_test_shared(&temp_dir);
        let config = create_test_config(&temp_dir);
        assert!(matches!(
            WalFile::take_over(&path, &config, 1, shared.clone()),
            Err(StoreError::WalState(_))
        ));

        let wal = WalFile::take_over(&path, &config, 2, shared.clone()).unwrap();
        assert_eq!(wal.status().owner, 2);
        assert!(wal.needs_replay());
        assert!(matches!(wal.delete(3), Err(StoreError::WalState(_))));

        let mut wal = WalFile::take_over(&path, &config, 4, shared).unwrap();
        assert!(!wal.is_active(2));
        wal.write_status(FileStatus::Open, ReplayState::Replayed).unwrap();
        wal.delete(4).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_list_wal_files() {
        let (temp_dir, wal) = create_test_wal();
        std::fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(temp_dir.path().join("WALFile.1.walfile.tmp"), b"x").unwrap();
        let files = list_wal_files(temp_dir.path()).unwrap();
        assert_eq!(files, vec![wal.path().to_path_buf()]);
    }
}
