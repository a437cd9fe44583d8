//! Application of committed write commands to primary year files.
//!
//! FIXED commands overwrite their slot with `[index][payload]`. VARIABLE
//! commands maintain an indirect pointer slot `{index, offset, len}` and a
//! row group appended at the end of the file:
//!
//! ```text
//! slot ──> [ rows sorted by ticks, snappy compressed ] (at EOF)
//! ```
//!
//! A new VARIABLE write reads the existing group, prepends it to the new rows,
//! sorts by the trailing interval ticks and writes the result back. When the
//! existing group is the last thing in the file it is rewritten in place,
//! otherwise the result is appended and the slot re-pointed.

use crate::config::SyncMode;
use crate::error::{Result, StoreError};
use crate::format::{RecordType, INDIRECT_RECORD_LEN, TICKS_LEN};
use crate::scan::ReadHints;
use crate::txn::WriteCommand;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Applies write commands to primary files, caching open handles until the
/// next [`PrimaryWriter::sync`].
#[derive(Debug)]
pub struct PrimaryWriter {
    root: PathBuf,
    hints: Arc<ReadHints>,
    compress: bool,
    sync_mode: SyncMode,
    handles: HashMap<PathBuf, File>,
}

impl PrimaryWriter {
    /// Creates a writer for files below `root`.
    pub fn new(root: impl Into<PathBuf>, hints: Arc<ReadHints>, compress: bool, sync_mode: SyncMode) -> Self {
        Self {
            root: root.into(),
            hints,
            compress,
            sync_mode,
            handles: HashMap::new(),
        }
    }

    /// Absolute path of a WAL key path.
    pub fn full_path(&self, wal_key_path: &str) -> PathBuf {
        self.root.join(wal_key_path)
    }

    /// Number of files written since the last sync.
    pub fn dirty_files(&self) -> usize {
        self.handles.len()
    }

    fn handle(&mut self, path: &Path) -> Result<&mut File> {
        match self.handles.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                Ok(entry.insert(file))
            }
        }
    }

    /// Applies all commands addressed to one file, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, read or written, or a
    /// VARIABLE row group cannot be decoded.
    pub fn write_file(&mut self, wal_key_path: &str, commands: &[&WriteCommand]) -> Result<()> {
        let path = self.full_path(wal_key_path);
        let compress = self.compress;
        let mut max_offset = None;
        {
            let file = self.handle(&path)?;
            for cmd in commands {
                match cmd.record_type {
                    RecordType::Fixed => write_fixed(file, cmd)?,
                    RecordType::Variable => write_variable(file, cmd, compress)?,
                }
                max_offset = max_offset.max(Some(cmd.offset));
            }
        }
        if let Some(offset) = max_offset {
            self.hints.raise_if_present(&path, offset);
        }
        debug!(path = ?path, commands = commands.len(), "applied primary writes");
        Ok(())
    }

    /// Syncs every file written since the last call and drops the handles.
    ///
    /// # Errors
    ///
    /// Returns the first sync error; remaining files are still synced.
    pub fn sync(&mut self) -> Result<()> {
        let mut first_err = None;
        for (path, file) in self.handles.drain() {
            if let Err(e) = self.sync_mode.sync(&file) {
                error!(path = ?path, error = %e, "failed to sync primary file");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn write_fixed(file: &mut File, cmd: &WriteCommand) -> Result<()> {
    let mut buf = Vec::with_capacity(8 + cmd.data.len());
    buf.extend_from_slice(&cmd.index.to_le_bytes());
    buf.extend_from_slice(&cmd.data);
    file.seek(SeekFrom::Start(cmd.offset as u64))?;
    file.write_all(&buf)?;
    Ok(())
}

/// Indirect slot of a VARIABLE bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct IndirectRecord {
    pub index: i64,
    pub offset: i64,
    pub len: i64,
}

impl IndirectRecord {
    pub(crate) fn from_bytes(buf: &[u8]) -> Self {
        let word = |i: usize| i64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
        Self {
            index: word(0),
            offset: word(1),
            len: word(2),
        }
    }

    fn to_bytes(self) -> [u8; INDIRECT_RECORD_LEN] {
        let mut buf = [0u8; INDIRECT_RECORD_LEN];
        buf[0..8].copy_from_slice(&self.index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.len.to_le_bytes());
        buf
    }
}

pub(crate) fn decompress(data: &[u8], compressed: bool) -> Result<Vec<u8>> {
    if !compressed {
        return Ok(data.to_vec());
    }
    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| StoreError::DecompressionError(e.to_string()))
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|e| StoreError::CompressionError(e.to_string()))
}

/// Stable sort of packed rows by their trailing `u32` interval ticks.
pub(crate) fn sort_by_ticks(data: &[u8], row_len: usize) -> Vec<u8> {
    if row_len < TICKS_LEN {
        return data.to_vec();
    }
    let mut rows: Vec<&[u8]> = data.chunks_exact(row_len).collect();
    rows.sort_by_key(|row| u32::from_le_bytes(row[row_len - TICKS_LEN..].try_into().unwrap()));
    rows.concat()
}

fn write_variable(file: &mut File, cmd: &WriteCommand, compressed: bool) -> Result<()> {
    let row_len = usize::try_from(cmd.var_rec_len)
        .ok()
        .filter(|len| *len >= TICKS_LEN)
        .ok_or_else(|| {
            StoreError::InvalidFormat(format!("variable record length {}", cmd.var_rec_len))
        })?;

    let mut slot = [0u8; INDIRECT_RECORD_LEN];
    file.seek(SeekFrom::Start(cmd.offset as u64))?;
    file.read_exact(&mut slot)?;
    let current = IndirectRecord::from_bytes(&slot);

    let mut rows = Vec::new();
    if current.index != 0 {
        let len = usize::try_from(current.len).map_err(|_| {
            StoreError::InvalidFormat(format!("negative row group length {}", current.len))
        })?;
        let mut old = vec![0u8; len];
        file.seek(SeekFrom::Start(current.offset as u64))?;
        file.read_exact(&mut old)?;
        rows = decompress(&old, compressed)?;
    }
    rows.extend_from_slice(&cmd.data);
    let rows = sort_by_ticks(&rows, row_len);
    let payload = if compressed { compress(&rows)? } else { rows };

    let end_of_file = file.seek(SeekFrom::End(0))? as i64;
    let write_at = if current.index != 0 && current.offset + current.len == end_of_file {
        current.offset
    } else {
        end_of_file
    };
    file.seek(SeekFrom::Start(write_at as u64))?;
    file.write_all(&payload)?;
    let new_end = write_at + payload.len() as i64;
    if new_end < end_of_file {
        file.set_len(new_end as u64)?;
    }

    let updated = IndirectRecord {
        index: cmd.index,
        offset: write_at,
        len: payload.len() as i64,
    };
    file.seek(SeekFrom::Start(cmd.offset as u64))?;
    file.write_all(&updated.to_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{BucketInfo, DataShape, ElementType, Timeframe, HEADER_SIZE};
    use tempfile::TempDir;

    fn create_test_file(temp_dir: &TempDir, record_type: RecordType) -> BucketInfo {
        let dir = temp_dir.path().join("AAPL/1D/TICK");
        std::fs::create_dir_all(&dir).unwrap();
        let info = BucketInfo::new(
            dir.join("2020.bin"),
            "test",
            2020,
            Timeframe::parse("1D").unwrap(),
            vec![DataShape::new("Price", ElementType::Float32)],
            record_type,
        );
        info.create_file().unwrap();
        info
    }

    fn variable_rows(rows: &[(f32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (price, ticks) in rows {
            out.extend_from_slice(&price.to_le_bytes());
            out.extend_from_slice(&ticks.to_le_bytes());
        }
        out
    }

    fn command(record_type: RecordType, index: i64, record_len: i32, data: Vec<u8>) -> WriteCommand {
        WriteCommand {
            record_type,
            wal_key_path: "AAPL/1D/TICK/2020.bin".into(),
            var_rec_len: if record_type.is_variable() { 8 } else { 0 },
            offset: HEADER_SIZE + (index - 1) * i64::from(record_len),
            index,
            data,
            shapes: Vec::new(),
        }
    }

    #[test]
    fn test_fixed_write() {
        let temp_dir = TempDir::new().unwrap();
        let info = create_test_file(&temp_dir, RecordType::Fixed);
        let hints = Arc::new(ReadHints::new());
        let mut writer = PrimaryWriter::new(temp_dir.path(), Arc::clone(&hints), true, SyncMode::None);

        let cmd = command(RecordType::Fixed, 3, info.record_length(), vec![7; 8]);
        writer.write_file("AAPL/1D/TICK/2020.bin", &[&cmd]).unwrap();
        assert_eq!(writer.dirty_files(), 1);
        writer.sync().unwrap();
        assert_eq!(writer.dirty_files(), 0);

        let bytes = std::fs::read(&info.path).unwrap();
        let at = cmd.offset as usize;
        assert_eq!(&bytes[at..at + 8], &3i64.to_le_bytes());
        assert_eq!(&bytes[at + 8..at + 16], &[7; 8]);
        assert_eq!(hints.get(&info.path), None);

        hints.raise(&info.path, HEADER_SIZE);
        let later = command(RecordType::Fixed, 9, info.record_length(), vec![1; 8]);
        writer.write_file("AAPL/1D/TICK/2020.bin", &[&later]).unwrap();
        assert_eq!(hints.get(&info.path), Some(later.offset));
    }

    #[test]
    fn test_variable_append_merges_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let info = create_test_file(&temp_dir, RecordType::Variable);
        let hints = Arc::new(ReadHints::new());
        for compressed in [true, false] {
            let path = info.path.clone();
            std::fs::remove_file(&path).unwrap();
            info.create_file().unwrap();
            let mut writer =
                PrimaryWriter::new(temp_dir.path(), Arc::clone(&hints), compressed, SyncMode::None);

            let first = command(RecordType::Variable, 2, 24, variable_rows(&[(2.0, 200), (3.0, 300)]));
            writer.write_file("AAPL/1D/TICK/2020.bin", &[&first]).unwrap();
            let second = command(RecordType::Variable, 2, 24, variable_rows(&[(1.0, 100)]));
            writer.write_file("AAPL/1D/TICK/2020.bin", &[&second]).unwrap();
            writer.sync().unwrap();

            let bytes = std::fs::read(&path).unwrap();
            let at = first.offset as usize;
            let slot = IndirectRecord::from_bytes(&bytes[at..at + 24]);
            assert_eq!(slot.index, 2);
            // The only group sits at the end of the file and was rewritten in place.
            assert_eq!((slot.offset + slot.len) as usize, bytes.len());

            let extent = &bytes[slot.offset as usize..(slot.offset + slot.len) as usize];
            let rows = decompress(extent, compressed).unwrap();
            assert_eq!(rows, variable_rows(&[(1.0, 100), (2.0, 200), (3.0, 300)]));
        }
    }

    #[test]
    fn test_variable_relocates_when_not_last() {
        let temp_dir = TempDir::new().unwrap();
        let info = create_test_file(&temp_dir, RecordType::Variable);
        let mut writer =
            PrimaryWriter::new(temp_dir.path(), Arc::new(ReadHints::new()), false, SyncMode::None);

        let a = command(RecordType::Variable, 1, 24, variable_rows(&[(1.0, 10)]));
        let b = command(RecordType::Variable, 5, 24, variable_rows(&[(5.0, 50)]));
        let a2 = command(RecordType::Variable, 1, 24, variable_rows(&[(1.5, 5)]));
        writer
            .write_file("AAPL/1D/TICK/2020.bin", &[&a, &b, &a2])
            .unwrap();

        let bytes = std::fs::read(&info.path).unwrap();
        let slot_a = IndirectRecord::from_bytes(&bytes[a.offset as usize..a.offset as usize + 24]);
        let slot_b = IndirectRecord::from_bytes(&bytes[b.offset as usize..b.offset as usize + 24]);
        assert!(slot_a.offset > slot_b.offset);
        let rows_a = &bytes[slot_a.offset as usize..(slot_a.offset + slot_a.len) as usize];
        assert_eq!(rows_a, variable_rows(&[(1.5, 5), (1.0, 10)]).as_slice());
        let rows_b = &bytes[slot_b.offset as usize..(slot_b.offset + slot_b.len) as usize];
        assert_eq!(rows_b, variable_rows(&[(5.0, 50)]).as_slice());
    }

    #[test]
    fn test_sort_by_ticks_is_stable() {
        let data = variable_rows(&[(1.0, 5), (2.0, 1), (3.0, 5), (4.0, 1)]);
        let sorted = sort_by_ticks(&data, 8);
        assert_eq!(sorted, variable_rows(&[(2.0, 1), (4.0, 1), (1.0, 5), (3.0, 5)]));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer =
            PrimaryWriter::new(temp_dir.path(), Arc::new(ReadHints::new()), true, SyncMode::None);
        let cmd = command(RecordType::Fixed, 1, 16, vec![0; 8]);
        assert!(writer.write_file("AAPL/1D/TICK/2020.bin", &[&cmd]).is_err());
    }
}
