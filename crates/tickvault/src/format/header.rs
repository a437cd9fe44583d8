//! Year-file header encoding and per-file bucket metadata.

use super::timeindex::file_size;
use super::{
    aligned_size, shapes_byte_len, DataShape, ElementType, RecordType, Timeframe, ELEMENT_NAME_LEN,
    EPOCH_LEN, FILE_INFO_VERSION, HEADER_SIZE, INDIRECT_RECORD_LEN, MAX_ELEMENTS, TICKS_LEN,
};
use crate::error::{Result, StoreError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Width of the description field.
const DESCRIPTION_LEN: usize = 256;

/// Reserved trailing words.
const RESERVED_WORDS: usize = 365;

/// Fixed-size header at the start of every year file.
///
/// Every field is encoded little-endian in declaration order; the layout is
/// padded to exactly [`HEADER_SIZE`] bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Format version.
    pub version: i64,
    /// Free-form description.
    pub description: String,
    /// Calendar year covered by the file.
    pub year: i64,
    /// Interval length in nanoseconds.
    pub timeframe_nanos: i64,
    /// Record type tag.
    pub record_type: i64,
    /// Number of columns (excluding Epoch).
    pub element_count: i64,
    /// Slot length in bytes.
    pub record_length: i64,
    /// Column names.
    pub element_names: Vec<String>,
    /// Column element type tags.
    pub element_types: Vec<u8>,
}

impl Header {
    /// Writes the header to a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        buf.extend_from_slice(&self.version.to_le_bytes());

        let mut description = [0u8; DESCRIPTION_LEN];
        let bytes = self.description.as_bytes();
        let len = bytes.len().min(DESCRIPTION_LEN);
        description[..len].copy_from_slice(&bytes[..len]);
        buf.extend_from_slice(&description);

        buf.extend_from_slice(&self.year.to_le_bytes());
        buf.extend_from_slice(&self.timeframe_nanos.to_le_bytes());
        buf.extend_from_slice(&self.record_type.to_le_bytes());
        buf.extend_from_slice(&self.element_count.to_le_bytes());
        buf.extend_from_slice(&self.record_length.to_le_bytes());
        buf.extend_from_slice(&0i64.to_le_bytes());

        for i in 0..MAX_ELEMENTS {
            let mut name = [0u8; ELEMENT_NAME_LEN];
            if let Some(n) = self.element_names.get(i) {
                let bytes = n.as_bytes();
                let len = bytes.len().min(ELEMENT_NAME_LEN);
                name[..len].copy_from_slice(&bytes[..len]);
            }
            buf.extend_from_slice(&name);
        }
        for i in 0..MAX_ELEMENTS {
            buf.push(self.element_types.get(i).copied().unwrap_or(0));
        }
        buf.resize(buf.len() + RESERVED_WORDS * 8, 0);
        debug_assert_eq!(buf.len(), HEADER_SIZE as usize);

        writer.write_all(&buf)?;
        Ok(())
    }

    /// Reads a header from a reader.
    ///
    /// # Errors
    ///
    /// Returns an error on a short read, an unsupported version, or an
    /// element count above the header capacity.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        reader.read_exact(&mut buf)?;

        let word = |pos: usize| i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        let version = word(0);
        if version != FILE_INFO_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }
        let description = trim_nul(&buf[8..8 + DESCRIPTION_LEN]);
        let mut pos = 8 + DESCRIPTION_LEN;
        let year = word(pos);
        let timeframe_nanos = word(pos + 8);
        let record_type = word(pos + 16);
        let element_count = word(pos + 24);
        let record_length = word(pos + 32);
        pos += 48;

        let count = usize::try_from(element_count)
            .ok()
            .filter(|n| *n <= MAX_ELEMENTS)
            .ok_or_else(|| {
                StoreError::InvalidFormat(format!("element count {element_count} out of range"))
            })?;
        let element_names = (0..count)
            .map(|i| {
                let start = pos + i * ELEMENT_NAME_LEN;
                trim_nul(&buf[start..start + ELEMENT_NAME_LEN])
            })
            .collect();
        pos += MAX_ELEMENTS * ELEMENT_NAME_LEN;
        let element_types = buf[pos..pos + count].to_vec();

        Ok(Self {
            version,
            description,
            year,
            timeframe_nanos,
            record_type,
            element_count,
            record_length,
            element_names,
            element_types,
        })
    }
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Metadata for one year file of one bucket.
///
/// Immutable once built; a new year produces a sibling via [`BucketInfo::for_year`].
#[derive(Debug, Clone, PartialEq)]
pub struct BucketInfo {
    /// Absolute path of the year file.
    pub path: PathBuf,
    /// Description from the header.
    pub description: String,
    /// Calendar year.
    pub year: i16,
    timeframe: Timeframe,
    record_type: RecordType,
    shapes: Vec<DataShape>,
    record_length: i32,
    variable_record_length: i32,
}

impl BucketInfo {
    /// Builds metadata for a new file. `shapes` excludes the Epoch column.
    pub fn new(
        path: impl Into<PathBuf>,
        description: impl Into<String>,
        year: i16,
        timeframe: Timeframe,
        shapes: Vec<DataShape>,
        record_type: RecordType,
    ) -> Self {
        let shapes: Vec<DataShape> = shapes
            .into_iter()
            .filter(|s| s.name != super::EPOCH_COLUMN)
            .collect();
        let field_len = shapes_byte_len(&shapes);
        let (record_length, variable_record_length) = match record_type {
            RecordType::Fixed => ((aligned_size(field_len) + EPOCH_LEN) as i32, 0),
            RecordType::Variable => (INDIRECT_RECORD_LEN as i32, (field_len + TICKS_LEN) as i32),
        };
        Self {
            path: path.into(),
            description: description.into(),
            year,
            timeframe,
            record_type,
            shapes,
            record_length,
            variable_record_length,
        }
    }

    /// Reads metadata from the header of an existing year file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its header is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let header = Header::read_from(&mut file)?;
        let invalid = |reason: String| StoreError::InvalidHeader {
            path: path.to_path_buf(),
            reason,
        };
        let timeframe =
            Timeframe::from_nanos(header.timeframe_nanos).map_err(|e| invalid(e.to_string()))?;
        let record_type =
            RecordType::from_tag(header.record_type).map_err(|e| invalid(e.to_string()))?;
        let shapes = header
            .element_names
            .iter()
            .zip(&header.element_types)
            .map(|(name, tag)| ElementType::from_tag(*tag).map(|ty| DataShape::new(name.clone(), ty)))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| invalid(e.to_string()))?;
        let year = i16::try_from(header.year).map_err(|_| invalid(format!("year {}", header.year)))?;

        let info = Self::new(
            path,
            header.description,
            year,
            timeframe,
            shapes,
            record_type,
        );
        if i64::from(info.record_length) != header.record_length {
            return Err(invalid(format!(
                "record length {} does not match shapes ({})",
                header.record_length, info.record_length
            )));
        }
        Ok(info)
    }

    /// Produces the metadata of the same bucket for another year, in a sibling file.
    pub fn for_year(&self, year: i16) -> Self {
        let dir = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self {
            path: dir.join(format!("{year}.bin")),
            year,
            ..self.clone()
        }
    }

    /// Builds the on-disk header for this file.
    pub fn header(&self) -> Header {
        Header {
            version: FILE_INFO_VERSION,
            description: self.description.clone(),
            year: i64::from(self.year),
            timeframe_nanos: self.timeframe.nanos(),
            record_type: self.record_type as i64,
            element_count: self.shapes.len() as i64,
            record_length: i64::from(self.record_length),
            element_names: self.shapes.iter().map(|s| s.name.clone()).collect(),
            element_types: self.shapes.iter().map(|s| s.ty as u8).collect(),
        }
    }

    /// Creates the year file: writes the header and extends the file to its
    /// full size so every slot reads as a hole.
    ///
    /// # Errors
    ///
    /// Returns `FileAlreadyExists` rather than overwriting, or an I/O error.
    pub fn create_file(&self) -> Result<()> {
        if self.path.exists() {
            return Err(StoreError::FileAlreadyExists(self.path.clone()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        self.header().write_to(&mut file)?;
        let size = file_size(
            self.timeframe.duration(),
            i32::from(self.year),
            self.record_length,
        );
        file.set_len(size as u64)?;
        debug!(path = ?self.path, size, "created year file");
        Ok(())
    }

    /// Bucket timeframe.
    pub fn timeframe(&self) -> &Timeframe {
        &self.timeframe
    }

    /// Intervals per day, derived from the timeframe.
    pub fn intervals_per_day(&self) -> i64 {
        self.timeframe.intervals_per_day()
    }

    /// Record layout.
    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    /// Column shapes, excluding Epoch.
    pub fn shapes(&self) -> &[DataShape] {
        &self.shapes
    }

    /// Slot length in bytes.
    pub fn record_length(&self) -> i32 {
        self.record_length
    }

    /// Length of one stored VARIABLE row including its tick trailer; zero for FIXED.
    pub fn variable_record_length(&self) -> i32 {
        self.variable_record_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ohlcv() -> Vec<DataShape> {
        vec![
            DataShape::new("Open", ElementType::Float32),
            DataShape::new("High", ElementType::Float32),
            DataShape::new("Low", ElementType::Float32),
            DataShape::new("Close", ElementType::Float32),
            DataShape::new("Volume", ElementType::Int32),
        ]
    }

    #[test]
    fn test_header_size_is_fixed() {
        let info = BucketInfo::new(
            "/tmp/x/2020.bin",
            "test",
            2020,
            Timeframe::parse("1Min").unwrap(),
            ohlcv(),
            RecordType::Fixed,
        );
        let mut buf = Vec::new();
        info.header().write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as i64, HEADER_SIZE);

        let decoded = Header::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, info.header());
    }

    #[test]
    fn test_record_lengths() {
        let tf = Timeframe::parse("1Min").unwrap();
        let fixed = BucketInfo::new("a", "", 2020, tf.clone(), ohlcv(), RecordType::Fixed);
        // 20 bytes of columns aligned to 24, plus the index word.
        assert_eq!(fixed.record_length(), 32);
        assert_eq!(fixed.variable_record_length(), 0);

        let variable = BucketInfo::new("a", "", 2020, tf, ohlcv(), RecordType::Variable);
        assert_eq!(variable.record_length(), 24);
        assert_eq!(variable.variable_record_length(), 24);
    }

    #[test]
    fn test_create_and_load_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("2021.bin");
        let info = BucketInfo::new(
            &path,
            "Created By Test",
            2021,
            Timeframe::parse("1D").unwrap(),
            ohlcv(),
            RecordType::Fixed,
        );
        info.create_file().unwrap();

        let len = std::fs::metadata(&path).unwrap().len() as i64;
        assert_eq!(len, HEADER_SIZE + 365 * 32);

        let loaded = BucketInfo::from_file(&path).unwrap();
        assert_eq!(loaded, info);

        assert!(matches!(
            info.create_file(),
            Err(StoreError::FileAlreadyExists(_))
        ));
    }

    #[test]
    fn test_epoch_shape_is_dropped() {
        let mut shapes = vec![DataShape::new("Epoch", ElementType::Int64)];
        shapes.extend(ohlcv());
        let info = BucketInfo::new(
            "a",
            "",
            2020,
            Timeframe::parse("1Min").unwrap(),
            shapes,
            RecordType::Fixed,
        );
        assert_eq!(info.shapes().len(), 5);
    }

    #[test]
    fn test_for_year_sibling() {
        let info = BucketInfo::new(
            "/data/AAPL/1Min/OHLCV/2020.bin",
            "",
            2020,
            Timeframe::parse("1Min").unwrap(),
            ohlcv(),
            RecordType::Fixed,
        );
        let next = info.for_year(2021);
        assert_eq!(next.path, PathBuf::from("/data/AAPL/1Min/OHLCV/2021.bin"));
        assert_eq!(next.year, 2021);
        assert_eq!(next.record_length(), info.record_length());
    }
}
