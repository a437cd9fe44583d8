//! Binary time-bucket file format.
//!
//! Every bucket stores one file per calendar year. A file is a fixed-size
//! header followed by one slot per time interval of the year:
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ Header (37024 bytes)         │
//! ├──────────────────────────────┤ HEADER_SIZE
//! │ slot 1  [index][payload...]  │
//! │ slot 2  [index][payload...]  │
//! │ ...                          │
//! │ slot N                       │
//! ├──────────────────────────────┤ (VARIABLE only)
//! │ appended row groups          │
//! └──────────────────────────────┘
//! ```
//!
//! A slot is live only when its leading index word is non-zero.
//! FIXED slots carry the column payload inline. VARIABLE slots hold an
//! `{index, offset, len}` pointer into the appended region at the end of the
//! file, where rows are stored with a trailing 4-byte interval tick value.

pub mod header;
pub mod timeframe;
pub mod timeindex;

pub use header::{BucketInfo, Header};
pub use timeframe::Timeframe;

use crate::error::{Result, StoreError};
use std::fmt;

/// Total size of the year-file header in bytes.
pub const HEADER_SIZE: i64 = 37024;

/// Version written into every new year file.
pub const FILE_INFO_VERSION: i64 = 2;

/// Size of the epoch (or index) word that prefixes each slot.
pub const EPOCH_LEN: usize = 8;

/// Size of a VARIABLE pointer slot: index, offset and length as `i64`.
pub const INDIRECT_RECORD_LEN: usize = 24;

/// Size of the interval tick trailer appended to VARIABLE rows.
pub const TICKS_LEN: usize = 4;

/// Maximum number of columns a header can describe.
pub const MAX_ELEMENTS: usize = 1024;

/// Maximum number of columns a WAL write command can carry.
pub const MAX_WAL_SHAPES: usize = u8::MAX as usize;

/// Width of one column name in the header.
pub const ELEMENT_NAME_LEN: usize = 32;

/// Name of the implicit time column.
pub const EPOCH_COLUMN: &str = "Epoch";

/// Name of the sub-second column produced for VARIABLE buckets.
pub const NANOSECONDS_COLUMN: &str = "Nanoseconds";

/// How records are laid out in a year file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum RecordType {
    /// One inline record per interval.
    Fixed = 0,
    /// Pointer slot per interval referencing appended row groups.
    Variable = 1,
}

impl RecordType {
    /// Decodes the on-disk tag.
    ///
    /// # Errors
    ///
    /// Returns an error for any tag other than 0 or 1.
    pub fn from_tag(tag: i64) -> Result<Self> {
        match tag {
            0 => Ok(Self::Fixed),
            1 => Ok(Self::Variable),
            other => Err(StoreError::InvalidFormat(format!(
                "unknown record type {other}"
            ))),
        }
    }

    /// Returns true for VARIABLE buckets.
    pub fn is_variable(self) -> bool {
        self == Self::Variable
    }
}

/// Element type tag of a column, as stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    /// 32-bit float.
    Float32 = 0,
    /// 32-bit signed integer.
    Int32 = 1,
    /// 64-bit float.
    Float64 = 2,
    /// 64-bit signed integer.
    Int64 = 3,
    /// Signed byte.
    Byte = 4,
    /// Boolean stored as one byte.
    Bool = 5,
    /// No type.
    None = 6,
    /// Variable length string, not storable in buckets.
    String = 7,
    /// 16-bit signed integer.
    Int16 = 8,
    /// 8-bit unsigned integer.
    Uint8 = 9,
    /// 16-bit unsigned integer.
    Uint16 = 10,
    /// 32-bit unsigned integer.
    Uint32 = 11,
    /// 64-bit unsigned integer.
    Uint64 = 12,
    /// Fixed 16-character string stored as UTF-32 (64 bytes).
    String16 = 13,
}

impl ElementType {
    /// Size of one value in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 | Self::Uint32 => 4,
            Self::Float64 | Self::Int64 | Self::Uint64 => 8,
            Self::Byte | Self::Bool | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::String16 => 64,
            Self::None | Self::String => 0,
        }
    }

    /// Decodes the header tag.
    ///
    /// # Errors
    ///
    /// Returns an error for tags outside the known range.
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Float32,
            1 => Self::Int32,
            2 => Self::Float64,
            3 => Self::Int64,
            4 => Self::Byte,
            5 => Self::Bool,
            6 => Self::None,
            7 => Self::String,
            8 => Self::Int16,
            9 => Self::Uint8,
            10 => Self::Uint16,
            11 => Self::Uint32,
            12 => Self::Uint64,
            13 => Self::String16,
            other => {
                return Err(StoreError::InvalidFormat(format!(
                    "unknown element type tag {other}"
                )))
            }
        })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float32 => "float32",
            Self::Int32 => "int32",
            Self::Float64 => "float64",
            Self::Int64 => "int64",
            Self::Byte => "byte",
            Self::Bool => "bool",
            Self::None => "none",
            Self::String => "string",
            Self::Int16 => "int16",
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::String16 => "string16",
        };
        f.write_str(name)
    }
}

/// Name and element type of one column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataShape {
    /// Column name.
    pub name: String,
    /// Column element type.
    pub ty: ElementType,
}

impl DataShape {
    /// Creates a new shape.
    pub fn new(name: impl Into<String>, ty: ElementType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    /// Encodes a shape list as `n u8` then `nameLen u8, name, type u8` per shape.
    ///
    /// Lists longer than [`MAX_WAL_SHAPES`] are cut; writers reject such
    /// buckets before anything is encoded.
    pub fn encode_list(shapes: &[DataShape], out: &mut Vec<u8>) {
        let count = shapes.len().min(u8::MAX as usize);
        out.push(count as u8);
        for shape in &shapes[..count] {
            let name = shape.name.as_bytes();
            let len = name.len().min(u8::MAX as usize);
            out.push(len as u8);
            out.extend_from_slice(&name[..len]);
            out.push(shape.ty as u8);
        }
    }

    /// Decodes a shape list, returning it with the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `ShortRead` if the buffer ends inside the list.
    pub fn decode_list(buf: &[u8]) -> Result<(Vec<DataShape>, usize)> {
        let short = |expected: usize| StoreError::ShortRead {
            expected,
            actual: buf.len(),
        };
        let count = *buf.first().ok_or_else(|| short(1))? as usize;
        let mut cursor = 1;
        let mut shapes = Vec::with_capacity(count);
        for _ in 0..count {
            let len = *buf.get(cursor).ok_or_else(|| short(cursor + 1))? as usize;
            cursor += 1;
            let name = buf
                .get(cursor..cursor + len)
                .ok_or_else(|| short(cursor + len))?;
            cursor += len;
            let tag = *buf.get(cursor).ok_or_else(|| short(cursor + 1))?;
            cursor += 1;
            shapes.push(DataShape {
                name: String::from_utf8_lossy(name).into_owned(),
                ty: ElementType::from_tag(tag)?,
            });
        }
        Ok((shapes, cursor))
    }
}

impl fmt::Display for DataShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.ty)
    }
}

/// Rounds a byte size up to the 8-byte machine word.
pub fn aligned_size(unaligned: usize) -> usize {
    let rem = unaligned % 8;
    if rem == 0 {
        unaligned
    } else {
        unaligned + 8 - rem
    }
}

/// Sum of the element sizes of `shapes`.
pub fn shapes_byte_len(shapes: &[DataShape]) -> usize {
    shapes.iter().map(|s| s.ty.size()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_size() {
        assert_eq!(aligned_size(0), 0);
        assert_eq!(aligned_size(1), 8);
        assert_eq!(aligned_size(8), 8);
        assert_eq!(aligned_size(20), 24);
    }

    #[test]
    fn test_element_tags() {
        for tag in 0u8..=13 {
            let ty = ElementType::from_tag(tag).unwrap();
            assert_eq!(ty as u8, tag);
        }
        assert!(ElementType::from_tag(14).is_err());
        assert_eq!(ElementType::String16.size(), 64);
    }

    #[test]
    fn test_shape_list_encoding() {
        let shapes = vec![
            DataShape::new("Bid", ElementType::Float32),
            DataShape::new("Ask", ElementType::Float32),
            DataShape::new("Size", ElementType::Int64),
        ];
        let mut buf = Vec::new();
        DataShape::encode_list(&shapes, &mut buf);
        buf.extend_from_slice(b"trailing");

        let (decoded, used) = DataShape::decode_list(&buf).unwrap();
        assert_eq!(decoded, shapes);
        assert_eq!(&buf[used..], b"trailing");
    }

    #[test]
    fn test_shape_list_truncated() {
        let shapes = vec![DataShape::new("Close", ElementType::Float64)];
        let mut buf = Vec::new();
        DataShape::encode_list(&shapes, &mut buf);
        let err = DataShape::decode_list(&buf[..buf.len() - 1]).unwrap_err();
        assert!(err.is_short_read());
    }
}
