//! Column-oriented result and input sets.
//!
//! A [`ColumnSeries`] is an ordered set of named, equally long [`Column`]s.
//! Every series carries an `Epoch` column (`Int64`, seconds); VARIABLE
//! buckets add a `Nanoseconds` column (`Int32`). Conversion to and from the
//! packed row layout used on disk lives here too.

mod coerce;

use crate::error::{Result, StoreError};
use crate::format::timeindex::epoch_to_time;
use crate::format::{aligned_size, DataShape, ElementType, EPOCH_COLUMN, NANOSECONDS_COLUMN};
use crate::key::BucketKey;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Columns keyed by bucket, as returned from a scan and accepted by `write_csm`.
pub type ColumnSeriesMap = BTreeMap<BucketKey, ColumnSeries>;

/// Number of UTF-32 code points in a `String16` value.
const STRING16_CHARS: usize = 16;

/// A typed column. One variant per storable element type.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// `FLOAT32` values.
    Float32(Vec<f32>),
    /// `INT32` values.
    Int32(Vec<i32>),
    /// `FLOAT64` values.
    Float64(Vec<f64>),
    /// `INT64` values.
    Int64(Vec<i64>),
    /// `BYTE` values.
    Byte(Vec<i8>),
    /// `BOOL` values.
    Bool(Vec<bool>),
    /// `INT16` values.
    Int16(Vec<i16>),
    /// `UINT8` values.
    Uint8(Vec<u8>),
    /// `UINT16` values.
    Uint16(Vec<u16>),
    /// `UINT32` values.
    Uint32(Vec<u32>),
    /// `UINT64` values.
    Uint64(Vec<u64>),
    /// Free-length strings; accepted as input only.
    String(Vec<String>),
    /// Up to 16 characters, stored as 64 bytes of UTF-32.
    String16(Vec<String>),
}

macro_rules! for_each_column {
    ($col:expr, $v:ident => $body:expr) => {
        match $col {
            Column::Float32($v) => $body,
            Column::Int32($v) => $body,
            Column::Float64($v) => $body,
            Column::Int64($v) => $body,
            Column::Byte($v) => $body,
            Column::Bool($v) => $body,
            Column::Int16($v) => $body,
            Column::Uint8($v) => $body,
            Column::Uint16($v) => $body,
            Column::Uint32($v) => $body,
            Column::Uint64($v) => $body,
            Column::String($v) => $body,
            Column::String16($v) => $body,
        }
    };
}

impl Column {
    /// An empty column of the given type, or `None` for `NONE`.
    pub fn empty(ty: ElementType) -> Option<Self> {
        Some(match ty {
            ElementType::Float32 => Self::Float32(Vec::new()),
            ElementType::Int32 => Self::Int32(Vec::new()),
            ElementType::Float64 => Self::Float64(Vec::new()),
            ElementType::Int64 => Self::Int64(Vec::new()),
            ElementType::Byte => Self::Byte(Vec::new()),
            ElementType::Bool => Self::Bool(Vec::new()),
            ElementType::Int16 => Self::Int16(Vec::new()),
            ElementType::Uint8 => Self::Uint8(Vec::new()),
            ElementType::Uint16 => Self::Uint16(Vec::new()),
            ElementType::Uint32 => Self::Uint32(Vec::new()),
            ElementType::Uint64 => Self::Uint64(Vec::new()),
            ElementType::String => Self::String(Vec::new()),
            ElementType::String16 => Self::String16(Vec::new()),
            ElementType::None => return None,
        })
    }

    /// A column of `len` zero values, used for columns absent from an input.
    pub fn zeroed(ty: ElementType, len: usize) -> Option<Self> {
        Some(match ty {
            ElementType::Float32 => Self::Float32(vec![0.0; len]),
            ElementType::Int32 => Self::Int32(vec![0; len]),
            ElementType::Float64 => Self::Float64(vec![0.0; len]),
            ElementType::Int64 => Self::Int64(vec![0; len]),
            ElementType::Byte => Self::Byte(vec![0; len]),
            ElementType::Bool => Self::Bool(vec![false; len]),
            ElementType::Int16 => Self::Int16(vec![0; len]),
            ElementType::Uint8 => Self::Uint8(vec![0; len]),
            ElementType::Uint16 => Self::Uint16(vec![0; len]),
            ElementType::Uint32 => Self::Uint32(vec![0; len]),
            ElementType::Uint64 => Self::Uint64(vec![0; len]),
            ElementType::String => Self::String(vec![String::new(); len]),
            ElementType::String16 => Self::String16(vec![String::new(); len]),
            ElementType::None => return None,
        })
    }

    /// Element type tag of this column.
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Float32(_) => ElementType::Float32,
            Self::Int32(_) => ElementType::Int32,
            Self::Float64(_) => ElementType::Float64,
            Self::Int64(_) => ElementType::Int64,
            Self::Byte(_) => ElementType::Byte,
            Self::Bool(_) => ElementType::Bool,
            Self::Int16(_) => ElementType::Int16,
            Self::Uint8(_) => ElementType::Uint8,
            Self::Uint16(_) => ElementType::Uint16,
            Self::Uint32(_) => ElementType::Uint32,
            Self::Uint64(_) => ElementType::Uint64,
            Self::String(_) => ElementType::String,
            Self::String16(_) => ElementType::String16,
        }
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        for_each_column!(self, v => v.len())
    }

    /// Returns true if the column holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keeps only the values at positions in `range`.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        let mut out = self.clone();
        for_each_column!(&mut out, v => {
            v.truncate(range.end);
            let start = range.start.min(v.len());
            v.drain(..start);
        });
        out
    }

    /// Appends value `row` in its little-endian on-disk form.
    fn write_le(&self, row: usize, out: &mut Vec<u8>) {
        match self {
            Self::Float32(v) => out.extend_from_slice(&v[row].to_le_bytes()),
            Self::Int32(v) => out.extend_from_slice(&v[row].to_le_bytes()),
            Self::Float64(v) => out.extend_from_slice(&v[row].to_le_bytes()),
            Self::Int64(v) => out.extend_from_slice(&v[row].to_le_bytes()),
            Self::Byte(v) => out.extend_from_slice(&v[row].to_le_bytes()),
            Self::Bool(v) => out.push(u8::from(v[row])),
            Self::Int16(v) => out.extend_from_slice(&v[row].to_le_bytes()),
            Self::Uint8(v) => out.push(v[row]),
            Self::Uint16(v) => out.extend_from_slice(&v[row].to_le_bytes()),
            Self::Uint32(v) => out.extend_from_slice(&v[row].to_le_bytes()),
            Self::Uint64(v) => out.extend_from_slice(&v[row].to_le_bytes()),
            Self::String(_) => {}
            Self::String16(v) => {
                let mut chars = v[row].chars();
                for _ in 0..STRING16_CHARS {
                    let code = chars.next().map(u32::from).unwrap_or(0);
                    out.extend_from_slice(&code.to_le_bytes());
                }
            }
        }
    }

    /// Decodes one value from `bytes` (exactly `element_type().size()` long) and appends it.
    fn push_le(&mut self, bytes: &[u8]) {
        macro_rules! le {
            ($t:ty) => {
                <$t>::from_le_bytes(bytes.try_into().unwrap_or_default())
            };
        }
        match self {
            Self::Float32(v) => v.push(le!(f32)),
            Self::Int32(v) => v.push(le!(i32)),
            Self::Float64(v) => v.push(le!(f64)),
            Self::Int64(v) => v.push(le!(i64)),
            Self::Byte(v) => v.push(le!(i8)),
            Self::Bool(v) => v.push(bytes.first().copied().unwrap_or(0) != 0),
            Self::Int16(v) => v.push(le!(i16)),
            Self::Uint8(v) => v.push(bytes.first().copied().unwrap_or(0)),
            Self::Uint16(v) => v.push(le!(u16)),
            Self::Uint32(v) => v.push(le!(u32)),
            Self::Uint64(v) => v.push(le!(u64)),
            Self::String(v) => v.push(String::new()),
            Self::String16(v) => v.push(
                bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes(c.try_into().unwrap_or_default()))
                    .take_while(|code| *code != 0)
                    .filter_map(char::from_u32)
                    .collect(),
            ),
        }
    }
}

/// An ordered set of equally long named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnSeries {
    names: Vec<String>,
    columns: Vec<Column>,
    previous_epoch: Option<i64>,
}

impl ColumnSeries {
    /// Creates an empty series.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column, replacing any existing column with the same name in place.
    pub fn add_column(&mut self, name: impl Into<String>, column: Column) {
        let name = name.into();
        match self.names.iter().position(|n| *n == name) {
            Some(i) => self.columns[i] = column,
            None => {
                self.names.push(name);
                self.columns.push(column);
            }
        }
    }

    /// Builder form of [`ColumnSeries::add_column`].
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Self {
        self.add_column(name, column);
        self
    }

    /// Removes and returns the named column.
    pub fn remove(&mut self, name: &str) -> Option<Column> {
        let i = self.names.iter().position(|n| n == name)?;
        self.names.remove(i);
        Some(self.columns.remove(i))
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.columns[i])
    }

    /// Column names in order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows (length of the first column).
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    /// Returns true if the series has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shapes of all columns, in order.
    pub fn shapes(&self) -> Vec<DataShape> {
        self.names
            .iter()
            .zip(&self.columns)
            .map(|(n, c)| DataShape::new(n.clone(), c.element_type()))
            .collect()
    }

    /// Epoch column values.
    ///
    /// # Errors
    ///
    /// Returns `MissingColumn` if there is no `Int64` Epoch column.
    pub fn epochs(&self) -> Result<&[i64]> {
        match self.column(EPOCH_COLUMN) {
            Some(Column::Int64(v)) => Ok(v),
            _ => Err(StoreError::MissingColumn {
                key: String::new(),
                column: EPOCH_COLUMN.to_string(),
            }),
        }
    }

    /// Row timestamps from Epoch plus the optional `Nanoseconds` column.
    ///
    /// # Errors
    ///
    /// Returns `MissingColumn` if there is no Epoch column.
    pub fn times(&self) -> Result<Vec<DateTime<Utc>>> {
        let epochs = self.epochs()?;
        let nanos = match self.column(NANOSECONDS_COLUMN) {
            Some(Column::Int32(v)) => Some(v.as_slice()),
            _ => None,
        };
        Ok(epochs
            .iter()
            .enumerate()
            .map(|(i, secs)| {
                let ns = nanos.and_then(|n| n.get(i)).copied().unwrap_or(0);
                epoch_to_time(*secs, u32::try_from(ns).unwrap_or(0))
            })
            .collect())
    }

    /// Timestamp (epoch seconds) of the last live record before the scanned
    /// window, when a forward scan looked for one.
    pub fn previous_epoch(&self) -> Option<i64> {
        self.previous_epoch
    }

    pub(crate) fn set_previous_epoch(&mut self, epoch: Option<i64>) {
        self.previous_epoch = epoch;
    }

    /// Converts one column to another element type.
    ///
    /// # Errors
    ///
    /// Returns `MissingColumn` or `UnsupportedCoercion`.
    pub fn coerce_column(&mut self, name: &str, to: ElementType) -> Result<()> {
        let i = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| StoreError::MissingColumn {
                key: String::new(),
                column: name.to_string(),
            })?;
        self.columns[i] = self.columns[i].coerce(name, to)?;
        Ok(())
    }

    /// Packs the series into rows following `shapes` (Epoch first). When
    /// `aligned` is set each row is padded to a multiple of 8 bytes.
    ///
    /// # Errors
    ///
    /// Returns `MissingColumn` or `SchemaMismatch` when a shape has no column
    /// of the right type.
    pub fn to_rows(&self, shapes: &[DataShape], aligned: bool) -> Result<Vec<u8>> {
        let columns = shapes
            .iter()
            .map(|shape| match self.column(&shape.name) {
                Some(c) if c.element_type() == shape.ty => Ok(c),
                Some(c) => Err(StoreError::SchemaMismatch {
                    key: String::new(),
                    reason: format!(
                        "column {} is {} but {} is required",
                        shape.name,
                        c.element_type(),
                        shape.ty
                    ),
                }),
                None => Err(StoreError::MissingColumn {
                    key: String::new(),
                    column: shape.name.clone(),
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        let raw_len: usize = shapes.iter().map(|s| s.ty.size()).sum();
        let row_len = if aligned {
            aligned_size(raw_len)
        } else {
            raw_len
        };
        let rows = self.len();
        let mut out = Vec::with_capacity(rows * row_len);
        for row in 0..rows {
            let start = out.len();
            for column in &columns {
                column.write_le(row, &mut out);
            }
            out.resize(start + row_len, 0);
        }
        Ok(out)
    }

    /// Unpacks rows laid out per `shapes` (Epoch first), each `row_len` bytes.
    pub fn from_rows(shapes: &[DataShape], data: &[u8], row_len: usize) -> Self {
        let mut series = Self::new();
        let mut columns: Vec<Column> = shapes
            .iter()
            .map(|s| Column::empty(s.ty).unwrap_or(Column::Uint8(Vec::new())))
            .collect();
        if row_len > 0 {
            for row in data.chunks_exact(row_len) {
                let mut cursor = 0;
                for (shape, column) in shapes.iter().zip(columns.iter_mut()) {
                    let size = shape.ty.size();
                    if let Some(bytes) = row.get(cursor..cursor + size) {
                        column.push_le(bytes);
                    }
                    cursor += size;
                }
            }
        }
        for (shape, column) in shapes.iter().zip(columns) {
            series.add_column(shape.name.clone(), column);
        }
        series
    }

    /// Keeps only rows in `range`.
    pub fn slice_rows(&self, range: std::ops::Range<usize>) -> Self {
        Self {
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.slice(range.clone())).collect(),
            previous_epoch: self.previous_epoch,
        }
    }
}
