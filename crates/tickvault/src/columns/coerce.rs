//! Element type coercion between columns.
//!
//! Numeric columns convert to any numeric type with `as` semantics
//! (truncation toward zero, saturation for float to int). Bool sources widen
//! to 0/1. Bool and String targets are rejected since incoming data must not
//! silently change meaning on disk.

use super::Column;
use crate::error::{Result, StoreError};
use crate::format::ElementType;

macro_rules! cast_numeric {
    ($values:expr, $to:expr) => {{
        let v = $values;
        match $to {
            ElementType::Float32 => Some(Column::Float32(v.iter().map(|x| *x as f32).collect())),
            ElementType::Int32 => Some(Column::Int32(v.iter().map(|x| *x as i32).collect())),
            ElementType::Float64 => Some(Column::Float64(v.iter().map(|x| *x as f64).collect())),
            ElementType::Int64 => Some(Column::Int64(v.iter().map(|x| *x as i64).collect())),
            ElementType::Byte => Some(Column::Byte(v.iter().map(|x| *x as i8).collect())),
            ElementType::Int16 => Some(Column::Int16(v.iter().map(|x| *x as i16).collect())),
            ElementType::Uint8 => Some(Column::Uint8(v.iter().map(|x| *x as u8).collect())),
            ElementType::Uint16 => Some(Column::Uint16(v.iter().map(|x| *x as u16).collect())),
            ElementType::Uint32 => Some(Column::Uint32(v.iter().map(|x| *x as u32).collect())),
            ElementType::Uint64 => Some(Column::Uint64(v.iter().map(|x| *x as u64).collect())),
            ElementType::Bool
            | ElementType::String
            | ElementType::String16
            | ElementType::None => None,
        }
    }};
}

impl Column {
    /// Returns a copy of this column converted to `to`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedCoercion` for Bool/String/None targets and for
    /// string sources converted to numbers.
    pub fn coerce(&self, name: &str, to: ElementType) -> Result<Column> {
        let from = self.element_type();
        if from == to {
            return Ok(self.clone());
        }
        let converted = match self {
            Column::Float32(v) => cast_numeric!(v, to),
            Column::Int32(v) => cast_numeric!(v, to),
            Column::Float64(v) => cast_numeric!(v, to),
            Column::Int64(v) => cast_numeric!(v, to),
            Column::Byte(v) => cast_numeric!(v, to),
            Column::Int16(v) => cast_numeric!(v, to),
            Column::Uint8(v) => cast_numeric!(v, to),
            Column::Uint16(v) => cast_numeric!(v, to),
            Column::Uint32(v) => cast_numeric!(v, to),
            Column::Uint64(v) => cast_numeric!(v, to),
            Column::Bool(v) => {
                let widened: Vec<u8> = v.iter().map(|b| u8::from(*b)).collect();
                cast_numeric!(&widened, to)
            }
            Column::String(v) | Column::String16(v) => match to {
                ElementType::String16 => Some(Column::String16(
                    v.iter().map(|s| s.chars().take(16).collect()).collect(),
                )),
                _ => None,
            },
        };
        converted.ok_or_else(|| StoreError::UnsupportedCoercion {
            column: name.to_string(),
            from,
            to,
        })
    }
}
