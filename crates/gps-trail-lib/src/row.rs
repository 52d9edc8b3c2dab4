//! Fixed-width row layout with typed column accessors
//!
//! Every record type declares an ordered list of [`Column`]s. Offsets are assigned once,
//! in declaration order, by [`figure_pos_and_size_for_columns`]; this order is the wire
//! layout of the record and must stay stable across versions.

use crate::{DataError, Result};
use std::fmt::Debug;
use std::hash::Hash;

/// Longest payload a [`ColumnType::ShortString`] column can hold
pub const MAX_SHORT_STRING_LEN: usize = u8::MAX as usize;

/// Stored value of a reference column that points nowhere
pub const NULL_REF: i32 = i32::MIN;

/// Primitive type of a column
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Int32,
    Int64,
    Float32,
    Float64,
    Byte,
    /// 1-byte length prefix followed by up to 255 bytes of UTF-8
    ShortString,
}

impl ColumnType {
    /// Number of bytes the column occupies in a row
    pub const fn size(self) -> usize {
        match self {
            ColumnType::Int32 | ColumnType::Float32 => 4,
            ColumnType::Int64 | ColumnType::Float64 => 8,
            ColumnType::Byte => 1,
            ColumnType::ShortString => 1 + MAX_SHORT_STRING_LEN,
        }
    }
}

/// A named, typed field at a fixed byte offset within a row
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    /// Byte offset, assigned by [`figure_pos_and_size_for_columns`]
    pub pos: usize,
}

impl Column {
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self { name, ty, pos: 0 }
    }
}

/// Assign offsets to `columns` in declaration order and return the total row size
pub fn figure_pos_and_size_for_columns(columns: &mut [Column]) -> usize {
    let mut pos = 0;
    for column in columns.iter_mut() {
        column.pos = pos;
        pos += column.ty.size();
    }
    pos
}

/// Ordered columns of a record type together with the resulting row size
#[derive(Clone, Debug)]
pub struct RowLayout {
    columns: Vec<Column>,
    size: usize,
}

impl RowLayout {
    pub fn new(columns: &[Column]) -> Self {
        let mut columns = columns.to_vec();
        let size = figure_pos_and_size_for_columns(&mut columns);
        Self { columns, size }
    }

    #[inline]
    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Size of a row in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Raw bytes of a single row, interpreted through a [`RowLayout`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowData {
    bytes: Box<[u8]>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl RowData {
    /// A zero-filled row for the given layout
    pub fn new(layout: &RowLayout) -> Self {
        Self {
            bytes: vec![0u8; layout.size()].into_boxed_slice(),
        }
    }

    /// Wrap decoded bytes, checking they match the layout
    pub fn from_bytes(layout: &RowLayout, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != layout.size() {
            return Err(DataError::Corrupt(format!(
                "row has {} bytes, layout expects {}",
                bytes.len(),
                layout.size()
            )));
        }
        Ok(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    fn field<const N: usize>(&self, column: &Column) -> [u8; N] {
        debug_assert_eq!(column.ty.size(), N, "column {} read with wrong width", column.name);
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[column.pos..column.pos + N]);
        out
    }

    #[inline]
    fn set_field(&mut self, column: &Column, value: &[u8]) {
        debug_assert_eq!(column.ty.size(), value.len(), "column {} written with wrong width", column.name);
        self.bytes[column.pos..column.pos + value.len()].copy_from_slice(value);
    }

    pub fn get_int(&self, column: &Column) -> i32 {
        i32::from_le_bytes(self.field(column))
    }

    pub fn set_int(&mut self, column: &Column, value: i32) {
        self.set_field(column, &value.to_le_bytes());
    }

    pub fn get_long(&self, column: &Column) -> i64 {
        i64::from_le_bytes(self.field(column))
    }

    pub fn set_long(&mut self, column: &Column, value: i64) {
        self.set_field(column, &value.to_le_bytes());
    }

    pub fn get_float(&self, column: &Column) -> f32 {
        f32::from_le_bytes(self.field(column))
    }

    pub fn set_float(&mut self, column: &Column, value: f32) {
        self.set_field(column, &value.to_le_bytes());
    }

    pub fn get_double(&self, column: &Column) -> f64 {
        f64::from_le_bytes(self.field(column))
    }

    pub fn set_double(&mut self, column: &Column, value: f64) {
        self.set_field(column, &value.to_le_bytes());
    }

    pub fn get_byte(&self, column: &Column) -> u8 {
        self.bytes[column.pos]
    }

    pub fn set_byte(&mut self, column: &Column, value: u8) {
        self.set_field(column, &[value]);
    }

    pub fn get_string(&self, column: &Column) -> String {
        let len = self.bytes[column.pos] as usize;
        let start = column.pos + 1;
        String::from_utf8_lossy(&self.bytes[start..start + len]).into_owned()
    }

    pub fn set_string(&mut self, column: &Column, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > MAX_SHORT_STRING_LEN {
            return Err(DataError::ValueTooLong { len: bytes.len() });
        }
        let start = column.pos + 1;
        self.bytes[column.pos] = bytes.len() as u8;
        self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        // Zero the tail so equal strings always encode to equal rows
        self.bytes[start + bytes.len()..start + MAX_SHORT_STRING_LEN].fill(0);
        Ok(())
    }

    /// Read an `Int32` column holding a row id, [`NULL_REF`] meaning absent
    pub fn get_ref(&self, column: &Column) -> Option<u32> {
        match self.get_int(column) {
            NULL_REF => None,
            id => Some(id as u32),
        }
    }

    pub fn set_ref(&mut self, column: &Column, id: Option<u32>) {
        let stored = match id {
            Some(id) => {
                debug_assert!(id <= i32::MAX as u32, "row id {id} does not fit a reference column");
                id as i32
            }
            None => NULL_REF,
        };
        self.set_int(column, stored);
    }
}

/// Typed row id
pub trait RowKey: Copy + Eq + Ord + Hash + Debug + Send + Sync {
    fn from_index(index: u32) -> Self;
    fn index(self) -> u32;
}

/// A record type stored in a [`crate::RowCache`]
pub trait Row: Sized + Send + Sync {
    type Id: RowKey;

    /// Table name, used for error reporting and backend file names
    const TABLE: &'static str;

    fn layout() -> &'static RowLayout;

    /// Rebuild a row from decoded bytes
    fn from_data(data: RowData) -> Self;

    fn data(&self) -> &RowData;

    fn data_mut(&mut self) -> &mut RowData;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_layout() -> RowLayout {
        RowLayout::new(&[
            Column::new("int", ColumnType::Int32),
            Column::new("long", ColumnType::Int64),
            Column::new("float", ColumnType::Float32),
            Column::new("double", ColumnType::Float64),
            Column::new("byte", ColumnType::Byte),
            Column::new("name", ColumnType::ShortString),
            Column::new("reference", ColumnType::Int32),
        ])
    }

    #[test]
    fn test_positions_follow_declaration_order() {
        let layout = test_layout();
        let positions: Vec<usize> = layout.columns().iter().map(|c| c.pos).collect();
        assert_eq!(positions, vec![0, 4, 12, 16, 24, 25, 281]);
        assert_eq!(layout.size(), 285);
    }

    #[test]
    fn test_typed_accessors() {
        let layout = test_layout();
        let mut row = RowData::new(&layout);

        row.set_int(layout.column(0), -42);
        row.set_long(layout.column(1), 1_700_000_000_123);
        row.set_float(layout.column(2), 1.5);
        row.set_double(layout.column(3), -2.25);
        row.set_byte(layout.column(4), 200);
        row.set_string(layout.column(5), "home").unwrap();
        row.set_ref(layout.column(6), Some(12));

        assert_eq!(row.get_int(layout.column(0)), -42);
        assert_eq!(row.get_long(layout.column(1)), 1_700_000_000_123);
        assert_eq!(row.get_float(layout.column(2)), 1.5);
        assert_eq!(row.get_double(layout.column(3)), -2.25);
        assert_eq!(row.get_byte(layout.column(4)), 200);
        assert_eq!(row.get_string(layout.column(5)), "home");
        assert_eq!(row.get_ref(layout.column(6)), Some(12));
    }

    #[test]
    fn test_null_reference() {
        let layout = test_layout();
        let mut row = RowData::new(&layout);
        row.set_ref(layout.column(6), None);
        assert_eq!(row.get_int(layout.column(6)), NULL_REF);
        assert_eq!(row.get_ref(layout.column(6)), None);
    }

    #[test]
    fn test_short_string_limits() {
        let layout = test_layout();
        let mut row = RowData::new(&layout);

        let longest = "x".repeat(MAX_SHORT_STRING_LEN);
        row.set_string(layout.column(5), &longest).unwrap();
        assert_eq!(row.get_string(layout.column(5)), longest);

        let too_long = "x".repeat(MAX_SHORT_STRING_LEN + 1);
        assert!(matches!(
            row.set_string(layout.column(5), &too_long),
            Err(DataError::ValueTooLong { len: 256 })
        ));

        // Shorter value overwrites the tail of the longer one
        row.set_string(layout.column(5), "ab").unwrap();
        assert_eq!(row.get_string(layout.column(5)), "ab");
    }

    #[test]
    fn test_from_bytes_checks_length() {
        let layout = test_layout();
        assert!(RowData::from_bytes(&layout, vec![0; layout.size()]).is_ok());
        assert!(matches!(
            RowData::from_bytes(&layout, vec![0; 3]),
            Err(DataError::Corrupt(_))
        ));
    }
}
