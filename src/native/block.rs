//! Blocks: the rectangular unit of data transfer.
//!
//! Wire layout:
//!
//! ```text
//! block info   field 1: overflows (u8), field 2: bucket (i32), 0 terminates
//! columns      varint
//! rows         varint
//! per column   name, type name, [custom serialization flag], prefix + data
//! ```
//!
//! Column data (and its prefix) is only present when `rows > 0`.

use std::ops::Index;
use std::sync::Arc;

use bytes::BytesMut;
use smallvec::SmallVec;

use super::binary::{ByteRead, ByteWrite};
use super::column::{decode_column, encode_column, read_prefix, write_prefix, ColumnContext};
use super::protocol::revision;
use super::types::SqlType;
use super::value::{FromValue, Value};
use crate::error::{Error, Result};

// ============================================================================
// Block info
// ============================================================================

/// Aggregation metadata carried in front of every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub is_overflows: bool,
    pub bucket_num: i32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self {
            is_overflows: false,
            bucket_num: -1,
        }
    }
}

impl BlockInfo {
    fn decode<R: ByteRead>(r: &mut R) -> Result<Self> {
        let mut info = BlockInfo::default();
        loop {
            match r.read_varint()? {
                0 => return Ok(info),
                1 => info.is_overflows = r.read_bool()?,
                2 => info.bucket_num = r.read_fixed()?,
                field => {
                    return Err(Error::MalformedBlock(format!(
                        "unknown block info field {}",
                        field
                    )))
                }
            }
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.write_varint(1);
        out.write_bool(self.is_overflows);
        out.write_varint(2);
        out.write_fixed(self.bucket_num);
        out.write_varint(0);
    }
}

// ============================================================================
// Columns
// ============================================================================

/// Name and type of one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// Type name exactly as the server sent it.
    pub type_name: String,
    pub sql_type: SqlType,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_name: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            type_name: type_name.to_string(),
            sql_type: SqlType::parse(type_name)?,
        })
    }
}

/// A named, typed column with its values.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub info: ColumnInfo,
    pub values: Vec<Value>,
}

// ============================================================================
// Block
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub info: BlockInfo,
    columns: Vec<Column>,
    rows: usize,
}

impl Block {
    /// A block with no columns and no rows (end of data).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a block from columns of equal length.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let rows = columns.first().map_or(0, |c| c.values.len());
        if let Some(bad) = columns.iter().find(|c| c.values.len() != rows) {
            return Err(Error::Usage(format!(
                "column '{}' has {} values, expected {}",
                bad.info.name,
                bad.values.len(),
                rows
            )));
        }
        Ok(Self {
            info: BlockInfo::default(),
            columns,
            rows,
        })
    }

    /// Transpose rows into a block shaped like `header`.
    pub fn from_rows<I>(header: &[ColumnInfo], rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let mut columns: Vec<Column> = header
            .iter()
            .map(|info| Column {
                info: info.clone(),
                values: Vec::new(),
            })
            .collect();

        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != columns.len() {
                return Err(Error::Usage(format!(
                    "row {} has {} values, table has {} columns",
                    i,
                    row.len(),
                    columns.len()
                )));
            }
            for (column, value) in columns.iter_mut().zip(row) {
                column.values.push(value);
            }
        }
        Self::new(columns)
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Empty blocks mark end of data or carry only a header.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.info.name == name)
    }

    pub fn column_infos(&self) -> Vec<ColumnInfo> {
        self.columns.iter().map(|c| c.info.clone()).collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.info.name.clone()).collect()
    }

    /// Consume the block into rows sharing one list of column names.
    pub fn into_rows(self) -> Vec<Row> {
        let names = Arc::new(self.column_names());
        let rows = self.rows;
        let mut columns: Vec<_> = self
            .columns
            .into_iter()
            .map(|c| c.values.into_iter())
            .collect();
        (0..rows)
            .map(|_| Row {
                columns: Arc::clone(&names),
                values: columns.iter_mut().filter_map(Iterator::next).collect(),
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Codec
    // ------------------------------------------------------------------------

    /// Decode one block negotiated at `revision`.
    pub fn decode<R: ByteRead>(r: &mut R, revision: u64, ctx: &ColumnContext) -> Result<Self> {
        let info = BlockInfo::decode(r)?;
        let num_columns = read_count(r, "column")?;
        let rows = read_count(r, "row")?;

        let mut columns = Vec::with_capacity(num_columns.min(1024));
        for _ in 0..num_columns {
            let name = r.read_string()?;
            let type_name = r.read_string()?;
            let sql_type = SqlType::parse(&type_name)?;

            if revision >= revision::CUSTOM_SERIALIZATION && r.read_bool()? {
                return Err(Error::UnsupportedType(format!(
                    "custom serialization of column '{}'",
                    name
                )));
            }

            let values = if rows > 0 {
                read_prefix(&sql_type, r)?;
                decode_column(&sql_type, rows, r, ctx)?
            } else {
                Vec::new()
            };

            columns.push(Column {
                info: ColumnInfo {
                    name,
                    type_name,
                    sql_type,
                },
                values,
            });
        }

        Ok(Self {
            info,
            columns,
            rows,
        })
    }

    /// Encode this block for `revision`.
    pub fn encode(&self, out: &mut BytesMut, revision: u64) -> Result<()> {
        self.info.encode(out);
        out.write_varint(self.columns.len() as u64);
        out.write_varint(self.rows as u64);

        for column in &self.columns {
            out.write_string(&column.info.name);
            out.write_string(&column.info.type_name);
            if revision >= revision::CUSTOM_SERIALIZATION {
                out.write_bool(false);
            }
            if self.rows > 0 {
                write_prefix(&column.info.sql_type, out);
                encode_column(&column.info.sql_type, &column.values, out)?;
            }
        }
        Ok(())
    }
}

fn read_count<R: ByteRead>(r: &mut R, what: &str) -> Result<usize> {
    let n = r.read_varint()?;
    usize::try_from(n).map_err(|_| Error::MalformedBlock(format!("{} count {} too large", what, n)))
}

// ============================================================================
// Row
// ============================================================================

/// One result row.
///
/// Values are stored inline for rows of up to 16 columns; column names are
/// shared with every other row of the same block.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: SmallVec<[Value; 16]>,
}

impl Row {
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values.into_vec()
    }

    /// Convert the value at `index`.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).ok_or_else(|| {
            Error::Usage(format!(
                "column index {} out of range ({} columns)",
                index,
                self.values.len()
            ))
        })?;
        T::from_value(value.clone())
    }

    /// Convert the value of the column called `name`.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::Usage(format!("no column named '{}'", name)))?;
        self.get(index)
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}
