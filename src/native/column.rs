//! Column codec.
//!
//! Every column is encoded in two parts. The serialization prefix is
//! written once per column before any data (only `LowCardinality` has one,
//! but prefixes nest through composite types). The data part holds all
//! rows of the column at once.
//!
//! Decoding is driven entirely by the server-supplied [`SqlType`]; values
//! are never used to infer a type.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use chrono::{Datelike, NaiveDate, TimeZone};
use chrono_tz::Tz;
use uuid::Uuid;

use super::binary::{ByteRead, ByteWrite, FixedWidth};
use super::types::{DecimalWidth, SqlType};
use super::value::{Decimal, Value, I256, U256};
use crate::error::{Error, Result};

/// `LowCardinality` serialization version written in the column prefix.
const SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS: u64 = 1;

const INDEX_TYPE_MASK: u64 = 0xff;
const NEED_GLOBAL_DICTIONARY: u64 = 1 << 8;
const HAS_ADDITIONAL_KEYS: u64 = 1 << 9;
const NEED_UPDATE_DICTIONARY: u64 = 1 << 10;

/// Days from 0001-01-01 to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// `Date32` covers 1900-01-01 through 2299-12-31.
const DATE32_MIN_DAYS: i64 = -25_567;
const DATE32_MAX_DAYS: i64 = 120_529;

/// Decoding context shared by every column of a block.
#[derive(Debug, Clone, Copy)]
pub struct ColumnContext {
    /// Zone for `DateTime` columns whose type names none.
    pub timezone: Tz,
}

impl ColumnContext {
    /// Prefer the server's zone, then the `TZ` environment variable, then the
    /// host's configured zone, then UTC.
    pub fn new(server_timezone: Option<Tz>) -> Self {
        Self {
            timezone: server_timezone.unwrap_or_else(local_timezone),
        }
    }
}

impl Default for ColumnContext {
    fn default() -> Self {
        Self { timezone: Tz::UTC }
    }
}

fn local_timezone() -> Tz {
    pick_timezone(
        std::env::var("TZ").ok(),
        iana_time_zone::get_timezone().ok(),
    )
}

/// First parseable zone of `TZ` and the system zone name, else UTC.
fn pick_timezone(env: Option<String>, system: Option<String>) -> Tz {
    let parse = |name: String| name.trim_start_matches(':').parse::<Tz>().ok();
    env.and_then(parse)
        .or_else(|| system.and_then(parse))
        .unwrap_or(Tz::UTC)
}

fn resolve_timezone(name: &Option<String>, ctx: &ColumnContext) -> Result<Tz> {
    match name {
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| Error::UnsupportedType(format!("unknown timezone '{}'", name))),
        None => Ok(ctx.timezone),
    }
}

// ============================================================================
// Serialization prefixes
// ============================================================================

/// Read the per-column prefix that precedes column data.
pub fn read_prefix<R: ByteRead>(ty: &SqlType, r: &mut R) -> Result<()> {
    match ty {
        SqlType::LowCardinality(_) => {
            let version: u64 = r.read_fixed()?;
            if version != SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS {
                return Err(Error::MalformedBlock(format!(
                    "unsupported LowCardinality key version {}",
                    version
                )));
            }
            Ok(())
        }
        SqlType::Nullable(inner) | SqlType::Array(inner) => read_prefix(inner, r),
        SqlType::Tuple(elements) => elements.iter().try_for_each(|(_, t)| read_prefix(t, r)),
        SqlType::Map(key, value) => {
            read_prefix(key, r)?;
            read_prefix(value, r)
        }
        _ => Ok(()),
    }
}

/// Write the per-column prefix for `ty`.
pub fn write_prefix(ty: &SqlType, out: &mut BytesMut) {
    match ty {
        SqlType::LowCardinality(_) => out.write_fixed(SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS),
        SqlType::Nullable(inner) | SqlType::Array(inner) => write_prefix(inner, out),
        SqlType::Tuple(elements) => elements.iter().for_each(|(_, t)| write_prefix(t, out)),
        SqlType::Map(key, value) => {
            write_prefix(key, out);
            write_prefix(value, out);
        }
        _ => {}
    }
}

// ============================================================================
// Decoding
// ============================================================================

fn byte_len(rows: usize, width: usize) -> Result<usize> {
    rows.checked_mul(width)
        .ok_or_else(|| Error::MalformedBlock(format!("{} rows overflow column size", rows)))
}

fn read_fixed_column<R, T, F>(r: &mut R, rows: usize, mut f: F) -> Result<Vec<Value>>
where
    R: ByteRead,
    T: FixedWidth,
    F: FnMut(T) -> Result<Value>,
{
    let raw = r.read_bytes(byte_len(rows, T::SIZE)?)?;
    raw.chunks_exact(T::SIZE)
        .map(|chunk| f(T::from_le_slice(chunk)))
        .collect()
}

fn bytes_to_value(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(s) => Value::String(s),
        Err(e) => Value::Bytes(e.into_bytes()),
    }
}

fn date_from_days(days: i64) -> Result<Value> {
    i32::try_from(days)
        .ok()
        .and_then(|d| d.checked_add(UNIX_EPOCH_DAYS_FROM_CE))
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .map(Value::Date)
        .ok_or_else(|| Error::Type(format!("day number {} out of range", days)))
}

fn datetime(tz: Tz, secs: i64, nanos: u32) -> Result<Value> {
    tz.timestamp_opt(secs, nanos)
        .single()
        .map(Value::DateTime)
        .ok_or_else(|| Error::Type(format!("timestamp {} out of range", secs)))
}

fn datetime64_scale(precision: u8) -> Result<i64> {
    if precision > 9 {
        return Err(Error::UnsupportedType(format!(
            "DateTime64 precision {} exceeds 9",
            precision
        )));
    }
    Ok(10i64.pow(u32::from(precision)))
}

fn enum_name<T>(table: &[(String, T)], raw: T, ty: &SqlType) -> Result<Value>
where
    T: Copy + PartialEq + Into<i16>,
{
    table
        .iter()
        .find(|(_, v)| *v == raw)
        .map(|(name, _)| Value::Enum(name.clone()))
        .ok_or_else(|| Error::UnknownEnumValue {
            type_name: ty.to_string(),
            value: raw.into(),
        })
}

/// Read `rows` cumulative offsets and return them with the flat element count.
fn read_offsets<R: ByteRead>(r: &mut R, rows: usize) -> Result<(Vec<u64>, usize)> {
    let raw = r.read_bytes(byte_len(rows, 8)?)?;
    let offsets: Vec<u64> = raw.chunks_exact(8).map(u64::from_le_slice).collect();

    let mut prev = 0u64;
    for (i, &offset) in offsets.iter().enumerate() {
        if offset < prev {
            return Err(Error::MalformedBlock(format!(
                "array offset {} at row {} is below previous offset {}",
                offset, i, prev
            )));
        }
        prev = offset;
    }
    let total = usize::try_from(prev)
        .map_err(|_| Error::MalformedBlock(format!("array offset {} too large", prev)))?;
    Ok((offsets, total))
}

fn split_by_offsets<T>(flat: Vec<T>, offsets: &[u64]) -> Vec<Vec<T>> {
    let mut items = flat.into_iter();
    let mut prev = 0u64;
    offsets
        .iter()
        .map(|&end| {
            let len = (end - prev) as usize;
            prev = end;
            items.by_ref().take(len).collect()
        })
        .collect()
}

/// Decode `rows` values of type `ty`.
///
/// The column prefix must already have been consumed with [`read_prefix`].
pub fn decode_column<R: ByteRead>(
    ty: &SqlType,
    rows: usize,
    r: &mut R,
    ctx: &ColumnContext,
) -> Result<Vec<Value>> {
    // Empty columns carry no data at all, not even LowCardinality headers.
    if rows == 0 {
        return Ok(Vec::new());
    }

    match ty {
        SqlType::UInt8 => read_fixed_column(r, rows, |v: u8| Ok(Value::UInt8(v))),
        SqlType::UInt16 => read_fixed_column(r, rows, |v: u16| Ok(Value::UInt16(v))),
        SqlType::UInt32 => read_fixed_column(r, rows, |v: u32| Ok(Value::UInt32(v))),
        SqlType::UInt64 => read_fixed_column(r, rows, |v: u64| Ok(Value::UInt64(v))),
        SqlType::UInt128 => read_fixed_column(r, rows, |v: u128| Ok(Value::UInt128(v))),
        SqlType::Int8 => read_fixed_column(r, rows, |v: i8| Ok(Value::Int8(v))),
        SqlType::Int16 => read_fixed_column(r, rows, |v: i16| Ok(Value::Int16(v))),
        SqlType::Int32 => read_fixed_column(r, rows, |v: i32| Ok(Value::Int32(v))),
        SqlType::Int64 => read_fixed_column(r, rows, |v: i64| Ok(Value::Int64(v))),
        SqlType::Int128 => read_fixed_column(r, rows, |v: i128| Ok(Value::Int128(v))),
        SqlType::UInt256 | SqlType::Int256 => {
            let raw = r.read_bytes(byte_len(rows, 32)?)?;
            Ok(raw
                .chunks_exact(32)
                .map(|chunk| {
                    let mut bytes = [0u8; 32];
                    bytes.copy_from_slice(chunk);
                    if matches!(ty, SqlType::UInt256) {
                        Value::UInt256(U256(bytes))
                    } else {
                        Value::Int256(I256(bytes))
                    }
                })
                .collect())
        }
        SqlType::Float32 => read_fixed_column(r, rows, |v: f32| Ok(Value::Float32(v))),
        SqlType::Float64 => read_fixed_column(r, rows, |v: f64| Ok(Value::Float64(v))),
        SqlType::Bool => read_fixed_column(r, rows, |v: u8| Ok(Value::Bool(v != 0))),
        SqlType::Nothing => read_fixed_column(r, rows, |_: u8| Ok(Value::Null)),

        SqlType::String => (0..rows)
            .map(|_| r.read_binary().map(bytes_to_value))
            .collect(),
        SqlType::FixedString(0) => Ok(vec![Value::Bytes(Vec::new()); rows]),
        SqlType::FixedString(n) => {
            let raw = r.read_bytes(byte_len(rows, *n)?)?;
            Ok(raw
                .chunks_exact(*n)
                .map(|chunk| Value::Bytes(chunk.to_vec()))
                .collect())
        }

        SqlType::Uuid => read_fixed_column(r, rows, |v: u128| {
            // High half first, each half little-endian.
            Ok(Value::Uuid(Uuid::from_u64_pair(v as u64, (v >> 64) as u64)))
        }),
        SqlType::IPv4 => read_fixed_column(r, rows, |v: u32| Ok(Value::IPv4(Ipv4Addr::from(v)))),
        SqlType::IPv6 => {
            let raw = r.read_bytes(byte_len(rows, 16)?)?;
            Ok(raw
                .chunks_exact(16)
                .map(|chunk| {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(chunk);
                    Value::IPv6(Ipv6Addr::from(octets))
                })
                .collect())
        }

        SqlType::Date => read_fixed_column(r, rows, |v: u16| date_from_days(i64::from(v))),
        SqlType::Date32 => read_fixed_column(r, rows, |v: i32| date_from_days(i64::from(v))),
        SqlType::DateTime(tz) => {
            let tz = resolve_timezone(tz, ctx)?;
            read_fixed_column(r, rows, |v: u32| datetime(tz, i64::from(v), 0))
        }
        SqlType::DateTime64(precision, tz) => {
            let tz = resolve_timezone(tz, ctx)?;
            let scale = datetime64_scale(*precision)?;
            let nanos_per_tick = 1_000_000_000 / scale;
            read_fixed_column(r, rows, |ticks: i64| {
                let secs = ticks.div_euclid(scale);
                let nanos = ticks.rem_euclid(scale) * nanos_per_tick;
                datetime(tz, secs, nanos as u32)
            })
        }

        SqlType::Decimal { scale, width, .. } => {
            let scale = *scale;
            match width {
                DecimalWidth::D32 => read_fixed_column(r, rows, |v: i32| {
                    Ok(Value::Decimal(Decimal::new(v.into(), scale)))
                }),
                DecimalWidth::D64 => read_fixed_column(r, rows, |v: i64| {
                    Ok(Value::Decimal(Decimal::new(v.into(), scale)))
                }),
                DecimalWidth::D128 => read_fixed_column(r, rows, |v: i128| {
                    Ok(Value::Decimal(Decimal::new(v, scale)))
                }),
                DecimalWidth::D256 => {
                    let raw = r.read_bytes(byte_len(rows, 32)?)?;
                    raw.chunks_exact(32)
                        .map(|chunk| {
                            let mut bytes = [0u8; 32];
                            bytes.copy_from_slice(chunk);
                            I256(bytes)
                                .to_i128()
                                .map(|m| Value::Decimal(Decimal::new(m, scale)))
                                .ok_or_else(|| {
                                    Error::Type(format!("{} value exceeds 128 bits", ty))
                                })
                        })
                        .collect()
                }
            }
        }

        SqlType::Enum8(table) => read_fixed_column(r, rows, |v: i8| enum_name(table, v, ty)),
        SqlType::Enum16(table) => read_fixed_column(r, rows, |v: i16| enum_name(table, v, ty)),

        SqlType::Nullable(inner) => {
            let null_map = r.read_bytes(rows)?;
            let mut values = decode_column(inner, rows, r, ctx)?;
            for (value, is_null) in values.iter_mut().zip(&null_map) {
                if *is_null != 0 {
                    *value = Value::Null;
                }
            }
            Ok(values)
        }

        SqlType::Array(inner) => {
            let (offsets, total) = read_offsets(r, rows)?;
            let flat = decode_column(inner, total, r, ctx)?;
            Ok(split_by_offsets(flat, &offsets)
                .into_iter()
                .map(Value::Array)
                .collect())
        }

        SqlType::Map(key, value) => {
            let (offsets, total) = read_offsets(r, rows)?;
            let keys = decode_column(key, total, r, ctx)?;
            let values = decode_column(value, total, r, ctx)?;
            let entries: Vec<(Value, Value)> = keys.into_iter().zip(values).collect();
            Ok(split_by_offsets(entries, &offsets)
                .into_iter()
                .map(Value::Map)
                .collect())
        }

        SqlType::Tuple(elements) => {
            let columns = elements
                .iter()
                .map(|(_, t)| decode_column(t, rows, r, ctx))
                .collect::<Result<Vec<_>>>()?;
            let mut columns: Vec<_> = columns.into_iter().map(Vec::into_iter).collect();
            Ok((0..rows)
                .map(|_| Value::Tuple(columns.iter_mut().filter_map(Iterator::next).collect()))
                .collect())
        }

        SqlType::LowCardinality(inner) => decode_low_cardinality(inner, rows, r, ctx),
    }
}

fn read_indices<R: ByteRead>(r: &mut R, rows: usize, index_type: u64) -> Result<Vec<u64>> {
    let width = 1usize << index_type;
    let raw = r.read_bytes(byte_len(rows, width)?)?;
    Ok(raw
        .chunks_exact(width)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes[..width].copy_from_slice(chunk);
            u64::from_le_bytes(bytes)
        })
        .collect())
}

fn decode_low_cardinality<R: ByteRead>(
    inner: &SqlType,
    rows: usize,
    r: &mut R,
    ctx: &ColumnContext,
) -> Result<Vec<Value>> {
    let flags: u64 = r.read_fixed()?;
    if flags & NEED_GLOBAL_DICTIONARY != 0 {
        return Err(Error::UnsupportedType(
            "LowCardinality with a global dictionary".to_string(),
        ));
    }
    if flags & HAS_ADDITIONAL_KEYS == 0 {
        return Err(Error::MalformedBlock(
            "LowCardinality chunk carries no dictionary keys".to_string(),
        ));
    }
    let index_type = flags & INDEX_TYPE_MASK;
    if index_type > 3 {
        return Err(Error::MalformedBlock(format!(
            "unknown LowCardinality index type {}",
            index_type
        )));
    }

    let key_count: u64 = r.read_fixed()?;
    let key_count = usize::try_from(key_count)
        .map_err(|_| Error::MalformedBlock(format!("{} dictionary keys", key_count)))?;
    let keys = decode_column(inner.non_nullable(), key_count, r, ctx)?;

    let row_count: u64 = r.read_fixed()?;
    if row_count != rows as u64 {
        return Err(Error::MalformedBlock(format!(
            "LowCardinality declares {} rows, block has {}",
            row_count, rows
        )));
    }

    let nullable = inner.is_nullable();
    read_indices(r, rows, index_type)?
        .into_iter()
        .map(|index| {
            if nullable && index == 0 {
                return Ok(Value::Null);
            }
            keys.get(index as usize).cloned().ok_or_else(|| {
                Error::MalformedBlock(format!(
                    "dictionary index {} out of range ({} keys)",
                    index,
                    keys.len()
                ))
            })
        })
        .collect()
}

// ============================================================================
// Encoding
// ============================================================================

fn type_error(ty: &SqlType, value: &Value) -> Error {
    Error::Type(format!("cannot encode {} as {}", value.kind(), ty))
}

fn range_error(ty: &SqlType, value: impl std::fmt::Display) -> Error {
    Error::Type(format!("{} out of range for {}", value, ty))
}

/// Placeholder written at null positions and in dictionary slot 0.
fn default_value(ty: &SqlType) -> Value {
    match ty {
        SqlType::UInt8 => Value::UInt8(0),
        SqlType::UInt16 => Value::UInt16(0),
        SqlType::UInt32 => Value::UInt32(0),
        SqlType::UInt64 => Value::UInt64(0),
        SqlType::UInt128 => Value::UInt128(0),
        SqlType::UInt256 => Value::UInt256(U256::default()),
        SqlType::Int8 => Value::Int8(0),
        SqlType::Int16 => Value::Int16(0),
        SqlType::Int32 => Value::Int32(0),
        SqlType::Int64 => Value::Int64(0),
        SqlType::Int128 => Value::Int128(0),
        SqlType::Int256 => Value::Int256(I256::default()),
        SqlType::Float32 => Value::Float32(0.0),
        SqlType::Float64 => Value::Float64(0.0),
        SqlType::Bool => Value::Bool(false),
        SqlType::String => Value::String(String::new()),
        SqlType::FixedString(n) => Value::Bytes(vec![0; *n]),
        SqlType::Uuid => Value::Uuid(Uuid::nil()),
        SqlType::IPv4 => Value::IPv4(Ipv4Addr::UNSPECIFIED),
        SqlType::IPv6 => Value::IPv6(Ipv6Addr::UNSPECIFIED),
        // Raw zero ticks/days.
        SqlType::Date | SqlType::Date32 | SqlType::DateTime(_) | SqlType::DateTime64(..) => {
            Value::Int32(0)
        }
        SqlType::Decimal { scale, .. } => Value::Decimal(Decimal::new(0, *scale)),
        SqlType::Enum8(table) => Value::Enum(table.first().map(|e| e.0.clone()).unwrap_or_default()),
        SqlType::Enum16(table) => {
            Value::Enum(table.first().map(|e| e.0.clone()).unwrap_or_default())
        }
        SqlType::Nothing | SqlType::Nullable(_) => Value::Null,
        SqlType::Array(_) => Value::Array(Vec::new()),
        SqlType::Map(..) => Value::Map(Vec::new()),
        SqlType::Tuple(elements) => {
            Value::Tuple(elements.iter().map(|(_, t)| default_value(t)).collect())
        }
        SqlType::LowCardinality(inner) => default_value(inner),
    }
}

fn write_ints<T>(ty: &SqlType, values: &[&Value], out: &mut BytesMut) -> Result<()>
where
    T: FixedWidth + TryFrom<i128>,
{
    for value in values {
        let n = value.as_i128().ok_or_else(|| type_error(ty, value))?;
        let n = T::try_from(n).map_err(|_| range_error(ty, n))?;
        out.write_fixed(n);
    }
    Ok(())
}

fn enum_code<T>(table: &[(String, T)], value: &Value, ty: &SqlType) -> Result<T>
where
    T: Copy,
    i128: From<T>,
{
    let found = match value {
        Value::Enum(name) | Value::String(name) => {
            table.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
        }
        other => {
            let n = other.as_i128().ok_or_else(|| type_error(ty, other))?;
            table.iter().find(|(_, v)| i128::from(*v) == n).map(|(_, v)| *v)
        }
    };
    found.ok_or_else(|| Error::Type(format!("{} is not a member of {}", value, ty)))
}

fn days_value(value: &Value, ty: &SqlType) -> Result<i64> {
    let date = match value {
        Value::Date(d) => *d,
        Value::DateTime(dt) => dt.date_naive(),
        other => {
            let raw = other.as_i128().ok_or_else(|| type_error(ty, other))?;
            return i64::try_from(raw).map_err(|_| range_error(ty, raw));
        }
    };
    Ok(i64::from(date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE))
}

fn decimal_mantissa(value: &Value, precision: u8, scale: u8, ty: &SqlType) -> Result<i128> {
    let decimal = match value {
        Value::Decimal(d) => *d,
        Value::String(s) => s.parse()?,
        other => Decimal::new(other.as_i128().ok_or_else(|| type_error(ty, other))?, 0),
    };
    let rescaled = decimal
        .rescale(scale)
        .ok_or_else(|| Error::Type(format!("{} cannot be represented as {}", decimal, ty)))?;
    let mantissa = rescaled.mantissa();
    if precision <= 38 && mantissa.unsigned_abs() >= 10u128.pow(u32::from(precision)) {
        return Err(range_error(ty, decimal));
    }
    Ok(mantissa)
}

fn write_offsets<I>(lengths: I, out: &mut BytesMut)
where
    I: Iterator<Item = usize>,
{
    let mut offset = 0u64;
    for len in lengths {
        offset += len as u64;
        out.write_fixed(offset);
    }
}

/// Encode `values` as one column of type `ty`.
///
/// Fails with `Error::Type` when a value does not fit the column; the
/// buffer may then hold a partial column and must be discarded.
pub fn encode_column(ty: &SqlType, values: &[Value], out: &mut BytesMut) -> Result<()> {
    let refs: Vec<&Value> = values.iter().collect();
    encode_refs(ty, &refs, out)
}

fn encode_refs(ty: &SqlType, values: &[&Value], out: &mut BytesMut) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }

    match ty {
        SqlType::UInt8 => write_ints::<u8>(ty, values, out),
        SqlType::UInt16 => write_ints::<u16>(ty, values, out),
        SqlType::UInt32 => write_ints::<u32>(ty, values, out),
        SqlType::UInt64 => write_ints::<u64>(ty, values, out),
        SqlType::Int8 => write_ints::<i8>(ty, values, out),
        SqlType::Int16 => write_ints::<i16>(ty, values, out),
        SqlType::Int32 => write_ints::<i32>(ty, values, out),
        SqlType::Int64 => write_ints::<i64>(ty, values, out),
        SqlType::Int128 => write_ints::<i128>(ty, values, out),
        SqlType::UInt128 => {
            for value in values {
                let n = value.as_u128().ok_or_else(|| type_error(ty, value))?;
                out.write_fixed(n);
            }
            Ok(())
        }
        SqlType::UInt256 => {
            for value in values {
                let raw = match value {
                    Value::UInt256(v) => *v,
                    other => U256::from(other.as_u128().ok_or_else(|| type_error(ty, other))?),
                };
                out.put_slice(&raw.0);
            }
            Ok(())
        }
        SqlType::Int256 => {
            for value in values {
                let raw = match value {
                    Value::Int256(v) => *v,
                    other => I256::from(other.as_i128().ok_or_else(|| type_error(ty, other))?),
                };
                out.put_slice(&raw.0);
            }
            Ok(())
        }
        SqlType::Float32 => {
            for value in values {
                let v = value.as_f64().ok_or_else(|| type_error(ty, value))?;
                out.write_fixed(v as f32);
            }
            Ok(())
        }
        SqlType::Float64 => {
            for value in values {
                out.write_fixed(value.as_f64().ok_or_else(|| type_error(ty, value))?);
            }
            Ok(())
        }
        SqlType::Bool => {
            for value in values {
                let v = match value {
                    Value::Bool(b) => *b,
                    other => match other.as_i128() {
                        Some(0) => false,
                        Some(1) => true,
                        _ => return Err(type_error(ty, other)),
                    },
                };
                out.write_bool(v);
            }
            Ok(())
        }
        SqlType::Nothing => {
            for value in values {
                if !value.is_null() {
                    return Err(type_error(ty, value));
                }
                out.put_u8(0);
            }
            Ok(())
        }

        SqlType::String => {
            for value in values {
                out.write_binary(value.as_bytes().ok_or_else(|| type_error(ty, value))?);
            }
            Ok(())
        }
        SqlType::FixedString(n) => {
            for value in values {
                let bytes = value.as_bytes().ok_or_else(|| type_error(ty, value))?;
                if bytes.len() > *n {
                    return Err(Error::Type(format!(
                        "{} bytes do not fit {}",
                        bytes.len(),
                        ty
                    )));
                }
                out.put_slice(bytes);
                out.put_bytes(0, n - bytes.len());
            }
            Ok(())
        }

        SqlType::Uuid => {
            for value in values {
                let uuid = match value {
                    Value::Uuid(u) => *u,
                    Value::String(s) => s
                        .parse::<Uuid>()
                        .map_err(|e| Error::Type(format!("invalid UUID '{}': {}", s, e)))?,
                    other => return Err(type_error(ty, other)),
                };
                let (high, low) = uuid.as_u64_pair();
                out.write_fixed(high);
                out.write_fixed(low);
            }
            Ok(())
        }
        SqlType::IPv4 => {
            for value in values {
                let ip = match value {
                    Value::IPv4(ip) => *ip,
                    Value::String(s) => s
                        .parse::<Ipv4Addr>()
                        .map_err(|e| Error::Type(format!("invalid IPv4 '{}': {}", s, e)))?,
                    other => return Err(type_error(ty, other)),
                };
                out.write_fixed(u32::from(ip));
            }
            Ok(())
        }
        SqlType::IPv6 => {
            for value in values {
                let ip = match value {
                    Value::IPv6(ip) => *ip,
                    Value::IPv4(ip) => ip.to_ipv6_mapped(),
                    Value::String(s) => s
                        .parse::<Ipv6Addr>()
                        .map_err(|e| Error::Type(format!("invalid IPv6 '{}': {}", s, e)))?,
                    other => return Err(type_error(ty, other)),
                };
                out.put_slice(&ip.octets());
            }
            Ok(())
        }

        SqlType::Date => {
            for value in values {
                let days = days_value(value, ty)?;
                let days = u16::try_from(days).map_err(|_| range_error(ty, value))?;
                out.write_fixed(days);
            }
            Ok(())
        }
        SqlType::Date32 => {
            for value in values {
                let days = days_value(value, ty)?;
                if !(DATE32_MIN_DAYS..=DATE32_MAX_DAYS).contains(&days) {
                    return Err(range_error(ty, value));
                }
                out.write_fixed(days as i32);
            }
            Ok(())
        }
        SqlType::DateTime(_) => {
            for value in values {
                let secs = match value {
                    Value::DateTime(dt) => i128::from(dt.timestamp()),
                    other => other.as_i128().ok_or_else(|| type_error(ty, other))?,
                };
                let secs = u32::try_from(secs).map_err(|_| range_error(ty, value))?;
                out.write_fixed(secs);
            }
            Ok(())
        }
        SqlType::DateTime64(precision, _) => {
            let scale = datetime64_scale(*precision)?;
            let nanos_per_tick = 1_000_000_000 / scale;
            for value in values {
                let ticks = match value {
                    Value::DateTime(dt) => dt
                        .timestamp()
                        .checked_mul(scale)
                        .and_then(|t| {
                            t.checked_add(i64::from(dt.timestamp_subsec_nanos()) / nanos_per_tick)
                        })
                        .ok_or_else(|| range_error(ty, value))?,
                    other => {
                        let raw = other.as_i128().ok_or_else(|| type_error(ty, other))?;
                        i64::try_from(raw).map_err(|_| range_error(ty, raw))?
                    }
                };
                out.write_fixed(ticks);
            }
            Ok(())
        }

        SqlType::Decimal {
            precision,
            scale,
            width,
        } => {
            for value in values {
                let m = decimal_mantissa(value, *precision, *scale, ty)?;
                match width {
                    DecimalWidth::D32 => {
                        out.write_fixed(i32::try_from(m).map_err(|_| range_error(ty, value))?)
                    }
                    DecimalWidth::D64 => {
                        out.write_fixed(i64::try_from(m).map_err(|_| range_error(ty, value))?)
                    }
                    DecimalWidth::D128 => out.write_fixed(m),
                    DecimalWidth::D256 => out.put_slice(&I256::from(m).0),
                }
            }
            Ok(())
        }

        SqlType::Enum8(table) => {
            for value in values {
                out.write_fixed(enum_code(table, value, ty)?);
            }
            Ok(())
        }
        SqlType::Enum16(table) => {
            for value in values {
                out.write_fixed(enum_code(table, value, ty)?);
            }
            Ok(())
        }

        SqlType::Nullable(inner) => {
            for value in values {
                out.write_bool(value.is_null());
            }
            let placeholder = default_value(inner);
            let filled: Vec<&Value> = values
                .iter()
                .map(|v| if v.is_null() { &placeholder } else { *v })
                .collect();
            encode_refs(inner, &filled, out)
        }

        SqlType::Array(inner) => {
            let arrays = values
                .iter()
                .map(|v| match v {
                    Value::Array(items) => Ok(items),
                    other => Err(type_error(ty, other)),
                })
                .collect::<Result<Vec<_>>>()?;
            write_offsets(arrays.iter().map(|items| items.len()), out);
            let flat: Vec<&Value> = arrays.iter().flat_map(|items| items.iter()).collect();
            encode_refs(inner, &flat, out)
        }

        SqlType::Map(key, value_type) => {
            let maps = values
                .iter()
                .map(|v| match v {
                    Value::Map(entries) => Ok(entries),
                    other => Err(type_error(ty, other)),
                })
                .collect::<Result<Vec<_>>>()?;
            write_offsets(maps.iter().map(|entries| entries.len()), out);
            let keys: Vec<&Value> = maps.iter().flat_map(|e| e.iter().map(|(k, _)| k)).collect();
            let vals: Vec<&Value> = maps.iter().flat_map(|e| e.iter().map(|(_, v)| v)).collect();
            encode_refs(key, &keys, out)?;
            encode_refs(value_type, &vals, out)
        }

        SqlType::Tuple(elements) => {
            let tuples = values
                .iter()
                .map(|v| match v {
                    Value::Tuple(items) if items.len() == elements.len() => Ok(items),
                    other => Err(type_error(ty, other)),
                })
                .collect::<Result<Vec<_>>>()?;
            for (i, (_, element_type)) in elements.iter().enumerate() {
                let column: Vec<&Value> = tuples.iter().map(|items| &items[i]).collect();
                encode_refs(element_type, &column, out)?;
            }
            Ok(())
        }

        SqlType::LowCardinality(inner) => encode_low_cardinality(inner, values, out),
    }
}

fn encode_low_cardinality(inner: &SqlType, values: &[&Value], out: &mut BytesMut) -> Result<()> {
    let key_type = inner.non_nullable();
    if matches!(
        key_type,
        SqlType::Array(_) | SqlType::Tuple(_) | SqlType::Map(..) | SqlType::LowCardinality(_)
    ) {
        return Err(Error::UnsupportedType(format!(
            "LowCardinality({})",
            inner
        )));
    }
    let nullable = inner.is_nullable();

    // Keys of flat types concatenate, so each distinct encoding is one slot.
    let mut dictionary = BytesMut::new();
    let mut slots: HashMap<Vec<u8>, u64> = HashMap::new();
    let mut key_count = 0u64;
    if nullable {
        encode_refs(key_type, &[&default_value(key_type)], &mut dictionary)?;
        key_count = 1;
    }

    let mut scratch = BytesMut::new();
    let mut indices = Vec::with_capacity(values.len());
    for value in values {
        if nullable && value.is_null() {
            indices.push(0);
            continue;
        }
        scratch.clear();
        encode_refs(key_type, &[*value], &mut scratch)?;
        let index = match slots.get(&scratch[..]) {
            Some(index) => *index,
            None => {
                dictionary.extend_from_slice(&scratch);
                slots.insert(scratch.to_vec(), key_count);
                key_count += 1;
                key_count - 1
            }
        };
        indices.push(index);
    }

    let max_index = key_count.saturating_sub(1);
    let index_type: u64 = if max_index <= u64::from(u8::MAX) {
        0
    } else if max_index <= u64::from(u16::MAX) {
        1
    } else if max_index <= u64::from(u32::MAX) {
        2
    } else {
        3
    };

    out.write_fixed(index_type | HAS_ADDITIONAL_KEYS | NEED_UPDATE_DICTIONARY);
    out.write_fixed(key_count);
    out.put_slice(&dictionary);
    out.write_fixed(values.len() as u64);
    for index in indices {
        match index_type {
            0 => out.write_fixed(index as u8),
            1 => out.write_fixed(index as u16),
            2 => out.write_fixed(index as u32),
            _ => out.write_fixed(index),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn roundtrip(type_name: &str, values: Vec<Value>) -> Vec<Value> {
        let ty = SqlType::parse(type_name).unwrap();
        let ctx = ColumnContext::default();
        let mut buf = BytesMut::new();
        write_prefix(&ty, &mut buf);
        encode_column(&ty, &values, &mut buf).unwrap();

        let mut cursor: &[u8] = &buf;
        read_prefix(&ty, &mut cursor).unwrap();
        let decoded = decode_column(&ty, values.len(), &mut cursor, &ctx).unwrap();
        assert!(cursor.is_empty(), "{} left {} bytes", type_name, cursor.len());
        decoded
    }

    fn decode(type_name: &str, rows: usize, bytes: &[u8]) -> Result<Vec<Value>> {
        let ty = SqlType::parse(type_name).unwrap();
        let mut cursor = bytes;
        read_prefix(&ty, &mut cursor)?;
        decode_column(&ty, rows, &mut cursor, &ColumnContext::default())
    }

    #[test]
    fn test_integer_boundaries() {
        let values = vec![Value::Int8(i8::MIN), Value::Int8(0), Value::Int8(i8::MAX)];
        assert_eq!(roundtrip("Int8", values.clone()), values);

        let values = vec![Value::UInt64(0), Value::UInt64(u64::MAX)];
        assert_eq!(roundtrip("UInt64", values.clone()), values);

        let values = vec![Value::Int128(i128::MIN), Value::Int128(i128::MAX)];
        assert_eq!(roundtrip("Int128", values.clone()), values);

        let values = vec![Value::Int256(I256::from(-7i128)), Value::Int256(I256([0x7f; 32]))];
        assert_eq!(roundtrip("Int256", values.clone()), values);
    }

    #[test]
    fn test_integer_out_of_range_is_type_error() {
        let ty = SqlType::UInt8;
        let mut buf = BytesMut::new();
        let err = encode_column(&ty, &[Value::Int32(256)], &mut buf).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fixed_width_layout() {
        let mut buf = BytesMut::new();
        encode_column(&SqlType::UInt32, &[Value::UInt32(1), Value::UInt32(0x0102)], &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[1, 0, 0, 0, 0x02, 0x01, 0, 0]);
    }

    #[test]
    fn test_strings_and_fixed_strings() {
        let values = vec![Value::from(""), Value::from("ClickHouse"), Value::from("ü")];
        assert_eq!(roundtrip("String", values.clone()), values);

        // Invalid UTF-8 survives as raw bytes.
        let decoded = decode("String", 1, &[2, 0xff, 0xfe]).unwrap();
        assert_eq!(decoded, vec![Value::Bytes(vec![0xff, 0xfe])]);

        let decoded = roundtrip("FixedString(4)", vec![Value::from("ab")]);
        assert_eq!(decoded, vec![Value::Bytes(b"ab\0\0".to_vec())]);

        let mut buf = BytesMut::new();
        let too_long = encode_column(
            &SqlType::FixedString(2),
            &[Value::from("abc")],
            &mut buf,
        );
        assert!(matches!(too_long, Err(Error::Type(_))));
    }

    #[test]
    fn test_binary_column_through_typed_accessor() {
        let raw = bytes::Bytes::from_static(&[0x00, 0xff, 0x80, 0x01]);
        let decoded = roundtrip("String", vec![Value::from(raw.clone())]);
        assert_eq!(decoded, vec![Value::Bytes(raw.to_vec())]);
        let back: bytes::Bytes = decoded.into_iter().next().unwrap().get().unwrap();
        assert_eq!(back, raw);

        let decoded = roundtrip("FixedString(3)", vec![Value::from(&b"\x01\x02"[..])]);
        let back: bytes::Bytes = decoded.into_iter().next().unwrap().get().unwrap();
        assert_eq!(&back[..], b"\x01\x02\x00");
    }

    #[test]
    fn test_nullable_layout() {
        let ty = SqlType::parse("Nullable(String)").unwrap();
        let mut buf = BytesMut::new();
        encode_column(&ty, &[Value::from("a"), Value::Null], &mut buf).unwrap();
        // Null map, then both values with an empty placeholder.
        assert_eq!(&buf[..], &[0, 1, 1, b'a', 0]);

        let decoded = decode("Nullable(String)", 2, &buf).unwrap();
        assert_eq!(decoded, vec![Value::from("a"), Value::Null]);
    }

    #[test]
    fn test_nested_array_of_nullable() {
        let values = vec![
            Value::Array(vec![]),
            Value::Array(vec![Value::UInt8(1), Value::Null]),
            Value::Array(vec![Value::Null]),
        ];
        assert_eq!(roundtrip("Array(Nullable(UInt8))", values.clone()), values);

        let deep = vec![Value::Array(vec![
            Value::Array(vec![Value::from("x")]),
            Value::Array(vec![]),
        ])];
        assert_eq!(roundtrip("Array(Array(String))", deep.clone()), deep);
    }

    #[test]
    fn test_decreasing_offsets_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&[1, 2]);
        let err = decode("Array(UInt8)", 2, &bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedBlock(_)));
    }

    #[test]
    fn test_tuple_and_map() {
        let values = vec![
            Value::Tuple(vec![Value::Int32(-1), Value::from("a")]),
            Value::Tuple(vec![Value::Int32(2), Value::from("")]),
        ];
        assert_eq!(roundtrip("Tuple(a Int32, b String)", values.clone()), values);

        let maps = vec![
            Value::Map(vec![(Value::from("k1"), Value::UInt16(1)), (Value::from("k2"), Value::UInt16(2))]),
            Value::Map(vec![]),
        ];
        assert_eq!(roundtrip("Map(String, UInt16)", maps.clone()), maps);

        let mut buf = BytesMut::new();
        let wrong_arity = encode_column(
            &SqlType::parse("Tuple(UInt8, UInt8)").unwrap(),
            &[Value::Tuple(vec![Value::UInt8(1)])],
            &mut buf,
        );
        assert!(matches!(wrong_arity, Err(Error::Type(_))));
    }

    #[test]
    fn test_low_cardinality_wire_layout() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u64.to_le_bytes()); // key version
        bytes.extend_from_slice(&(HAS_ADDITIONAL_KEYS | NEED_UPDATE_DICTIONARY).to_le_bytes());
        bytes.extend_from_slice(&3u64.to_le_bytes());
        bytes.extend_from_slice(&[1, b'a', 1, b'b', 1, b'c']);
        bytes.extend_from_slice(&4u64.to_le_bytes());
        bytes.extend_from_slice(&[0, 1, 0, 2]);

        let decoded = decode("LowCardinality(String)", 4, &bytes).unwrap();
        let expected: Vec<Value> = ["a", "b", "a", "c"].iter().map(|s| Value::from(*s)).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_low_cardinality_thousand_rows_three_values() {
        let distinct = ["red", "green", "blue"];
        let values: Vec<Value> = (0..1000).map(|i| Value::from(distinct[i % 3])).collect();

        let ty = SqlType::parse("LowCardinality(String)").unwrap();
        let mut buf = BytesMut::new();
        write_prefix(&ty, &mut buf);
        encode_column(&ty, &values, &mut buf).unwrap();

        // prefix + flags + key count + keys + row count + one byte per index
        let keys_len: usize = distinct.iter().map(|s| s.len() + 1).sum();
        assert_eq!(buf.len(), 8 + 8 + 8 + keys_len + 8 + 1000);

        let mut cursor: &[u8] = &buf;
        read_prefix(&ty, &mut cursor).unwrap();
        let decoded = decode_column(&ty, 1000, &mut cursor, &ColumnContext::default()).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_low_cardinality_nullable_uses_slot_zero() {
        let values = vec![Value::from(""), Value::Null, Value::from("x"), Value::Null];
        assert_eq!(roundtrip("LowCardinality(Nullable(String))", values.clone()), values);
    }

    #[test]
    fn test_low_cardinality_row_count_mismatch() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&HAS_ADDITIONAL_KEYS.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&[1, b'a']);
        bytes.extend_from_slice(&5u64.to_le_bytes());
        bytes.extend_from_slice(&[0, 0]);

        let err = decode("LowCardinality(String)", 2, &bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedBlock(_)));
    }

    #[test]
    fn test_array_of_low_cardinality_nests_prefix() {
        let values = vec![
            Value::Array(vec![Value::from("a"), Value::from("a")]),
            Value::Array(vec![]),
        ];
        assert_eq!(roundtrip("Array(LowCardinality(String))", values.clone()), values);
    }

    #[test]
    fn test_enum_mapping() {
        let values = vec![Value::Enum("a".into()), Value::Enum("b".into())];
        assert_eq!(roundtrip("Enum8('a' = 1, 'b' = -2)", values.clone()), values);

        let err = decode("Enum8('a' = 1)", 1, &[7]).unwrap_err();
        match err {
            Error::UnknownEnumValue { value, .. } => assert_eq!(value, 7),
            other => panic!("unexpected error: {:?}", other),
        }

        let mut buf = BytesMut::new();
        let unknown = encode_column(
            &SqlType::parse("Enum16('x' = 1000)").unwrap(),
            &[Value::from("y")],
            &mut buf,
        );
        assert!(matches!(unknown, Err(Error::Type(_))));
    }

    #[test]
    fn test_dates() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        let before = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap();
        let values = vec![Value::Date(epoch), Value::Date(before)];
        assert_eq!(roundtrip("Date32", values.clone()), values);

        let mut buf = BytesMut::new();
        let err = encode_column(&SqlType::Date, &[Value::Date(before)], &mut buf);
        assert!(matches!(err, Err(Error::Type(_))));
    }

    #[test]
    fn test_datetime_uses_column_timezone() {
        let decoded = decode("DateTime('Asia/Tokyo')", 1, &0u32.to_le_bytes()).unwrap();
        match &decoded[0] {
            Value::DateTime(dt) => {
                assert_eq!(dt.timestamp(), 0);
                assert_eq!(dt.hour(), 9);
            }
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn test_datetime_falls_back_to_context_timezone() {
        let ty = SqlType::parse("DateTime").unwrap();
        let ctx = ColumnContext {
            timezone: chrono_tz::Europe::Berlin,
        };
        let mut cursor: &[u8] = &3600u32.to_le_bytes();
        let decoded = decode_column(&ty, 1, &mut cursor, &ctx).unwrap();
        match &decoded[0] {
            Value::DateTime(dt) => assert_eq!(dt.hour(), 2),
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn test_local_timezone_fallback_order() {
        let name = |s: &str| Some(s.to_string());
        assert_eq!(
            pick_timezone(name(":Europe/Berlin"), name("Asia/Tokyo")),
            Tz::Europe__Berlin
        );
        assert_eq!(
            pick_timezone(None, name("Asia/Tokyo")),
            Tz::Asia__Tokyo
        );
        // An unparseable TZ falls through to the system zone.
        assert_eq!(
            pick_timezone(name("Not/AZone"), name("America/New_York")),
            Tz::America__New_York
        );
        assert_eq!(pick_timezone(None, name("garbage")), Tz::UTC);
        assert_eq!(pick_timezone(None, None), Tz::UTC);
    }

    #[test]
    fn test_datetime64_sub_second_precision() {
        let utc = Tz::UTC;
        let values = vec![
            Value::DateTime(utc.timestamp_opt(1_700_000_000, 123_000_000).unwrap()),
            Value::DateTime(utc.timestamp_opt(-1, 500_000_000).unwrap()),
        ];
        assert_eq!(roundtrip("DateTime64(3, 'UTC')", values.clone()), values);

        // -0.5s is stored as -500 ticks.
        let ty = SqlType::parse("DateTime64(3)").unwrap();
        let mut buf = BytesMut::new();
        encode_column(&ty, &values[1..], &mut buf).unwrap();
        assert_eq!(&buf[..], &(-500i64).to_le_bytes());
    }

    #[test]
    fn test_decimals_keep_exact_scale() {
        let values = vec![
            Value::Decimal(Decimal::new(12345, 2)),
            Value::Decimal(Decimal::new(-1, 2)),
        ];
        assert_eq!(roundtrip("Decimal(9, 2)", values.clone()), values);

        let decoded = roundtrip("Decimal64(4)", vec![Value::from("1.5")]);
        assert_eq!(decoded, vec![Value::Decimal(Decimal::new(15000, 4))]);

        let mut buf = BytesMut::new();
        let lossy = encode_column(
            &SqlType::parse("Decimal(9, 1)").unwrap(),
            &[Value::Decimal(Decimal::new(155, 2))],
            &mut buf,
        );
        assert!(matches!(lossy, Err(Error::Type(_))));

        let wide = vec![Value::Decimal(Decimal::new(-10i128.pow(30), 10))];
        assert_eq!(roundtrip("Decimal256(10)", wide.clone()), wide);
    }

    #[test]
    fn test_uuid_and_ip_layout() {
        let uuid: Uuid = "00112233-4455-6677-8899-aabbccddeeff".parse().unwrap();
        let mut buf = BytesMut::new();
        encode_column(&SqlType::Uuid, &[Value::Uuid(uuid)], &mut buf).unwrap();
        assert_eq!(&buf[..8], &0x0011_2233_4455_6677u64.to_le_bytes());
        assert_eq!(roundtrip("UUID", vec![Value::Uuid(uuid)]), vec![Value::Uuid(uuid)]);

        let ips = vec![Value::IPv4(Ipv4Addr::new(192, 168, 0, 1))];
        assert_eq!(roundtrip("IPv4", ips.clone()), ips);
        let ips = vec![Value::IPv6(Ipv6Addr::LOCALHOST)];
        assert_eq!(roundtrip("IPv6", ips.clone()), ips);
    }

    #[test]
    fn test_truncated_column_data() {
        let err = decode("UInt32", 2, &[1, 0, 0, 0, 2]).unwrap_err();
        assert!(matches!(err, Error::TruncatedInput));
    }

    #[test]
    fn test_zero_rows_reads_nothing() {
        let decoded = decode("LowCardinality(String)", 0, &1u64.to_le_bytes()).unwrap();
        assert!(decoded.is_empty());
    }
}
