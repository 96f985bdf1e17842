//! Typed values exchanged with callers.
//!
//! A column decodes into a `Vec<Value>`; inserts take rows of `Value`s. The
//! server's type metadata decides how a value is laid out on the wire, so
//! one `Value` variant may serve several column types (`Date` covers both
//! `Date` and `Date32`, `DateTime` covers both `DateTime` and `DateTime64`).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// 256-bit integers
// ============================================================================

/// Signed 256-bit integer kept as its little-endian wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct I256(pub [u8; 32]);

/// Unsigned 256-bit integer kept as its little-endian wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct U256(pub [u8; 32]);

impl From<i128> for I256 {
    fn from(v: i128) -> Self {
        let mut raw = if v < 0 { [0xff; 32] } else { [0u8; 32] };
        raw[..16].copy_from_slice(&v.to_le_bytes());
        I256(raw)
    }
}

impl I256 {
    /// The value as an i128, when it fits.
    pub fn to_i128(&self) -> Option<i128> {
        let low = i128::from_le_bytes(self.0[..16].try_into().ok()?);
        let fill = if low < 0 { 0xff } else { 0x00 };
        self.0[16..].iter().all(|b| *b == fill).then_some(low)
    }
}

impl From<u128> for U256 {
    fn from(v: u128) -> Self {
        let mut raw = [0u8; 32];
        raw[..16].copy_from_slice(&v.to_le_bytes());
        U256(raw)
    }
}

impl U256 {
    pub fn to_u128(&self) -> Option<u128> {
        let low = u128::from_le_bytes(self.0[..16].try_into().ok()?);
        self.0[16..].iter().all(|b| *b == 0).then_some(low)
    }
}

// ============================================================================
// Decimal
// ============================================================================

/// An exact decimal: `mantissa * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    mantissa: i128,
    scale: u8,
}

impl Decimal {
    pub fn new(mantissa: i128, scale: u8) -> Self {
        Self { mantissa, scale }
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// Re-express at `scale`, failing if digits would be lost or the
    /// mantissa overflows.
    pub fn rescale(&self, scale: u8) -> Option<Decimal> {
        if scale >= self.scale {
            let factor = 10i128.checked_pow(u32::from(scale - self.scale))?;
            let mantissa = self.mantissa.checked_mul(factor)?;
            Some(Decimal::new(mantissa, scale))
        } else {
            let factor = 10i128.checked_pow(u32::from(self.scale - scale))?;
            (self.mantissa % factor == 0).then(|| Decimal::new(self.mantissa / factor, scale))
        }
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.mantissa.unsigned_abs().to_string();
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let scale = self.scale as usize;
        if scale == 0 {
            return write!(f, "{}{}", sign, digits);
        }
        let padded = format!("{:0>width$}", digits, width = scale + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{}{}.{}", sign, int_part, frac_part)
    }
}

impl FromStr for Decimal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Type(format!("invalid decimal literal '{}'", s));
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let scale = u8::try_from(frac_part.len()).map_err(|_| invalid())?;
        let digits = format!("{}{}", int_part, frac_part);
        let magnitude: i128 = digits.parse().map_err(|_| invalid())?;
        let mantissa = if negative { -magnitude } else { magnitude };
        Ok(Decimal::new(mantissa, scale))
    }
}

// ============================================================================
// Value
// ============================================================================

/// One cell of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    UInt128(u128),
    UInt256(U256),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    Int256(I256),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    String(String),
    /// Non-UTF-8 strings and every `FixedString`.
    Bytes(Vec<u8>),
    Uuid(Uuid),
    IPv4(Ipv4Addr),
    IPv6(Ipv6Addr),
    Date(NaiveDate),
    DateTime(DateTime<Tz>),
    Decimal(Decimal),
    /// Enum label.
    Enum(String),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short variant name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::UInt8(_) => "UInt8",
            Value::UInt16(_) => "UInt16",
            Value::UInt32(_) => "UInt32",
            Value::UInt64(_) => "UInt64",
            Value::UInt128(_) => "UInt128",
            Value::UInt256(_) => "UInt256",
            Value::Int8(_) => "Int8",
            Value::Int16(_) => "Int16",
            Value::Int32(_) => "Int32",
            Value::Int64(_) => "Int64",
            Value::Int128(_) => "Int128",
            Value::Int256(_) => "Int256",
            Value::Float32(_) => "Float32",
            Value::Float64(_) => "Float64",
            Value::Bool(_) => "Bool",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::Uuid(_) => "UUID",
            Value::IPv4(_) => "IPv4",
            Value::IPv6(_) => "IPv6",
            Value::Date(_) => "Date",
            Value::DateTime(_) => "DateTime",
            Value::Decimal(_) => "Decimal",
            Value::Enum(_) => "Enum",
            Value::Array(_) => "Array",
            Value::Tuple(_) => "Tuple",
            Value::Map(_) => "Map",
        }
    }

    /// Any integer-like value widened to i128.
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::UInt8(v) => Some(v.into()),
            Value::UInt16(v) => Some(v.into()),
            Value::UInt32(v) => Some(v.into()),
            Value::UInt64(v) => Some(v.into()),
            Value::UInt128(v) => i128::try_from(v).ok(),
            Value::UInt256(v) => v.to_u128().and_then(|v| i128::try_from(v).ok()),
            Value::Int8(v) => Some(v.into()),
            Value::Int16(v) => Some(v.into()),
            Value::Int32(v) => Some(v.into()),
            Value::Int64(v) => Some(v.into()),
            Value::Int128(v) => Some(v),
            Value::Int256(v) => v.to_i128(),
            Value::Bool(v) => Some(v.into()),
            _ => None,
        }
    }

    /// Any non-negative integer-like value widened to u128.
    pub fn as_u128(&self) -> Option<u128> {
        match *self {
            Value::UInt128(v) => Some(v),
            Value::UInt256(v) => v.to_u128(),
            _ => self.as_i128().and_then(|v| u128::try_from(v).ok()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(v) => Some(v.into()),
            Value::Float64(v) => Some(v),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    /// String-like content as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) | Value::Enum(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Enum(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Convert into a Rust type.
    pub fn get<T: FromValue>(self) -> Result<T> {
        T::from_value(self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::UInt8(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::UInt128(v) => write!(f, "{}", v),
            Value::UInt256(v) => match v.to_u128() {
                Some(n) => write!(f, "{}", n),
                None => write!(f, "{:?}", v),
            },
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Int128(v) => write!(f, "{}", v),
            Value::Int256(v) => match v.to_i128() {
                Some(n) => write!(f, "{}", n),
                None => write!(f, "{:?}", v),
            },
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::String(s) | Value::Enum(s) => f.write_str(s),
            Value::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::IPv4(ip) => write!(f, "{}", ip),
            Value::IPv6(ip) => write!(f, "{}", ip),
            Value::Date(d) => write!(f, "{}", d),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Array(items) | Value::Tuple(items) => {
                let (open, close) = if matches!(self, Value::Array(_)) {
                    ("[", "]")
                } else {
                    ("(", ")")
                };
                f.write_str(open)?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(close)
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

// ============================================================================
// Conversions into Value
// ============================================================================

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                #[inline]
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from!(
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    u128 => UInt128,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    i128 => Int128,
    f32 => Float32,
    f64 => Float64,
    bool => Bool,
    String => String,
    Uuid => Uuid,
    Ipv4Addr => IPv4,
    Ipv6Addr => IPv6,
    NaiveDate => Date,
    DateTime<Tz> => DateTime,
    Decimal => Decimal,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// Raw bytes. `Vec<u8>` converts to an array of `UInt8` instead.
impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// Conversions out of Value
// ============================================================================

/// Types that can be extracted from a decoded [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch<T>(value: &Value, target: &str) -> Result<T> {
    Err(Error::Type(format!(
        "cannot convert {} to {}",
        value.kind(),
        target
    )))
}

macro_rules! from_value_int {
    ($($t:ty),* $(,)?) => {
        $(
            impl FromValue for $t {
                fn from_value(value: Value) -> Result<Self> {
                    match value.as_i128() {
                        Some(v) => <$t>::try_from(v).map_err(|_| {
                            Error::Type(format!("{} out of range for {}", v, stringify!($t)))
                        }),
                        None => mismatch(&value, stringify!($t)),
                    }
                }
            }
        )*
    };
}

from_value_int!(u8, u16, u32, u64, i8, i16, i32, i64, i128);

impl FromValue for u128 {
    fn from_value(value: Value) -> Result<Self> {
        match value.as_u128() {
            Some(v) => Ok(v),
            None => mismatch(&value, "u128"),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value.as_f64() {
            Some(v) => Ok(v),
            None => mismatch(&value, "f64"),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Float32(v) => Ok(v),
            other => mismatch(&other, "f32"),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(v),
            Value::UInt8(v) => Ok(v != 0),
            other => mismatch(&other, "bool"),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) | Value::Enum(s) => Ok(s),
            Value::Bytes(b) => {
                String::from_utf8(b).map_err(|e| Error::Type(format!("invalid UTF-8: {}", e)))
            }
            other => mismatch(&other, "String"),
        }
    }
}

impl FromValue for Bytes {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(Bytes::from(b)),
            Value::String(s) => Ok(Bytes::from(s.into_bytes())),
            other => mismatch(&other, "Bytes"),
        }
    }
}

macro_rules! from_value_variant {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromValue for $t {
                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => mismatch(&other, stringify!($t)),
                    }
                }
            }
        )*
    };
}

from_value_variant!(
    Uuid => Uuid,
    Ipv4Addr => IPv4,
    Ipv6Addr => IPv6,
    NaiveDate => Date,
    DateTime<Tz> => DateTime,
    Decimal => Decimal,
);

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            other => mismatch(&other, "Vec"),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i256_sign_extension() {
        let neg = I256::from(-5i128);
        assert_eq!(neg.0[31], 0xff);
        assert_eq!(neg.to_i128(), Some(-5));

        let mut big = I256::from(1i128);
        big.0[20] = 1;
        assert_eq!(big.to_i128(), None);

        assert_eq!(U256::from(u128::MAX).to_u128(), Some(u128::MAX));
    }

    #[test]
    fn test_decimal_display_and_parse() {
        assert_eq!(Decimal::new(12345, 2).to_string(), "123.45");
        assert_eq!(Decimal::new(-5, 3).to_string(), "-0.005");
        assert_eq!(Decimal::new(7, 0).to_string(), "7");

        let parsed: Decimal = "-0.005".parse().unwrap();
        assert_eq!(parsed, Decimal::new(-5, 3));
        assert!("1.2.3".parse::<Decimal>().is_err());
        assert!("".parse::<Decimal>().is_err());
    }

    #[test]
    fn test_decimal_rescale_is_exact() {
        let d = Decimal::new(150, 2); // 1.50
        assert_eq!(d.rescale(4), Some(Decimal::new(15000, 4)));
        assert_eq!(d.rescale(1), Some(Decimal::new(15, 1)));
        assert_eq!(Decimal::new(151, 2).rescale(1), None);
    }

    #[test]
    fn test_integer_conversions() {
        assert_eq!(Value::UInt8(200).get::<i64>().unwrap(), 200);
        assert!(Value::Int64(-1).get::<u32>().is_err());
        assert_eq!(Value::UInt128(u128::MAX).get::<u128>().unwrap(), u128::MAX);
        assert!(Value::String("x".into()).get::<i32>().is_err());
    }

    #[test]
    fn test_option_and_vec_conversions() {
        assert_eq!(Value::Null.get::<Option<String>>().unwrap(), None);
        assert_eq!(
            Value::String("a".into()).get::<Option<String>>().unwrap(),
            Some("a".to_string())
        );

        let arr = Value::from(vec![1u32, 2, 3]);
        assert_eq!(arr.get::<Vec<u64>>().unwrap(), vec![1, 2, 3]);
        assert_eq!(Value::from(None::<u8>), Value::Null);
    }

    #[test]
    fn test_raw_bytes_conversions() {
        let raw = Value::from(Bytes::from_static(b"\x00\xffab"));
        assert_eq!(raw, Value::Bytes(vec![0x00, 0xff, b'a', b'b']));
        assert_eq!(raw.get::<Bytes>().unwrap(), Bytes::from_static(b"\x00\xffab"));
        assert_eq!(Value::from(&b"xy"[..]), Value::Bytes(b"xy".to_vec()));
        assert_eq!(Value::from("hi").get::<Bytes>().unwrap(), Bytes::from_static(b"hi"));
        assert!(Value::UInt8(1).get::<Bytes>().is_err());

        // A byte vector is an array of UInt8, not raw bytes.
        assert_eq!(
            Value::from(vec![1u8, 2]),
            Value::Array(vec![Value::UInt8(1), Value::UInt8(2)])
        );
        assert_eq!(Value::from(vec![1u8, 2]).get::<Vec<u8>>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_display() {
        let v = Value::Array(vec![Value::UInt8(1), Value::Null]);
        assert_eq!(v.to_string(), "[1, NULL]");
        let t = Value::Tuple(vec![Value::from("a"), Value::Decimal(Decimal::new(5, 1))]);
        assert_eq!(t.to_string(), "(a, 0.5)");
    }
}
