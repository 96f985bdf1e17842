//! Column type descriptors.
//!
//! The server names every column's type as a string such as
//! `Nullable(String)` or `DateTime64(3, 'Europe/Berlin')`. [`SqlType::parse`]
//! turns that string into a closed enum; the column codec dispatches on it.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Width of a decimal's underlying integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecimalWidth {
    D32,
    D64,
    D128,
    D256,
}

impl DecimalWidth {
    /// Width implied by a precision, as the server chooses it.
    pub fn for_precision(precision: u8) -> Result<Self> {
        match precision {
            1..=9 => Ok(DecimalWidth::D32),
            10..=18 => Ok(DecimalWidth::D64),
            19..=38 => Ok(DecimalWidth::D128),
            39..=76 => Ok(DecimalWidth::D256),
            _ => Err(Error::UnsupportedType(format!(
                "decimal precision {} out of range",
                precision
            ))),
        }
    }

    pub fn max_precision(self) -> u8 {
        match self {
            DecimalWidth::D32 => 9,
            DecimalWidth::D64 => 18,
            DecimalWidth::D128 => 38,
            DecimalWidth::D256 => 76,
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            DecimalWidth::D32 => 4,
            DecimalWidth::D64 => 8,
            DecimalWidth::D128 => 16,
            DecimalWidth::D256 => 32,
        }
    }
}

/// A parsed column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    UInt128,
    UInt256,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    Int256,
    Float32,
    Float64,
    Bool,
    String,
    FixedString(usize),
    Uuid,
    IPv4,
    IPv6,
    Date,
    Date32,
    DateTime(Option<String>),
    DateTime64(u8, Option<String>),
    Decimal {
        precision: u8,
        scale: u8,
        width: DecimalWidth,
    },
    Enum8(Vec<(String, i8)>),
    Enum16(Vec<(String, i16)>),
    Nothing,
    Nullable(Box<SqlType>),
    Array(Box<SqlType>),
    LowCardinality(Box<SqlType>),
    /// Elements with optional names (named tuples back `Nested`).
    Tuple(Vec<(Option<String>, SqlType)>),
    Map(Box<SqlType>, Box<SqlType>),
}

impl SqlType {
    /// Parse a type name as the server prints it.
    pub fn parse(input: &str) -> Result<SqlType> {
        let mut parser = Parser::new(input);
        let ty = parser.parse_type()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(parser.error("trailing characters"));
        }
        Ok(ty)
    }

    /// Whether NULL is a legal value of this type.
    pub fn is_nullable(&self) -> bool {
        matches!(self, SqlType::Nullable(_))
    }

    /// Strip one `Nullable` wrapper, if present.
    pub fn non_nullable(&self) -> &SqlType {
        match self {
            SqlType::Nullable(inner) => inner,
            other => other,
        }
    }

    /// Byte width of types stored as flat fixed-size records.
    pub fn fixed_size(&self) -> Option<usize> {
        let size = match self {
            SqlType::UInt8 | SqlType::Int8 | SqlType::Bool | SqlType::Nothing => 1,
            SqlType::UInt16 | SqlType::Int16 | SqlType::Date => 2,
            SqlType::UInt32
            | SqlType::Int32
            | SqlType::Float32
            | SqlType::Date32
            | SqlType::IPv4
            | SqlType::DateTime(_) => 4,
            SqlType::UInt64 | SqlType::Int64 | SqlType::Float64 | SqlType::DateTime64(..) => 8,
            SqlType::UInt128 | SqlType::Int128 | SqlType::Uuid | SqlType::IPv6 => 16,
            SqlType::UInt256 | SqlType::Int256 => 32,
            SqlType::FixedString(n) => *n,
            SqlType::Decimal { width, .. } => width.byte_size(),
            SqlType::Enum8(_) => 1,
            SqlType::Enum16(_) => 2,
            _ => return None,
        };
        Some(size)
    }
}

impl FromStr for SqlType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SqlType::parse(s)
    }
}

// ============================================================================
// Printing
// ============================================================================

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("'")?;
    for c in s.chars() {
        match c {
            '\'' => f.write_str("\\'")?,
            '\\' => f.write_str("\\\\")?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("'")
}

fn write_enum<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    items: &[(String, T)],
) -> fmt::Result {
    write!(f, "{}(", name)?;
    for (i, (label, value)) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write_quoted(f, label)?;
        write!(f, " = {}", value)?;
    }
    f.write_str(")")
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlType::UInt8 => f.write_str("UInt8"),
            SqlType::UInt16 => f.write_str("UInt16"),
            SqlType::UInt32 => f.write_str("UInt32"),
            SqlType::UInt64 => f.write_str("UInt64"),
            SqlType::UInt128 => f.write_str("UInt128"),
            SqlType::UInt256 => f.write_str("UInt256"),
            SqlType::Int8 => f.write_str("Int8"),
            SqlType::Int16 => f.write_str("Int16"),
            SqlType::Int32 => f.write_str("Int32"),
            SqlType::Int64 => f.write_str("Int64"),
            SqlType::Int128 => f.write_str("Int128"),
            SqlType::Int256 => f.write_str("Int256"),
            SqlType::Float32 => f.write_str("Float32"),
            SqlType::Float64 => f.write_str("Float64"),
            SqlType::Bool => f.write_str("Bool"),
            SqlType::String => f.write_str("String"),
            SqlType::FixedString(n) => write!(f, "FixedString({})", n),
            SqlType::Uuid => f.write_str("UUID"),
            SqlType::IPv4 => f.write_str("IPv4"),
            SqlType::IPv6 => f.write_str("IPv6"),
            SqlType::Date => f.write_str("Date"),
            SqlType::Date32 => f.write_str("Date32"),
            SqlType::DateTime(None) => f.write_str("DateTime"),
            SqlType::DateTime(Some(tz)) => {
                f.write_str("DateTime(")?;
                write_quoted(f, tz)?;
                f.write_str(")")
            }
            SqlType::DateTime64(precision, None) => write!(f, "DateTime64({})", precision),
            SqlType::DateTime64(precision, Some(tz)) => {
                write!(f, "DateTime64({}, ", precision)?;
                write_quoted(f, tz)?;
                f.write_str(")")
            }
            SqlType::Decimal {
                precision, scale, ..
            } => write!(f, "Decimal({}, {})", precision, scale),
            SqlType::Enum8(items) => write_enum(f, "Enum8", items),
            SqlType::Enum16(items) => write_enum(f, "Enum16", items),
            SqlType::Nothing => f.write_str("Nothing"),
            SqlType::Nullable(inner) => write!(f, "Nullable({})", inner),
            SqlType::Array(inner) => write!(f, "Array({})", inner),
            SqlType::LowCardinality(inner) => write!(f, "LowCardinality({})", inner),
            SqlType::Tuple(items) => {
                f.write_str("Tuple(")?;
                for (i, (name, ty)) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    if let Some(name) = name {
                        write!(f, "{} ", name)?;
                    }
                    write!(f, "{}", ty)?;
                }
                f.write_str(")")
            }
            SqlType::Map(key, value) => write!(f, "Map({}, {})", key, value),
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Recursive-descent parser over a type name.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, what: &str) -> Error {
        Error::UnsupportedType(format!(
            "{} at offset {} in '{}'",
            what, self.pos, self.input
        ))
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", expected)))
        }
    }

    fn ident(&mut self) -> Result<&'a str> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error("expected identifier"));
        }
        Ok(&self.input[start..self.pos])
    }

    fn integer(&mut self) -> Result<i64> {
        self.skip_ws();
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        self.input[start..self.pos]
            .parse()
            .map_err(|_| self.error("expected integer"))
    }

    fn small_uint<T: TryFrom<i64>>(&mut self) -> Result<T> {
        let value = self.integer()?;
        T::try_from(value).map_err(|_| self.error("integer out of range"))
    }

    fn quoted(&mut self) -> Result<String> {
        self.skip_ws();
        if self.peek() != Some('\'') {
            return Err(self.error("expected quoted string"));
        }
        self.pos += 1;
        let mut out = String::new();
        loop {
            let c = self.peek().ok_or_else(|| self.error("unterminated string"))?;
            self.pos += c.len_utf8();
            match c {
                '\'' => return Ok(out),
                '\\' => {
                    let escaped = self.peek().ok_or_else(|| self.error("dangling escape"))?;
                    self.pos += escaped.len_utf8();
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        '0' => '\0',
                        other => other,
                    });
                }
                c => out.push(c),
            }
        }
    }

    fn parse_type(&mut self) -> Result<SqlType> {
        let name = self.ident()?;
        let ty = match name {
            "UInt8" => SqlType::UInt8,
            "UInt16" => SqlType::UInt16,
            "UInt32" => SqlType::UInt32,
            "UInt64" => SqlType::UInt64,
            "UInt128" => SqlType::UInt128,
            "UInt256" => SqlType::UInt256,
            "Int8" => SqlType::Int8,
            "Int16" => SqlType::Int16,
            "Int32" => SqlType::Int32,
            "Int64" => SqlType::Int64,
            "Int128" => SqlType::Int128,
            "Int256" => SqlType::Int256,
            "Float32" => SqlType::Float32,
            "Float64" => SqlType::Float64,
            "Bool" => SqlType::Bool,
            "String" => SqlType::String,
            "UUID" => SqlType::Uuid,
            "IPv4" => SqlType::IPv4,
            "IPv6" => SqlType::IPv6,
            "Date" => SqlType::Date,
            "Date32" => SqlType::Date32,
            "Nothing" => SqlType::Nothing,
            "FixedString" => {
                self.expect('(')?;
                let n = self.small_uint::<usize>()?;
                self.expect(')')?;
                SqlType::FixedString(n)
            }
            "DateTime" => {
                if self.eat('(') {
                    let tz = self.quoted()?;
                    self.expect(')')?;
                    SqlType::DateTime(Some(tz))
                } else {
                    SqlType::DateTime(None)
                }
            }
            "DateTime64" => {
                self.expect('(')?;
                let precision = self.small_uint::<u8>()?;
                if precision > 9 {
                    return Err(self.error("DateTime64 precision above 9"));
                }
                let tz = if self.eat(',') {
                    Some(self.quoted()?)
                } else {
                    None
                };
                self.expect(')')?;
                SqlType::DateTime64(precision, tz)
            }
            "Decimal" => {
                self.expect('(')?;
                let precision = self.small_uint::<u8>()?;
                self.expect(',')?;
                let scale = self.small_uint::<u8>()?;
                self.expect(')')?;
                decimal(precision, scale, DecimalWidth::for_precision(precision)?)?
            }
            "Decimal32" | "Decimal64" | "Decimal128" | "Decimal256" => {
                let width = match name {
                    "Decimal32" => DecimalWidth::D32,
                    "Decimal64" => DecimalWidth::D64,
                    "Decimal128" => DecimalWidth::D128,
                    _ => DecimalWidth::D256,
                };
                self.expect('(')?;
                let scale = self.small_uint::<u8>()?;
                self.expect(')')?;
                decimal(width.max_precision(), scale, width)?
            }
            "Enum8" => SqlType::Enum8(self.enum_items()?),
            "Enum16" => SqlType::Enum16(self.enum_items()?),
            "Nullable" => SqlType::Nullable(Box::new(self.wrapped()?)),
            "Array" => SqlType::Array(Box::new(self.wrapped()?)),
            "LowCardinality" => SqlType::LowCardinality(Box::new(self.wrapped()?)),
            "Tuple" => {
                self.expect('(')?;
                let mut items = Vec::new();
                loop {
                    items.push(self.tuple_element()?);
                    if !self.eat(',') {
                        break;
                    }
                }
                self.expect(')')?;
                SqlType::Tuple(items)
            }
            "Nested" => {
                self.expect('(')?;
                let mut items = Vec::new();
                loop {
                    let field = self.ident()?.to_string();
                    items.push((Some(field), self.parse_type()?));
                    if !self.eat(',') {
                        break;
                    }
                }
                self.expect(')')?;
                SqlType::Array(Box::new(SqlType::Tuple(items)))
            }
            "Map" => {
                self.expect('(')?;
                let key = self.parse_type()?;
                self.expect(',')?;
                let value = self.parse_type()?;
                self.expect(')')?;
                SqlType::Map(Box::new(key), Box::new(value))
            }
            "SimpleAggregateFunction" => {
                self.expect('(')?;
                self.ident()?;
                self.expect(',')?;
                let inner = self.parse_type()?;
                self.expect(')')?;
                inner
            }
            other => {
                return Err(Error::UnsupportedType(format!(
                    "'{}' in '{}'",
                    other, self.input
                )))
            }
        };
        Ok(ty)
    }

    fn wrapped(&mut self) -> Result<SqlType> {
        self.expect('(')?;
        let inner = self.parse_type()?;
        self.expect(')')?;
        Ok(inner)
    }

    /// `name Type` or a bare `Type`.
    fn tuple_element(&mut self) -> Result<(Option<String>, SqlType)> {
        let save = self.pos;
        let first = self.ident()?;
        self.skip_ws();
        let next_is_type = matches!(self.peek(), Some(c) if c.is_ascii_alphabetic());
        if next_is_type {
            let name = first.to_string();
            return Ok((Some(name), self.parse_type()?));
        }
        self.pos = save;
        Ok((None, self.parse_type()?))
    }

    fn enum_items<T: TryFrom<i64>>(&mut self) -> Result<Vec<(String, T)>> {
        self.expect('(')?;
        let mut items = Vec::new();
        loop {
            let label = self.quoted()?;
            self.expect('=')?;
            let value = self.small_uint::<T>()?;
            items.push((label, value));
            if !self.eat(',') {
                break;
            }
        }
        self.expect(')')?;
        Ok(items)
    }
}

fn decimal(precision: u8, scale: u8, width: DecimalWidth) -> Result<SqlType> {
    if scale > precision {
        return Err(Error::UnsupportedType(format!(
            "decimal scale {} exceeds precision {}",
            scale, precision
        )));
    }
    Ok(SqlType::Decimal {
        precision,
        scale,
        width,
    })
}
