//! Error types for the native protocol driver.
//!
//! Errors split into two families. Fatal errors leave the position in the
//! byte stream unknown, so the connection must be closed. Recoverable errors
//! are cleanly framed (a server exception, a rejected call) and the
//! connection stays usable.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unexpected end of input")]
    TruncatedInput,

    #[error("Corrupt compressed frame: {0}")]
    CorruptFrame(String),

    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Unknown value {value} for {type_name}")]
    UnknownEnumValue { type_name: String, value: i16 },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{0}")]
    Server(ServerException),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Type conversion error: {0}")]
    Type(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the connection that produced this error must be discarded.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Server(_) | Error::Usage(_) | Error::Type(_))
    }

    /// The server exception, if this error carries one.
    pub fn server_exception(&self) -> Option<&ServerException> {
        match self {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An exception raised by the server, with its nested causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerException {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub stack_trace: String,
    pub nested: Option<Box<ServerException>>,
}

impl ServerException {
    /// Iterate over this exception and every nested cause, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &ServerException> {
        std::iter::successors(Some(self), |e| e.nested.as_deref())
    }
}

impl fmt::Display for ServerException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code: {}. {}: {}", self.code, self.name, self.message)?;
        let mut nested = self.nested.as_deref();
        while let Some(e) = nested {
            write!(f, "\nCaused by: Code: {}. {}: {}", e.code, e.name, e.message)?;
            nested = e.nested.as_deref();
        }
        Ok(())
    }
}
