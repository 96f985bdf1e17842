//! Native TCP protocol client.
//!
//! This module provides a columnar database client that:
//! - Speaks the binary native protocol directly over TCP
//! - Negotiates a protocol revision and gates wire fields on it
//! - Streams query results block by block
//! - Optionally compresses data blocks with LZ4 or ZSTD
//!
//! Architecture:
//! - `binary`: Varints, fixed-width integers and strings
//! - `compression`: Checksummed compressed frames and the codec table
//! - `types`: Column type descriptors
//! - `value`: Typed values exchanged with callers
//! - `column`: Per-type column encoding/decoding
//! - `block`: Blocks of named, typed columns
//! - `protocol`: Packet encoding/decoding in both directions
//! - `config`: Connection configuration
//! - `connection`: Connection state machine and query/insert API

pub mod binary;
pub mod block;
pub mod column;
pub mod compression;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod types;
pub mod value;


pub use block::{Block, BlockInfo, Column, ColumnInfo, Row};
pub use column::ColumnContext;
pub use compression::{Codec, CodecTable, Compression, CompressionMethod};
pub use config::ClientConfig;
pub use connection::{
    Connection, ConnectionState, QueryInfo, QueryOptions, QueryResult, QueryStream, ServerInfo,
    Transport,
};
pub use protocol::{ProfileInfo, Progress};
pub use types::{DecimalWidth, SqlType};
pub use value::{Decimal, FromValue, Value, I256, U256};
