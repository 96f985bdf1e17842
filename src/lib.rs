//! chnative - an async client for the columnar database native TCP protocol.
//!
//! ```no_run
//! use chnative::{ClientConfig, Connection};
//!
//! # async fn run() -> chnative::Result<()> {
//! let mut conn = Connection::connect(ClientConfig::localhost()).await?;
//! let result = conn.query("SELECT number FROM system.numbers LIMIT 3").await?;
//! for row in result.into_rows() {
//!     let n: u64 = row.get(0)?;
//!     println!("{n}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod native;

pub use error::{Error, Result, ServerException};
pub use native::{
    Block, ClientConfig, ColumnInfo, CompressionMethod, Connection, ConnectionState, QueryOptions,
    QueryResult, QueryStream, Row, SqlType, Value,
};
