//! Native protocol connection.
//!
//! This module provides the connection type that handles:
//! - TCP connection establishment (or any caller-supplied byte stream)
//! - Hello exchange and revision negotiation
//! - Queries with streamed results
//! - Bulk inserts
//! - Cancellation and ping
//!
//! One connection serves one caller at a time: every operation takes
//! `&mut self`, so operations can never interleave on the same socket.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use futures::{FutureExt, Stream};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::block::{Block, ColumnInfo, Row};
use super::column::ColumnContext;
use super::compression::{CodecTable, Compression, CompressionMethod};
use super::config::ClientConfig;
use super::binary::SliceReader;
use super::protocol::*;
use super::value::Value;
use crate::error::{Error, Result};

/// Initial capacity of the read buffer and the size of each read.
const READ_CHUNK: usize = 32 * 1024;

/// Upper bound on bytes pulled in one pass of non-blocking reads.
const MAX_READ_AHEAD: usize = 4 * 1024 * 1024;

/// How long a partial packet waits for more bytes before it is decoded
/// short of its growth goal.
const IDLE_GRACE: Duration = Duration::from_millis(2);

/// Oldest server revision this client talks to.
const MIN_SERVER_REVISION: u64 = revision::SERVER_TIMEZONE;

/// Query text longer than this is cut in log events.
const LOGGED_QUERY_CHARS: usize = 200;

// ============================================================================
// Transport
// ============================================================================

/// A bidirectional byte stream the connection can run over.
///
/// Implemented for every tokio stream; TLS wrappers and in-memory pipes
/// qualify as long as they are `Unpin + Send`.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout),
        },
        None => fut.await.map_err(Error::from),
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Phase of the connection's request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Idle,
    /// Query sent, no result packet seen yet.
    AwaitingQueryResponse,
    StreamingResult,
    /// INSERT accepted; the caller owes Data packets and a terminator.
    SendingData,
    /// Stream position unknown. Only `reconnect` leaves this state.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the server told us about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub version_patch: u64,
    /// The server's own revision, before negotiation.
    pub revision: u64,
    pub timezone: Option<String>,
    pub display_name: Option<String>,
}

impl From<ServerHello> for ServerInfo {
    fn from(hello: ServerHello) -> Self {
        Self {
            name: hello.name,
            version_major: hello.version_major,
            version_minor: hello.version_minor,
            version_patch: hello.version_patch,
            revision: hello.revision,
            timezone: hello.timezone.filter(|tz| !tz.is_empty()),
            display_name: hello.display_name.filter(|name| !name.is_empty()),
        }
    }
}

/// Side-channel information accumulated while a query runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryInfo {
    pub query_id: String,
    pub progress: Progress,
    pub profile: Option<ProfileInfo>,
    pub totals: Option<Block>,
    pub extremes: Option<Block>,
}

/// Per-query options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Defaults to a random UUID.
    pub query_id: Option<String>,
    /// Merged over the connection's settings.
    pub settings: Vec<(String, String)>,
    /// Values for `{name:Type}` placeholders.
    pub parameters: Vec<(String, String)>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    pub fn with_setting(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.push((name.into(), value.into()));
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.parameters.push((name.into(), value.to_string()));
        self
    }
}

/// A fully collected query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    /// Non-empty data blocks in arrival order.
    pub blocks: Vec<Block>,
    /// Total row count over all blocks.
    pub rows: usize,
    pub info: QueryInfo,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.blocks.into_iter().flat_map(Block::into_rows).collect()
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A native protocol connection.
pub struct Connection {
    reader: BufReader<ReadHalf<BoxedTransport>>,
    writer: BufWriter<WriteHalf<BoxedTransport>>,
    config: ClientConfig,
    codecs: Arc<CodecTable>,
    /// Set when blocks are framed.
    compression: Option<Compression>,
    state: ConnectionState,
    server: Option<ServerInfo>,
    /// Negotiated revision.
    revision: u64,
    column_ctx: ColumnContext,
    /// Bytes received but not yet decoded.
    read_buffer: BytesMut,
    partial: PartialPacket,
    /// Info of the current or most recent query.
    info: QueryInfo,
    /// Column layout the server expects for the pending INSERT.
    insert_header: Option<Vec<ColumnInfo>>,
    os_user: String,
    client_hostname: String,
}

impl Connection {
    /// Connect over TCP using the standard codec table.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::connect_with_codecs(config, Arc::new(CodecTable::standard())).await
    }

    /// Connect over TCP with an explicit codec table.
    pub async fn connect_with_codecs(config: ClientConfig, codecs: Arc<CodecTable>) -> Result<Self> {
        let stream = open_tcp(&config).await?;
        Self::establish(Box::new(stream), config, codecs).await
    }

    /// Run the protocol over a caller-supplied stream.
    pub async fn connect_with_stream<S: Transport + 'static>(
        stream: S,
        config: ClientConfig,
    ) -> Result<Self> {
        Self::establish(Box::new(stream), config, Arc::new(CodecTable::standard())).await
    }

    pub async fn connect_with_stream_and_codecs<S: Transport + 'static>(
        stream: S,
        config: ClientConfig,
        codecs: Arc<CodecTable>,
    ) -> Result<Self> {
        Self::establish(Box::new(stream), config, codecs).await
    }

    async fn establish(
        stream: BoxedTransport,
        config: ClientConfig,
        codecs: Arc<CodecTable>,
    ) -> Result<Self> {
        let compression = match config.compression {
            CompressionMethod::None => None,
            method => Some(Compression::new(method, Arc::clone(&codecs))?),
        };
        let (read_half, write_half) = tokio::io::split(stream);

        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            config,
            codecs,
            compression,
            state: ConnectionState::Disconnected,
            server: None,
            revision: revision::CLIENT_REVISION,
            column_ctx: ColumnContext::default(),
            read_buffer: BytesMut::with_capacity(READ_CHUNK),
            partial: PartialPacket::default(),
            info: QueryInfo::default(),
            insert_header: None,
            os_user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_default(),
            client_hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        conn.handshake().await?;
        Ok(conn)
    }

    /// Exchange Hello packets and negotiate the revision.
    async fn handshake(&mut self) -> Result<()> {
        self.state = ConnectionState::Handshaking;
        self.revision = revision::CLIENT_REVISION;

        let hello = ClientPacket::Hello(ClientHello {
            client_name: self.config.client_name.clone(),
            version_major: client_version(env!("CARGO_PKG_VERSION_MAJOR")),
            version_minor: client_version(env!("CARGO_PKG_VERSION_MINOR")),
            protocol_revision: revision::CLIENT_REVISION,
            database: self.config.database.clone(),
            user: self.config.user.clone(),
            password: self.config.password.clone(),
        });
        self.send_packet(&hello).await?;

        let hello = match self.receive_packet().await? {
            ServerPacket::Hello(hello) => hello,
            ServerPacket::Exception(e) => {
                self.state = ConnectionState::Error;
                return Err(Error::Handshake(e.to_string()));
            }
            other => {
                return Err(self.poison(Error::ProtocolViolation(format!(
                    "expected Hello, got {}",
                    other.name()
                ))))
            }
        };

        if hello.revision < MIN_SERVER_REVISION {
            self.state = ConnectionState::Error;
            return Err(Error::Handshake(format!(
                "server revision {} is older than the minimum {}",
                hello.revision, MIN_SERVER_REVISION
            )));
        }
        self.revision = hello.revision.min(revision::CLIENT_REVISION);

        let server = ServerInfo::from(hello);
        let server_tz = server.timezone.as_deref().and_then(|name| match name.parse() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!(timezone = name, "unknown server timezone, using local zone");
                None
            }
        });
        self.column_ctx = ColumnContext::new(server_tz);

        if self.revision >= revision::HELLO_ADDENDUM {
            let mut buf = BytesMut::new();
            encode_hello_addendum(&self.config.quota_key, &mut buf);
            self.write_bytes(buf).await?;
        }

        info!(
            server = %server.name,
            version = %format_args!("{}.{}.{}", server.version_major, server.version_minor, server.version_patch),
            revision = self.revision,
            "connected"
        );
        self.server = Some(server);
        self.state = ConnectionState::Idle;
        Ok(())
    }

    /// Drop the current stream, open a new TCP connection and handshake again.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.state = ConnectionState::Disconnected;
        let stream: BoxedTransport = Box::new(open_tcp(&self.config).await?);
        let (read_half, write_half) = tokio::io::split(stream);
        self.reader = BufReader::new(read_half);
        self.writer = BufWriter::new(write_half);
        self.read_buffer.clear();
        self.partial = PartialPacket::default();
        self.server = None;
        self.insert_header = None;
        self.info = QueryInfo::default();
        self.handshake().await
    }

    /// Close the connection. Pending results are abandoned.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }
        self.state = ConnectionState::Disconnected;
        self.read_buffer.clear();
        self.partial = PartialPacket::default();
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "shutdown failed");
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a query and collect every result block.
    pub async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        self.query_with_options(sql, QueryOptions::default()).await
    }

    pub async fn query_with_options(
        &mut self,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryResult> {
        let mut stream = self.query_stream_with_options(sql, options).await?;
        let mut blocks = Vec::new();
        let mut rows = 0;
        while let Some(block) = stream.next_block().await? {
            rows += block.num_rows();
            blocks.push(block);
        }
        let columns = stream.columns().map(<[ColumnInfo]>::to_vec).unwrap_or_default();
        Ok(QueryResult {
            columns,
            blocks,
            rows,
            info: self.info.clone(),
        })
    }

    /// Start a query whose results are pulled block by block.
    pub async fn query_stream(&mut self, sql: &str) -> Result<QueryStream<'_>> {
        self.query_stream_with_options(sql, QueryOptions::default()).await
    }

    pub async fn query_stream_with_options(
        &mut self,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryStream<'_>> {
        self.send_query(sql, options).await?;
        Ok(QueryStream {
            conn: self,
            columns: None,
            pending: VecDeque::new(),
            done: false,
        })
    }

    async fn send_query(&mut self, sql: &str, options: QueryOptions) -> Result<()> {
        self.ensure_idle()?;

        let query_id = options
            .query_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut settings = self.config.settings.clone();
        for (name, value) in options.settings {
            match settings.iter_mut().find(|(n, _)| *n == name) {
                Some(existing) => existing.1 = value,
                None => settings.push((name, value)),
            }
        }

        let packet = ClientPacket::Query(Box::new(QueryPacket {
            query_id: query_id.clone(),
            client_info: self.client_info(),
            settings,
            stage: STAGE_COMPLETE,
            compression: self.compression.is_some(),
            query: sql.to_string(),
            parameters: options.parameters,
        }));

        // The empty Data block ends the (absent) external tables.
        let mut buf = BytesMut::new();
        let ctx = self.protocol_context();
        packet.encode(&ctx, &mut buf)?;
        ClientPacket::Data(DataPacket::default()).encode(&ctx, &mut buf)?;

        debug!(
            query_id = %query_id,
            query = %sql.chars().take(LOGGED_QUERY_CHARS).collect::<String>(),
            "sending query"
        );
        self.info = QueryInfo {
            query_id,
            ..QueryInfo::default()
        };
        self.write_bytes(buf).await?;
        self.state = ConnectionState::AwaitingQueryResponse;
        Ok(())
    }

    fn client_info(&self) -> ClientInfo {
        let start_time_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        ClientInfo {
            initial_user: String::new(),
            initial_query_id: String::new(),
            initial_address: "0.0.0.0:0".to_string(),
            initial_query_start_time_us: start_time_us,
            os_user: self.os_user.clone(),
            client_hostname: self.client_hostname.clone(),
            client_name: self.config.client_name.clone(),
            version_major: client_version(env!("CARGO_PKG_VERSION_MAJOR")),
            version_minor: client_version(env!("CARGO_PKG_VERSION_MINOR")),
            version_patch: client_version(env!("CARGO_PKG_VERSION_PATCH")),
            protocol_revision: revision::CLIENT_REVISION,
            quota_key: self.config.quota_key.clone(),
            distributed_depth: 0,
        }
    }

    /// Pull the next Data block of the running query.
    ///
    /// Returns `None` at EndOfStream. Side-channel packets are absorbed into
    /// [`QueryInfo`] on the way.
    async fn next_result_block(&mut self) -> Result<Option<Block>> {
        if !matches!(
            self.state,
            ConnectionState::AwaitingQueryResponse | ConnectionState::StreamingResult
        ) {
            return Ok(None);
        }

        loop {
            let packet = self.receive_packet().await?;
            match self.absorb(packet) {
                None => continue,
                Some(ServerPacket::Data(data)) => {
                    self.state = ConnectionState::StreamingResult;
                    return Ok(Some(data.block));
                }
                Some(ServerPacket::EndOfStream) => {
                    self.state = ConnectionState::Idle;
                    return Ok(None);
                }
                Some(ServerPacket::Exception(e)) => {
                    self.state = ConnectionState::Idle;
                    debug!(code = e.code, "query failed on server");
                    return Err(Error::Server(e));
                }
                Some(other) => return Err(self.unexpected(&other)),
            }
        }
    }

    // ========================================================================
    // Inserts
    // ========================================================================

    /// Run an INSERT, sending `rows` in blocks of `insert_block_size`.
    ///
    /// `sql` is the statement without data, e.g. `INSERT INTO t (a, b) VALUES`.
    /// Returns the number of rows sent.
    pub async fn insert<I>(&mut self, sql: &str, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let header = self.begin_insert(sql).await?;
        let block_size = self.config.insert_block_size.max(1);
        let mut rows = rows.into_iter();
        let mut written = 0u64;

        loop {
            let chunk: Vec<Vec<Value>> = rows.by_ref().take(block_size).collect();
            if chunk.is_empty() {
                break;
            }
            let count = chunk.len() as u64;
            let sent = match Block::from_rows(&header, chunk) {
                Ok(block) => self.send_block(block).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                return Err(self.abort_insert(e).await);
            }
            written += count;
        }

        self.finish_insert().await?;
        Ok(written)
    }

    /// Send an INSERT statement and wait for the server's column layout.
    pub async fn begin_insert(&mut self, sql: &str) -> Result<Vec<ColumnInfo>> {
        self.send_query(sql, QueryOptions::default()).await?;

        loop {
            let packet = self.receive_packet().await?;
            match self.absorb(packet) {
                None => continue,
                Some(ServerPacket::Data(data)) => {
                    let header = data.block.column_infos();
                    debug!(columns = header.len(), "insert accepted");
                    self.insert_header = Some(header.clone());
                    self.state = ConnectionState::SendingData;
                    return Ok(header);
                }
                Some(ServerPacket::Exception(e)) => {
                    self.state = ConnectionState::Idle;
                    return Err(Error::Server(e));
                }
                Some(ServerPacket::EndOfStream) => {
                    self.state = ConnectionState::Idle;
                    return Err(Error::Usage(
                        "statement finished without requesting data; not an INSERT".to_string(),
                    ));
                }
                Some(other) => return Err(self.unexpected(&other)),
            }
        }
    }

    /// Send one block of the pending INSERT. Empty blocks are skipped.
    pub async fn send_block(&mut self, block: Block) -> Result<()> {
        if self.state != ConnectionState::SendingData {
            return Err(Error::Usage(format!(
                "no insert is pending (connection is {})",
                self.state
            )));
        }
        if block.is_empty() {
            return Ok(());
        }
        if let Some(header) = &self.insert_header {
            check_insert_layout(header, &block)?;
        }

        let mut buf = BytesMut::new();
        ClientPacket::Data(DataPacket::new(block)).encode(&self.protocol_context(), &mut buf)?;
        trace!(bytes = buf.len(), "sending insert block");
        self.write_bytes(buf).await
    }

    /// Terminate the pending INSERT and wait for the server to commit it.
    pub async fn finish_insert(&mut self) -> Result<()> {
        if self.state != ConnectionState::SendingData {
            return Err(Error::Usage(format!(
                "no insert is pending (connection is {})",
                self.state
            )));
        }

        let mut buf = BytesMut::new();
        ClientPacket::Data(DataPacket::default()).encode(&self.protocol_context(), &mut buf)?;
        self.write_bytes(buf).await?;
        self.insert_header = None;
        self.state = ConnectionState::AwaitingQueryResponse;

        loop {
            let packet = self.receive_packet().await?;
            match self.absorb(packet) {
                None => continue,
                Some(ServerPacket::EndOfStream) => {
                    self.state = ConnectionState::Idle;
                    debug!(
                        rows = self.info.progress.written_rows,
                        "insert committed"
                    );
                    return Ok(());
                }
                Some(ServerPacket::Exception(e)) => {
                    self.state = ConnectionState::Idle;
                    return Err(Error::Server(e));
                }
                Some(other) => return Err(self.unexpected(&other)),
            }
        }
    }

    /// Cancel an insert after a recoverable failure, returning `err`.
    async fn abort_insert(&mut self, err: Error) -> Error {
        if self.state == ConnectionState::SendingData {
            if let Err(cancel_err) = self.cancel().await {
                return cancel_err;
            }
        }
        err
    }

    // ========================================================================
    // Cancel and ping
    // ========================================================================

    /// Cancel the running query or insert.
    ///
    /// Sends Cancel and drains packets up to EndOfStream or Exception so the
    /// stream stays aligned. A server exception caused by the cancel is
    /// swallowed. Does nothing when no query is running.
    pub async fn cancel(&mut self) -> Result<()> {
        if !self.is_query_executing() {
            return Ok(());
        }

        info!(query_id = %self.info.query_id, "cancelling query");
        self.send_packet(&ClientPacket::Cancel).await?;
        self.insert_header = None;

        loop {
            match self.receive_packet().await? {
                ServerPacket::EndOfStream => break,
                ServerPacket::Exception(e) => {
                    debug!(code = e.code, "cancelled query ended with exception");
                    break;
                }
                ServerPacket::Hello(_) | ServerPacket::Pong => {
                    return Err(self.poison(Error::ProtocolViolation(
                        "unexpected packet while draining".to_string(),
                    )))
                }
                _ => {}
            }
        }
        self.state = ConnectionState::Idle;
        Ok(())
    }

    /// Check liveness. Only valid while idle.
    pub async fn ping(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.send_packet(&ClientPacket::Ping).await?;

        loop {
            let packet = self.receive_packet().await?;
            match self.absorb(packet) {
                None => continue,
                Some(ServerPacket::Pong) => return Ok(()),
                Some(other) => return Err(self.unexpected(&other)),
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a query or insert is in flight.
    pub fn is_query_executing(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::AwaitingQueryResponse
                | ConnectionState::StreamingResult
                | ConnectionState::SendingData
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Error
        )
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server.as_ref()
    }

    /// Negotiated protocol revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Info of the current or most recent query.
    pub fn query_info(&self) -> &QueryInfo {
        &self.info
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn codecs(&self) -> &CodecTable {
        &self.codecs
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn protocol_context(&self) -> ProtocolContext<'_> {
        ProtocolContext {
            revision: self.revision,
            compression: self.compression.as_ref(),
            columns: self.column_ctx,
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.state {
            ConnectionState::Idle => Ok(()),
            ConnectionState::SendingData => Err(Error::Usage(
                "an insert is pending; finish or cancel it first".to_string(),
            )),
            ConnectionState::AwaitingQueryResponse | ConnectionState::StreamingResult => Err(
                Error::Usage("a query result is still being read; drain or cancel it first".to_string()),
            ),
            ConnectionState::Disconnected
            | ConnectionState::Handshaking
            | ConnectionState::Error => Err(Error::ConnectionClosed),
        }
    }

    /// Move to `Error` and hand the error back.
    fn poison(&mut self, err: Error) -> Error {
        if self.state != ConnectionState::Error {
            error!(error = %err, state = %self.state, "connection is no longer usable");
        }
        self.state = ConnectionState::Error;
        err
    }

    fn unexpected(&mut self, packet: &ServerPacket) -> Error {
        let err = Error::ProtocolViolation(format!(
            "unexpected {} packet while {}",
            packet.name(),
            self.state
        ));
        self.poison(err)
    }

    /// Record side-channel packets; hand everything else back.
    fn absorb(&mut self, packet: ServerPacket) -> Option<ServerPacket> {
        match packet {
            ServerPacket::Progress(delta) => self.info.progress.merge(&delta),
            ServerPacket::ProfileInfo(profile) => self.info.profile = Some(profile),
            ServerPacket::Totals(data) => self.info.totals = Some(data.block),
            ServerPacket::Extremes(data) => self.info.extremes = Some(data.block),
            ServerPacket::Log(data) => emit_server_log(&data.block),
            ServerPacket::ProfileEvents(data) => {
                trace!(rows = data.block.num_rows(), "profile events")
            }
            ServerPacket::TableColumns(columns) => {
                trace!(table = %columns.table_name, "table columns")
            }
            other => return Some(other),
        }
        None
    }

    async fn send_packet(&mut self, packet: &ClientPacket) -> Result<()> {
        let mut buf = BytesMut::new();
        packet.encode(&self.protocol_context(), &mut buf)?;
        self.write_bytes(buf).await
    }

    async fn write_bytes(&mut self, buf: BytesMut) -> Result<()> {
        let limit = self.config.send_timeout;
        let writer = &mut self.writer;
        let result = with_timeout(limit, async move {
            writer.write_all(&buf).await?;
            writer.flush().await
        })
        .await;
        result.map_err(|e| self.poison(e))
    }

    /// Receive one server packet.
    async fn receive_packet(&mut self) -> Result<ServerPacket> {
        loop {
            let len = self.read_buffer.len();
            if self.partial.may_complete(len) {
                let ctx = self.protocol_context();
                let mut reader = SliceReader::new(&self.read_buffer);
                match ServerPacket::decode(&mut reader, &ctx) {
                    Ok(packet) => {
                        let consumed = reader.position();
                        self.read_buffer.advance(consumed);
                        self.partial = PartialPacket::default();
                        trace!(packet = packet.name(), bytes = consumed, "received");
                        return Ok(packet);
                    }
                    Err(Error::TruncatedInput) => {
                        self.partial = PartialPacket::truncated(len, reader.wanted());
                    }
                    Err(e) => return Err(self.poison(e)),
                }
            }
            self.fill_buffer().await?;
        }
    }

    /// Wait for more bytes, then take whatever else is already available.
    async fn fill_buffer(&mut self) -> Result<()> {
        let limit = self.config.receive_timeout;
        self.read_buffer.reserve(READ_CHUNK);
        let read = with_timeout(limit, self.reader.read_buf(&mut self.read_buffer)).await;
        let n = read.map_err(|e| self.poison(e))?;
        if n == 0 {
            let err = if self.read_buffer.is_empty() {
                Error::ConnectionClosed
            } else {
                Error::TruncatedInput
            };
            return Err(self.poison(err));
        }

        // Each retry re-parses the packet from its start, so gather what the
        // socket already holds before trying again.
        let mut gathered = n;
        while gathered < MAX_READ_AHEAD {
            self.read_buffer.reserve(READ_CHUNK);
            match self.reader.read_buf(&mut self.read_buffer).now_or_never() {
                Some(Ok(0)) | None => break,
                Some(Ok(n)) => gathered += n,
                Some(Err(e)) => return Err(self.poison(e.into())),
            }
        }

        // Short of the growth goal, decode only once the peer goes quiet.
        while self.partial.wants_more(self.read_buffer.len()) {
            self.read_buffer.reserve(READ_CHUNK);
            let read = self.reader.read_buf(&mut self.read_buffer);
            match tokio::time::timeout(IDLE_GRACE, read).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(self.poison(e.into())),
            }
        }
        Ok(())
    }
}

/// Decode progress on a packet that has not fully arrived.
///
/// A failed attempt sets a hard floor (the input length the decoder asked
/// for) and a soft goal of twice the bytes seen, so a large packet is
/// decoded a logarithmic number of times while it trickles in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PartialPacket {
    /// The packet cannot be complete below this length.
    floor: usize,
    /// Below this length, wait for the peer to go quiet before decoding.
    goal: usize,
}

impl PartialPacket {
    /// State after a decode over `len` bytes ran out of input.
    fn truncated(len: usize, wanted: usize) -> Self {
        Self {
            floor: wanted.max(len.saturating_add(1)),
            goal: len.saturating_mul(2),
        }
    }

    fn may_complete(&self, len: usize) -> bool {
        len > 0 && len >= self.floor
    }

    fn wants_more(&self, len: usize) -> bool {
        len >= self.floor && len < self.goal
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.config.address())
            .field("state", &self.state)
            .field("revision", &self.revision)
            .field("compression", &self.compression.as_ref().map(Compression::method))
            .finish()
    }
}

async fn open_tcp(config: &ClientConfig) -> Result<TcpStream> {
    let address = config.address();
    debug!(address = %address, "opening TCP connection");
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| Error::Timeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn client_version(part: &str) -> u64 {
    part.parse().unwrap_or(0)
}

fn check_insert_layout(header: &[ColumnInfo], block: &Block) -> Result<()> {
    if header.len() != block.num_columns() {
        return Err(Error::Usage(format!(
            "insert expects {} columns, block has {}",
            header.len(),
            block.num_columns()
        )));
    }
    for (expected, column) in header.iter().zip(block.columns()) {
        if expected.name != column.info.name || expected.sql_type != column.info.sql_type {
            return Err(Error::Usage(format!(
                "insert expects column '{}' {}, block has '{}' {}",
                expected.name, expected.type_name, column.info.name, column.info.type_name
            )));
        }
    }
    Ok(())
}

/// Re-emit a server log block as tracing events.
fn emit_server_log(block: &Block) {
    let (Some(priority), Some(text)) = (block.column("priority"), block.column("text")) else {
        return;
    };
    let source = block.column("source");

    for (i, (level, message)) in priority.values.iter().zip(&text.values).enumerate() {
        let message = message.as_str().unwrap_or_default();
        let source = source
            .and_then(|c| c.values.get(i))
            .and_then(Value::as_str)
            .unwrap_or_default();
        match level.as_i128().unwrap_or(0) {
            1..=3 => error!(target: "chnative::server", source, "{}", message),
            4 => warn!(target: "chnative::server", source, "{}", message),
            5 | 6 => info!(target: "chnative::server", source, "{}", message),
            7 => debug!(target: "chnative::server", source, "{}", message),
            _ => trace!(target: "chnative::server", source, "{}", message),
        }
    }
}

// ============================================================================
// Streaming results
// ============================================================================

/// Results of a running query, pulled on demand.
///
/// Dropping the stream early leaves the connection mid-result; call
/// [`QueryStream::cancel`] (or [`Connection::cancel`]) before the next query.
pub struct QueryStream<'c> {
    conn: &'c mut Connection,
    columns: Option<Vec<ColumnInfo>>,
    pending: VecDeque<Row>,
    done: bool,
}

impl<'c> QueryStream<'c> {
    /// Result columns, known once the header block has arrived.
    pub fn columns(&self) -> Option<&[ColumnInfo]> {
        self.columns.as_deref()
    }

    /// Counters gathered so far.
    pub fn info(&self) -> &QueryInfo {
        &self.conn.info
    }

    /// Next non-empty block, or `None` once the server ends the stream.
    pub async fn next_block(&mut self) -> Result<Option<Block>> {
        if self.done {
            return Ok(None);
        }
        loop {
            match self.conn.next_result_block().await {
                Ok(Some(block)) => {
                    if self.columns.is_none() {
                        self.columns = Some(block.column_infos());
                    }
                    if block.is_empty() {
                        continue;
                    }
                    return Ok(Some(block));
                }
                Ok(None) => {
                    self.done = true;
                    return Ok(None);
                }
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            }
        }
    }

    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            match self.next_block().await? {
                Some(block) => self.pending.extend(block.into_rows()),
                None => return Ok(None),
            }
        }
    }

    /// Stop the query and realign the connection.
    pub async fn cancel(self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.conn.cancel().await
    }

    /// Adapt into a `futures::Stream` of rows.
    pub fn into_rows(self) -> impl Stream<Item = Result<Row>> + 'c {
        futures::stream::try_unfold(self, |mut stream| async move {
            Ok::<_, Error>(stream.next_row().await?.map(|row| (row, stream)))
        })
    }
}
