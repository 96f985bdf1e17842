//! Native protocol packet encoding and decoding.
//!
//! Every packet starts with a varint code. Both directions are implemented
//! in full: the client encodes `ClientPacket` and decodes `ServerPacket`, and
//! the inverse pair lets an in-process server speak the same protocol in
//! tests.
//!
//! Fields introduced in later protocol revisions are read and written only
//! when the negotiated revision is high enough; see [`revision`].

use bytes::BytesMut;

use super::binary::{ByteRead, ByteWrite};
use super::block::Block;
use super::column::ColumnContext;
use super::compression::{Compression, FrameReader};
use crate::error::{Error, Result, ServerException};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Minimum negotiated revisions at which optional fields appear.
pub mod revision {
    /// Revision this client speaks.
    pub const CLIENT_REVISION: u64 = 54459;

    pub const SERVER_TIMEZONE: u64 = 54058;
    pub const QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;
    pub const SERVER_DISPLAY_NAME: u64 = 54372;
    pub const VERSION_PATCH: u64 = 54401;
    pub const WRITTEN_IN_PROGRESS: u64 = 54420;
    pub const SETTINGS_AS_STRINGS: u64 = 54429;
    pub const INTERSERVER_SECRET: u64 = 54441;
    pub const OPENTELEMETRY: u64 = 54442;
    pub const DISTRIBUTED_DEPTH: u64 = 54448;
    pub const INITIAL_QUERY_START_TIME: u64 = 54449;
    pub const PROFILE_EVENTS: u64 = 54451;
    pub const PARALLEL_REPLICAS: u64 = 54453;
    pub const CUSTOM_SERIALIZATION: u64 = 54454;
    pub const HELLO_ADDENDUM: u64 = 54458;
    pub const PARAMETERS: u64 = 54459;
}

/// Client packet codes.
pub mod client_code {
    pub const HELLO: u64 = 0;
    pub const QUERY: u64 = 1;
    pub const DATA: u64 = 2;
    pub const CANCEL: u64 = 3;
    pub const PING: u64 = 4;
}

/// Server packet codes.
pub mod server_code {
    pub const HELLO: u64 = 0;
    pub const DATA: u64 = 1;
    pub const EXCEPTION: u64 = 2;
    pub const PROGRESS: u64 = 3;
    pub const PONG: u64 = 4;
    pub const END_OF_STREAM: u64 = 5;
    pub const PROFILE_INFO: u64 = 6;
    pub const TOTALS: u64 = 7;
    pub const EXTREMES: u64 = 8;
    pub const LOG: u64 = 10;
    pub const TABLE_COLUMNS: u64 = 11;
    pub const PROFILE_EVENTS: u64 = 14;
}

/// Process the query to completion.
pub const STAGE_COMPLETE: u64 = 2;

const QUERY_KIND_INITIAL: u8 = 1;
const INTERFACE_TCP: u8 = 1;

const SETTING_FLAG_CUSTOM: u64 = 0x02;

// ============================================================================
// Codec context
// ============================================================================

/// Session parameters every packet encoder and decoder needs.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolContext<'a> {
    /// Negotiated revision.
    pub revision: u64,
    /// Set when the connection compresses data blocks.
    pub compression: Option<&'a Compression>,
    pub columns: ColumnContext,
}

impl<'a> ProtocolContext<'a> {
    pub fn new(revision: u64, compression: Option<&'a Compression>) -> Self {
        Self {
            revision,
            compression,
            columns: ColumnContext::default(),
        }
    }

    #[inline]
    fn has(&self, min_revision: u64) -> bool {
        self.revision >= min_revision
    }
}

/// Write a block, framed when compression is on.
fn encode_block(
    block: &Block,
    compressed: bool,
    ctx: &ProtocolContext<'_>,
    out: &mut BytesMut,
) -> Result<()> {
    match ctx.compression.filter(|_| compressed) {
        Some(compression) => {
            let mut raw = BytesMut::new();
            block.encode(&mut raw, ctx.revision)?;
            compression.write_frames(&raw, out)
        }
        None => block.encode(out, ctx.revision),
    }
}

fn decode_block<R: ByteRead>(
    r: &mut R,
    compressed: bool,
    ctx: &ProtocolContext<'_>,
) -> Result<Block> {
    match ctx.compression.filter(|_| compressed) {
        Some(compression) => {
            let mut frames = FrameReader::new(&mut *r, compression.table());
            let block = Block::decode(&mut frames, ctx.revision, &ctx.columns)?;
            frames.finish()?;
            Ok(block)
        }
        None => Block::decode(r, ctx.revision, &ctx.columns),
    }
}

// ============================================================================
// Shared payloads
// ============================================================================

/// A block tagged with the (usually empty) name of an external table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataPacket {
    pub table_name: String,
    pub block: Block,
}

impl DataPacket {
    pub fn new(block: Block) -> Self {
        Self {
            table_name: String::new(),
            block,
        }
    }

    fn encode(
        &self,
        compressed: bool,
        ctx: &ProtocolContext<'_>,
        out: &mut BytesMut,
    ) -> Result<()> {
        out.write_string(&self.table_name);
        encode_block(&self.block, compressed, ctx, out)
    }

    fn decode<R: ByteRead>(
        r: &mut R,
        compressed: bool,
        ctx: &ProtocolContext<'_>,
    ) -> Result<Self> {
        let table_name = r.read_string()?;
        let block = decode_block(r, compressed, ctx)?;
        Ok(Self { table_name, block })
    }
}

// ============================================================================
// Client -> Server
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ClientHello {
    pub client_name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub protocol_revision: u64,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Identity of the client, sent with every query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientInfo {
    pub initial_user: String,
    pub initial_query_id: String,
    pub initial_address: String,
    pub initial_query_start_time_us: u64,
    pub os_user: String,
    pub client_hostname: String,
    pub client_name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub version_patch: u64,
    pub protocol_revision: u64,
    pub quota_key: String,
    pub distributed_depth: u64,
}

impl ClientInfo {
    fn encode(&self, ctx: &ProtocolContext<'_>, out: &mut BytesMut) {
        out.write_fixed(QUERY_KIND_INITIAL);
        out.write_string(&self.initial_user);
        out.write_string(&self.initial_query_id);
        out.write_string(&self.initial_address);
        if ctx.has(revision::INITIAL_QUERY_START_TIME) {
            out.write_fixed(self.initial_query_start_time_us);
        }
        out.write_fixed(INTERFACE_TCP);
        out.write_string(&self.os_user);
        out.write_string(&self.client_hostname);
        out.write_string(&self.client_name);
        out.write_varint(self.version_major);
        out.write_varint(self.version_minor);
        out.write_varint(self.protocol_revision);
        if ctx.has(revision::QUOTA_KEY_IN_CLIENT_INFO) {
            out.write_string(&self.quota_key);
        }
        if ctx.has(revision::DISTRIBUTED_DEPTH) {
            out.write_varint(self.distributed_depth);
        }
        if ctx.has(revision::VERSION_PATCH) {
            out.write_varint(self.version_patch);
        }
        if ctx.has(revision::OPENTELEMETRY) {
            out.write_fixed(0u8);
        }
        if ctx.has(revision::PARALLEL_REPLICAS) {
            // collaborate_with_initiator, replica count, replica number
            out.write_varint(0);
            out.write_varint(0);
            out.write_varint(0);
        }
    }

    fn decode<R: ByteRead>(r: &mut R, ctx: &ProtocolContext<'_>) -> Result<Self> {
        let kind = r.read_u8()?;
        if kind != QUERY_KIND_INITIAL {
            return Err(Error::ProtocolViolation(format!("unexpected query kind {}", kind)));
        }
        let mut info = ClientInfo {
            initial_user: r.read_string()?,
            initial_query_id: r.read_string()?,
            initial_address: r.read_string()?,
            ..Default::default()
        };
        if ctx.has(revision::INITIAL_QUERY_START_TIME) {
            info.initial_query_start_time_us = r.read_fixed()?;
        }
        let interface = r.read_u8()?;
        if interface != INTERFACE_TCP {
            return Err(Error::ProtocolViolation(format!("unexpected interface {}", interface)));
        }
        info.os_user = r.read_string()?;
        info.client_hostname = r.read_string()?;
        info.client_name = r.read_string()?;
        info.version_major = r.read_varint()?;
        info.version_minor = r.read_varint()?;
        info.protocol_revision = r.read_varint()?;
        if ctx.has(revision::QUOTA_KEY_IN_CLIENT_INFO) {
            info.quota_key = r.read_string()?;
        }
        if ctx.has(revision::DISTRIBUTED_DEPTH) {
            info.distributed_depth = r.read_varint()?;
        }
        if ctx.has(revision::VERSION_PATCH) {
            info.version_patch = r.read_varint()?;
        }
        if ctx.has(revision::OPENTELEMETRY) && r.read_bool()? {
            return Err(Error::ProtocolViolation(
                "trace context is not supported".to_string(),
            ));
        }
        if ctx.has(revision::PARALLEL_REPLICAS) {
            for _ in 0..3 {
                r.read_varint()?;
            }
        }
        Ok(info)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPacket {
    pub query_id: String,
    pub client_info: ClientInfo,
    pub settings: Vec<(String, String)>,
    pub stage: u64,
    pub compression: bool,
    pub query: String,
    /// Raw parameter values; quoting happens on the wire.
    pub parameters: Vec<(String, String)>,
}

/// Quote a parameter value the way the server's parameter parser expects.
fn quote_parameter(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

fn unquote_parameter(value: &str) -> Result<String> {
    let inner = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .ok_or_else(|| Error::ProtocolViolation(format!("unquoted parameter {}", value)))?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.extend(chars.next());
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn read_settings<R: ByteRead>(r: &mut R) -> Result<Vec<(String, u64, String)>> {
    let mut settings = Vec::new();
    loop {
        let name = r.read_string()?;
        if name.is_empty() {
            return Ok(settings);
        }
        let flags = r.read_varint()?;
        let value = r.read_string()?;
        settings.push((name, flags, value));
    }
}

impl QueryPacket {
    fn encode(&self, ctx: &ProtocolContext<'_>, out: &mut BytesMut) -> Result<()> {
        out.write_string(&self.query_id);
        self.client_info.encode(ctx, out);

        if ctx.has(revision::SETTINGS_AS_STRINGS) {
            for (name, value) in &self.settings {
                out.write_string(name);
                out.write_varint(0);
                out.write_string(value);
            }
        } else if !self.settings.is_empty() {
            return Err(Error::Usage(format!(
                "server revision {} cannot receive settings",
                ctx.revision
            )));
        }
        out.write_string("");

        if ctx.has(revision::INTERSERVER_SECRET) {
            out.write_string("");
        }
        out.write_varint(self.stage);
        out.write_varint(u64::from(self.compression));
        out.write_string(&self.query);

        if ctx.has(revision::PARAMETERS) {
            for (name, value) in &self.parameters {
                out.write_string(name);
                out.write_varint(SETTING_FLAG_CUSTOM);
                out.write_string(&quote_parameter(value));
            }
            out.write_string("");
        } else if !self.parameters.is_empty() {
            return Err(Error::Usage(format!(
                "server revision {} does not support query parameters",
                ctx.revision
            )));
        }
        Ok(())
    }

    fn decode<R: ByteRead>(r: &mut R, ctx: &ProtocolContext<'_>) -> Result<Self> {
        let query_id = r.read_string()?;
        let client_info = ClientInfo::decode(r, ctx)?;
        let settings = read_settings(r)?
            .into_iter()
            .map(|(name, _, value)| (name, value))
            .collect();
        if ctx.has(revision::INTERSERVER_SECRET) {
            r.read_string()?;
        }
        let stage = r.read_varint()?;
        let compression = r.read_varint()? != 0;
        let query = r.read_string()?;
        let parameters = if ctx.has(revision::PARAMETERS) {
            read_settings(r)?
                .into_iter()
                .map(|(name, _, value)| Ok((name, unquote_parameter(&value)?)))
                .collect::<Result<_>>()?
        } else {
            Vec::new()
        };
        Ok(Self {
            query_id,
            client_info,
            settings,
            stage,
            compression,
            query,
            parameters,
        })
    }
}

/// Packets sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Hello(ClientHello),
    Query(Box<QueryPacket>),
    Data(DataPacket),
    Cancel,
    Ping,
}

impl ClientPacket {
    pub fn encode(&self, ctx: &ProtocolContext<'_>, out: &mut BytesMut) -> Result<()> {
        match self {
            ClientPacket::Hello(hello) => {
                out.write_varint(client_code::HELLO);
                out.write_string(&hello.client_name);
                out.write_varint(hello.version_major);
                out.write_varint(hello.version_minor);
                out.write_varint(hello.protocol_revision);
                out.write_string(&hello.database);
                out.write_string(&hello.user);
                out.write_string(&hello.password);
            }
            ClientPacket::Query(query) => {
                out.write_varint(client_code::QUERY);
                query.encode(ctx, out)?;
            }
            ClientPacket::Data(data) => {
                out.write_varint(client_code::DATA);
                data.encode(true, ctx, out)?;
            }
            ClientPacket::Cancel => out.write_varint(client_code::CANCEL),
            ClientPacket::Ping => out.write_varint(client_code::PING),
        }
        Ok(())
    }

    pub fn decode<R: ByteRead>(r: &mut R, ctx: &ProtocolContext<'_>) -> Result<Self> {
        match r.read_varint()? {
            client_code::HELLO => Ok(ClientPacket::Hello(ClientHello {
                client_name: r.read_string()?,
                version_major: r.read_varint()?,
                version_minor: r.read_varint()?,
                protocol_revision: r.read_varint()?,
                database: r.read_string()?,
                user: r.read_string()?,
                password: r.read_string()?,
            })),
            client_code::QUERY => Ok(ClientPacket::Query(Box::new(QueryPacket::decode(r, ctx)?))),
            client_code::DATA => Ok(ClientPacket::Data(DataPacket::decode(r, true, ctx)?)),
            client_code::CANCEL => Ok(ClientPacket::Cancel),
            client_code::PING => Ok(ClientPacket::Ping),
            code => Err(Error::ProtocolViolation(format!(
                "unknown client packet code {}",
                code
            ))),
        }
    }
}

/// Quota key sent right after the server hello at revision 54458 and later.
pub fn encode_hello_addendum(quota_key: &str, out: &mut BytesMut) {
    out.write_string(quota_key);
}

pub fn decode_hello_addendum<R: ByteRead>(r: &mut R) -> Result<String> {
    r.read_string()
}

// ============================================================================
// Server -> Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerHello {
    pub name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub timezone: Option<String>,
    pub display_name: Option<String>,
    pub version_patch: u64,
}

impl ServerHello {
    fn encode(&self, ctx: &ProtocolContext<'_>, out: &mut BytesMut) {
        let negotiated = self.revision.min(ctx.revision);
        out.write_string(&self.name);
        out.write_varint(self.version_major);
        out.write_varint(self.version_minor);
        out.write_varint(self.revision);
        if negotiated >= revision::SERVER_TIMEZONE {
            out.write_string(self.timezone.as_deref().unwrap_or(""));
        }
        if negotiated >= revision::SERVER_DISPLAY_NAME {
            out.write_string(self.display_name.as_deref().unwrap_or(""));
        }
        if negotiated >= revision::VERSION_PATCH {
            out.write_varint(self.version_patch);
        }
    }

    fn decode<R: ByteRead>(r: &mut R, ctx: &ProtocolContext<'_>) -> Result<Self> {
        let mut hello = ServerHello {
            name: r.read_string()?,
            version_major: r.read_varint()?,
            version_minor: r.read_varint()?,
            revision: r.read_varint()?,
            ..Default::default()
        };
        let negotiated = hello.revision.min(ctx.revision);
        if negotiated >= revision::SERVER_TIMEZONE {
            hello.timezone = Some(r.read_string()?);
        }
        if negotiated >= revision::SERVER_DISPLAY_NAME {
            hello.display_name = Some(r.read_string()?);
        }
        hello.version_patch = if negotiated >= revision::VERSION_PATCH {
            r.read_varint()?
        } else {
            hello.revision
        };
        Ok(hello)
    }
}

/// Counters reported while a query runs. Each packet carries increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
    pub total_rows: u64,
    pub written_rows: u64,
    pub written_bytes: u64,
}

impl Progress {
    /// Add `delta` to the running totals, saturating at `u64::MAX`.
    pub fn merge(&mut self, delta: &Progress) {
        self.rows = self.rows.saturating_add(delta.rows);
        self.bytes = self.bytes.saturating_add(delta.bytes);
        self.total_rows = self.total_rows.saturating_add(delta.total_rows);
        self.written_rows = self.written_rows.saturating_add(delta.written_rows);
        self.written_bytes = self.written_bytes.saturating_add(delta.written_bytes);
    }

    fn encode(&self, ctx: &ProtocolContext<'_>, out: &mut BytesMut) {
        out.write_varint(self.rows);
        out.write_varint(self.bytes);
        out.write_varint(self.total_rows);
        if ctx.has(revision::WRITTEN_IN_PROGRESS) {
            out.write_varint(self.written_rows);
            out.write_varint(self.written_bytes);
        }
    }

    fn decode<R: ByteRead>(r: &mut R, ctx: &ProtocolContext<'_>) -> Result<Self> {
        let mut progress = Progress {
            rows: r.read_varint()?,
            bytes: r.read_varint()?,
            total_rows: r.read_varint()?,
            ..Default::default()
        };
        if ctx.has(revision::WRITTEN_IN_PROGRESS) {
            progress.written_rows = r.read_varint()?;
            progress.written_bytes = r.read_varint()?;
        }
        Ok(progress)
    }
}

/// Execution summary sent once per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
    pub calculated_rows_before_limit: bool,
}

impl ProfileInfo {
    fn encode(&self, out: &mut BytesMut) {
        out.write_varint(self.rows);
        out.write_varint(self.blocks);
        out.write_varint(self.bytes);
        out.write_bool(self.applied_limit);
        out.write_varint(self.rows_before_limit);
        out.write_bool(self.calculated_rows_before_limit);
    }

    fn decode<R: ByteRead>(r: &mut R) -> Result<Self> {
        Ok(ProfileInfo {
            rows: r.read_varint()?,
            blocks: r.read_varint()?,
            bytes: r.read_varint()?,
            applied_limit: r.read_bool()?,
            rows_before_limit: r.read_varint()?,
            calculated_rows_before_limit: r.read_bool()?,
        })
    }
}

/// Column description of a table, sent before INSERT data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableColumns {
    pub table_name: String,
    pub description: String,
}

fn encode_exception(exception: &ServerException, out: &mut BytesMut) {
    for (i, e) in exception.chain().enumerate() {
        if i > 0 {
            out.write_bool(true);
        }
        out.write_fixed(e.code);
        out.write_string(&e.name);
        out.write_string(&e.message);
        out.write_string(&e.stack_trace);
    }
    out.write_bool(false);
}

fn decode_exception<R: ByteRead>(r: &mut R) -> Result<ServerException> {
    let mut chain = Vec::new();
    loop {
        chain.push(ServerException {
            code: r.read_fixed()?,
            name: r.read_string()?,
            message: r.read_string()?,
            stack_trace: r.read_string()?,
            nested: None,
        });
        if !r.read_bool()? {
            break;
        }
    }
    let mut nested = None;
    while let Some(mut e) = chain.pop() {
        e.nested = nested.map(Box::new);
        nested = Some(e);
    }
    nested.ok_or_else(|| Error::ProtocolViolation("empty exception".to_string()))
}

/// Packets sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    Hello(ServerHello),
    Data(DataPacket),
    Exception(ServerException),
    Progress(Progress),
    Pong,
    EndOfStream,
    ProfileInfo(ProfileInfo),
    Totals(DataPacket),
    Extremes(DataPacket),
    Log(DataPacket),
    TableColumns(TableColumns),
    ProfileEvents(DataPacket),
}

impl ServerPacket {
    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ServerPacket::Hello(_) => "Hello",
            ServerPacket::Data(_) => "Data",
            ServerPacket::Exception(_) => "Exception",
            ServerPacket::Progress(_) => "Progress",
            ServerPacket::Pong => "Pong",
            ServerPacket::EndOfStream => "EndOfStream",
            ServerPacket::ProfileInfo(_) => "ProfileInfo",
            ServerPacket::Totals(_) => "Totals",
            ServerPacket::Extremes(_) => "Extremes",
            ServerPacket::Log(_) => "Log",
            ServerPacket::TableColumns(_) => "TableColumns",
            ServerPacket::ProfileEvents(_) => "ProfileEvents",
        }
    }

    pub fn encode(&self, ctx: &ProtocolContext<'_>, out: &mut BytesMut) -> Result<()> {
        match self {
            ServerPacket::Hello(hello) => {
                out.write_varint(server_code::HELLO);
                hello.encode(ctx, out);
            }
            ServerPacket::Data(data) => {
                out.write_varint(server_code::DATA);
                data.encode(true, ctx, out)?;
            }
            ServerPacket::Exception(e) => {
                out.write_varint(server_code::EXCEPTION);
                encode_exception(e, out);
            }
            ServerPacket::Progress(progress) => {
                out.write_varint(server_code::PROGRESS);
                progress.encode(ctx, out);
            }
            ServerPacket::Pong => out.write_varint(server_code::PONG),
            ServerPacket::EndOfStream => out.write_varint(server_code::END_OF_STREAM),
            ServerPacket::ProfileInfo(info) => {
                out.write_varint(server_code::PROFILE_INFO);
                info.encode(out);
            }
            ServerPacket::Totals(data) => {
                out.write_varint(server_code::TOTALS);
                data.encode(true, ctx, out)?;
            }
            ServerPacket::Extremes(data) => {
                out.write_varint(server_code::EXTREMES);
                data.encode(true, ctx, out)?;
            }
            ServerPacket::Log(data) => {
                out.write_varint(server_code::LOG);
                data.encode(false, ctx, out)?;
            }
            ServerPacket::TableColumns(columns) => {
                out.write_varint(server_code::TABLE_COLUMNS);
                out.write_string(&columns.table_name);
                out.write_string(&columns.description);
            }
            ServerPacket::ProfileEvents(data) => {
                out.write_varint(server_code::PROFILE_EVENTS);
                data.encode(false, ctx, out)?;
            }
        }
        Ok(())
    }

    /// Decode one packet. Fails with `TruncatedInput` when `r` ends early.
    pub fn decode<R: ByteRead>(r: &mut R, ctx: &ProtocolContext<'_>) -> Result<Self> {
        let code = r.read_varint()?;
        match code {
            server_code::HELLO => Ok(ServerPacket::Hello(ServerHello::decode(r, ctx)?)),
            server_code::DATA => Ok(ServerPacket::Data(DataPacket::decode(r, true, ctx)?)),
            server_code::EXCEPTION => Ok(ServerPacket::Exception(decode_exception(r)?)),
            server_code::PROGRESS => Ok(ServerPacket::Progress(Progress::decode(r, ctx)?)),
            server_code::PONG => Ok(ServerPacket::Pong),
            server_code::END_OF_STREAM => Ok(ServerPacket::EndOfStream),
            server_code::PROFILE_INFO => Ok(ServerPacket::ProfileInfo(ProfileInfo::decode(r)?)),
            server_code::TOTALS => Ok(ServerPacket::Totals(DataPacket::decode(r, true, ctx)?)),
            server_code::EXTREMES => Ok(ServerPacket::Extremes(DataPacket::decode(r, true, ctx)?)),
            server_code::LOG => Ok(ServerPacket::Log(DataPacket::decode(r, false, ctx)?)),
            server_code::TABLE_COLUMNS => Ok(ServerPacket::TableColumns(TableColumns {
                table_name: r.read_string()?,
                description: r.read_string()?,
            })),
            server_code::PROFILE_EVENTS if ctx.has(revision::PROFILE_EVENTS) => Ok(
                ServerPacket::ProfileEvents(DataPacket::decode(r, false, ctx)?),
            ),
            _ => Err(Error::ProtocolViolation(format!(
                "unknown server packet code {}",
                code
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::block::ColumnInfo;
    use crate::native::compression::{CodecTable, CompressionMethod};
    use crate::native::value::Value;
    use std::sync::Arc;

    fn ctx() -> ProtocolContext<'static> {
        ProtocolContext::new(revision::CLIENT_REVISION, None)
    }

    fn server_roundtrip(packet: &ServerPacket, ctx: &ProtocolContext<'_>) -> ServerPacket {
        let mut buf = BytesMut::new();
        packet.encode(ctx, &mut buf).unwrap();
        let mut cursor: &[u8] = &buf;
        let decoded = ServerPacket::decode(&mut cursor, ctx).unwrap();
        assert!(cursor.is_empty());
        decoded
    }

    fn sample_block() -> Block {
        let header = vec![ColumnInfo::new("n", "UInt64").unwrap()];
        Block::from_rows(&header, (0..10u64).map(|i| vec![Value::UInt64(i)])).unwrap()
    }

    mod client_packets {
        use super::*;

        fn query() -> QueryPacket {
            QueryPacket {
                query_id: "q-1".to_string(),
                client_info: ClientInfo {
                    initial_address: "0.0.0.0:0".to_string(),
                    client_name: "chnative".to_string(),
                    protocol_revision: revision::CLIENT_REVISION,
                    ..Default::default()
                },
                settings: vec![("max_threads".to_string(), "2".to_string())],
                stage: STAGE_COMPLETE,
                compression: false,
                query: "SELECT {x:String}".to_string(),
                parameters: vec![("x".to_string(), "it's \\ here".to_string())],
            }
        }

        #[test]
        fn test_hello_layout() {
            let hello = ClientPacket::Hello(ClientHello {
                client_name: "c".to_string(),
                version_major: 1,
                version_minor: 2,
                protocol_revision: revision::CLIENT_REVISION,
                database: "default".to_string(),
                user: "u".to_string(),
                password: String::new(),
            });
            let mut buf = BytesMut::new();
            hello.encode(&ctx(), &mut buf).unwrap();
            assert_eq!(&buf[..4], &[0x00, 0x01, b'c', 0x01]);

            let mut cursor: &[u8] = &buf;
            assert_eq!(ClientPacket::decode(&mut cursor, &ctx()).unwrap(), hello);
        }

        #[test]
        fn test_query_roundtrip_with_parameters() {
            let packet = ClientPacket::Query(Box::new(query()));
            let mut buf = BytesMut::new();
            packet.encode(&ctx(), &mut buf).unwrap();

            let mut cursor: &[u8] = &buf;
            assert_eq!(ClientPacket::decode(&mut cursor, &ctx()).unwrap(), packet);
            assert!(cursor.is_empty());
        }

        #[test]
        fn test_query_shrinks_at_old_revision() {
            let mut q = query();
            q.parameters.clear();
            let packet = ClientPacket::Query(Box::new(q));

            let mut new = BytesMut::new();
            packet.encode(&ctx(), &mut new).unwrap();
            let old_ctx = ProtocolContext::new(revision::SETTINGS_AS_STRINGS, None);
            let mut old = BytesMut::new();
            packet.encode(&old_ctx, &mut old).unwrap();
            assert!(old.len() < new.len());

            let mut cursor: &[u8] = &old;
            assert_eq!(ClientPacket::decode(&mut cursor, &old_ctx).unwrap(), packet);
        }

        #[test]
        fn test_parameters_rejected_before_support() {
            let packet = ClientPacket::Query(Box::new(query()));
            let old_ctx = ProtocolContext::new(revision::PARAMETERS - 1, None);
            let err = packet.encode(&old_ctx, &mut BytesMut::new()).unwrap_err();
            assert!(matches!(err, Error::Usage(_)));
        }

        #[test]
        fn test_parameter_quoting() {
            assert_eq!(quote_parameter("a'b\\c"), "'a\\'b\\\\c'");
            assert_eq!(unquote_parameter("'a\\'b\\\\c'").unwrap(), "a'b\\c");
        }

        #[test]
        fn test_compressed_data_roundtrip() {
            let compression =
                Compression::new(CompressionMethod::Lz4, Arc::new(CodecTable::standard())).unwrap();
            let ctx = ProtocolContext::new(revision::CLIENT_REVISION, Some(&compression));
            let packet = ClientPacket::Data(DataPacket::new(sample_block()));

            let mut buf = BytesMut::new();
            packet.encode(&ctx, &mut buf).unwrap();
            let mut cursor: &[u8] = &buf;
            assert_eq!(ClientPacket::decode(&mut cursor, &ctx).unwrap(), packet);
            assert!(cursor.is_empty());
        }
    }

    mod server_packets {
        use super::*;

        #[test]
        fn test_hello_fields_are_revision_gated() {
            let hello = ServerHello {
                name: "ClickHouse".to_string(),
                version_major: 23,
                version_minor: 8,
                revision: 54050,
                timezone: None,
                display_name: None,
                version_patch: 54050,
            };
            let packet = ServerPacket::Hello(hello.clone());
            assert_eq!(server_roundtrip(&packet, &ctx()), packet);

            let newer = ServerPacket::Hello(ServerHello {
                revision: 54460,
                timezone: Some("UTC".to_string()),
                display_name: Some("node-1".to_string()),
                version_patch: 3,
                ..hello
            });
            assert_eq!(server_roundtrip(&newer, &ctx()), newer);
        }

        #[test]
        fn test_exception_chain() {
            let exception = ServerException {
                code: 60,
                name: "DB::Exception".to_string(),
                message: "Table default.t does not exist".to_string(),
                stack_trace: "0. frame".to_string(),
                nested: Some(Box::new(ServerException {
                    code: 1000,
                    name: "Poco::Exception".to_string(),
                    message: "inner".to_string(),
                    stack_trace: String::new(),
                    nested: None,
                })),
            };
            let packet = ServerPacket::Exception(exception);
            assert_eq!(server_roundtrip(&packet, &ctx()), packet);
        }

        #[test]
        fn test_progress_written_counters_gated() {
            let progress = Progress {
                rows: 10,
                bytes: 80,
                total_rows: 100,
                written_rows: 1,
                written_bytes: 2,
            };
            let packet = ServerPacket::Progress(progress);
            assert_eq!(server_roundtrip(&packet, &ctx()), packet);

            let old_ctx = ProtocolContext::new(revision::WRITTEN_IN_PROGRESS - 1, None);
            match server_roundtrip(&packet, &old_ctx) {
                ServerPacket::Progress(p) => {
                    assert_eq!(p.rows, 10);
                    assert_eq!(p.written_rows, 0);
                }
                other => panic!("unexpected packet: {:?}", other),
            }
        }

        #[test]
        fn test_progress_merge_saturates() {
            let mut total = Progress {
                rows: u64::MAX - 1,
                bytes: 10,
                ..Default::default()
            };
            // Wire varints can carry any u64.
            let delta = Progress {
                rows: 5,
                bytes: 20,
                written_bytes: u64::MAX,
                ..Default::default()
            };
            total.merge(&delta);
            total.merge(&delta);
            assert_eq!(total.rows, u64::MAX);
            assert_eq!(total.bytes, 50);
            assert_eq!(total.written_bytes, u64::MAX);
            assert_eq!(total.total_rows, 0);
        }

        #[test]
        fn test_profile_info_and_table_columns() {
            let info = ServerPacket::ProfileInfo(ProfileInfo {
                rows: 5,
                blocks: 1,
                bytes: 40,
                applied_limit: true,
                rows_before_limit: 50,
                calculated_rows_before_limit: true,
            });
            assert_eq!(server_roundtrip(&info, &ctx()), info);

            let columns = ServerPacket::TableColumns(TableColumns {
                table_name: String::new(),
                description: "columns format version: 1\n".to_string(),
            });
            assert_eq!(server_roundtrip(&columns, &ctx()), columns);
        }

        #[test]
        fn test_log_blocks_are_never_compressed() {
            let compression =
                Compression::new(CompressionMethod::Zstd, Arc::new(CodecTable::standard()))
                    .unwrap();
            let compressed = ProtocolContext::new(revision::CLIENT_REVISION, Some(&compression));

            let log = ServerPacket::Log(DataPacket::new(sample_block()));
            let mut buf = BytesMut::new();
            log.encode(&compressed, &mut buf).unwrap();
            // Decodes without a codec table.
            let mut cursor: &[u8] = &buf;
            assert_eq!(ServerPacket::decode(&mut cursor, &ctx()).unwrap(), log);

            let data = ServerPacket::Data(DataPacket::new(sample_block()));
            assert_eq!(server_roundtrip(&data, &compressed), data);
        }

        #[test]
        fn test_unknown_code_is_protocol_violation() {
            let mut cursor: &[u8] = &[9];
            let err = ServerPacket::decode(&mut cursor, &ctx()).unwrap_err();
            assert!(matches!(err, Error::ProtocolViolation(_)));
            assert!(err.is_fatal());
        }

        #[test]
        fn test_trailing_bytes_in_compressed_frame() {
            let compression =
                Compression::new(CompressionMethod::Lz4, Arc::new(CodecTable::standard())).unwrap();
            let ctx = ProtocolContext::new(revision::CLIENT_REVISION, Some(&compression));

            let mut raw = BytesMut::new();
            sample_block().encode(&mut raw, ctx.revision).unwrap();
            raw.extend_from_slice(&[0]);

            let mut buf = BytesMut::new();
            buf.write_varint(server_code::DATA);
            buf.write_string("");
            compression.write_frames(&raw, &mut buf).unwrap();

            let mut cursor: &[u8] = &buf;
            let err = ServerPacket::decode(&mut cursor, &ctx).unwrap_err();
            assert!(matches!(err, Error::MalformedBlock(ref msg) if msg.contains("unread")));
        }

        #[test]
        fn test_truncated_packet() {
            let packet = ServerPacket::Data(DataPacket::new(sample_block()));
            let mut buf = BytesMut::new();
            packet.encode(&ctx(), &mut buf).unwrap();

            for cut in [1, buf.len() / 2, buf.len() - 1] {
                let mut cursor: &[u8] = &buf[..cut];
                assert!(matches!(
                    ServerPacket::decode(&mut cursor, &ctx()),
                    Err(Error::TruncatedInput)
                ));
            }
        }
    }
}
