use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{TlsAcceptor, process_socket};
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{EngineError, SharedEngine};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: SharedEngine,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(LabresFactory::new(engine, password));
    process_socket(socket, tls, factory).await
}

pub struct LabresHandler {
    engine: SharedEngine,
    query_parser: Arc<LabresQueryParser>,
}

impl LabresHandler {
    pub fn new(engine: SharedEngine) -> Self {
        Self {
            engine,
            query_parser: Arc::new(LabresQueryParser),
        }
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// One statement, one lock: the engine is held for the whole operation.
    async fn dispatch(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let mut engine = self.engine.lock().await;
        match cmd {
            Command::SelectLabs { id } => {
                let labs = match id {
                    Some(id) => vec![engine.get_lab(id).map_err(engine_err)?],
                    None => engine.list_labs(),
                };
                lab_rows(labs, format)
            }
            Command::SelectReservations { id, filter } => {
                let reservations = match id {
                    Some(id) => {
                        let r = engine.get_reservation(id).map_err(engine_err)?;
                        if filter.matches(&r) { vec![r] } else { vec![] }
                    }
                    None => engine.list_reservations(&filter).map_err(engine_err)?,
                };
                reservation_rows(reservations, format)
            }
            Command::SelectBlocks { lab_id } => block_rows(engine.list_blocks(lab_id), format),
            Command::SelectSlots { lab_id, date } => {
                let slots = engine.day_slots(lab_id, date).map_err(engine_err)?;
                slot_rows(lab_id, slots, format)
            }
            Command::InsertReservation { input, returning } => {
                let r = engine.create_reservation(input).map_err(engine_err)?;
                if returning {
                    reservation_rows(vec![r], format)
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::InsertApproval { reservation_id } => {
                engine
                    .approve_reservation(reservation_id)
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertDenial {
                reservation_id,
                reason,
            } => {
                engine
                    .deny_reservation(reservation_id, &reason)
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine.cancel_reservation(id).map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBlock { input, returning } => {
                let b = engine.add_block(input).map_err(engine_err)?;
                if returning {
                    block_rows(vec![b], format)
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::DeleteBlock { id } => {
                engine.remove_block(id).map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type, format: &Format, idx: usize) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, format.format_for(idx))
}

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| field(name, ty.clone(), format, idx))
        .collect()
}

fn lab_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::INT8),
            ("name", Type::VARCHAR),
            ("capacity", Type::INT4),
            ("description", Type::VARCHAR),
        ],
        format,
    )
}

fn reservation_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::INT8),
            ("lab_id", Type::INT8),
            ("requester_name", Type::VARCHAR),
            ("phone", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("duration_minutes", Type::INT4),
            ("course", Type::VARCHAR),
            ("section", Type::VARCHAR),
            ("note", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("created_at", Type::VARCHAR),
            ("denial_reason", Type::VARCHAR),
        ],
        format,
    )
}

fn block_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::INT8),
            ("lab_id", Type::INT8),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("reason", Type::VARCHAR),
        ],
        format,
    )
}

fn slot_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("lab_id", Type::INT8),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("state", Type::VARCHAR),
        ],
        format,
    )
}

/// Row description for a statement, or none if it returns no rows.
fn schema_for(sql: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::result_table(sql).as_deref() {
        Some("labs") => lab_schema(format),
        Some("reservations") => reservation_schema(format),
        Some("blocks") => block_schema(format),
        Some("slots") => slot_schema(format),
        _ => vec![],
    }
}

fn text_time(t: Timestamp) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn int8(id: Id) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn int4(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn lab_rows(labs: Vec<Lab>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(lab_schema(format));
    let rows: Vec<PgWireResult<_>> = labs
        .into_iter()
        .map(|lab| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&int8(lab.id))?;
            encoder.encode_field(&lab.name)?;
            encoder.encode_field(&int4(lab.capacity))?;
            encoder.encode_field(&lab.description)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservation_rows(reservations: Vec<Reservation>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema(format));
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&int8(r.id))?;
            encoder.encode_field(&int8(r.lab_id))?;
            encoder.encode_field(&r.requester_name)?;
            encoder.encode_field(&r.phone)?;
            encoder.encode_field(&text_time(r.start_time))?;
            encoder.encode_field(&text_time(r.end_time))?;
            encoder.encode_field(&int4(r.duration_minutes))?;
            encoder.encode_field(&r.course)?;
            encoder.encode_field(&r.section)?;
            encoder.encode_field(&r.note)?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&text_time(r.created_at))?;
            encoder.encode_field(&r.denial_reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn block_rows(blocks: Vec<Block>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(block_schema(format));
    let rows: Vec<PgWireResult<_>> = blocks
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&int8(b.id))?;
            encoder.encode_field(&int8(b.lab_id))?;
            encoder.encode_field(&text_time(b.start_time))?;
            encoder.encode_field(&text_time(b.end_time))?;
            encoder.encode_field(&b.reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn slot_rows(lab_id: Id, slots: Vec<Slot>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(slot_schema(format));
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&int8(lab_id))?;
            encoder.encode_field(&text_time(slot.start))?;
            encoder.encode_field(&text_time(slot.end))?;
            encoder.encode_field(&slot.state.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for LabresHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        debug!("simple query: {query}");
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let response = self.execute_command(cmd, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LabresQueryParser;

#[async_trait]
impl QueryParser for LabresQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LabresHandler {
    type Statement = String;
    type QueryParser = LabresQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        debug!("extended query: {sql}");
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(cmd, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// (byte range, index) pairs in statement order.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // a doubled quote is an escaped quote and keeps the literal open
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound parameters as quoted literals in a single pass over the
/// statement. Substituted text is never scanned again.
fn substitute_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// One shared password for every user name.
#[derive(Debug)]
pub struct LabresAuthSource {
    password: String,
}

impl LabresAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for LabresAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!("login attempt from user {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LabresFactory {
    handler: Arc<LabresHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LabresAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LabresFactory {
    pub fn new(engine: SharedEngine, password: String) -> Self {
        Self {
            handler: Arc::new(LabresHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                LabresAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LabresFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE per engine failure class.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "23514",
        EngineError::NotFound(..) => "P0002",
        EngineError::InvalidState { .. } => "55000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
