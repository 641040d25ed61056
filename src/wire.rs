use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::RoomwardAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct RoomwardHandler {
    engine: Arc<Engine>,
    query_parser: Arc<RoomwardQueryParser>,
}

impl RoomwardHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(RoomwardQueryParser),
        }
    }

    /// The login user name is the id of the user every query acts for.
    fn resolve_user<C: ClientInfo>(&self, client: &C) -> PgWireResult<UserId> {
        let user = client.metadata().get("user").map(String::as_str).unwrap_or_default();
        Ulid::from_string(user).map_err(|_| {
            user_error("28000", format!("user name {user:?} is not a user id"))
        })
    }

    async fn run(&self, user_id: UserId, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(user_id, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, user_id: UserId, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        let offset = engine.config().utc_offset;
        match cmd {
            Command::InsertReservation { room_id, data } => {
                let outcome = engine
                    .create_reservation(room_id, data, user_id)
                    .await
                    .map_err(engine_err)?;
                outcome_response(&outcome, offset)
            }
            Command::UpdateReservation { id, patch } => {
                let outcome = engine
                    .update_reservation(id, patch, user_id)
                    .await
                    .map_err(engine_err)?;
                outcome_response(&outcome, offset)
            }
            Command::DeleteReservation { id } => {
                engine.delete_reservation(id, user_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { room_id } => {
                let reservations = engine
                    .list_for_room(room_id, user_id)
                    .await
                    .map_err(engine_err)?;
                reservations_response(&reservations, offset)
            }
            Command::SelectReservation { id } => {
                let reservation = engine.get_reservation(id, user_id).await.map_err(engine_err)?;
                reservations_response(std::slice::from_ref(&reservation), offset)
            }
            Command::SelectAvailability {
                room_id,
                start,
                end,
                min_duration,
            } => {
                let availability = engine
                    .get_availability(room_id, user_id, start.as_deref(), end.as_deref(), min_duration)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let rid_str = room_id.to_string();
                let rows: Vec<PgWireResult<_>> = availability
                    .available_slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&rfc3339(slot.start, offset))?;
                        encoder.encode_field(&rfc3339(slot.end, offset))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Row encoding ────────────────────────────────────────────────

const RESERVATION_COLUMNS: [&str; 10] = [
    "id",
    "room_id",
    "organizer_id",
    "title",
    "description",
    "start_time",
    "end_time",
    "invitees",
    "created_at",
    "updated_at",
];

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    RESERVATION_COLUMNS.iter().map(|c| text_field(c)).collect()
}

/// Reservation columns plus the capacity advisory.
fn outcome_schema() -> Vec<FieldInfo> {
    let mut schema = reservation_schema();
    schema.push(text_field("warning"));
    schema
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("room_id"), text_field("start"), text_field("end")]
}

fn rfc3339(t: Ms, offset: FixedOffset) -> String {
    match DateTime::from_timestamp_millis(t) {
        Some(dt) => dt.with_timezone(&offset).to_rfc3339_opts(SecondsFormat::Millis, true),
        None => t.to_string(),
    }
}

/// Postgres text form of an array: `{a,b}`.
fn id_array(ids: &[Ulid]) -> String {
    let joined: Vec<String> = ids.iter().map(Ulid::to_string).collect();
    format!("{{{}}}", joined.join(","))
}

fn encode_reservation(encoder: &mut DataRowEncoder, r: &Reservation, offset: FixedOffset) -> PgWireResult<()> {
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.room_id.to_string())?;
    encoder.encode_field(&r.organizer_id.to_string())?;
    encoder.encode_field(&r.title)?;
    encoder.encode_field(&r.description)?;
    encoder.encode_field(&rfc3339(r.span.start, offset))?;
    encoder.encode_field(&rfc3339(r.span.end, offset))?;
    encoder.encode_field(&id_array(&r.invitees))?;
    encoder.encode_field(&rfc3339(r.created_at, offset))?;
    encoder.encode_field(&rfc3339(r.updated_at, offset))?;
    Ok(())
}

fn reservations_response(reservations: &[Reservation], offset: FixedOffset) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<DataRow>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_reservation(&mut encoder, r, offset)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn outcome_response(outcome: &ReservationOutcome, offset: FixedOffset) -> PgWireResult<Response> {
    let schema = Arc::new(outcome_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_reservation(&mut encoder, &outcome.reservation, offset)?;
    encoder.encode_field(&outcome.warning)?;
    let rows: Vec<PgWireResult<DataRow>> = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns a statement will produce, judged from its text since
/// parameters are still unbound at describe time.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("INSERT") || upper.starts_with("UPDATE") {
        outcome_schema()
    } else if upper.starts_with("SELECT") && upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.starts_with("SELECT") {
        reservation_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomwardHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let user_id = self.resolve_user(client)?;
        Ok(vec![self.run(user_id, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomwardQueryParser;

#[async_trait]
impl QueryParser for RoomwardQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomwardHandler {
    type Statement = String;
    type QueryParser = RoomwardQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let user_id = self.resolve_user(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(user_id, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    scan_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Substitute `$1`, `$2`, ... placeholders with bound parameter values (text
/// format) in one left-to-right pass. Placeholders inside single-quoted
/// literals, including the ones just written, are left alone.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    scan_placeholders(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        })
    })
}

/// Walk `sql`, handing each `$N` outside a quoted literal to `replace`.
/// A `None` from `replace` keeps the placeholder text as written.
fn scan_placeholders(sql: &str, mut replace: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut rest = sql;
    while let Some(c) = rest.chars().next() {
        if c == '\'' {
            // A doubled quote inside a literal toggles twice and stays inside.
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            rest = &rest[c.len_utf8()..];
            continue;
        }
        let digits = rest[1..].bytes().take_while(u8::is_ascii_digit).count();
        let placeholder = &rest[..1 + digits];
        match rest[1..1 + digits].parse::<usize>().ok().and_then(&mut replace) {
            Some(value) => out.push_str(&value),
            None => out.push_str(placeholder),
        }
        rest = &rest[1 + digits..];
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomwardFactory {
    handler: Arc<RoomwardHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<RoomwardAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomwardFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(RoomwardHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                RoomwardAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomwardFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<RoomwardFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidWindow(_) | EngineError::InvalidInput(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::Storage(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
