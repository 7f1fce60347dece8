use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::TutoriumAuthSource;
use crate::limits::MAX_SLOTS_PER_BOOKING;
use crate::model::*;
use crate::scheduler::{Scheduler, SchedulingError};
use crate::school::SchoolManager;
use crate::sql::{self, BookingFilter, Command};

pub struct TutoriumHandler {
    schools: Arc<SchoolManager>,
    query_parser: Arc<TutoriumQueryParser>,
}

impl TutoriumHandler {
    pub fn new(schools: Arc<SchoolManager>) -> Self {
        Self {
            schools,
            query_parser: Arc::new(TutoriumQueryParser),
        }
    }

    fn resolve_scheduler<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Scheduler>> {
        let school = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.schools.get_or_create(&school).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("school error: {e}"),
            )))
        })
    }

    /// The already-authenticated identity this connection acts as.
    fn connection_actor<C: ClientInfo>(client: &C) -> String {
        client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn execute_command(
        &self,
        scheduler: &Scheduler,
        cmd: Command,
        connection_actor: String,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SubmitBooking {
                resource,
                requester,
                start,
                end,
                location,
                comment,
                topic,
                assignment_id,
                justification,
            } => {
                let slots = run_from_span(start, end).map_err(scheduling_err)?;
                let booking = scheduler
                    .submit(BookingRequest {
                        resource,
                        requester,
                        slots,
                        location,
                        comment,
                        topic,
                        assignment_id,
                        prep_materials: Vec::new(),
                        justification,
                    })
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![booking_rows(vec![booking])])
            }
            Command::RescheduleBooking {
                id,
                start,
                end,
                resource,
                reason,
                actor,
            } => {
                let slots = run_from_span(start, end).map_err(scheduling_err)?;
                let replacement = scheduler
                    .reschedule(
                        id,
                        slots,
                        resource,
                        reason.as_deref().unwrap_or(""),
                        actor.as_deref().unwrap_or(&connection_actor),
                    )
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![booking_rows(vec![replacement])])
            }
            Command::DecideBooking { id, approve, actor } => {
                let booking = scheduler
                    .decide(id, approve, actor.as_deref().unwrap_or(&connection_actor))
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![booking_rows(vec![booking])])
            }
            Command::CancelBooking { id } => {
                scheduler
                    .cancel(id, &connection_actor)
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::ById(id) => scheduler.booking(id).into_iter().collect(),
                    BookingFilter::ByResource(r) => scheduler.bookings_for_resource(&r),
                    BookingFilter::ByRequester(r) => scheduler.bookings_for_requester(&r),
                };
                Ok(vec![booking_rows(bookings)])
            }
            Command::InsertBlackout { start, end } => {
                scheduler
                    .add_blackout(start, end)
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteBlackout { id } => {
                scheduler
                    .remove_blackout(id)
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBlackouts => Ok(vec![blackout_rows(scheduler.list_blackouts())]),
            Command::InsertBusy {
                resource,
                start,
                end,
                source,
            } => {
                scheduler
                    .mark_busy(&resource, start, end, source)
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteBusy { id } => {
                scheduler.clear_busy(id).await.map_err(scheduling_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBusy { resource } => {
                Ok(vec![busy_rows(scheduler.busy_for_resource(&resource).await)])
            }
            Command::SelectQuotas { requester } => {
                let quotas = match requester {
                    Some(r) => vec![scheduler.quota(&r)],
                    None => scheduler.all_quotas(),
                };
                Ok(vec![quota_rows(quotas)])
            }
            Command::SetQuotaLimit { requester, limit } => {
                let info = scheduler
                    .set_quota_limit(&requester, limit)
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![quota_rows(vec![info])])
            }
            Command::ResetQuota { requester } => {
                let info = scheduler
                    .reset_quota(&requester)
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![quota_rows(vec![info])])
            }
            Command::SelectAvailability {
                resource,
                start,
                end,
            } => {
                let free = scheduler
                    .availability(&resource, start, end)
                    .await
                    .map_err(scheduling_err)?;

                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = free
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&resource)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end())?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                channel.strip_prefix("resource_").ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected resource_{{name}})"),
                    )))
                })?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { .. } => Ok(vec![Response::Execution(Tag::new("UNLISTEN"))]),
            Command::UnlistenAll => Ok(vec![Response::Execution(Tag::new("UNLISTEN"))]),
        }
    }
}

/// Expand a half-open `[start, end)` interval into its contiguous slot run.
/// Alignment is checked here so a client-side off-by-some-minutes never turns
/// into a silently wider booking; run-length limits stay with the scheduler,
/// the cap here just bounds the loop.
fn run_from_span(start: Ms, end: Ms) -> Result<Vec<Slot>, SchedulingError> {
    if !Slot::is_aligned(start) || !Slot::is_aligned(end) {
        return Err(SchedulingError::InvalidRequest(
            "start and end must be aligned to the 20-minute grid",
        ));
    }
    let mut slots = Vec::new();
    let mut s = start;
    while s < end && slots.len() <= MAX_SLOTS_PER_BOOKING {
        slots.push(Slot { start: s });
        s += SLOT_MS;
    }
    Ok(slots)
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("resource", Type::VARCHAR),
        text_field("requester", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("location", Type::VARCHAR),
        text_field("comment", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
    ]
}

fn quota_schema() -> Vec<FieldInfo> {
    vec![
        text_field("requester", Type::VARCHAR),
        text_field("used", Type::INT8),
        text_field("limit", Type::INT8),
    ]
}

fn blackout_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
    ]
}

fn busy_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("resource", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("source", Type::VARCHAR),
    ]
}

fn booking_rows(bookings: Vec<Booking>) -> Response<'static> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.resource)?;
            encoder.encode_field(&b.requester)?;
            encoder.encode_field(&b.span().start)?;
            encoder.encode_field(&b.span().end)?;
            encoder.encode_field(&b.location)?;
            encoder.encode_field(&b.comment)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn quota_rows(quotas: Vec<QuotaInfo>) -> Response<'static> {
    let schema = Arc::new(quota_schema());
    let rows: Vec<PgWireResult<_>> = quotas
        .into_iter()
        .map(|q| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&q.requester)?;
            encoder.encode_field(&(q.used as i64))?;
            encoder.encode_field(&(q.limit as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn blackout_rows(blackouts: Vec<BlackoutInfo>) -> Response<'static> {
    let schema = Arc::new(blackout_schema());
    let rows: Vec<PgWireResult<_>> = blackouts
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.start)?;
            encoder.encode_field(&b.end)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn busy_rows(busy: Vec<BusyInfo>) -> Response<'static> {
    let schema = Arc::new(busy_schema());
    let rows: Vec<PgWireResult<_>> = busy
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.resource)?;
            encoder.encode_field(&b.start)?;
            encoder.encode_field(&b.end)?;
            encoder.encode_field(&b.source.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for TutoriumHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let scheduler = self.resolve_scheduler(client)?;
        let actor = Self::connection_actor(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = crate::observability::command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(&scheduler, cmd, actor).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label,
            "status" => status,
        )
        .increment(1);
        metrics::histogram!(
            crate::observability::QUERY_DURATION_SECONDS,
            "command" => label,
        )
        .record(started.elapsed().as_secs_f64());
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TutoriumQueryParser;

#[async_trait]
impl QueryParser for TutoriumQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

/// Best-effort schema guess for Describe: SELECTs and the row-returning
/// mutations advertise their row shape, everything else reports no columns.
fn statement_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("QUOTAS") {
        quota_schema()
    } else if upper.contains("BLACKOUTS") && upper.starts_with("SELECT") {
        blackout_schema()
    } else if upper.contains("BUSY_PERIODS") && upper.starts_with("SELECT") {
        busy_schema()
    } else if upper.contains("BOOKINGS") && !upper.starts_with("DELETE") {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for TutoriumHandler {
    type Statement = String;
    type QueryParser = TutoriumQueryParser;

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
        let scheduler = self.resolve_scheduler(client)?;
        let actor = Self::connection_actor(client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&scheduler, cmd, actor).await?;
        Ok(responses.remove(0))
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
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TutoriumFactory {
    handler: Arc<TutoriumHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<TutoriumAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TutoriumFactory {
    pub fn new(schools: Arc<SchoolManager>, password: String) -> Self {
        let auth_source = TutoriumAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TutoriumHandler::new(schools)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TutoriumFactory {
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
    schools: Arc<SchoolManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = Arc::new(TutoriumFactory::new(schools, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// One SQLSTATE per error kind so callers can branch without parsing text.
fn scheduling_sqlstate(e: &SchedulingError) -> &'static str {
    match e {
        SchedulingError::InvalidRequest(_) => "22023",
        SchedulingError::BlackoutConflict(_) => "23513",
        SchedulingError::SlotUnavailable(_) => "23505",
        SchedulingError::QuotaExceeded { .. } => "23514",
        SchedulingError::NotFound(_) => "42704",
        SchedulingError::InvalidState(_) => "55000",
        SchedulingError::Contention => "40001",
        SchedulingError::DependencyUnavailable(_) => "57P03",
    }
}

fn scheduling_err(e: SchedulingError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        scheduling_sqlstate(&e).into(),
        format!("{}: {e}", e.kind()),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_from_span_builds_contiguous_slots() {
        let slots = run_from_span(0, 3 * SLOT_MS).unwrap();
        assert_eq!(slots.len(), 3);
        assert!(crate::slots::is_contiguous(&slots));
    }

    #[test]
    fn run_from_span_rejects_misalignment() {
        assert!(run_from_span(1, SLOT_MS).is_err());
        assert!(run_from_span(0, SLOT_MS + 1).is_err());
    }

    #[test]
    fn run_from_span_caps_the_loop() {
        // A huge window yields just over the limit, never an unbounded vec
        let slots = run_from_span(0, 1_000_000 * SLOT_MS).unwrap();
        assert_eq!(slots.len(), MAX_SLOTS_PER_BOOKING + 1);
    }

    #[test]
    fn sqlstates_are_distinct_per_kind() {
        let states = [
            scheduling_sqlstate(&SchedulingError::InvalidRequest("x")),
            scheduling_sqlstate(&SchedulingError::BlackoutConflict(ulid::Ulid::new())),
            scheduling_sqlstate(&SchedulingError::SlotUnavailable(ulid::Ulid::new())),
            scheduling_sqlstate(&SchedulingError::QuotaExceeded { used: 3, limit: 3 }),
            scheduling_sqlstate(&SchedulingError::NotFound(ulid::Ulid::new())),
            scheduling_sqlstate(&SchedulingError::InvalidState(BookingStatus::Confirmed)),
            scheduling_sqlstate(&SchedulingError::Contention),
            scheduling_sqlstate(&SchedulingError::DependencyUnavailable("x".into())),
        ];
        let unique: std::collections::HashSet<_> = states.iter().collect();
        assert_eq!(unique.len(), states.len());
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(count_params("UPDATE bookings SET start = $2, \"end\" = $3 WHERE id = $1"), 3);
        assert_eq!(count_params("SELECT * FROM blackouts"), 0);
    }
}
