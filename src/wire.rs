use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::NevermissAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct NevermissHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<NevermissQueryParser>,
}

impl NevermissHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(NevermissQueryParser),
        }
    }

    /// One tenant per database name.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd, now_ms()).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

fn executed(tag: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

async fn execute_command(engine: &Engine, cmd: Command, now: Ms) -> PgWireResult<Response> {
    match cmd {
        Command::InsertPage {
            id,
            owner_id,
            fields,
        } => {
            engine
                .create_page(id, owner_id, fields, now)
                .await
                .map_err(engine_err)?;
            Ok(executed("INSERT", 1))
        }
        Command::UpdatePage { id, fields } => {
            engine
                .update_page(id, fields, now)
                .await
                .map_err(engine_err)?;
            Ok(executed("UPDATE", 1))
        }
        Command::DeletePage { id } => {
            engine.delete_page(id).await.map_err(engine_err)?;
            Ok(executed("DELETE", 1))
        }
        Command::InsertBooking {
            id,
            page_id,
            guest_name,
            start,
            end,
        } => {
            if end <= start {
                return Err(engine_err(EngineError::InvalidInterval));
            }
            engine
                .create_booking(id, page_id, &guest_name, Span::new(start, end), now)
                .await
                .map_err(engine_err)?;
            Ok(executed("INSERT", 1))
        }
        Command::CancelBooking { id, policy } => {
            engine
                .cancel_booking(id, now, policy)
                .await
                .map_err(engine_err)?;
            let tag = match policy {
                crate::engine::CancelPolicy::Guest => "DELETE",
                crate::engine::CancelPolicy::Owner => "UPDATE",
            };
            Ok(executed(tag, 1))
        }
        Command::SetMeetingUrl { id, meeting_url } => {
            engine
                .set_meeting_url(id, meeting_url)
                .await
                .map_err(engine_err)?;
            Ok(executed("UPDATE", 1))
        }
        Command::MarkNotificationRead { id } => {
            engine.mark_notification_read(id).await.map_err(engine_err)?;
            Ok(executed("UPDATE", 1))
        }
        Command::MarkAllNotificationsRead { owner_id } => {
            let n = engine
                .mark_all_notifications_read(owner_id)
                .await
                .map_err(engine_err)?;
            Ok(executed("UPDATE", n))
        }
        Command::SelectPage { id } => {
            let page = engine.get_page(id).await.map_err(engine_err)?;
            page_rows(vec![page])
        }
        Command::SelectPageBySlug { slug } => {
            let page = engine.page_by_slug(&slug, now).await.map_err(engine_err)?;
            page_rows(vec![page])
        }
        Command::SelectPages { owner_id } => page_rows(engine.list_pages(owner_id).await),
        Command::SelectBooking { id } => {
            let booking = engine.get_booking(id).await.map_err(engine_err)?;
            booking_rows(vec![booking])
        }
        Command::SelectBookings {
            owner_id,
            start,
            end,
        } => {
            let bookings = engine
                .list_bookings(owner_id, start, end)
                .await
                .map_err(engine_err)?;
            booking_rows(bookings)
        }
        Command::SelectSlots { page_id, date } => {
            let slots = engine
                .compute_slots(page_id, date, now)
                .await
                .map_err(engine_err)?;
            let schema = Arc::new(slots_schema());
            let pid = page_id.to_string();
            let rows = slots.into_iter().map(|slot| -> PgWireResult<DataRow> {
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&pid)?;
                encoder.encode_field(&slot.start)?;
                encoder.encode_field(&slot.end)?;
                Ok(encoder.take_row())
            });
            query_response(schema.clone(), rows)
        }
        Command::SelectEligibleDates { page_id } => {
            let dates = engine
                .compute_eligible_dates(page_id, now)
                .await
                .map_err(engine_err)?;
            let schema = Arc::new(eligible_dates_schema());
            let pid = page_id.to_string();
            let rows = dates.into_iter().map(|date| -> PgWireResult<DataRow> {
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&pid)?;
                encoder.encode_field(&date.format("%Y-%m-%d").to_string())?;
                Ok(encoder.take_row())
            });
            query_response(schema.clone(), rows)
        }
        Command::SelectConflicts {
            owner_id,
            start,
            end,
            exclude,
        } => {
            if end <= start {
                return Err(engine_err(EngineError::InvalidInterval));
            }
            let bookings = engine
                .find_conflicts(owner_id, Span::new(start, end), exclude)
                .await
                .map_err(engine_err)?;
            booking_rows(bookings)
        }
        Command::SelectNotifications {
            owner_id,
            unread_only,
        } => {
            let notifications = engine.list_notifications(owner_id, unread_only).await;
            let schema = Arc::new(notifications_schema());
            let rows = notifications.into_iter().map(|n| -> PgWireResult<DataRow> {
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&n.id.to_string())?;
                encoder.encode_field(&n.owner_id.to_string())?;
                encoder.encode_field(&n.kind.as_str())?;
                encoder.encode_field(&n.booking_id.to_string())?;
                encoder.encode_field(&n.is_read)?;
                encoder.encode_field(&n.created_at)?;
                Ok(encoder.take_row())
            });
            query_response(schema.clone(), rows)
        }
    }
}

fn query_response(
    schema: Arc<Vec<FieldInfo>>,
    rows: impl Iterator<Item = PgWireResult<DataRow>>,
) -> PgWireResult<Response> {
    let rows: Vec<PgWireResult<DataRow>> = rows.collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn page_rows(pages: Vec<BookingPage>) -> PgWireResult<Response> {
    let schema = Arc::new(pages_schema());
    let rows = pages.into_iter().map(|p| -> PgWireResult<DataRow> {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&p.id.to_string())?;
        encoder.encode_field(&p.owner_id.to_string())?;
        encoder.encode_field(&p.slug)?;
        encoder.encode_field(&p.title)?;
        encoder.encode_field(&(p.config.duration_minutes as i32))?;
        let days = serde_json::to_string(&p.config.available_days.days())
            .unwrap_or_else(|_| "[]".to_string());
        encoder.encode_field(&days)?;
        encoder.encode_field(&p.config.start_time.format("%H:%M").to_string())?;
        encoder.encode_field(&p.config.end_time.format("%H:%M").to_string())?;
        encoder.encode_field(&(p.config.min_notice_hours as i32))?;
        encoder.encode_field(&(p.config.max_days_ahead as i32))?;
        encoder.encode_field(&p.config.timezone.name())?;
        encoder.encode_field(&p.meeting_type.as_str())?;
        encoder.encode_field(&p.location_address)?;
        encoder.encode_field(&p.expires_at)?;
        encoder.encode_field(&p.is_active)?;
        encoder.encode_field(&p.created_at)?;
        encoder.encode_field(&p.updated_at)?;
        Ok(encoder.take_row())
    });
    query_response(schema.clone(), rows)
}

fn booking_rows(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows = bookings.into_iter().map(|b| -> PgWireResult<DataRow> {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&b.id.to_string())?;
        encoder.encode_field(&b.page_id.to_string())?;
        encoder.encode_field(&b.owner_id.to_string())?;
        encoder.encode_field(&b.guest_name)?;
        encoder.encode_field(&b.span.start)?;
        encoder.encode_field(&b.span.end)?;
        encoder.encode_field(&b.meeting_type.as_str())?;
        encoder.encode_field(&b.location_address)?;
        encoder.encode_field(&b.meeting_url)?;
        encoder.encode_field(&b.status.as_str())?;
        encoder.encode_field(&b.cancelled_at)?;
        encoder.encode_field(&b.cancel_deadline)?;
        encoder.encode_field(&b.created_at)?;
        Ok(encoder.take_row())
    });
    query_response(schema.clone(), rows)
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int4(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn pages_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("owner_id"),
        text("slug"),
        text("title"),
        int4("duration_minutes"),
        text("available_days"),
        text("start_time"),
        text("end_time"),
        int4("min_notice_hours"),
        int4("max_days_ahead"),
        text("timezone"),
        text("meeting_type"),
        text("location_address"),
        int8("expires_at"),
        boolean("is_active"),
        int8("created_at"),
        int8("updated_at"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("page_id"),
        text("owner_id"),
        text("guest_name"),
        int8("start"),
        int8("end"),
        text("meeting_type"),
        text("location_address"),
        text("meeting_url"),
        text("status"),
        int8("cancelled_at"),
        int8("cancel_deadline"),
        int8("created_at"),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text("page_id"), int8("start"), int8("end")]
}

fn eligible_dates_schema() -> Vec<FieldInfo> {
    vec![text("page_id"), text("date")]
}

fn notifications_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("owner_id"),
        text("type"),
        text("booking_id"),
        boolean("is_read"),
        int8("created_at"),
    ]
}

/// Row shape of a statement, judged from the table after FROM. Only SELECTs
/// return rows.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let mut words = sql.split_whitespace();
    if !words
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case("SELECT"))
    {
        return Vec::new();
    }
    let table = words
        .skip_while(|w| !w.eq_ignore_ascii_case("FROM"))
        .nth(1)
        .map(|t| t.trim_matches(|c: char| c == '"' || c == ';').to_lowercase());
    match table.as_deref() {
        Some("booking_pages") => pages_schema(),
        Some("bookings") | Some("conflicts") => bookings_schema(),
        Some("slots") => slots_schema(),
        Some("eligible_dates") => eligible_dates_schema(),
        Some("notifications") => notifications_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for NevermissHandler {
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
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct NevermissQueryParser;

#[async_trait]
impl QueryParser for NevermissQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for NevermissHandler {
    type Statement = String;
    type QueryParser = NevermissQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if let Ok(n) = sql[start..end].parse::<usize>() {
            max = max.max(n);
        }
        i = end.max(i + 1);
    }
    max
}

/// Inline bound parameters as quoted literals. Highest index first so `$1`
/// never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct NevermissFactory {
    handler: Arc<NevermissHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<NevermissAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl NevermissFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(NevermissHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                NevermissAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for NevermissFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(NevermissFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for each engine failure. Overlap uses exclusion_violation, the
/// code Postgres raises for a violated range exclusion constraint.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::AlreadyExists(_) | EngineError::SlugTaken(_) => "23505",
        EngineError::SlotNotOffered
        | EngineError::InvalidInterval
        | EngineError::InvalidConfig(_)
        | EngineError::InvalidInput(_) => "22023",
        EngineError::NotFound(_) | EngineError::NotFoundSlug(_) => "02000",
        EngineError::PageInactive(_)
        | EngineError::PageExpired(_)
        | EngineError::CancelDeadlinePassed(_)
        | EngineError::AlreadyCancelled(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest_index() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(count_params("SELECT * FROM slots WHERE page_id = $1 AND date = $2"), 2);
        assert_eq!(count_params("VALUES ($2, $10, $1)"), 10);
        assert_eq!(count_params("cost $ 5"), 0);
    }

    #[test]
    fn result_schema_by_table() {
        assert_eq!(result_schema("SELECT * FROM slots WHERE page_id = $1").len(), 3);
        assert_eq!(result_schema("select * from booking_pages where slug = $1").len(), 17);
        assert_eq!(result_schema("SELECT * FROM conflicts WHERE owner_id = $1").len(), 13);
        assert_eq!(result_schema("SELECT * FROM notifications;").len(), 6);
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
        assert!(result_schema("SELECT * FROM nowhere").is_empty());
    }

    #[test]
    fn sqlstate_mapping() {
        assert_eq!(engine_sqlstate(&EngineError::Conflict(Ulid::new())), "23P01");
        assert_eq!(engine_sqlstate(&EngineError::SlotNotOffered), "22023");
        assert_eq!(engine_sqlstate(&EngineError::NotFoundSlug("x".into())), "02000");
        assert_eq!(engine_sqlstate(&EngineError::CancelDeadlinePassed(0)), "55000");
        assert_eq!(engine_sqlstate(&EngineError::SlugTaken("x".into())), "23505");
    }
}
