use std::collections::HashSet;
use std::fmt::Debug;
use std::io;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::{principal_for, DocentAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::status::appointment_timing;

// ── Result schemas ───────────────────────────────────────────────

type Columns = &'static [(&'static str, Type)];

const SLOT_COLUMNS: Columns = &[
    ("time_slot", Type::VARCHAR),
    ("capacity", Type::INT8),
    ("reserved_count", Type::INT8),
    ("available_count", Type::INT8),
];

const TIME_SLOT_COLUMNS: Columns = &[
    ("time_slot", Type::VARCHAR),
    ("capacity", Type::INT8),
    ("active", Type::BOOL),
];

const APPOINTMENT_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("owner", Type::VARCHAR),
    ("date", Type::VARCHAR),
    ("time_slot", Type::VARCHAR),
    ("visitor_count", Type::INT8),
    ("contact_name", Type::VARCHAR),
    ("contact_phone", Type::VARCHAR),
    ("organization", Type::VARCHAR),
    ("purpose", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("timing", Type::VARCHAR),
    ("admin_notes", Type::VARCHAR),
    ("created_at", Type::INT8),
    ("updated_at", Type::INT8),
];

const COUNT_COLUMNS: Columns = &[
    ("pending", Type::INT8),
    ("confirmed", Type::INT8),
    ("completed", Type::INT8),
    ("cancelled", Type::INT8),
    ("total", Type::INT8),
    ("today", Type::INT8),
    ("week", Type::INT8),
    ("month", Type::INT8),
    ("upcoming", Type::INT8),
];

const ACTIVITY_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("title", Type::VARCHAR),
    ("description", Type::VARCHAR),
    ("start_time", Type::INT8),
    ("end_time", Type::INT8),
    ("location", Type::VARCHAR),
    ("speaker", Type::VARCHAR),
    // NULL means unlimited
    ("capacity", Type::INT8),
    ("registration_deadline", Type::INT8),
    ("allow_registration", Type::BOOL),
    ("category", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("phase", Type::VARCHAR),
    ("registered_count", Type::INT8),
    ("is_registered", Type::BOOL),
    ("is_registration_open", Type::BOOL),
];

const REGISTRATION_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("activity_id", Type::VARCHAR),
    ("user_id", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("registration_time", Type::INT8),
    ("cancelled_at", Type::INT8),
    ("activity_title", Type::VARCHAR),
    ("activity_start", Type::INT8),
];

const CATEGORY_COLUMNS: Columns = &[("value", Type::VARCHAR), ("label", Type::VARCHAR)];

const LEDGER_CHECK_COLUMNS: Columns = &[
    ("unit", Type::VARCHAR),
    ("ledger", Type::INT8),
    ("records", Type::INT8),
];

fn table_columns(table: &str) -> Option<Columns> {
    match table {
        "slots" => Some(SLOT_COLUMNS),
        "time_slots" => Some(TIME_SLOT_COLUMNS),
        "appointments" => Some(APPOINTMENT_COLUMNS),
        "appointment_counts" => Some(COUNT_COLUMNS),
        "activities" => Some(ACTIVITY_COLUMNS),
        "activity_categories" => Some(CATEGORY_COLUMNS),
        "registrations" => Some(REGISTRATION_COLUMNS),
        "ledger_check" => Some(LEDGER_CHECK_COLUMNS),
        _ => None,
    }
}

fn schema(columns: Columns, format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

/// Row description for a statement: the table's columns for a SELECT,
/// nothing for anything else.
fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    sql::select_table(sql)
        .and_then(|t| table_columns(&t))
        .map(|columns| schema(columns, format))
        .unwrap_or_default()
}

fn query_response<T>(
    columns: Columns,
    format: &Format,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema(columns, format));
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_appointment(enc: &mut DataRowEncoder, a: Appointment, now: Ms) -> PgWireResult<()> {
    let timing = TimeSlot::parse(&a.time_slot)
        .ok()
        .map(|slot| appointment_timing(a.date, &slot, now).as_str());
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.owner)?;
    enc.encode_field(&a.date.format("%Y-%m-%d").to_string())?;
    enc.encode_field(&a.time_slot)?;
    enc.encode_field(&i64::from(a.visitor_count))?;
    enc.encode_field(&a.contact_name)?;
    enc.encode_field(&a.contact_phone)?;
    enc.encode_field(&a.organization)?;
    enc.encode_field(&a.purpose)?;
    enc.encode_field(&a.status.as_str())?;
    enc.encode_field(&timing)?;
    enc.encode_field(&a.admin_notes)?;
    enc.encode_field(&a.created_at)?;
    enc.encode_field(&a.updated_at)?;
    Ok(())
}

fn encode_activity(enc: &mut DataRowEncoder, v: ActivityView) -> PgWireResult<()> {
    let a = v.activity;
    let capacity = match a.capacity {
        Capacity::Limited(cap) => Some(i64::from(cap)),
        Capacity::Unlimited => None,
    };
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.title)?;
    enc.encode_field(&a.description)?;
    enc.encode_field(&a.start_time)?;
    enc.encode_field(&a.end_time)?;
    enc.encode_field(&a.location)?;
    enc.encode_field(&a.speaker)?;
    enc.encode_field(&capacity)?;
    enc.encode_field(&a.registration_deadline)?;
    enc.encode_field(&a.allow_registration)?;
    enc.encode_field(&a.category)?;
    enc.encode_field(&v.status.as_str())?;
    enc.encode_field(&v.phase.as_str())?;
    enc.encode_field(&i64::from(v.registered_count))?;
    enc.encode_field(&v.is_registered)?;
    enc.encode_field(&v.is_registration_open)?;
    Ok(())
}

fn encode_registration(enc: &mut DataRowEncoder, v: RegistrationView) -> PgWireResult<()> {
    let r = v.registration;
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.activity_id.to_string())?;
    enc.encode_field(&r.user_id)?;
    enc.encode_field(&r.status.as_str())?;
    enc.encode_field(&r.registration_time)?;
    enc.encode_field(&r.cancelled_at)?;
    enc.encode_field(&v.activity_title)?;
    enc.encode_field(&v.activity_start)?;
    Ok(())
}

fn executed(tag: &str) -> Response {
    Response::Execution(Tag::new(tag).with_rows(1))
}

// ── Handler ──────────────────────────────────────────────────────

pub struct DocentHandler {
    engine: Arc<Engine>,
    admins: Arc<HashSet<String>>,
    query_parser: Arc<DocentQueryParser>,
}

impl DocentHandler {
    pub fn new(engine: Arc<Engine>, admins: Arc<HashSet<String>>) -> Self {
        Self {
            engine,
            admins,
            query_parser: Arc::new(DocentQueryParser),
        }
    }

    /// The caller is whoever logged in; the startup `user` is their id.
    fn principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Principal> {
        match client.metadata().get("user") {
            Some(user) if !user.is_empty() => Ok(principal_for(user, &self.admins)),
            _ => {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(user_error("28000", "startup message carried no user name".into()))
            }
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, principal: &Principal, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(principal, cmd, format).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_rejection() => "rejected",
            Err(_) => "error",
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(user = %principal.user_id, command = label, "{e}");
        }
        result.map_err(engine_err)
    }

    async fn execute_command(
        &self,
        principal: &Principal,
        cmd: Command,
        format: &Format,
    ) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::SelectSlots { date } => {
                let slots = engine.available_slots(date).await?;
                Ok(query_response(SLOT_COLUMNS, format, slots, |enc, s| {
                    enc.encode_field(&s.time_slot)?;
                    enc.encode_field(&i64::from(s.capacity))?;
                    enc.encode_field(&i64::from(s.reserved_count))?;
                    enc.encode_field(&i64::from(s.available_count))?;
                    Ok(())
                }))
            }
            Command::SelectTimeSlots => {
                let slots = engine.time_slots(principal)?;
                Ok(query_response(TIME_SLOT_COLUMNS, format, slots, |enc, c| {
                    enc.encode_field(&c.slot.label)?;
                    enc.encode_field(&i64::from(c.capacity))?;
                    enc.encode_field(&c.active)?;
                    Ok(())
                }))
            }
            Command::InsertTimeSlot {
                time_slot,
                capacity,
                active,
            } => {
                engine
                    .configure_time_slot(principal, &time_slot, capacity, active)
                    .await?;
                Ok(executed("INSERT"))
            }
            Command::UpdateTimeSlot {
                time_slot,
                capacity,
                active,
            } => {
                engine
                    .update_time_slot(principal, &time_slot, capacity, active)
                    .await?;
                Ok(executed("UPDATE"))
            }
            Command::InsertAppointment(req) => {
                engine.create_appointment(principal, req).await?;
                Ok(executed("INSERT"))
            }
            Command::CancelAppointment { id } => {
                engine.cancel_appointment(principal, id).await?;
                Ok(executed("DELETE"))
            }
            Command::UpdateAppointment {
                id,
                status,
                admin_notes,
            } => {
                engine
                    .update_appointment(principal, id, status, admin_notes)
                    .await?;
                Ok(executed("UPDATE"))
            }
            Command::SelectAppointments { id, filter } => {
                let appointments = match id {
                    Some(id) => {
                        let a = engine.get_appointment(principal, id)?;
                        if filter.matches(&a) { vec![a] } else { vec![] }
                    }
                    None if principal.is_admin() => engine.list_appointments(principal, &filter)?,
                    None => engine
                        .appointments_for_owner(principal)
                        .into_iter()
                        .filter(|a| filter.matches(a))
                        .collect(),
                };
                let now = engine.now();
                Ok(query_response(APPOINTMENT_COLUMNS, format, appointments, |enc, a| {
                    encode_appointment(enc, a, now)
                }))
            }
            Command::SelectAppointmentCounts => {
                let c = engine.appointment_counts(principal)?;
                Ok(query_response(COUNT_COLUMNS, format, [c], |enc, c| {
                    for n in [
                        c.pending,
                        c.confirmed,
                        c.completed,
                        c.cancelled,
                        c.total,
                        c.today,
                        c.week,
                        c.month,
                        c.upcoming,
                    ] {
                        enc.encode_field(&(n as i64))?;
                    }
                    Ok(())
                }))
            }
            Command::InsertActivity(new) => {
                engine.create_activity(principal, new).await?;
                Ok(executed("INSERT"))
            }
            Command::UpdateActivity { id, patch } => {
                engine.update_activity(principal, id, patch).await?;
                Ok(executed("UPDATE"))
            }
            Command::SelectActivities { id, filter } => {
                let views = match id {
                    Some(id) => {
                        let view = engine.activity_view(principal, id).await?;
                        let visible = principal.is_admin()
                            || view.activity.status == ActivityStatus::Active;
                        if visible && filter.matches(&view.activity, engine.now()) {
                            vec![view]
                        } else {
                            vec![]
                        }
                    }
                    None => engine.list_activities(principal, &filter).await,
                };
                Ok(query_response(ACTIVITY_COLUMNS, format, views, encode_activity))
            }
            Command::SelectActivityCategories => Ok(query_response(
                CATEGORY_COLUMNS,
                format,
                ACTIVITY_CATEGORIES,
                |enc, (value, label)| {
                    enc.encode_field(&value.to_string())?;
                    enc.encode_field(&label.to_string())?;
                    Ok(())
                },
            )),
            Command::InsertRegistration { id, activity_id } => {
                engine.register(principal, activity_id, id).await?;
                Ok(executed("INSERT"))
            }
            Command::CancelRegistration { activity_id } => {
                engine.cancel_registration(principal, activity_id).await?;
                Ok(executed("DELETE"))
            }
            Command::SelectRegistrations { activity_id } => {
                let views = match activity_id {
                    Some(activity_id) if principal.is_admin() => {
                        let activity = engine.activity(activity_id)?;
                        engine
                            .activity_registrations(principal, activity_id)?
                            .into_iter()
                            .map(|registration| RegistrationView {
                                registration,
                                activity_title: activity.title.clone(),
                                activity_start: activity.start_time,
                            })
                            .collect()
                    }
                    Some(activity_id) => engine
                        .registrations_for_user(principal)
                        .into_iter()
                        .filter(|v| v.registration.activity_id == activity_id)
                        .collect(),
                    None => engine.registrations_for_user(principal),
                };
                Ok(query_response(REGISTRATION_COLUMNS, format, views, encode_registration))
            }
            Command::SelectLedgerCheck => {
                let mismatches = engine.verify_counters(principal).await?;
                Ok(query_response(LEDGER_CHECK_COLUMNS, format, mismatches, |enc, m| {
                    enc.encode_field(&m.unit)?;
                    enc.encode_field(&i64::from(m.ledger))?;
                    enc.encode_field(&i64::from(m.records))?;
                    Ok(())
                }))
            }
        }
    }
}

#[async_trait]
impl SimpleQueryHandler for DocentHandler {
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
        let principal = self.principal(client)?;
        let response = self.run(&principal, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct DocentQueryParser;

#[async_trait]
impl QueryParser for DocentQueryParser {
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
        Ok(describe_schema(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for DocentHandler {
    type Statement = String;
    type QueryParser = DocentQueryParser;

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
        let principal = self.principal(client)?;
        let sql = substitute_params(portal);
        self.run(&principal, &sql, &portal.result_column_format).await
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
            describe_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text
/// format). Every value becomes a quoted literal; the SQL layer accepts
/// quoted numbers and booleans.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    // highest index first so $1 never eats the prefix of $10
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct DocentFactory {
    handler: Arc<DocentHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<DocentAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl DocentFactory {
    pub fn new(engine: Arc<Engine>, admins: Arc<HashSet<String>>, password: String) -> Self {
        let auth_source = DocentAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(DocentHandler::new(engine, admins)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for DocentFactory {
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
    engine: Arc<Engine>,
    admins: Arc<HashSet<String>>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(DocentFactory::new(engine, admins, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
