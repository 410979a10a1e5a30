use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::clock::parse_local_instant;
use crate::model::*;
use crate::status::ActivityPhase;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSlots {
        date: NaiveDate,
    },
    SelectTimeSlots,
    InsertTimeSlot {
        time_slot: String,
        capacity: u32,
        active: bool,
    },
    UpdateTimeSlot {
        time_slot: String,
        capacity: Option<u32>,
        active: Option<bool>,
    },
    InsertAppointment(NewAppointment),
    CancelAppointment {
        id: Ulid,
    },
    UpdateAppointment {
        id: Ulid,
        status: Option<AppointmentStatus>,
        admin_notes: Option<String>,
    },
    SelectAppointments {
        id: Option<Ulid>,
        filter: AppointmentFilter,
    },
    SelectAppointmentCounts,
    InsertActivity(NewActivity),
    UpdateActivity {
        id: Ulid,
        patch: ActivityPatch,
    },
    SelectActivities {
        id: Option<Ulid>,
        filter: ActivityFilter,
    },
    SelectActivityCategories,
    InsertRegistration {
        id: Ulid,
        activity_id: Ulid,
    },
    CancelRegistration {
        activity_id: Ulid,
    },
    SelectRegistrations {
        activity_id: Option<Ulid>,
    },
    SelectLedgerCheck,
}

/// Column order assumed by an INSERT without a column list.
const TIME_SLOT_COLUMNS: &[&str] = &["time_slot", "capacity", "active"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "id",
    "date",
    "time_slot",
    "visitor_count",
    "contact_name",
    "contact_phone",
    "organization",
    "purpose",
];
const ACTIVITY_COLUMNS: &[&str] = &[
    "id",
    "title",
    "description",
    "start_time",
    "end_time",
    "location",
    "speaker",
    "capacity",
    "registration_deadline",
    "allow_registration",
    "category",
];
const REGISTRATION_COLUMNS: &[&str] = &["id", "activity_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "time_slots" => {
            let mut row = Fields::from_insert("time_slots", insert, TIME_SLOT_COLUMNS)?;
            let cmd = Command::InsertTimeSlot {
                time_slot: parse_text(&row.required("time_slot")?)?,
                capacity: parse_u32(&row.required("capacity")?)?,
                active: row.take("active").map(|e| parse_bool(&e)).transpose()?.unwrap_or(true),
            };
            row.finish()?;
            Ok(cmd)
        }
        "appointments" => {
            let mut row = Fields::from_insert("appointments", insert, APPOINTMENT_COLUMNS)?;
            let req = NewAppointment {
                id: parse_ulid(&row.required("id")?)?,
                date: parse_date(&row.required("date")?)?,
                time_slot: parse_text(&row.required("time_slot")?)?,
                visitor_count: parse_u32(&row.required("visitor_count")?)?,
                contact_name: parse_text(&row.required("contact_name")?)?,
                contact_phone: parse_text(&row.required("contact_phone")?)?,
                organization: row.optional_text("organization")?,
                purpose: row.optional_text("purpose")?,
            };
            row.finish()?;
            Ok(Command::InsertAppointment(req))
        }
        "activities" => {
            let mut row = Fields::from_insert("activities", insert, ACTIVITY_COLUMNS)?;
            let new = NewActivity {
                id: parse_ulid(&row.required("id")?)?,
                title: parse_text(&row.required("title")?)?,
                description: row.optional_text("description")?.unwrap_or_default(),
                start_time: parse_instant(&row.required("start_time")?)?,
                end_time: parse_instant(&row.required("end_time")?)?,
                location: parse_text(&row.required("location")?)?,
                speaker: row.optional_text("speaker")?,
                capacity: row
                    .take("capacity")
                    .map(|e| parse_capacity(&e))
                    .transpose()?
                    .unwrap_or(Capacity::Unlimited),
                registration_deadline: row
                    .take("registration_deadline")
                    .map(|e| parse_optional_instant(&e))
                    .transpose()?
                    .flatten(),
                allow_registration: row
                    .take("allow_registration")
                    .map(|e| parse_bool(&e))
                    .transpose()?
                    .unwrap_or(true),
                category: row.optional_text("category")?.unwrap_or_default(),
            };
            row.finish()?;
            Ok(Command::InsertActivity(new))
        }
        "registrations" => {
            let mut row = Fields::from_insert("registrations", insert, REGISTRATION_COLUMNS)?;
            let cmd = Command::InsertRegistration {
                id: parse_ulid(&row.required("id")?)?,
                activity_id: parse_ulid(&row.required("activity_id")?)?,
            };
            row.finish()?;
            Ok(cmd)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = Filters::parse(delete.selection.as_ref())?;

    let cmd = match table.as_str() {
        "appointments" => Command::CancelAppointment {
            id: parse_ulid(&filters.required_eq("id")?)?,
        },
        "registrations" => Command::CancelRegistration {
            activity_id: parse_ulid(&filters.required_eq("activity_id")?)?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(cmd)
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut set = Fields::from_assignments(&table, assignments)?;
    let mut filters = Filters::parse(selection)?;

    let cmd = match table.as_str() {
        "time_slots" => Command::UpdateTimeSlot {
            time_slot: parse_text(&filters.required_eq("time_slot")?)?,
            capacity: set.take("capacity").map(|e| parse_u32(&e)).transpose()?,
            active: set.take("active").map(|e| parse_bool(&e)).transpose()?,
        },
        "appointments" => Command::UpdateAppointment {
            id: parse_ulid(&filters.required_eq("id")?)?,
            status: set
                .take("status")
                .map(|e| parse_appointment_status(&e))
                .transpose()?,
            // NULL clears the notes, same as an empty string
            admin_notes: set
                .take("admin_notes")
                .map(|e| parse_optional_text(&e).map(Option::unwrap_or_default))
                .transpose()?,
        },
        "activities" => Command::UpdateActivity {
            id: parse_ulid(&filters.required_eq("id")?)?,
            patch: ActivityPatch {
                title: set.take("title").map(|e| parse_text(&e)).transpose()?,
                description: set
                    .take("description")
                    .map(|e| parse_optional_text(&e).map(Option::unwrap_or_default))
                    .transpose()?,
                start_time: set.take("start_time").map(|e| parse_instant(&e)).transpose()?,
                end_time: set.take("end_time").map(|e| parse_instant(&e)).transpose()?,
                location: set.take("location").map(|e| parse_text(&e)).transpose()?,
                speaker: set.take("speaker").map(|e| parse_optional_text(&e)).transpose()?,
                capacity: set.take("capacity").map(|e| parse_capacity(&e)).transpose()?,
                registration_deadline: set
                    .take("registration_deadline")
                    .map(|e| parse_optional_instant(&e))
                    .transpose()?,
                allow_registration: set
                    .take("allow_registration")
                    .map(|e| parse_bool(&e))
                    .transpose()?,
                category: set
                    .take("category")
                    .map(|e| parse_optional_text(&e).map(Option::unwrap_or_default))
                    .transpose()?,
                status: set
                    .take("status")
                    .map(|e| parse_activity_status(&e))
                    .transpose()?,
            },
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    set.finish()?;
    filters.finish()?;
    Ok(cmd)
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let mut filters = Filters::parse(select.selection.as_ref())?;

    let cmd = match table.as_str() {
        "slots" => Command::SelectSlots {
            date: parse_date(&filters.required_eq("date")?)?,
        },
        "time_slots" => Command::SelectTimeSlots,
        "appointments" => {
            let id = filters.take(BinaryOperator::Eq, "id").map(|e| parse_ulid(&e)).transpose()?;
            let status = filters
                .take(BinaryOperator::Eq, "status")
                .map(|e| parse_appointment_status(&e))
                .transpose()?;
            let on = filters.take(BinaryOperator::Eq, "date").map(|e| parse_date(&e)).transpose()?;
            let from = filters.take(BinaryOperator::GtEq, "date").map(|e| parse_date(&e)).transpose()?;
            let to = filters.take(BinaryOperator::LtEq, "date").map(|e| parse_date(&e)).transpose()?;
            Command::SelectAppointments {
                id,
                filter: AppointmentFilter {
                    status,
                    date_from: on.or(from),
                    date_to: on.or(to),
                },
            }
        }
        "appointment_counts" => Command::SelectAppointmentCounts,
        "activities" => Command::SelectActivities {
            id: filters.take(BinaryOperator::Eq, "id").map(|e| parse_ulid(&e)).transpose()?,
            filter: ActivityFilter {
                phase: filters.take(BinaryOperator::Eq, "phase").map(|e| parse_phase(&e)).transpose()?,
                category: filters
                    .take(BinaryOperator::Eq, "category")
                    .map(|e| parse_text(&e))
                    .transpose()?,
                // pseudo-column: substring of title or description
                search: filters
                    .take(BinaryOperator::Eq, "search")
                    .map(|e| parse_text(&e))
                    .transpose()?,
            },
        },
        "activity_categories" => Command::SelectActivityCategories,
        "registrations" => Command::SelectRegistrations {
            activity_id: filters
                .take(BinaryOperator::Eq, "activity_id")
                .map(|e| parse_ulid(&e))
                .transpose()?,
        },
        "ledger_check" => Command::SelectLedgerCheck,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(cmd)
}

/// Table a SELECT reads from, without interpreting its filters. Used to
/// describe prepared statements whose parameters are still `$N` placeholders.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let [Statement::Query(query)] = stmts.as_slice() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── Column / filter collection ────────────────────────────────

/// Column → value pairs from an INSERT row or an UPDATE's SET list. Every
/// column must be consumed; leftovers are reported as unknown.
struct Fields {
    values: HashMap<String, Expr>,
}

impl Fields {
    fn from_insert(table: &'static str, insert: &ast::Insert, default_columns: &[&str]) -> Result<Self, SqlError> {
        let rows = insert_rows(insert)?;
        let [row] = rows else {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        };
        let columns: Vec<String> = if insert.columns.is_empty() {
            default_columns.iter().take(row.len()).map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| column_name(&c.to_string())).collect()
        };
        if columns.len() != row.len() {
            return Err(SqlError::WrongArity(table, columns.len(), row.len()));
        }
        let mut values = HashMap::with_capacity(columns.len());
        for (column, value) in columns.into_iter().zip(row.iter()) {
            if values.insert(column.clone(), value.clone()).is_some() {
                return Err(SqlError::Parse(format!("column {column} given twice")));
            }
        }
        Ok(Self { values })
    }

    fn from_assignments(table: &str, assignments: &[ast::Assignment]) -> Result<Self, SqlError> {
        if assignments.is_empty() {
            return Err(SqlError::Parse(format!("UPDATE {table} without SET")));
        }
        let mut values = HashMap::with_capacity(assignments.len());
        for assignment in assignments {
            let column = match &assignment.target {
                AssignmentTarget::ColumnName(name) => object_name_last(name)
                    .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
                AssignmentTarget::Tuple(_) => {
                    return Err(SqlError::Unsupported("tuple assignment".into()));
                }
            };
            if values.insert(column.clone(), assignment.value.clone()).is_some() {
                return Err(SqlError::Parse(format!("column {column} assigned twice")));
            }
        }
        Ok(Self { values })
    }

    fn take(&mut self, column: &str) -> Option<Expr> {
        self.values.remove(column)
    }

    fn required(&mut self, column: &'static str) -> Result<Expr, SqlError> {
        self.take(column).ok_or(SqlError::MissingColumn(column))
    }

    fn optional_text(&mut self, column: &str) -> Result<Option<String>, SqlError> {
        Ok(self.take(column).map(|e| parse_optional_text(&e)).transpose()?.flatten())
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.values.into_keys().min() {
            Some(column) => Err(SqlError::UnknownColumn(column)),
            None => Ok(()),
        }
    }
}

/// `column <op> value` predicates of a WHERE clause made only of ANDs.
struct Filters {
    predicates: Vec<(String, BinaryOperator, Expr)>,
}

impl Filters {
    fn parse(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut predicates = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut predicates)?;
        }
        Ok(Self { predicates })
    }

    fn take(&mut self, op: BinaryOperator, column: &str) -> Option<Expr> {
        let pos = self
            .predicates
            .iter()
            .position(|(c, o, _)| c == column && *o == op)?;
        Some(self.predicates.remove(pos).2)
    }

    fn required_eq(&mut self, column: &'static str) -> Result<Expr, SqlError> {
        self.take(BinaryOperator::Eq, column)
            .ok_or(SqlError::MissingFilter(column))
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.predicates.into_iter().next() {
            Some((column, op, _)) => Err(SqlError::Unsupported(format!("filter {column} {op}"))),
            None => Ok(()),
        }
    }
}

fn collect_predicates(expr: &Expr, out: &mut Vec<(String, BinaryOperator, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right }
            if matches!(op, BinaryOperator::Eq | BinaryOperator::GtEq | BinaryOperator::LtEq) =>
        {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((column, op.clone(), (**right).clone()));
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

/// Normalize a printed column reference: drop quotes and any qualifier.
fn column_name(printed: &str) -> String {
    printed
        .rsplit('.')
        .next()
        .unwrap_or(printed)
        .trim_matches('"')
        .to_lowercase()
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn expect_value(expr: &Expr) -> Result<&Value, SqlError> {
    extract_value(expr).ok_or_else(|| SqlError::Parse(format!("expected value, got {expr}")))
}

fn parse_optional_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expect_value(expr)? {
        Value::Null => Ok(None),
        Value::SingleQuotedString(s) | Value::EscapedStringLiteral(s) => Ok(Some(s.clone())),
        Value::Number(n, _) => Ok(Some(n.clone())),
        other => Err(SqlError::Parse(format!("expected string, got {other}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_optional_text(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match expect_value(expr)? {
        Value::Number(s, _) | Value::SingleQuotedString(s) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        other => Err(SqlError::Parse(format!("expected number, got {other}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match expect_value(expr)? {
        Value::Boolean(b) => Ok(*b),
        Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Value::Number(n, _) => Ok(n != "0"),
        other => Err(SqlError::Parse(format!("expected bool, got {other}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

/// Unix ms as a number, or an ISO-8601 string (local time when no offset).
fn parse_optional_instant(expr: &Expr) -> Result<Option<Ms>, SqlError> {
    if let Expr::UnaryOp { .. } = expr {
        return parse_i64(expr).map(Some);
    }
    match expect_value(expr)? {
        Value::Null => Ok(None),
        Value::Number(..) => parse_i64(expr).map(Some),
        Value::SingleQuotedString(s) => {
            if let Ok(ms) = s.trim().parse::<Ms>() {
                return Ok(Some(ms));
            }
            parse_local_instant(s.trim())
                .map(Some)
                .ok_or_else(|| SqlError::Parse(format!("bad timestamp {s:?}")))
        }
        other => Err(SqlError::Parse(format!("expected timestamp, got {other}"))),
    }
}

fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    parse_optional_instant(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

/// A seat count, or NULL / 'unlimited' for no cap.
fn parse_capacity(expr: &Expr) -> Result<Capacity, SqlError> {
    match expect_value(expr)? {
        Value::Null => Ok(Capacity::Unlimited),
        Value::SingleQuotedString(s) if s.eq_ignore_ascii_case("unlimited") => Ok(Capacity::Unlimited),
        _ => parse_u32(expr).map(Capacity::Limited),
    }
}

fn parse_appointment_status(expr: &Expr) -> Result<AppointmentStatus, SqlError> {
    let s = parse_text(expr)?;
    AppointmentStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown appointment status {s:?}")))
}

fn parse_activity_status(expr: &Expr) -> Result<ActivityStatus, SqlError> {
    let s = parse_text(expr)?;
    ActivityStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown activity status {s:?}")))
}

fn parse_phase(expr: &Expr) -> Result<ActivityPhase, SqlError> {
    let s = parse_text(expr)?;
    ActivityPhase::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown phase {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::local_ms;
    use chrono::NaiveTime;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    #[test]
    fn parse_select_slots() {
        let cmd = parse_sql("SELECT * FROM slots WHERE date = '2025-06-02'").unwrap();
        assert_eq!(cmd, Command::SelectSlots { date: date(2) });
        assert!(matches!(
            parse_sql("SELECT * FROM slots"),
            Err(SqlError::MissingFilter("date"))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM slots WHERE date = '06/02/2025'"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_insert_appointment_named_columns() {
        let sql = format!(
            "INSERT INTO appointments (id, date, time_slot, visitor_count, contact_name, contact_phone, organization) \
             VALUES ('{ID}', '2025-06-02', '09:00-10:00', 3, 'Wang Fang', '13800138000', NULL)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment(req) => {
                assert_eq!(req.id, id());
                assert_eq!(req.date, date(2));
                assert_eq!(req.time_slot, "09:00-10:00");
                assert_eq!(req.visitor_count, 3);
                assert_eq!(req.contact_name, "Wang Fang");
                assert_eq!(req.organization, None);
                assert_eq!(req.purpose, None);
            }
            other => panic!("expected InsertAppointment, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_appointment_positional_with_quoted_numbers() {
        // extended-protocol parameters arrive as quoted text
        let sql = format!(
            "INSERT INTO appointments VALUES ('{ID}', '2025-06-02', '10:00-11:00', '2', 'Li', '139', 'No. 3 Middle School', 'science fair')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertAppointment(req) => {
                assert_eq!(req.visitor_count, 2);
                assert_eq!(req.organization.as_deref(), Some("No. 3 Middle School"));
                assert_eq!(req.purpose.as_deref(), Some("science fair"));
            }
            other => panic!("expected InsertAppointment, got {other:?}"),
        }
    }

    #[test]
    fn insert_missing_or_unknown_columns() {
        let sql = format!("INSERT INTO appointments (id, date) VALUES ('{ID}', '2025-06-02')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("time_slot"))));

        let sql = "INSERT INTO time_slots (time_slot, capacity, colour) VALUES ('09:00-10:00', 5, 'red')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn(c)) if c == "colour"));

        let sql = "INSERT INTO time_slots (time_slot, capacity) VALUES ('09:00-10:00')";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity("time_slots", 2, 1))));
    }

    #[test]
    fn parse_time_slot_statements() {
        assert_eq!(
            parse_sql("INSERT INTO time_slots (time_slot, capacity) VALUES ('17:00-18:00', 12)").unwrap(),
            Command::InsertTimeSlot {
                time_slot: "17:00-18:00".into(),
                capacity: 12,
                active: true,
            }
        );
        assert_eq!(
            parse_sql("UPDATE time_slots SET active = false WHERE time_slot = '09:00-10:00'").unwrap(),
            Command::UpdateTimeSlot {
                time_slot: "09:00-10:00".into(),
                capacity: None,
                active: Some(false),
            }
        );
        assert_eq!(parse_sql("SELECT * FROM time_slots").unwrap(), Command::SelectTimeSlots);
        assert!(matches!(
            parse_sql("INSERT INTO time_slots (time_slot, capacity) VALUES ('09:00-10:00', -1)"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_cancel_and_review() {
        assert_eq!(
            parse_sql(&format!("DELETE FROM appointments WHERE id = '{ID}'")).unwrap(),
            Command::CancelAppointment { id: id() }
        );
        assert_eq!(
            parse_sql(&format!(
                "UPDATE appointments SET status = 'confirmed', admin_notes = 'bring IDs' WHERE id = '{ID}'"
            ))
            .unwrap(),
            Command::UpdateAppointment {
                id: id(),
                status: Some(AppointmentStatus::Confirmed),
                admin_notes: Some("bring IDs".into()),
            }
        );
        assert_eq!(
            parse_sql(&format!("UPDATE appointments SET admin_notes = NULL WHERE id = '{ID}'")).unwrap(),
            Command::UpdateAppointment {
                id: id(),
                status: None,
                admin_notes: Some(String::new()),
            }
        );
        assert!(matches!(
            parse_sql(&format!("UPDATE appointments SET status = 'approved' WHERE id = '{ID}'")),
            Err(SqlError::Parse(_))
        ));
        assert!(matches!(
            parse_sql("UPDATE appointments SET status = 'confirmed'"),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(matches!(
            parse_sql(&format!("UPDATE appointments SET owner = 'x' WHERE id = '{ID}'")),
            Err(SqlError::UnknownColumn(_))
        ));
    }

    #[test]
    fn parse_select_appointments_filters() {
        let cmd = parse_sql(
            "SELECT * FROM appointments WHERE status = 'pending' AND date >= '2025-06-01' AND date <= '2025-06-30'",
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectAppointments {
                id: None,
                filter: AppointmentFilter {
                    status: Some(AppointmentStatus::Pending),
                    date_from: Some(date(1)),
                    date_to: Some(date(30)),
                },
            }
        );

        let cmd = parse_sql("SELECT * FROM appointments WHERE (date = '2025-06-02')").unwrap();
        assert_eq!(
            cmd,
            Command::SelectAppointments {
                id: None,
                filter: AppointmentFilter {
                    status: None,
                    date_from: Some(date(2)),
                    date_to: Some(date(2)),
                },
            }
        );

        assert!(matches!(
            parse_sql("SELECT * FROM appointments WHERE status = 'pending' OR status = 'confirmed'"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM appointments WHERE owner = 'bob'"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_insert_activity_defaults_and_instants() {
        let sql = format!(
            "INSERT INTO activities (id, title, start_time, end_time, location) \
             VALUES ('{ID}', 'Dinosaur night', '2025-06-03 19:00', 1748962800000, 'Hall A')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertActivity(a) => {
                let seven_pm = local_ms(date(3), NaiveTime::from_hms_opt(19, 0, 0).unwrap());
                assert_eq!(a.start_time, seven_pm);
                assert_eq!(a.end_time, 1_748_962_800_000);
                assert_eq!(a.capacity, Capacity::Unlimited);
                assert_eq!(a.registration_deadline, None);
                assert!(a.allow_registration);
                assert_eq!(a.description, "");
                assert_eq!(a.speaker, None);
            }
            other => panic!("expected InsertActivity, got {other:?}"),
        }

        let sql = format!(
            "INSERT INTO activities (id, title, start_time, end_time, location, capacity, registration_deadline, allow_registration) \
             VALUES ('{ID}', 'Talk', 2000, 3000, 'Room 1', 40, '2025-06-01T12:00:00+08:00', 'f')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertActivity(a) => {
                assert_eq!(a.capacity, Capacity::Limited(40));
                assert_eq!(
                    a.registration_deadline,
                    Some(local_ms(date(1), NaiveTime::from_hms_opt(12, 0, 0).unwrap()))
                );
                assert!(!a.allow_registration);
            }
            other => panic!("expected InsertActivity, got {other:?}"),
        }
    }

    #[test]
    fn parse_update_activity_patch() {
        let sql = format!(
            "UPDATE activities SET capacity = 'unlimited', speaker = NULL, status = 'cancelled', registration_deadline = NULL WHERE id = '{ID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateActivity { id: got, patch } => {
                assert_eq!(got, id());
                assert_eq!(patch.capacity, Some(Capacity::Unlimited));
                assert_eq!(patch.speaker, Some(None));
                assert_eq!(patch.registration_deadline, Some(None));
                assert_eq!(patch.status, Some(ActivityStatus::Cancelled));
                assert_eq!(patch.title, None);
            }
            other => panic!("expected UpdateActivity, got {other:?}"),
        }
    }

    #[test]
    fn parse_activity_selects() {
        assert_eq!(
            parse_sql("SELECT * FROM activities").unwrap(),
            Command::SelectActivities {
                id: None,
                filter: ActivityFilter::default(),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM activities WHERE phase = 'past'").unwrap(),
            Command::SelectActivities {
                id: None,
                filter: ActivityFilter {
                    phase: Some(ActivityPhase::Ended),
                    ..Default::default()
                },
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT title FROM activities WHERE id = '{ID}'")).unwrap(),
            Command::SelectActivities {
                id: Some(id()),
                filter: ActivityFilter::default(),
            }
        );
    }

    #[test]
    fn parse_activity_category_and_search() {
        assert_eq!(
            parse_sql("SELECT * FROM activities WHERE category = 'ai' AND search = 'Robot' AND phase = 'upcoming'")
                .unwrap(),
            Command::SelectActivities {
                id: None,
                filter: ActivityFilter {
                    phase: Some(ActivityPhase::Upcoming),
                    category: Some("ai".into()),
                    search: Some("Robot".into()),
                },
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM activity_categories").unwrap(),
            Command::SelectActivityCategories
        );
        assert!(matches!(
            parse_sql("SELECT * FROM activities WHERE search >= 'a'"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_registration_statements() {
        assert_eq!(
            parse_sql(&format!("INSERT INTO registrations (id, activity_id) VALUES ('{ID}', '{ID}')")).unwrap(),
            Command::InsertRegistration {
                id: id(),
                activity_id: id(),
            }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM registrations WHERE activity_id = '{ID}'")).unwrap(),
            Command::CancelRegistration { activity_id: id() }
        );
        assert_eq!(
            parse_sql("SELECT * FROM registrations").unwrap(),
            Command::SelectRegistrations { activity_id: None }
        );
        assert!(matches!(
            parse_sql(&format!("DELETE FROM registrations WHERE id = '{ID}'")),
            Err(SqlError::MissingFilter("activity_id"))
        ));
    }

    #[test]
    fn parse_aggregate_tables() {
        assert_eq!(
            parse_sql("SELECT * FROM appointment_counts").unwrap(),
            Command::SelectAppointmentCounts
        );
        assert_eq!(parse_sql("select * from LEDGER_CHECK").unwrap(), Command::SelectLedgerCheck);
    }

    #[test]
    fn select_table_ignores_placeholders() {
        assert_eq!(
            select_table("SELECT * FROM appointments WHERE id = $1").as_deref(),
            Some("appointments")
        );
        assert_eq!(select_table("DELETE FROM appointments WHERE id = $1"), None);
        assert_eq!(select_table("not sql"), None);
    }

    #[test]
    fn parse_bad_ulid_errors() {
        assert!(matches!(
            parse_sql("DELETE FROM appointments WHERE id = 'not-a-ulid'"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO bookings (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(t)) if t == "bookings"));
    }

    #[test]
    fn multi_row_insert_rejected() {
        let sql = format!("INSERT INTO registrations (id, activity_id) VALUES ('{ID}', '{ID}'), ('{ID}', '{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(
            parse_sql("SELECT * FROM slots WHERE date = '2025-06-02'; SELECT * FROM time_slots"),
            Err(SqlError::Unsupported(_))
        ));
    }
}
