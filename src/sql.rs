use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{CancelPolicy, PageFields};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPage {
        id: Ulid,
        owner_id: Ulid,
        fields: PageFields,
    },
    UpdatePage {
        id: Ulid,
        fields: PageFields,
    },
    DeletePage {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        page_id: Ulid,
        guest_name: String,
        start: Ms,
        end: Ms,
    },
    CancelBooking {
        id: Ulid,
        policy: CancelPolicy,
    },
    SetMeetingUrl {
        id: Ulid,
        meeting_url: Option<String>,
    },
    MarkNotificationRead {
        id: Ulid,
    },
    MarkAllNotificationsRead {
        owner_id: Ulid,
    },
    SelectPage {
        id: Ulid,
    },
    SelectPageBySlug {
        slug: String,
    },
    SelectPages {
        owner_id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        owner_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectSlots {
        page_id: Ulid,
        date: NaiveDate,
    },
    SelectEligibleDates {
        page_id: Ulid,
    },
    SelectConflicts {
        owner_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    SelectNotifications {
        owner_id: Ulid,
        unread_only: bool,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert)?;

    match table.as_str() {
        "booking_pages" => {
            let mut id = None;
            let mut owner_id = None;
            let mut rest = Vec::new();
            for (col, expr) in row {
                match col.as_str() {
                    "id" => id = Some(parse_ulid(expr)?),
                    "owner_id" => owner_id = Some(parse_ulid(expr)?),
                    _ => rest.push((col, expr)),
                }
            }
            Ok(Command::InsertPage {
                id: id.ok_or(SqlError::MissingColumn("id"))?,
                owner_id: owner_id.ok_or(SqlError::MissingColumn("owner_id"))?,
                fields: page_fields(&rest)?,
            })
        }
        "bookings" => {
            let (mut id, mut page_id, mut guest_name, mut start, mut end) =
                (None, None, None, None, None);
            for (col, expr) in row {
                match col.as_str() {
                    "id" => id = Some(parse_ulid(expr)?),
                    "page_id" => page_id = Some(parse_ulid(expr)?),
                    "guest_name" => guest_name = Some(parse_string(expr)?),
                    "start" => start = Some(parse_i64(expr)?),
                    "end" => end = Some(parse_i64(expr)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::InsertBooking {
                id: id.ok_or(SqlError::MissingColumn("id"))?,
                page_id: page_id.ok_or(SqlError::MissingColumn("page_id"))?,
                guest_name: guest_name.ok_or(SqlError::MissingColumn("guest_name"))?,
                start: start.ok_or(SqlError::MissingColumn("start"))?,
                end: end.ok_or(SqlError::MissingColumn("end"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Pair the column list with the single VALUES row.
fn insert_row(insert: &ast::Insert) -> Result<Vec<(String, &Expr)>, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT needs an explicit column list".into()));
    }
    let source = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    match values.rows.as_slice() {
        [row] => {
            if row.len() != insert.columns.len() {
                return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
            }
            Ok(insert
                .columns
                .iter()
                .map(|c| c.value.to_lowercase())
                .zip(row.iter())
                .collect())
        }
        [] => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
    }
}

/// Page columns shared by INSERT and UPDATE. Identity columns are handled by
/// the caller.
fn page_fields(cols: &[(String, &Expr)]) -> Result<PageFields, SqlError> {
    let mut f = PageFields::default();
    for (col, expr) in cols {
        match col.as_str() {
            "title" => f.title = Some(parse_string(expr)?),
            "slug" => f.slug = parse_string_or_null(expr)?,
            "duration_minutes" => f.duration_minutes = Some(parse_u32(expr)?),
            "available_days" => f.available_days = Some(parse_weekdays(expr)?),
            "start_time" => f.start_time = Some(parse_time(expr)?),
            "end_time" => f.end_time = Some(parse_time(expr)?),
            "min_notice_hours" => f.min_notice_hours = Some(parse_u32(expr)?),
            "max_days_ahead" => f.max_days_ahead = Some(parse_u32(expr)?),
            "timezone" => f.timezone = Some(parse_timezone(expr)?),
            "meeting_type" => f.meeting_type = Some(parse_meeting_type(expr)?),
            "location_address" => f.location_address = Some(parse_string_or_null(expr)?),
            "expires_at" => f.expires_at = Some(parse_i64_or_null(expr)?),
            "is_active" => f.is_active = Some(parse_bool(expr)?),
            _ => return Err(SqlError::UnknownColumn(col.clone())),
        }
    }
    Ok(f)
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableFactor,
    assignments: &[Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(table)?;
    let mut set = Vec::with_capacity(assignments.len());
    for a in assignments {
        let AssignmentTarget::ColumnName(name) = &a.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let col = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column".into()))?;
        set.push((col, &a.value));
    }
    let filters = Filters::collect(selection)?;

    match table.as_str() {
        "booking_pages" => {
            if set.iter().any(|(c, _)| c == "id" || c == "owner_id") {
                return Err(SqlError::Unsupported("changing id or owner_id".into()));
            }
            Ok(Command::UpdatePage {
                id: filters.require_ulid("id")?,
                fields: page_fields(&set)?,
            })
        }
        "bookings" => {
            let id = filters.require_ulid("id")?;
            match set.as_slice() {
                [(col, expr)] if col == "status" => {
                    let status = parse_string(expr)?;
                    if status != BookingStatus::Cancelled.as_str() {
                        return Err(SqlError::Unsupported(format!("status change to '{status}'")));
                    }
                    Ok(Command::CancelBooking {
                        id,
                        policy: CancelPolicy::Owner,
                    })
                }
                [(col, expr)] if col == "meeting_url" => Ok(Command::SetMeetingUrl {
                    id,
                    meeting_url: parse_string_or_null(expr)?,
                }),
                _ => Err(SqlError::Unsupported(
                    "bookings only support SET status = 'cancelled' or SET meeting_url".into(),
                )),
            }
        }
        "notifications" => {
            match set.as_slice() {
                [(col, expr)] if col == "is_read" && parse_bool(expr)? => {}
                _ => {
                    return Err(SqlError::Unsupported(
                        "notifications only support SET is_read = true".into(),
                    ));
                }
            }
            if let Some(id) = filters.ulid("id")? {
                Ok(Command::MarkNotificationRead { id })
            } else {
                Ok(Command::MarkAllNotificationsRead {
                    owner_id: filters.require_ulid("owner_id")?,
                })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;
    let id = filters.require_ulid("id")?;

    match table.as_str() {
        "booking_pages" => Ok(Command::DeletePage { id }),
        // Deleting through the public link is the guest cancel.
        "bookings" => Ok(Command::CancelBooking {
            id,
            policy: CancelPolicy::Guest,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let f = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "booking_pages" => {
            if let Some(id) = f.ulid("id")? {
                Ok(Command::SelectPage { id })
            } else if let Some(slug) = f.eq("slug") {
                Ok(Command::SelectPageBySlug {
                    slug: parse_string(slug)?,
                })
            } else if let Some(owner_id) = f.ulid("owner_id")? {
                Ok(Command::SelectPages { owner_id })
            } else {
                Err(SqlError::MissingFilter("id, slug or owner_id"))
            }
        }
        "bookings" => {
            if let Some(id) = f.ulid("id")? {
                return Ok(Command::SelectBooking { id });
            }
            Ok(Command::SelectBookings {
                owner_id: f.require_ulid("owner_id")?,
                start: parse_i64(f.ge("start").ok_or(SqlError::MissingFilter("start"))?)?,
                end: parse_i64(f.le("end").ok_or(SqlError::MissingFilter("end"))?)?,
            })
        }
        "slots" => Ok(Command::SelectSlots {
            page_id: f.require_ulid("page_id")?,
            date: parse_date(f.eq("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        "eligible_dates" => Ok(Command::SelectEligibleDates {
            page_id: f.require_ulid("page_id")?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            owner_id: f.require_ulid("owner_id")?,
            start: parse_i64(f.eq("start").ok_or(SqlError::MissingFilter("start"))?)?,
            end: parse_i64(f.eq("end").ok_or(SqlError::MissingFilter("end"))?)?,
            exclude: f.ulid("exclude_id")?,
        }),
        "notifications" => Ok(Command::SelectNotifications {
            owner_id: f.require_ulid("owner_id")?,
            unread_only: match f.eq("is_read") {
                Some(expr) => !parse_bool(expr)?,
                None => false,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunction of `column <op> literal` comparisons from a WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    eq: Vec<(String, &'a Expr)>,
    ge: Vec<(String, &'a Expr)>,
    le: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.visit(expr)?;
        }
        Ok(filters)
    }

    fn visit(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.visit(inner),
            Expr::BinaryOp { left, op, right } => {
                if *op == ast::BinaryOperator::And {
                    self.visit(left)?;
                    return self.visit(right);
                }
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                let bucket = match op {
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.ge,
                    ast::BinaryOperator::LtEq => &mut self.le,
                    _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
                };
                bucket.push((col, right.as_ref()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
    }

    fn find(list: &[(String, &'a Expr)], col: &str) -> Option<&'a Expr> {
        list.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn eq(&self, col: &str) -> Option<&'a Expr> {
        Self::find(&self.eq, col)
    }

    fn ge(&self, col: &str) -> Option<&'a Expr> {
        Self::find(&self.ge, col)
    }

    fn le(&self, col: &str) -> Option<&'a Expr> {
        Self::find(&self.le, col)
    }

    fn ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq(col).map(parse_ulid).transpose()
    }

    fn require_ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.ulid(col)?.ok_or(SqlError::MissingFilter(col))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        return Ok(-parse_i64(inner)?);
    }
    let s = parse_string(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

/// `'1,2,3'` or `'{1,2,3}'`, days numbered from Sunday = 0.
fn parse_weekdays(expr: &Expr) -> Result<Weekdays, SqlError> {
    let raw = parse_string(expr)?;
    let inner = raw.trim().trim_start_matches('{').trim_end_matches('}');
    let mut days = Vec::new();
    for part in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let d: u8 = part
            .parse()
            .map_err(|_| SqlError::Parse(format!("bad weekday '{part}'")))?;
        days.push(d);
    }
    Weekdays::from_days(&days)
        .ok_or_else(|| SqlError::Parse(format!("weekdays must be 0-6, got '{raw}'")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .map_err(|_| SqlError::Parse(format!("bad time '{s}', expected HH:MM")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date '{s}', expected YYYY-MM-DD")))
}

fn parse_timezone(expr: &Expr) -> Result<Tz, SqlError> {
    let s = parse_string(expr)?;
    s.parse()
        .map_err(|_| SqlError::Parse(format!("unknown timezone '{s}'")))
}

fn parse_meeting_type(expr: &Expr) -> Result<MeetingType, SqlError> {
    let s = parse_string(expr)?;
    MeetingType::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown meeting type '{s}'")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
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
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
