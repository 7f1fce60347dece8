use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which bookings a SELECT asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    ById(Ulid),
    ByResource(String),
    ByRequester(String),
}

/// Parsed command from SQL input. Commands map 1:1 onto scheduler operations;
/// the collections are `bookings`, `quotas`, `blackouts`, `busy_periods` and
/// the derived `availability` view.
#[derive(Debug, PartialEq)]
pub enum Command {
    SubmitBooking {
        resource: String,
        requester: String,
        start: Ms,
        end: Ms,
        location: String,
        comment: String,
        topic: Option<String>,
        assignment_id: Option<String>,
        justification: Option<String>,
    },
    RescheduleBooking {
        id: Ulid,
        start: Ms,
        end: Ms,
        resource: Option<String>,
        reason: Option<String>,
        actor: Option<String>,
    },
    DecideBooking {
        id: Ulid,
        approve: bool,
        actor: Option<String>,
    },
    CancelBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    InsertBlackout {
        start: Ms,
        end: Ms,
    },
    DeleteBlackout {
        id: Ulid,
    },
    SelectBlackouts,
    InsertBusy {
        resource: String,
        start: Ms,
        end: Ms,
        source: BusySource,
    },
    DeleteBusy {
        id: Ulid,
    },
    SelectBusy {
        resource: String,
    },
    SelectQuotas {
        requester: Option<String>,
    },
    SetQuotaLimit {
        requester: String,
        limit: u32,
    },
    ResetQuota {
        requester: String,
    },
    SelectAvailability {
        resource: String,
        start: Ms,
        end: Ms,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    // LISTEN/UNLISTEN channels carry resource names (emails, room ids) that
    // the SQL tokenizer would mangle, so they are handled textually.
    if let Some(rest) = strip_keyword(trimmed, "LISTEN ") {
        return Ok(Command::Listen {
            channel: rest.trim().trim_matches(';').to_string(),
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN ") {
        let channel = rest.trim().trim_matches(';').to_string();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn strip_keyword<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    let head = input.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(&input[keyword.len()..])
    } else {
        None
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "bookings" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("bookings", 6, values.len()));
            }
            Ok(Command::SubmitBooking {
                resource: parse_string(&values[0])?,
                requester: parse_string(&values[1])?,
                start: parse_i64(&values[2])?,
                end: parse_i64(&values[3])?,
                location: parse_string(&values[4])?,
                comment: parse_string(&values[5])?,
                topic: values.get(6).map(parse_string_or_null).transpose()?.flatten(),
                assignment_id: values.get(7).map(parse_string_or_null).transpose()?.flatten(),
                justification: values.get(8).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "blackouts" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("blackouts", 2, values.len()));
            }
            Ok(Command::InsertBlackout {
                start: parse_i64(&values[0])?,
                end: parse_i64(&values[1])?,
            })
        }
        "busy_periods" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("busy_periods", 3, values.len()));
            }
            let source = match values.get(3) {
                Some(v) => {
                    let tag = parse_string(v)?;
                    BusySource::parse(&tag)
                        .ok_or_else(|| SqlError::Parse(format!("unknown busy source: {tag}")))?
                }
                None => BusySource::Manual,
            };
            Ok(Command::InsertBusy {
                resource: parse_string(&values[0])?,
                start: parse_i64(&values[1])?,
                end: parse_i64(&values[2])?,
                source,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking { id }),
        "blackouts" => Ok(Command::DeleteBlackout { id }),
        "busy_periods" => Ok(Command::DeleteBusy { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;

    match table.as_str() {
        "bookings" => {
            let id = extract_where_id(selection)?;
            let mut status: Option<String> = None;
            let mut start: Option<Ms> = None;
            let mut end: Option<Ms> = None;
            let mut resource: Option<String> = None;
            let mut reason: Option<String> = None;
            let mut actor: Option<String> = None;

            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "status" => status = Some(parse_string(&a.value)?),
                    "start" => start = Some(parse_i64(&a.value)?),
                    "end" => end = Some(parse_i64(&a.value)?),
                    "resource" => resource = Some(parse_string(&a.value)?),
                    "reason" => reason = Some(parse_string(&a.value)?),
                    "actor" => actor = Some(parse_string(&a.value)?),
                    col => return Err(SqlError::Parse(format!("cannot assign column {col}"))),
                }
            }

            if let Some(tag) = status {
                if start.is_some() || end.is_some() || resource.is_some() {
                    return Err(SqlError::Parse(
                        "status and slot changes cannot be combined".into(),
                    ));
                }
                let approve = match BookingStatus::parse(&tag) {
                    Some(BookingStatus::Confirmed) => true,
                    Some(BookingStatus::Declined) => false,
                    _ => {
                        return Err(SqlError::Parse(format!(
                            "status must be 'confirmed' or 'declined', got {tag}"
                        )))
                    }
                };
                return Ok(Command::DecideBooking { id, approve, actor });
            }

            match (start, end) {
                (Some(start), Some(end)) => Ok(Command::RescheduleBooking {
                    id,
                    start,
                    end,
                    resource,
                    reason,
                    actor,
                }),
                _ => Err(SqlError::Parse(
                    "UPDATE bookings needs status or start + \"end\"".into(),
                )),
            }
        }
        "quotas" => {
            let requester = extract_where_string(selection, "requester")?;
            if assignments.len() != 1 {
                return Err(SqlError::Parse("UPDATE quotas takes one assignment".into()));
            }
            let a = &assignments[0];
            match assignment_column(a)?.as_str() {
                "limit" => Ok(Command::SetQuotaLimit {
                    requester,
                    limit: parse_u32(&a.value)?,
                }),
                "used" => {
                    let v = parse_i64(&a.value)?;
                    if v != 0 {
                        return Err(SqlError::Parse("used can only be reset to 0".into()));
                    }
                    Ok(Command::ResetQuota { requester })
                }
                col => Err(SqlError::Parse(format!("cannot assign column {col}"))),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "availability" => {
            let (mut resource, mut start, mut end) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_availability_filters(selection, &mut resource, &mut start, &mut end)?;
            }
            Ok(Command::SelectAvailability {
                resource: resource.ok_or(SqlError::MissingFilter("resource"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        "bookings" => {
            let selection = select
                .selection
                .as_ref()
                .ok_or(SqlError::MissingFilter("id, resource or requester"))?;
            Ok(Command::SelectBookings {
                filter: extract_booking_filter(selection)?,
            })
        }
        "quotas" => {
            let requester = match &select.selection {
                Some(sel) => Some(extract_eq_string(sel, "requester")?),
                None => None,
            };
            Ok(Command::SelectQuotas { requester })
        }
        "blackouts" => Ok(Command::SelectBlackouts),
        "busy_periods" => {
            let selection = select
                .selection
                .as_ref()
                .ok_or(SqlError::MissingFilter("resource"))?;
            Ok(Command::SelectBusy {
                resource: extract_eq_string(selection, "resource")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_availability_filters(
    expr: &Expr,
    resource: &mut Option<String>,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_availability_filters(left, resource, start, end)?;
                extract_availability_filters(right, resource, start, end)?;
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some("resource") {
                    *resource = Some(parse_string(right)?);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_i64(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_i64(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_booking_filter(expr: &Expr) -> Result<BookingFilter, SqlError> {
    if let Expr::BinaryOp {
        left,
        op: ast::BinaryOperator::Eq,
        right,
    } = expr
    {
        match expr_column_name(left).as_deref() {
            Some("id") => return Ok(BookingFilter::ById(parse_ulid(right)?)),
            Some("resource") => return Ok(BookingFilter::ByResource(parse_string(right)?)),
            Some("requester") => return Ok(BookingFilter::ByRequester(parse_string(right)?)),
            _ => {}
        }
    }
    Err(SqlError::MissingFilter("id, resource or requester"))
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

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn extract_where_string(selection: &Option<Expr>, col: &'static str) -> Result<String, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(col))?;
    extract_eq_string(sel, col)
}

fn extract_eq_string(expr: &Expr, col: &'static str) -> Result<String, SqlError> {
    if let Expr::BinaryOp {
        left,
        op: ast::BinaryOperator::Eq,
        right,
    } = expr
        && expr_column_name(left).as_deref() == Some(col)
    {
        return parse_string(right);
    }
    Err(SqlError::MissingFilter(col))
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    let s = parse_string(expr)?;
    if s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(s))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_submit_booking() {
        let sql = r#"INSERT INTO bookings (resource, requester, start, "end", location, comment) VALUES ('t@school.edu', 's@school.edu', 1000, 2000, 'Online', 'help')"#;
        let cmd = parse_sql(sql).unwrap();
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
                assert_eq!(resource, "t@school.edu");
                assert_eq!(requester, "s@school.edu");
                assert_eq!(start, 1000);
                assert_eq!(end, 2000);
                assert_eq!(location, "Online");
                assert_eq!(comment, "help");
                assert_eq!(topic, None);
                assert_eq!(assignment_id, None);
                assert_eq!(justification, None);
            }
            _ => panic!("expected SubmitBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_submit_booking_with_metadata() {
        let sql = r#"INSERT INTO bookings (resource, requester, start, "end", location, comment, topic, assignment_id, justification) VALUES ('t@school.edu', 's@school.edu', 1000, 2000, 'Online', 'help', 'calculus', 'hw-3', 'deadline week')"#;
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::SubmitBooking {
                topic,
                assignment_id,
                justification,
                ..
            } => {
                assert_eq!(topic.as_deref(), Some("calculus"));
                assert_eq!(assignment_id.as_deref(), Some("hw-3"));
                assert_eq!(justification.as_deref(), Some("deadline week"));
            }
            _ => panic!("expected SubmitBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_submit_booking_null_metadata() {
        let sql = r#"INSERT INTO bookings (resource, requester, start, "end", location, comment, topic) VALUES ('t@school.edu', 's@school.edu', 1000, 2000, 'Online', 'help', NULL)"#;
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::SubmitBooking { topic, .. } => assert_eq!(topic, None),
            _ => panic!("expected SubmitBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_submit_booking_too_few_values() {
        let sql = "INSERT INTO bookings (resource) VALUES ('t@school.edu')";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::WrongArity("bookings", 6, 1))
        ));
    }

    #[test]
    fn parse_cancel() {
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::CancelBooking { id } => assert_eq!(id.to_string(), ID),
            _ => panic!("expected CancelBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_decide() {
        let sql = format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::DecideBooking { approve, actor, .. } => {
                assert!(approve);
                assert_eq!(actor, None);
            }
            _ => panic!("expected DecideBooking, got {cmd:?}"),
        }

        let sql = format!(
            "UPDATE bookings SET status = 'declined', actor = 'head@school.edu' WHERE id = '{ID}'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::DecideBooking { approve, actor, .. } => {
                assert!(!approve);
                assert_eq!(actor.as_deref(), Some("head@school.edu"));
            }
            _ => panic!("expected DecideBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_decide_legacy_status_tags() {
        // The predecessor wrote "Yes"/"No"; the boundary normalizes them
        let sql = format!("UPDATE bookings SET status = 'Yes' WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::DecideBooking { approve: true, .. }
        ));
        let sql = format!("UPDATE bookings SET status = 'No' WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::DecideBooking { approve: false, .. }
        ));
        // A terminal-but-wrong target is rejected
        let sql = format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{ID}'");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_reschedule() {
        let sql = format!(
            r#"UPDATE bookings SET start = 1000, "end" = 2000, reason = 'clash', actor = 't@school.edu' WHERE id = '{ID}'"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::RescheduleBooking {
                start,
                end,
                resource,
                reason,
                actor,
                ..
            } => {
                assert_eq!(start, 1000);
                assert_eq!(end, 2000);
                assert_eq!(resource, None);
                assert_eq!(reason.as_deref(), Some("clash"));
                assert_eq!(actor.as_deref(), Some("t@school.edu"));
            }
            _ => panic!("expected RescheduleBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_reschedule_with_resource_move() {
        let sql = format!(
            r#"UPDATE bookings SET start = 1000, "end" = 2000, resource = 'lab-2' WHERE id = '{ID}'"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::RescheduleBooking { resource, .. } => {
                assert_eq!(resource.as_deref(), Some("lab-2"));
            }
            _ => panic!("expected RescheduleBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_bookings_requires_id_filter() {
        let sql = "UPDATE bookings SET status = 'confirmed'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_select_bookings_filters() {
        let sql = "SELECT * FROM bookings WHERE resource = 't@school.edu'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::ByResource("t@school.edu".into())
            }
        );

        let sql = "SELECT * FROM bookings WHERE requester = 's@school.edu'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::ByRequester("s@school.edu".into())
            }
        );

        let sql = format!("SELECT * FROM bookings WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::ById(_)
            }
        ));

        // no filter at all
        assert!(parse_sql("SELECT * FROM bookings").is_err());
    }

    #[test]
    fn parse_blackout_commands() {
        let cmd = parse_sql("INSERT INTO blackouts (start, \"end\") VALUES (1000, 2000)").unwrap();
        assert_eq!(cmd, Command::InsertBlackout { start: 1000, end: 2000 });

        let cmd = parse_sql(&format!("DELETE FROM blackouts WHERE id = '{ID}'")).unwrap();
        assert!(matches!(cmd, Command::DeleteBlackout { .. }));

        let cmd = parse_sql("SELECT * FROM blackouts").unwrap();
        assert_eq!(cmd, Command::SelectBlackouts);
    }

    #[test]
    fn parse_busy_commands() {
        let cmd = parse_sql(
            r#"INSERT INTO busy_periods (resource, start, "end") VALUES ('t@school.edu', 1000, 2000)"#,
        )
        .unwrap();
        match cmd {
            Command::InsertBusy { resource, source, .. } => {
                assert_eq!(resource, "t@school.edu");
                assert_eq!(source, BusySource::Manual);
            }
            _ => panic!("expected InsertBusy, got {cmd:?}"),
        }

        let cmd = parse_sql(
            r#"INSERT INTO busy_periods (resource, start, "end", source) VALUES ('t@school.edu', 1000, 2000, 'calendar_sync')"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            Command::InsertBusy {
                source: BusySource::CalendarSync,
                ..
            }
        ));

        let cmd = parse_sql("SELECT * FROM busy_periods WHERE resource = 'lab-1'").unwrap();
        assert_eq!(
            cmd,
            Command::SelectBusy {
                resource: "lab-1".into()
            }
        );
    }

    #[test]
    fn parse_quota_commands() {
        let cmd = parse_sql("SELECT * FROM quotas WHERE requester = 's@school.edu'").unwrap();
        assert_eq!(
            cmd,
            Command::SelectQuotas {
                requester: Some("s@school.edu".into())
            }
        );

        let cmd = parse_sql("SELECT * FROM quotas").unwrap();
        assert_eq!(cmd, Command::SelectQuotas { requester: None });

        let cmd =
            parse_sql("UPDATE quotas SET \"limit\" = 5 WHERE requester = 's@school.edu'").unwrap();
        assert_eq!(
            cmd,
            Command::SetQuotaLimit {
                requester: "s@school.edu".into(),
                limit: 5
            }
        );

        let cmd = parse_sql("UPDATE quotas SET used = 0 WHERE requester = 's@school.edu'").unwrap();
        assert_eq!(
            cmd,
            Command::ResetQuota {
                requester: "s@school.edu".into()
            }
        );

        // used can only be zeroed
        assert!(parse_sql("UPDATE quotas SET used = 2 WHERE requester = 's@school.edu'").is_err());
    }

    #[test]
    fn parse_select_availability() {
        let sql = "SELECT * FROM availability WHERE resource = 't@school.edu' AND start >= 1000 AND \"end\" <= 2000";
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::SelectAvailability {
                resource: "t@school.edu".into(),
                start: 1000,
                end: 2000
            }
        );
    }

    #[test]
    fn parse_select_availability_missing_filters() {
        let sql = "SELECT * FROM availability WHERE resource = 't@school.edu'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter(_))));
    }

    #[test]
    fn parse_listen_unlisten() {
        let cmd = parse_sql("LISTEN resource_t@school.edu").unwrap();
        assert_eq!(
            cmd,
            Command::Listen {
                channel: "resource_t@school.edu".into()
            }
        );

        let cmd = parse_sql("UNLISTEN resource_t@school.edu;").unwrap();
        assert_eq!(
            cmd,
            Command::Unlisten {
                channel: "resource_t@school.edu".into()
            }
        );

        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(parse_sql("INSERT INTO foobar (id) VALUES ('x')").is_err());
        assert!(parse_sql("SELECT * FROM foobar").is_err());
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
