use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::Transition;
use crate::model::*;

/// Which appointments a SELECT asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentFilter {
    All,
    Id(Ulid),
    Telescope(Ulid),
    User(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTelescope {
        id: Ulid,
        name: Option<String>,
    },
    DeleteTelescope {
        id: Ulid,
    },
    InsertUser {
        id: Ulid,
        name: Option<String>,
        roles: RoleSet,
    },
    UpdateUserRoles {
        id: Ulid,
        roles: RoleSet,
    },
    SetAllottedTime {
        user_id: Ulid,
        /// `None` = unlimited.
        max_ms: Option<Ms>,
    },
    InsertAppointment {
        appointment: NewAppointment,
    },
    RequestAppointment {
        appointment: NewAppointment,
    },
    RescheduleAppointment {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    TransitionAppointment {
        id: Ulid,
        transition: Transition,
    },
    AddCoordinate {
        appointment_id: Ulid,
        coordinate: Coordinate,
    },
    Calibrate {
        appointment_id: Ulid,
    },
    PurgeAppointment {
        id: Ulid,
    },
    SelectTelescopes,
    SelectUsers {
        id: Option<Ulid>,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    SelectOverlap {
        telescope_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    SelectAllottedTime {
        user_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without binding its filter values. Lets
/// statements with `$n` placeholders be described before execution.
pub fn select_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    match query.body.as_ref() {
        SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "telescopes" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("telescopes", 1, 0));
            }
            Ok(Command::InsertTelescope {
                id: parse_ulid(&values[0])?,
                name: optional(&values, 1, parse_string_or_null)?.flatten(),
            })
        }
        "users" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("users", 1, 0));
            }
            let roles = match optional(&values, 2, parse_string_or_null)?.flatten() {
                Some(list) => parse_role_list(&list)?,
                None => RoleSet::new(),
            };
            Ok(Command::InsertUser {
                id: parse_ulid(&values[0])?,
                name: optional(&values, 1, parse_string_or_null)?.flatten(),
                roles,
            })
        }
        "allotted_time" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("allotted_time", 2, values.len()));
            }
            Ok(Command::SetAllottedTime {
                user_id: parse_ulid(&values[0])?,
                max_ms: parse_i64_or_null(&values[1])?,
            })
        }
        "appointments" => Ok(Command::InsertAppointment {
            appointment: parse_new_appointment("appointments", &values)?,
        }),
        "appointment_requests" => Ok(Command::RequestAppointment {
            appointment: parse_new_appointment("appointment_requests", &values)?,
        }),
        "coordinates" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("coordinates", 5, values.len()));
            }
            Ok(Command::AddCoordinate {
                appointment_id: parse_ulid(&values[0])?,
                coordinate: Coordinate {
                    hours: parse_u8(&values[1])?,
                    minutes: parse_u8(&values[2])?,
                    seconds: parse_u8(&values[3])?,
                    declination: parse_f64(&values[4])?,
                },
            })
        }
        "calibrations" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("calibrations", 1, 0));
            }
            Ok(Command::Calibrate {
                appointment_id: parse_ulid(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Columns: id, telescope_id, user_id, start, end, [type], [priority], [public].
fn parse_new_appointment(table: &'static str, values: &[Expr]) -> Result<NewAppointment, SqlError> {
    if values.len() < 5 {
        return Err(SqlError::WrongArity(table, 5, values.len()));
    }
    let start = parse_i64(&values[3])?;
    let end = parse_i64(&values[4])?;
    if end <= start {
        return Err(SqlError::Parse("end must be after start".into()));
    }
    let kind = match optional(values, 5, parse_string_or_null)?.flatten() {
        Some(s) => s.parse().map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))?,
        None => AppointmentType::Point,
    };
    let priority = match optional(values, 6, parse_string_or_null)?.flatten() {
        Some(s) => s.parse().map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))?,
        None => Priority::Manual,
    };
    Ok(NewAppointment {
        id: parse_ulid(&values[0])?,
        telescope_id: parse_ulid(&values[1])?,
        user_id: parse_ulid(&values[2])?,
        span: Span::new(start, end),
        priority,
        kind,
        public: optional(values, 7, parse_bool)?.unwrap_or(true),
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let mut columns = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        columns.push((column, &assignment.value));
    }
    let find = |col: &str| columns.iter().find(|(c, _)| c == col).map(|(_, v)| *v);

    match table.as_str() {
        "appointments" => {
            if let Some(status) = find("status") {
                if columns.len() > 1 {
                    return Err(SqlError::Unsupported(
                        "status cannot be changed together with other columns".into(),
                    ));
                }
                let word = parse_string_or_null(status)?
                    .ok_or(SqlError::Parse("status cannot be NULL".into()))?;
                return Ok(Command::TransitionAppointment {
                    id,
                    transition: parse_transition(&word)?,
                });
            }
            let start = find("start").ok_or(SqlError::MissingFilter("start"))?;
            let end = find("end").ok_or(SqlError::MissingFilter("end"))?;
            Ok(Command::RescheduleAppointment {
                id,
                start: parse_i64(start)?,
                end: parse_i64(end)?,
            })
        }
        "users" => {
            let roles = find("roles").ok_or(SqlError::MissingFilter("roles"))?;
            let list = parse_string_or_null(roles)?.unwrap_or_default();
            Ok(Command::UpdateUserRoles {
                id,
                roles: parse_role_list(&list)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Status words a client may write into `status`.
pub fn parse_transition(word: &str) -> Result<Transition, SqlError> {
    match word.trim().to_ascii_uppercase().as_str() {
        "SCHEDULED" | "APPROVED" => Ok(Transition::Approve),
        "DENIED" => Ok(Transition::Deny),
        "IN_PROGRESS" | "STARTED" => Ok(Transition::Start),
        "COMPLETED" => Ok(Transition::Complete),
        "CANCELED" | "CANCELLED" => Ok(Transition::Cancel),
        _ => Err(SqlError::Parse(format!("unknown status: {word}"))),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "telescopes" => Ok(Command::DeleteTelescope { id }),
        "appointments" => Ok(Command::PurgeAppointment { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);

    match table.as_str() {
        "telescopes" => Ok(Command::SelectTelescopes),
        "users" => Ok(Command::SelectUsers {
            id: filter("id").map(parse_ulid).transpose()?,
        }),
        "appointments" => {
            let filter = if let Some(e) = filter("id") {
                AppointmentFilter::Id(parse_ulid(e)?)
            } else if let Some(e) = filter("telescope_id") {
                AppointmentFilter::Telescope(parse_ulid(e)?)
            } else if let Some(e) = filter("user_id") {
                AppointmentFilter::User(parse_ulid(e)?)
            } else {
                AppointmentFilter::All
            };
            Ok(Command::SelectAppointments { filter })
        }
        "overlap" => Ok(Command::SelectOverlap {
            telescope_id: parse_ulid(filter("telescope_id").ok_or(SqlError::MissingFilter("telescope_id"))?)?,
            start: parse_i64(filter("start").ok_or(SqlError::MissingFilter("start"))?)?,
            end: parse_i64(filter("end").ok_or(SqlError::MissingFilter("end"))?)?,
            exclude: filter("exclude").map(parse_ulid).transpose()?,
        }),
        "allotted_time" => Ok(Command::SelectAllottedTime {
            user_id: parse_ulid(filter("user_id").ok_or(SqlError::MissingFilter("user_id"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
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

/// Apply `parse` to `values[idx]` if the column was supplied.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(idx).map(parse).transpose()
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_role_list(list: &str) -> Result<RoleSet, SqlError> {
    parse_roles(list).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad i64 {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64(expr)?)),
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_f64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
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
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing column or filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
