//! Role gating and execution of parsed commands against one engine.
//!
//! Every command is checked against the session before the engine sees it:
//! administrative commands need ADMIN, appointment commands need the owner
//! or ADMIN, and private appointments are hidden from everyone else.

use std::time::Instant;

use tracing::debug;
use ulid::Ulid;

use crate::auth::{Session, authorize};
use crate::engine::{Engine, EngineError, Transition};
use crate::model::*;
use crate::observability;
use crate::sql::{AppointmentFilter, Command};

const CREATE_ROLES: &[Role] = &[Role::Member, Role::Researcher];
const REQUEST_ROLES: &[Role] = &[
    Role::User,
    Role::Guest,
    Role::Student,
    Role::Researcher,
    Role::Member,
    Role::Alumnus,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Int8,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> Column {
    Column { name, kind }
}

pub const TELESCOPE_COLUMNS: &[Column] = &[
    col("id", ColumnKind::Text),
    col("name", ColumnKind::Text),
    col("appointment_count", ColumnKind::Int8),
];

pub const USER_COLUMNS: &[Column] = &[
    col("id", ColumnKind::Text),
    col("name", ColumnKind::Text),
    col("roles", ColumnKind::Text),
];

pub const APPOINTMENT_COLUMNS: &[Column] = &[
    col("id", ColumnKind::Text),
    col("telescope_id", ColumnKind::Text),
    col("user_id", ColumnKind::Text),
    col("start", ColumnKind::Int8),
    col("end", ColumnKind::Int8),
    col("status", ColumnKind::Text),
    col("type", ColumnKind::Text),
    col("priority", ColumnKind::Text),
    col("public", ColumnKind::Bool),
    col("coordinates", ColumnKind::Text),
    col("calibrated_at", ColumnKind::Int8),
];

pub const OVERLAP_COLUMNS: &[Column] = &[
    col("overlaps", ColumnKind::Bool),
    col("conflicting_id", ColumnKind::Text),
];

pub const ALLOTTED_TIME_COLUMNS: &[Column] = &[
    col("user_id", ColumnKind::Text),
    col("max_ms", ColumnKind::Int8),
    col("used_ms", ColumnKind::Int8),
    col("remaining_ms", ColumnKind::Int8),
];

/// Result columns of a SELECT on `table`; empty for unknown tables.
pub fn schema_for_table(table: &str) -> &'static [Column] {
    match table {
        "telescopes" => TELESCOPE_COLUMNS,
        "users" => USER_COLUMNS,
        "appointments" => APPOINTMENT_COLUMNS,
        "overlap" => OVERLAP_COLUMNS,
        "allotted_time" => ALLOTTED_TIME_COLUMNS,
        _ => &[],
    }
}

/// PostgreSQL text form of a boolean.
fn pg_bool(b: bool) -> String {
    if b { "t" } else { "f" }.to_string()
}

pub type Row = Vec<Option<String>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Command tag (`INSERT`, `UPDATE`, `DELETE`) and affected row count.
    Executed { tag: &'static str, rows: usize },
    Rows {
        columns: &'static [Column],
        rows: Vec<Row>,
    },
}

impl Outcome {
    fn executed(tag: &'static str) -> Self {
        Outcome::Executed { tag, rows: 1 }
    }
}

#[derive(Debug)]
pub enum DispatchError {
    Engine(EngineError),
    Forbidden(&'static str),
    Unauthenticated(String),
}

impl DispatchError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            DispatchError::Engine(e) => e.kind().sqlstate(),
            DispatchError::Forbidden(_) => "42501",
            DispatchError::Unauthenticated(_) => "28000",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            DispatchError::Engine(e) => e.kind().tag(),
            DispatchError::Forbidden(_) => "FORBIDDEN",
            DispatchError::Unauthenticated(_) => "UNAUTHENTICATED",
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Engine(e) => write!(f, "{}: {e}", e.kind().tag()),
            DispatchError::Forbidden(what) => write!(f, "FORBIDDEN: {what}"),
            DispatchError::Unauthenticated(login) => {
                write!(f, "unknown login {login}: expected the admin login or a user id")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<EngineError> for DispatchError {
    fn from(e: EngineError) -> Self {
        DispatchError::Engine(e)
    }
}

fn require(ok: bool, what: &'static str) -> Result<(), DispatchError> {
    if ok { Ok(()) } else { Err(DispatchError::Forbidden(what)) }
}

fn require_admin(session: &Session) -> Result<(), DispatchError> {
    require(session.is_admin(), "administrator role required")
}

/// Owner of an existing appointment.
fn appointment_owner(engine: &Engine, id: Ulid) -> Result<Ulid, DispatchError> {
    engine
        .locate_appointment(&id)
        .map(|r| r.user_id)
        .ok_or(DispatchError::Engine(EngineError::NotFound(id)))
}

fn require_owner(engine: &Engine, session: &Session, id: Ulid) -> Result<(), DispatchError> {
    let owner = appointment_owner(engine, id)?;
    require(session.may_act_for(owner), "only the owner or an administrator may do this")
}

/// Gate, execute, and record metrics for one command.
pub async fn execute(
    engine: &Engine,
    session: &Session,
    cmd: Command,
) -> Result<Outcome, DispatchError> {
    let label = observability::command_label(&cmd);
    let started = Instant::now();
    let result = run(engine, session, cmd).await;

    metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
        .record(started.elapsed().as_secs_f64());
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
        .increment(1);
    if let Err(e) = &result {
        metrics::counter!(
            observability::COMMAND_REJECTIONS_TOTAL,
            "command" => label,
            "reason" => e.tag()
        )
        .increment(1);
        debug!(command = label, user = ?session.user_id, "rejected: {e}");
    }
    result
}

async fn run(engine: &Engine, session: &Session, cmd: Command) -> Result<Outcome, DispatchError> {
    match cmd {
        Command::InsertTelescope { id, name } => {
            require_admin(session)?;
            engine.create_telescope(id, name).await?;
            Ok(Outcome::executed("INSERT"))
        }
        Command::DeleteTelescope { id } => {
            require_admin(session)?;
            engine.delete_telescope(id).await?;
            Ok(Outcome::executed("DELETE"))
        }
        Command::InsertUser { id, name, roles } => {
            require_admin(session)?;
            engine.register_user(id, name, roles).await?;
            Ok(Outcome::executed("INSERT"))
        }
        Command::UpdateUserRoles { id, roles } => {
            require_admin(session)?;
            engine.set_user_roles(id, roles).await?;
            Ok(Outcome::executed("UPDATE"))
        }
        Command::SetAllottedTime { user_id, max_ms } => {
            require_admin(session)?;
            engine
                .set_allotted_time(user_id, AllottedTime::from_option(max_ms))
                .await?;
            Ok(Outcome::executed("INSERT"))
        }
        Command::InsertAppointment { appointment } => {
            require(
                authorize(&session.roles, CREATE_ROLES),
                "MEMBER, RESEARCHER or ADMIN role required to schedule directly",
            )?;
            require(
                session.may_act_for(appointment.user_id),
                "cannot book on behalf of another user",
            )?;
            engine.create_appointment(appointment).await?;
            Ok(Outcome::executed("INSERT"))
        }
        Command::RequestAppointment { appointment } => {
            require(
                authorize(&session.roles, REQUEST_ROLES),
                "a registered role is required to request time",
            )?;
            require(
                session.may_act_for(appointment.user_id),
                "cannot request on behalf of another user",
            )?;
            engine.request_appointment(appointment).await?;
            Ok(Outcome::executed("INSERT"))
        }
        Command::RescheduleAppointment { id, start, end } => {
            require_owner(engine, session, id)?;
            let span = crate::engine::validate_window(start, end)?;
            engine.reschedule_appointment(id, span).await?;
            Ok(Outcome::executed("UPDATE"))
        }
        Command::TransitionAppointment { id, transition } => {
            match transition {
                Transition::Approve | Transition::Deny => require_admin(session)?,
                Transition::Start | Transition::Complete | Transition::Cancel => {
                    require_owner(engine, session, id)?
                }
            }
            engine.transition(id, transition).await?;
            Ok(Outcome::executed("UPDATE"))
        }
        Command::AddCoordinate {
            appointment_id,
            coordinate,
        } => {
            require_owner(engine, session, appointment_id)?;
            engine.add_coordinate(appointment_id, coordinate).await?;
            Ok(Outcome::executed("INSERT"))
        }
        Command::Calibrate { appointment_id } => {
            require_owner(engine, session, appointment_id)?;
            engine.calibrate(appointment_id).await?;
            Ok(Outcome::executed("INSERT"))
        }
        Command::PurgeAppointment { id } => {
            require_admin(session)?;
            engine.purge_appointment(id).await?;
            Ok(Outcome::executed("DELETE"))
        }
        Command::SelectTelescopes => {
            let rows = engine
                .list_telescopes()
                .await
                .into_iter()
                .map(|t| {
                    vec![
                        Some(t.id.to_string()),
                        t.name,
                        Some(t.appointment_count.to_string()),
                    ]
                })
                .collect();
            Ok(Outcome::Rows {
                columns: TELESCOPE_COLUMNS,
                rows,
            })
        }
        Command::SelectUsers { id } => {
            let users = match id {
                Some(id) => {
                    require(session.may_act_for(id), "administrator role required")?;
                    engine.get_user(&id).into_iter().collect()
                }
                None => {
                    require_admin(session)?;
                    engine.list_users()
                }
            };
            let rows = users
                .into_iter()
                .map(|u| vec![Some(u.id.to_string()), u.name, Some(format_roles(&u.roles))])
                .collect();
            Ok(Outcome::Rows {
                columns: USER_COLUMNS,
                rows,
            })
        }
        Command::SelectAppointments { filter } => {
            let appointments = match filter {
                AppointmentFilter::All => engine.all_appointments().await,
                AppointmentFilter::Id(id) => engine.get_appointment(id).await.into_iter().collect(),
                AppointmentFilter::Telescope(t) => engine.appointments_for_telescope(t).await,
                AppointmentFilter::User(u) => engine.appointments_for_user(u).await,
            };
            let rows = appointments
                .iter()
                .filter(|a| a.public || session.may_act_for(a.user_id))
                .map(appointment_row)
                .collect();
            Ok(Outcome::Rows {
                columns: APPOINTMENT_COLUMNS,
                rows,
            })
        }
        Command::SelectOverlap {
            telescope_id,
            start,
            end,
            exclude,
        } => {
            let span = crate::engine::validate_window(start, end)?;
            let conflicting = engine.find_overlap(telescope_id, span, exclude).await;
            Ok(Outcome::Rows {
                columns: OVERLAP_COLUMNS,
                rows: vec![vec![
                    Some(pg_bool(conflicting.is_some())),
                    conflicting.map(|id| id.to_string()),
                ]],
            })
        }
        Command::SelectAllottedTime { user_id } => {
            require(
                session.may_act_for(user_id),
                "only the user or an administrator may read allotted time",
            )?;
            let info = engine.allotted_time_info(user_id)?;
            Ok(Outcome::Rows {
                columns: ALLOTTED_TIME_COLUMNS,
                rows: vec![vec![
                    Some(info.user_id.to_string()),
                    info.cap.as_option().map(|ms| ms.to_string()),
                    Some(info.used_ms.to_string()),
                    info.remaining_ms.map(|ms| ms.to_string()),
                ]],
            })
        }
    }
}

fn appointment_row(a: &Appointment) -> Row {
    vec![
        Some(a.id.to_string()),
        Some(a.telescope_id.to_string()),
        Some(a.user_id.to_string()),
        Some(a.span.start.to_string()),
        Some(a.span.end.to_string()),
        Some(a.status.as_str().to_string()),
        Some(a.kind.as_str().to_string()),
        Some(a.priority.as_str().to_string()),
        Some(pg_bool(a.public)),
        serde_json::to_string(&a.coordinates).ok(),
        a.calibrated_at.map(|at| at.to_string()),
    ]
}
