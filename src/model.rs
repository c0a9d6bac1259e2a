use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open observation window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back windows (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Enumerations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Requested,
    Scheduled,
    InProgress,
    Completed,
    Canceled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Requested => "REQUESTED",
            AppointmentStatus::Scheduled => "SCHEDULED",
            AppointmentStatus::InProgress => "IN_PROGRESS",
            AppointmentStatus::Completed => "COMPLETED",
            AppointmentStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Canceled)
    }

    /// Everything except CANCELED occupies its window on the telescope.
    pub fn occupies_telescope(&self) -> bool {
        !matches!(self, AppointmentStatus::Canceled)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Primary,
    Secondary,
    Manual,
    Rare,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Primary => "PRIMARY",
            Priority::Secondary => "SECONDARY",
            Priority::Manual => "MANUAL",
            Priority::Rare => "RARE",
        }
    }
}

impl FromStr for Priority {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRIMARY" => Ok(Priority::Primary),
            "SECONDARY" => Ok(Priority::Secondary),
            "MANUAL" => Ok(Priority::Manual),
            "RARE" => Ok(Priority::Rare),
            _ => Err(UnknownVariant("priority", s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentType {
    Point,
    CelestialBody,
    DriftScan,
    RasterScan,
    FreeControl,
}

impl AppointmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentType::Point => "POINT",
            AppointmentType::CelestialBody => "CELESTIAL_BODY",
            AppointmentType::DriftScan => "DRIFT_SCAN",
            AppointmentType::RasterScan => "RASTER_SCAN",
            AppointmentType::FreeControl => "FREE_CONTROL",
        }
    }
}

impl FromStr for AppointmentType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "POINT" => Ok(AppointmentType::Point),
            "CELESTIAL_BODY" => Ok(AppointmentType::CelestialBody),
            "DRIFT_SCAN" => Ok(AppointmentType::DriftScan),
            "RASTER_SCAN" => Ok(AppointmentType::RasterScan),
            "FREE_CONTROL" => Ok(AppointmentType::FreeControl),
            _ => Err(UnknownVariant("appointment type", s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Guest,
    Student,
    Researcher,
    Member,
    Alumnus,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Guest => "GUEST",
            Role::Student => "STUDENT",
            Role::Researcher => "RESEARCHER",
            Role::Member => "MEMBER",
            Role::Alumnus => "ALUMNUS",
            Role::Admin => "ADMIN",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(Role::User),
            "GUEST" => Ok(Role::Guest),
            "STUDENT" => Ok(Role::Student),
            "RESEARCHER" => Ok(Role::Researcher),
            "MEMBER" => Ok(Role::Member),
            "ALUMNUS" => Ok(Role::Alumnus),
            "ADMIN" => Ok(Role::Admin),
            _ => Err(UnknownVariant("role", s.to_string())),
        }
    }
}

pub type RoleSet = BTreeSet<Role>;

/// Comma-separated role list, e.g. `"STUDENT,MEMBER"`. Empty string → no roles.
pub fn parse_roles(s: &str) -> Result<RoleSet, UnknownVariant> {
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect()
}

pub fn format_roles(roles: &RoleSet) -> String {
    roles.iter().map(Role::as_str).collect::<Vec<_>>().join(",")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub &'static str, pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.0, self.1)
    }
}

impl std::error::Error for UnknownVariant {}

// ── Appointments ─────────────────────────────────────────────────

/// Equatorial pointing target for free-control observations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Right ascension.
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    /// Degrees, `[-90, 90]`.
    pub declination: f64,
}

impl Coordinate {
    pub fn is_valid(&self) -> bool {
        self.hours < 24
            && self.minutes < 60
            && self.seconds < 60
            && self.declination.is_finite()
            && (-90.0..=90.0).contains(&self.declination)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub telescope_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
    pub priority: Priority,
    pub kind: AppointmentType,
    pub public: bool,
    pub coordinates: Vec<Coordinate>,
    pub calibrated_at: Option<Ms>,
}

/// Input to create/request: everything the caller chooses.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub telescope_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub priority: Priority,
    pub kind: AppointmentType,
    pub public: bool,
}

impl NewAppointment {
    pub fn into_appointment(self, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: self.id,
            telescope_id: self.telescope_id,
            user_id: self.user_id,
            span: self.span,
            status,
            priority: self.priority,
            kind: self.kind,
            public: self.public,
            coordinates: Vec::new(),
            calibrated_at: None,
        }
    }
}

/// Per-user observation budget. `Unlimited` is the "null cap".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllottedTime {
    Unlimited,
    Limited(Ms),
}

impl AllottedTime {
    pub fn from_option(max_ms: Option<Ms>) -> Self {
        match max_ms {
            Some(ms) => AllottedTime::Limited(ms),
            None => AllottedTime::Unlimited,
        }
    }

    pub fn as_option(&self) -> Option<Ms> {
        match self {
            AllottedTime::Unlimited => None,
            AllottedTime::Limited(ms) => Some(*ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Ulid,
    pub name: Option<String>,
    pub roles: RoleSet,
}

#[derive(Debug, Clone)]
pub struct TelescopeState {
    pub id: Ulid,
    pub name: Option<String>,
    /// All appointments on this telescope, sorted by `span.start`.
    pub appointments: Vec<Appointment>,
}

impl TelescopeState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            appointments: Vec::new(),
        }
    }

    /// Insert appointment maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments (any status) whose window intersects `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    pub fn in_progress(&self) -> impl Iterator<Item = &Appointment> {
        self.appointments
            .iter()
            .filter(|a| a.status == AppointmentStatus::InProgress)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    TelescopeCreated {
        id: Ulid,
        name: Option<String>,
    },
    TelescopeDeleted {
        id: Ulid,
    },
    UserRegistered {
        id: Ulid,
        name: Option<String>,
        roles: Vec<Role>,
    },
    UserRolesChanged {
        id: Ulid,
        roles: Vec<Role>,
    },
    AllottedTimeSet {
        user_id: Ulid,
        max_ms: Option<Ms>,
    },
    AppointmentCreated {
        id: Ulid,
        telescope_id: Ulid,
        user_id: Ulid,
        span: Span,
        status: AppointmentStatus,
        priority: Priority,
        kind: AppointmentType,
        public: bool,
    },
    AppointmentRescheduled {
        id: Ulid,
        telescope_id: Ulid,
        span: Span,
    },
    AppointmentStatusChanged {
        id: Ulid,
        telescope_id: Ulid,
        status: AppointmentStatus,
    },
    CoordinateAdded {
        id: Ulid,
        telescope_id: Ulid,
        coordinate: Coordinate,
    },
    AppointmentCalibrated {
        id: Ulid,
        telescope_id: Ulid,
        at: Ms,
    },
    AppointmentPurged {
        id: Ulid,
        telescope_id: Ulid,
    },
}

impl Event {
    /// Telescope whose state this event mutates, if any.
    pub fn telescope_id(&self) -> Option<Ulid> {
        match self {
            Event::AppointmentCreated { telescope_id, .. }
            | Event::AppointmentRescheduled { telescope_id, .. }
            | Event::AppointmentStatusChanged { telescope_id, .. }
            | Event::CoordinateAdded { telescope_id, .. }
            | Event::AppointmentCalibrated { telescope_id, .. }
            | Event::AppointmentPurged { telescope_id, .. } => Some(*telescope_id),
            Event::TelescopeCreated { .. }
            | Event::TelescopeDeleted { .. }
            | Event::UserRegistered { .. }
            | Event::UserRolesChanged { .. }
            | Event::AllottedTimeSet { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::TelescopeCreated { .. } => "telescope_created",
            Event::TelescopeDeleted { .. } => "telescope_deleted",
            Event::UserRegistered { .. } => "user_registered",
            Event::UserRolesChanged { .. } => "user_roles_changed",
            Event::AllottedTimeSet { .. } => "allotted_time_set",
            Event::AppointmentCreated { .. } => "appointment_created",
            Event::AppointmentRescheduled { .. } => "appointment_rescheduled",
            Event::AppointmentStatusChanged { .. } => "appointment_status_changed",
            Event::CoordinateAdded { .. } => "coordinate_added",
            Event::AppointmentCalibrated { .. } => "appointment_calibrated",
            Event::AppointmentPurged { .. } => "appointment_purged",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelescopeInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub appointment_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllottedTimeInfo {
    pub user_id: Ulid,
    pub cap: AllottedTime,
    pub used_ms: Ms,
    /// `None` when the cap is unlimited.
    pub remaining_ms: Option<Ms>,
}
