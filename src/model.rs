use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::local_ms;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Opaque user reference handed to us by the auth collaborator.
pub type UserId = String;

// ── Principals ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
}

/// The authenticated caller attached to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub role: Role,
}

impl Principal {
    pub fn user(id: impl Into<UserId>) -> Self {
        Self {
            user_id: id.into(),
            role: Role::User,
        }
    }

    pub fn admin(id: impl Into<UserId>) -> Self {
        Self {
            user_id: id.into(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Capacity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capacity {
    Limited(u32),
    Unlimited,
}

impl Capacity {
    /// Units still free given `reserved`, clamped at 0. `None` when unlimited.
    pub fn remaining(&self, reserved: u32) -> Option<u32> {
        match self {
            Capacity::Limited(cap) => Some(cap.saturating_sub(reserved)),
            Capacity::Unlimited => None,
        }
    }

    pub fn admits(&self, reserved: u32, amount: u32) -> bool {
        match self {
            Capacity::Limited(cap) => reserved
                .checked_add(amount)
                .is_some_and(|total| total <= *cap),
            Capacity::Unlimited => true,
        }
    }

    pub fn is_exhausted(&self, reserved: u32) -> bool {
        matches!(self, Capacity::Limited(cap) if reserved >= *cap)
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::Limited(cap) => write!(f, "{cap}"),
            Capacity::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// How many ledger units an appointment consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityMode {
    /// One unit per appointment, regardless of party size.
    #[default]
    PerBooking,
    /// One unit per visitor.
    PerVisitor,
}

impl CapacityMode {
    pub fn units_for(&self, visitor_count: u32) -> u32 {
        match self {
            CapacityMode::PerBooking => 1,
            CapacityMode::PerVisitor => visitor_count,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_booking" | "booking" => Some(CapacityMode::PerBooking),
            "per_visitor" | "visitor" => Some(CapacityMode::PerVisitor),
            _ => None,
        }
    }
}

// ── Daily schedule ───────────────────────────────────────────────

/// A labeled daily window such as `09:00-10:00`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSlot {
    pub label: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn parse(label: &str) -> Result<Self, String> {
        let label = label.trim();
        let (start, end) = label
            .split_once('-')
            .ok_or_else(|| format!("time slot {label:?} must look like HH:MM-HH:MM"))?;
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M")
                .map_err(|_| format!("bad time {s:?} in slot {label:?}"))
        };
        let (start, end) = (parse(start)?, parse(end)?);
        if start >= end {
            return Err(format!("time slot {label:?} ends before it starts"));
        }
        Ok(Self {
            label: format!("{}-{}", start.format("%H:%M"), end.format("%H:%M")),
            start,
            end,
        })
    }

    pub fn starts_at(&self, date: NaiveDate) -> Ms {
        local_ms(date, self.start)
    }

    pub fn ends_at(&self, date: NaiveDate) -> Ms {
        local_ms(date, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSlotConfig {
    pub slot: TimeSlot,
    pub capacity: u32,
    pub active: bool,
}

/// The schedule seeded on first start.
pub const DEFAULT_TIME_SLOTS: [&str; 7] = [
    "09:00-10:00",
    "10:00-11:00",
    "11:00-12:00",
    "13:00-14:00",
    "14:00-15:00",
    "15:00-16:00",
    "16:00-17:00",
];

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(AppointmentStatus::Pending),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "completed" => Some(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }

    /// The review workflow's transition table.
    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }

    /// Holds a claim on the owner's date (one live appointment per user per day).
    pub fn is_live(&self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub owner: UserId,
    pub date: NaiveDate,
    pub time_slot: String,
    pub visitor_count: u32,
    /// Ledger units held while not cancelled; fixed at creation.
    pub units: u32,
    pub contact_name: String,
    pub contact_phone: String,
    pub organization: Option<String>,
    pub purpose: Option<String>,
    pub status: AppointmentStatus,
    pub admin_notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Booking request as received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub date: NaiveDate,
    pub time_slot: String,
    pub visitor_count: u32,
    pub contact_name: String,
    pub contact_phone: String,
    pub organization: Option<String>,
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub status: Option<AppointmentStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl AppointmentFilter {
    pub fn matches(&self, a: &Appointment) -> bool {
        self.status.is_none_or(|s| a.status == s)
            && self.date_from.is_none_or(|d| a.date >= d)
            && self.date_to.is_none_or(|d| a.date <= d)
    }
}

// ── Activities ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityStatus {
    Active,
    Cancelled,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Active => "active",
            ActivityStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(ActivityStatus::Active),
            "cancelled" | "canceled" => Some(ActivityStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Ulid,
    pub title: String,
    pub description: String,
    pub start_time: Ms,
    pub end_time: Ms,
    pub location: String,
    pub speaker: Option<String>,
    pub capacity: Capacity,
    pub registration_deadline: Option<Ms>,
    pub allow_registration: bool,
    pub category: String,
    pub status: ActivityStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActivity {
    pub id: Ulid,
    pub title: String,
    pub description: String,
    pub start_time: Ms,
    pub end_time: Ms,
    pub location: String,
    pub speaker: Option<String>,
    pub capacity: Capacity,
    pub registration_deadline: Option<Ms>,
    pub allow_registration: bool,
    pub category: String,
}

/// Suggested activity categories as (value, label). `category` is free text;
/// this list only feeds pickers.
pub const ACTIVITY_CATEGORIES: [(&str, &str); 5] = [
    ("general", "General"),
    ("ai", "Artificial intelligence"),
    ("physics", "Physics"),
    ("workshop", "Workshop"),
    ("lecture", "Lecture"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityFilter {
    pub phase: Option<crate::status::ActivityPhase>,
    /// Exact category value.
    pub category: Option<String>,
    /// Case-insensitive substring of the title or the description.
    pub search: Option<String>,
}

impl ActivityFilter {
    pub fn matches(&self, activity: &Activity, now: Ms) -> bool {
        self.phase
            .is_none_or(|p| crate::status::activity_phase(activity, now) == p)
            && self.category.as_ref().is_none_or(|c| activity.category == *c)
            && self.search.as_ref().is_none_or(|term| {
                let term = term.to_lowercase();
                activity.title.to_lowercase().contains(&term)
                    || activity.description.to_lowercase().contains(&term)
            })
    }
}

/// Partial update of an activity. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<Ms>,
    pub end_time: Option<Ms>,
    pub location: Option<String>,
    pub speaker: Option<Option<String>>,
    pub capacity: Option<Capacity>,
    pub registration_deadline: Option<Option<Ms>>,
    pub allow_registration: Option<bool>,
    pub category: Option<String>,
    pub status: Option<ActivityStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Registered,
    Cancelled,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Registered => "registered",
            RegistrationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: Ulid,
    pub activity_id: Ulid,
    pub user_id: UserId,
    pub status: RegistrationStatus,
    pub registration_time: Ms,
    pub cancelled_at: Option<Ms>,
}

// ── WAL records ──────────────────────────────────────────────────

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TimeSlotConfigured {
        time_slot: String,
        capacity: u32,
        active: bool,
    },
    AppointmentCreated {
        appointment: Appointment,
    },
    AppointmentUpdated {
        id: Ulid,
        status: AppointmentStatus,
        admin_notes: Option<String>,
        at: Ms,
    },
    ActivityCreated {
        activity: Activity,
    },
    ActivityUpdated {
        activity: Activity,
    },
    RegistrationCreated {
        registration: Registration,
    },
    RegistrationCancelled {
        id: Ulid,
        activity_id: Ulid,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAvailability {
    pub time_slot: String,
    pub capacity: u32,
    pub reserved_count: u32,
    pub available_count: u32,
}

/// Aggregates for the admin dashboard. Date windows count live
/// (pending/confirmed) appointments only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentCounts {
    pub pending: u64,
    pub confirmed: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub total: u64,
    pub today: u64,
    pub week: u64,
    pub month: u64,
    pub upcoming: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityView {
    pub activity: Activity,
    pub registered_count: u32,
    pub status: crate::status::ActivityDerivedStatus,
    pub phase: crate::status::ActivityPhase,
    pub is_registered: bool,
    pub is_registration_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationView {
    pub registration: Registration,
    pub activity_title: String,
    pub activity_start: Ms,
}

/// A ledger unit whose counter disagrees with the records it should mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterMismatch {
    pub unit: String,
    pub ledger: u32,
    pub records: u32,
}
