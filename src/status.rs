//! Lifecycle labels derived from stored timestamps, counts and the current time.
//!
//! Nothing here is stored: every label is recomputed from the record and `now`,
//! so two callers asking at the same instant always agree.

use chrono::NaiveDate;

use crate::model::*;

/// Registration-facing status of an activity.
///
/// Precedence is fixed: cancelled, then ended, then ongoing, then deadline,
/// then full. An activity in progress is never reported as open or past its
/// deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityDerivedStatus {
    Cancelled,
    Ended,
    Ongoing,
    DeadlinePassed,
    Full,
    Open,
}

impl ActivityDerivedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityDerivedStatus::Cancelled => "cancelled",
            ActivityDerivedStatus::Ended => "ended",
            ActivityDerivedStatus::Ongoing => "ongoing",
            ActivityDerivedStatus::DeadlinePassed => "deadline_passed",
            ActivityDerivedStatus::Full => "full",
            ActivityDerivedStatus::Open => "open",
        }
    }
}

pub fn activity_status(activity: &Activity, registered_count: u32, now: Ms) -> ActivityDerivedStatus {
    if activity.status == ActivityStatus::Cancelled {
        return ActivityDerivedStatus::Cancelled;
    }
    if activity.end_time < now {
        return ActivityDerivedStatus::Ended;
    }
    if activity.start_time <= now {
        return ActivityDerivedStatus::Ongoing;
    }
    if activity.registration_deadline.is_some_and(|d| d < now) {
        return ActivityDerivedStatus::DeadlinePassed;
    }
    if activity.capacity.is_exhausted(registered_count) {
        return ActivityDerivedStatus::Full;
    }
    ActivityDerivedStatus::Open
}

/// Timeline position of an activity, used for the upcoming/ongoing/ended tabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityPhase {
    Upcoming,
    Ongoing,
    Ended,
}

impl ActivityPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityPhase::Upcoming => "upcoming",
            ActivityPhase::Ongoing => "ongoing",
            ActivityPhase::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upcoming" => Some(ActivityPhase::Upcoming),
            "ongoing" => Some(ActivityPhase::Ongoing),
            "ended" | "past" => Some(ActivityPhase::Ended),
            _ => None,
        }
    }
}

pub fn activity_phase(activity: &Activity, now: Ms) -> ActivityPhase {
    if activity.end_time < now {
        ActivityPhase::Ended
    } else if activity.start_time <= now {
        ActivityPhase::Ongoing
    } else {
        ActivityPhase::Upcoming
    }
}

/// Presentation label for an appointment's slot window. The stored status stays
/// authoritative; this only says where the visit sits in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppointmentTiming {
    Upcoming,
    InProgress,
    Past,
}

impl AppointmentTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentTiming::Upcoming => "upcoming",
            AppointmentTiming::InProgress => "in_progress",
            AppointmentTiming::Past => "past",
        }
    }
}

pub fn appointment_timing(date: NaiveDate, slot: &TimeSlot, now: Ms) -> AppointmentTiming {
    if slot.ends_at(date) < now {
        AppointmentTiming::Past
    } else if slot.starts_at(date) <= now {
        AppointmentTiming::InProgress
    } else {
        AppointmentTiming::Upcoming
    }
}
