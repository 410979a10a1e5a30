use std::collections::HashMap;

use chrono::{Datelike, Duration};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::status::{activity_phase, activity_status, ActivityDerivedStatus};

use super::{require_admin, Engine, EngineError, UnitKey};

impl Engine {
    pub(crate) fn appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.appointments
            .get(&id)
            .map(|a| a.clone())
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    /// One appointment, visible to its owner and to admins.
    pub fn get_appointment(&self, principal: &Principal, id: Ulid) -> Result<Appointment, EngineError> {
        let appointment = self.appointment(id)?;
        if appointment.owner != principal.user_id && !principal.is_admin() {
            return Err(EngineError::Forbidden("appointment belongs to another user"));
        }
        Ok(appointment)
    }

    /// The caller's own appointments, newest first.
    pub fn appointments_for_owner(&self, principal: &Principal) -> Vec<Appointment> {
        let mut out: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|e| e.owner == principal.user_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out.truncate(MAX_LIST_ROWS);
        out
    }

    /// Admin listing, ordered by visit date then slot.
    pub fn list_appointments(
        &self,
        principal: &Principal,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, EngineError> {
        require_admin(principal)?;
        let mut out: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| {
            (a.date, &a.time_slot, a.id).cmp(&(b.date, &b.time_slot, b.id))
        });
        out.truncate(MAX_LIST_ROWS);
        Ok(out)
    }

    /// Dashboard aggregates. Date windows (today, this Monday-to-Sunday week,
    /// this calendar month, today onward) count live appointments only.
    pub fn appointment_counts(&self, principal: &Principal) -> Result<AppointmentCounts, EngineError> {
        require_admin(principal)?;
        let today = self.today();
        let week_start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
        let week_end = week_start + Duration::days(6);

        let mut counts = AppointmentCounts::default();
        for e in self.appointments.iter() {
            let a = e.value();
            counts.total += 1;
            match a.status {
                AppointmentStatus::Pending => counts.pending += 1,
                AppointmentStatus::Confirmed => counts.confirmed += 1,
                AppointmentStatus::Completed => counts.completed += 1,
                AppointmentStatus::Cancelled => counts.cancelled += 1,
            }
            if !a.status.is_live() {
                continue;
            }
            if a.date == today {
                counts.today += 1;
            }
            if a.date >= week_start && a.date <= week_end {
                counts.week += 1;
            }
            if a.date.year() == today.year() && a.date.month() == today.month() {
                counts.month += 1;
            }
            if a.date >= today {
                counts.upcoming += 1;
            }
        }
        Ok(counts)
    }

    // ── Activities ──────────────────────────────────────────

    pub fn activity(&self, id: Ulid) -> Result<Activity, EngineError> {
        self.activities
            .get(&id)
            .map(|a| a.clone())
            .ok_or_else(|| EngineError::not_found("activity", id))
    }

    async fn registered_count(&self, id: Ulid) -> u32 {
        self.ledger
            .snapshot(&UnitKey::Activity(id))
            .await
            .map_or(0, |(_, reserved)| reserved)
    }

    async fn view(&self, principal: &Principal, activity: Activity, now: Ms) -> ActivityView {
        let registered_count = self.registered_count(activity.id).await;
        let status = activity_status(&activity, registered_count, now);
        ActivityView {
            phase: activity_phase(&activity, now),
            is_registered: self
                .active_registrations
                .contains_key(&(activity.id, principal.user_id.clone())),
            is_registration_open: status == ActivityDerivedStatus::Open && activity.allow_registration,
            status,
            registered_count,
            activity,
        }
    }

    pub async fn activity_view(&self, principal: &Principal, id: Ulid) -> Result<ActivityView, EngineError> {
        let activity = self.activity(id)?;
        Ok(self.view(principal, activity, self.now()).await)
    }

    /// Activities in start order, narrowed by phase, category and a title or
    /// description search. Cancelled activities are only listed for admins.
    pub async fn list_activities(
        &self,
        principal: &Principal,
        filter: &ActivityFilter,
    ) -> Vec<ActivityView> {
        let now = self.now();
        let mut activities: Vec<Activity> = self
            .activities
            .iter()
            .filter(|e| principal.is_admin() || e.status == ActivityStatus::Active)
            .filter(|e| filter.matches(e.value(), now))
            .map(|e| e.value().clone())
            .collect();
        activities.sort_by_key(|a| (a.start_time, a.id));
        activities.truncate(MAX_LIST_ROWS);

        let mut out = Vec::with_capacity(activities.len());
        for activity in activities {
            out.push(self.view(principal, activity, now).await);
        }
        out
    }

    /// Every registration the caller has made, newest first.
    pub fn registrations_for_user(&self, principal: &Principal) -> Vec<RegistrationView> {
        let mut out: Vec<RegistrationView> = self
            .registrations
            .iter()
            .filter(|e| e.user_id == principal.user_id)
            .filter_map(|e| {
                let activity = self.activities.get(&e.activity_id)?;
                Some(RegistrationView {
                    registration: e.value().clone(),
                    activity_title: activity.title.clone(),
                    activity_start: activity.start_time,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            b.registration.registration_time
                .cmp(&a.registration.registration_time)
                .then(b.registration.id.cmp(&a.registration.id))
        });
        out.truncate(MAX_LIST_ROWS);
        out
    }

    /// All registrations of one activity, oldest first. Admin only.
    pub fn activity_registrations(
        &self,
        principal: &Principal,
        activity_id: Ulid,
    ) -> Result<Vec<Registration>, EngineError> {
        require_admin(principal)?;
        if !self.activities.contains_key(&activity_id) {
            return Err(EngineError::not_found("activity", activity_id));
        }
        let mut out: Vec<Registration> = self
            .registrations
            .iter()
            .filter(|e| e.activity_id == activity_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| (r.registration_time, r.id));
        out.truncate(MAX_LIST_ROWS);
        Ok(out)
    }

    // ── Consistency ─────────────────────────────────────────

    /// Units held according to the records alone.
    fn expected_reservations(&self) -> HashMap<UnitKey, u32> {
        let mut expected: HashMap<UnitKey, u32> = HashMap::new();
        for e in self.appointments.iter() {
            if e.status != AppointmentStatus::Cancelled {
                *expected
                    .entry(UnitKey::slot(e.date, e.time_slot.clone()))
                    .or_default() += e.units;
            }
        }
        for e in self.registrations.iter() {
            if e.status == RegistrationStatus::Registered {
                *expected.entry(UnitKey::Activity(e.activity_id)).or_default() += 1;
            }
        }
        expected
    }

    fn expected_for_unit(&self, key: &UnitKey) -> u32 {
        match key {
            UnitKey::Slot { date, time_slot } => self
                .appointments
                .iter()
                .filter(|e| e.status != AppointmentStatus::Cancelled)
                .filter(|e| e.date == *date && e.time_slot == *time_slot)
                .map(|e| e.units)
                .sum(),
            UnitKey::Activity(id) => self
                .registrations
                .iter()
                .filter(|e| e.activity_id == *id && e.status == RegistrationStatus::Registered)
                .count() as u32,
        }
    }

    /// Recompute every unit's reservation count from the records and report
    /// units whose ledger counter disagrees. Empty means consistent.
    pub async fn verify_counters(&self, principal: &Principal) -> Result<Vec<CounterMismatch>, EngineError> {
        require_admin(principal)?;
        let expected = self.expected_reservations();
        let mut keys: Vec<UnitKey> = self.ledger.keys();
        keys.extend(expected.keys().filter(|k| self.ledger.get(k).is_none()).cloned());
        keys.sort();
        keys.dedup();

        let mut mismatches = Vec::new();
        for key in keys {
            let records = expected.get(&key).copied().unwrap_or(0);
            let Some(unit) = self.ledger.get(&key) else {
                mismatches.push(CounterMismatch {
                    unit: key.to_string(),
                    ledger: 0,
                    records,
                });
                continue;
            };
            let counter = unit.lock().await;
            if counter.reserved == records {
                continue;
            }
            // Re-count under the lock: the bulk pass may have raced a mutation.
            let records = self.expected_for_unit(&key);
            if counter.reserved != records {
                mismatches.push(CounterMismatch {
                    unit: key.to_string(),
                    ledger: counter.reserved,
                    records,
                });
            }
        }
        Ok(mismatches)
    }
}
