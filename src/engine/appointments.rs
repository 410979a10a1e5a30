use chrono::{Duration, NaiveDate};
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{
    optional_text, record_release, record_reservation, require_admin, required_text, Engine,
    EngineError, IdClaim, UnitKey,
};

impl Engine {
    /// Reject dates before today or beyond the booking horizon.
    fn check_bookable_date(&self, date: NaiveDate) -> Result<(), EngineError> {
        let today = self.today();
        if date < today {
            return Err(EngineError::Validation(format!("date {date} is in the past")));
        }
        let horizon = self.config.booking_horizon_days;
        if date > today + Duration::days(horizon) {
            return Err(EngineError::Validation(format!(
                "date {date} is more than {horizon} days ahead"
            )));
        }
        Ok(())
    }

    /// Remaining capacity of every active slot on `date`, in schedule order.
    /// Full slots are included with `available_count = 0`.
    pub async fn available_slots(&self, date: NaiveDate) -> Result<Vec<SlotAvailability>, EngineError> {
        self.check_bookable_date(date)?;

        let mut configs: Vec<TimeSlotConfig> = self
            .schedule
            .iter()
            .filter(|e| e.value().active)
            .map(|e| e.value().clone())
            .collect();
        configs.sort_by_key(|c| c.slot.start);

        // Read-only: a unit nobody has booked into is not created here.
        let mut out = Vec::with_capacity(configs.len());
        for config in configs {
            let reserved = match self.ledger.get(&UnitKey::slot(date, config.slot.label.as_str())) {
                Some(unit) => unit.lock().await.reserved,
                None => 0,
            };
            out.push(SlotAvailability {
                available_count: Capacity::Limited(config.capacity)
                    .remaining(reserved)
                    .unwrap_or(u32::MAX),
                time_slot: config.slot.label,
                capacity: config.capacity,
                reserved_count: reserved,
            });
        }
        Ok(out)
    }

    pub async fn create_appointment(
        &self,
        principal: &Principal,
        req: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        let result = self.try_create_appointment(principal, req).await;
        record_reservation("slot", &result);
        result
    }

    async fn try_create_appointment(
        &self,
        principal: &Principal,
        req: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        let Some(_claim) = IdClaim::take(&self.ids_in_flight, req.id) else {
            return Err(EngineError::already_exists("appointment", req.id));
        };
        self.create_claimed_appointment(principal, req).await
    }

    /// Runs while `req.id` is claimed in `ids_in_flight`, so no other create
    /// with the same id can pass the existence check below.
    async fn create_claimed_appointment(
        &self,
        principal: &Principal,
        req: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        if self.appointments.contains_key(&req.id) {
            return Err(EngineError::already_exists("appointment", req.id));
        }
        if self.appointments.len() >= MAX_APPOINTMENTS {
            return Err(EngineError::LimitExceeded("too many appointments"));
        }
        if principal.user_id.is_empty() || principal.user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::Validation("invalid user id".into()));
        }
        self.check_bookable_date(req.date)?;

        let slot = TimeSlot::parse(&req.time_slot).map_err(EngineError::Validation)?;
        let config = self
            .schedule
            .get(&slot.label)
            .filter(|c| c.active)
            .map(|c| c.clone())
            .ok_or_else(|| {
                EngineError::Validation(format!("time slot {} is not available", slot.label))
            })?;
        let now = self.now();
        if config.slot.starts_at(req.date) <= now {
            return Err(EngineError::Validation(format!(
                "time slot {} on {} has already started",
                slot.label, req.date
            )));
        }

        if req.visitor_count == 0 {
            return Err(EngineError::Validation("visitor_count must be positive".into()));
        }
        if req.visitor_count > MAX_VISITOR_COUNT {
            return Err(EngineError::LimitExceeded("visitor_count too large"));
        }
        let contact_name = required_text("contact_name", &req.contact_name, MAX_NAME_LEN)?;
        let contact_phone = required_text("contact_phone", &req.contact_phone, MAX_PHONE_LEN)?;
        let organization = optional_text("organization", req.organization.as_deref(), MAX_NAME_LEN)?;
        let purpose = optional_text("purpose", req.purpose.as_deref(), MAX_TEXT_LEN)?;

        // One live appointment per owner per day. The claim is taken before the
        // slot so a rejected booking never touches the ledger.
        let claim = (principal.user_id.clone(), req.date);
        match self.date_claims.entry(claim.clone()) {
            Entry::Occupied(e) => return Err(EngineError::AlreadyBooked(*e.get())),
            Entry::Vacant(v) => {
                v.insert(req.id);
            }
        }

        let appointment = Appointment {
            id: req.id,
            owner: principal.user_id.clone(),
            date: req.date,
            time_slot: slot.label,
            visitor_count: req.visitor_count,
            units: self.config.capacity_mode.units_for(req.visitor_count),
            contact_name,
            contact_phone,
            organization,
            purpose,
            status: AppointmentStatus::Pending,
            admin_notes: None,
            created_at: now,
            updated_at: now,
        };

        let result = self.reserve_appointment(&appointment).await;
        if result.is_err() {
            self.date_claims.remove_if(&claim, |_, id| *id == req.id);
        }
        result?;

        info!(
            id = %appointment.id,
            date = %appointment.date,
            slot = %appointment.time_slot,
            visitors = appointment.visitor_count,
            "appointment booked"
        );
        Ok(appointment)
    }

    /// Reserve the appointment's units and persist it, all under the unit lock.
    async fn reserve_appointment(&self, appointment: &Appointment) -> Result<(), EngineError> {
        let key = UnitKey::slot(appointment.date, appointment.time_slot.clone());
        let mut unit = self.lock_slot(appointment.date, &appointment.time_slot).await;
        if let Err(e) = unit.try_reserve(appointment.units) {
            debug!(%key, "booking rejected: {e}");
            return Err(EngineError::SlotFull(key));
        }
        let event = Event::AppointmentCreated {
            appointment: appointment.clone(),
        };
        if let Err(e) = self.persist(event).await {
            unit.release(appointment.units);
            warn!(%key, "reservation released after WAL failure: {e}");
            metrics::counter!(observability::WAL_COMPENSATIONS_TOTAL).increment(1);
            return Err(e);
        }
        Ok(())
    }

    /// Cancel an appointment on behalf of its owner (or an admin) and return
    /// its units to the slot.
    pub async fn cancel_appointment(
        &self,
        principal: &Principal,
        id: Ulid,
    ) -> Result<Appointment, EngineError> {
        let (owner, date, time_slot) = self
            .appointments
            .get(&id)
            .map(|a| (a.owner.clone(), a.date, a.time_slot.clone()))
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        if owner != principal.user_id && !principal.is_admin() {
            return Err(EngineError::Forbidden("appointment belongs to another user"));
        }

        let mut unit = self.lock_slot(date, &time_slot).await;
        let (status, units, admin_notes) = self
            .appointments
            .get(&id)
            .map(|a| (a.status, a.units, a.admin_notes.clone()))
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        if status.is_terminal() {
            debug!(%id, %status, "cancel rejected");
            return Err(EngineError::AlreadyCancelled(id));
        }

        self.persist(Event::AppointmentUpdated {
            id,
            status: AppointmentStatus::Cancelled,
            admin_notes,
            at: self.now(),
        })
        .await?;
        unit.release(units);
        drop(unit);
        record_release("slot");

        info!(%id, "appointment cancelled");
        self.appointment(id)
    }

    /// Admin review: move an appointment through the workflow and/or replace
    /// its notes. `admin_notes = Some("")` clears the notes.
    pub async fn update_appointment(
        &self,
        principal: &Principal,
        id: Ulid,
        status: Option<AppointmentStatus>,
        admin_notes: Option<String>,
    ) -> Result<Appointment, EngineError> {
        require_admin(principal)?;
        if status.is_none() && admin_notes.is_none() {
            return Err(EngineError::Validation("nothing to update".into()));
        }
        let notes = match admin_notes {
            Some(n) => Some(optional_text("admin_notes", Some(&n), MAX_TEXT_LEN)?),
            None => None,
        };

        let (date, time_slot) = self
            .appointments
            .get(&id)
            .map(|a| (a.date, a.time_slot.clone()))
            .ok_or_else(|| EngineError::not_found("appointment", id))?;

        let mut unit = self.lock_slot(date, &time_slot).await;
        let (current, units, current_notes) = self
            .appointments
            .get(&id)
            .map(|a| (a.status, a.units, a.admin_notes.clone()))
            .ok_or_else(|| EngineError::not_found("appointment", id))?;

        let next = match status {
            None => current,
            Some(next) if next == AppointmentStatus::Cancelled && current.is_terminal() => {
                return Err(EngineError::AlreadyTerminal {
                    id,
                    status: current.as_str(),
                });
            }
            Some(next) if !current.can_transition_to(next) => {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: current.as_str(),
                    to: next.as_str(),
                });
            }
            Some(next) => next,
        };

        self.persist(Event::AppointmentUpdated {
            id,
            status: next,
            admin_notes: notes.unwrap_or(current_notes),
            at: self.now(),
        })
        .await?;
        if next == AppointmentStatus::Cancelled && current != AppointmentStatus::Cancelled {
            unit.release(units);
            record_release("slot");
        }
        drop(unit);

        if next != current {
            info!(%id, from = %current, to = %next, "appointment status changed");
        }
        self.appointment(id)
    }

    /// Mark confirmed appointments whose slot has ended as completed. Capacity
    /// is untouched. Returns how many were moved.
    pub async fn complete_finished_appointments(&self) -> Result<usize, EngineError> {
        let now = self.now();
        let mut due: Vec<(Ulid, NaiveDate, String)> = self
            .appointments
            .iter()
            .filter(|e| e.status == AppointmentStatus::Confirmed)
            .filter(|e| TimeSlot::parse(&e.time_slot).is_ok_and(|s| s.ends_at(e.date) < now))
            .map(|e| (e.id, e.date, e.time_slot.clone()))
            .collect();
        due.sort();

        let mut completed = 0;
        for (id, date, time_slot) in due {
            let _unit = self.lock_slot(date, &time_slot).await;
            let Some(notes) = self
                .appointments
                .get(&id)
                .filter(|a| a.status == AppointmentStatus::Confirmed)
                .map(|a| a.admin_notes.clone())
            else {
                continue;
            };
            self.persist(Event::AppointmentUpdated {
                id,
                status: AppointmentStatus::Completed,
                admin_notes: notes,
                at: now,
            })
            .await?;
            completed += 1;
        }
        if completed > 0 {
            metrics::counter!(observability::SWEEP_COMPLETED_TOTAL).increment(completed as u64);
            info!(completed, "confirmed appointments completed");
        }
        Ok(completed)
    }

    // ── Daily schedule ──────────────────────────────────────

    pub async fn configure_time_slot(
        &self,
        principal: &Principal,
        label: &str,
        capacity: u32,
        active: bool,
    ) -> Result<TimeSlotConfig, EngineError> {
        require_admin(principal)?;
        let slot = TimeSlot::parse(label).map_err(EngineError::Validation)?;
        let _edit = self.schedule_lock.lock().await;
        if self.schedule.contains_key(&slot.label) {
            return Err(EngineError::already_exists("time slot", &slot.label));
        }
        if self.schedule.len() >= MAX_TIME_SLOTS {
            return Err(EngineError::LimitExceeded("too many time slots"));
        }
        self.persist(Event::TimeSlotConfigured {
            time_slot: slot.label.clone(),
            capacity,
            active,
        })
        .await?;
        info!(slot = %slot.label, capacity, active, "time slot configured");
        self.time_slot(&slot.label)
    }

    /// Change a slot's capacity and/or active flag. Capacity changes apply to
    /// every date, including ones that already hold bookings; bookings are
    /// never evicted.
    pub async fn update_time_slot(
        &self,
        principal: &Principal,
        label: &str,
        capacity: Option<u32>,
        active: Option<bool>,
    ) -> Result<TimeSlotConfig, EngineError> {
        require_admin(principal)?;
        if capacity.is_none() && active.is_none() {
            return Err(EngineError::Validation("nothing to update".into()));
        }
        let slot = TimeSlot::parse(label).map_err(EngineError::Validation)?;
        let _edit = self.schedule_lock.lock().await;
        let current = self.time_slot(&slot.label)?;
        let capacity = capacity.unwrap_or(current.capacity);
        self.persist(Event::TimeSlotConfigured {
            time_slot: slot.label.clone(),
            capacity,
            active: active.unwrap_or(current.active),
        })
        .await?;

        if capacity != current.capacity {
            for key in self.ledger.keys() {
                if matches!(&key, UnitKey::Slot { time_slot, .. } if *time_slot == slot.label) {
                    self.ledger.set_capacity(&key, Capacity::Limited(capacity)).await;
                }
            }
        }
        info!(slot = %slot.label, capacity, "time slot updated");
        self.time_slot(&slot.label)
    }

    /// The whole schedule, inactive slots included, in start order.
    pub fn time_slots(&self, principal: &Principal) -> Result<Vec<TimeSlotConfig>, EngineError> {
        require_admin(principal)?;
        let mut out: Vec<TimeSlotConfig> = self.schedule.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|c| c.slot.start);
        Ok(out)
    }

    fn time_slot(&self, label: &str) -> Result<TimeSlotConfig, EngineError> {
        self.schedule
            .get(label)
            .map(|c| c.clone())
            .ok_or_else(|| EngineError::not_found("time slot", label))
    }

    /// Install the default daily schedule when none exists yet.
    pub async fn seed_default_schedule(&self) -> Result<usize, EngineError> {
        let _edit = self.schedule_lock.lock().await;
        if !self.schedule.is_empty() {
            return Ok(0);
        }
        for label in DEFAULT_TIME_SLOTS {
            self.persist(Event::TimeSlotConfigured {
                time_slot: label.to_string(),
                capacity: self.config.default_slot_capacity,
                active: true,
            })
            .await?;
        }
        info!(
            slots = DEFAULT_TIME_SLOTS.len(),
            capacity = self.config.default_slot_capacity,
            "seeded default schedule"
        );
        Ok(DEFAULT_TIME_SLOTS.len())
    }
}
