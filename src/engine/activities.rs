use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{
    optional_text, record_release, record_reservation, require_admin, required_text, Engine,
    EngineError, IdClaim, UnitKey,
};

const DEFAULT_CATEGORY: &str = "general";

fn validate_window(start: Ms, end: Ms, deadline: Option<Ms>) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::Validation("start_time must be before end_time".into()));
    }
    if deadline.is_some_and(|d| d > end) {
        return Err(EngineError::Validation(
            "registration_deadline must not be after end_time".into(),
        ));
    }
    Ok(())
}

impl Engine {
    pub async fn create_activity(
        &self,
        principal: &Principal,
        new: NewActivity,
    ) -> Result<Activity, EngineError> {
        require_admin(principal)?;
        if self.activities.contains_key(&new.id) {
            return Err(EngineError::already_exists("activity", new.id));
        }
        if self.activities.len() >= MAX_ACTIVITIES {
            return Err(EngineError::LimitExceeded("too many activities"));
        }
        validate_window(new.start_time, new.end_time, new.registration_deadline)?;

        let activity = Activity {
            id: new.id,
            title: required_text("title", &new.title, MAX_NAME_LEN)?,
            description: optional_text("description", Some(&new.description), MAX_TEXT_LEN)?
                .unwrap_or_default(),
            start_time: new.start_time,
            end_time: new.end_time,
            location: required_text("location", &new.location, MAX_NAME_LEN)?,
            speaker: optional_text("speaker", new.speaker.as_deref(), MAX_NAME_LEN)?,
            capacity: new.capacity,
            registration_deadline: new.registration_deadline,
            allow_registration: new.allow_registration,
            category: optional_text("category", Some(&new.category), MAX_NAME_LEN)?
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            status: ActivityStatus::Active,
            created_at: self.now(),
        };

        let mut unit = self.ledger.lock(&UnitKey::Activity(activity.id), activity.capacity).await;
        if self.activities.contains_key(&activity.id) {
            return Err(EngineError::already_exists("activity", activity.id));
        }
        self.persist(Event::ActivityCreated {
            activity: activity.clone(),
        })
        .await?;
        unit.capacity = activity.capacity;
        drop(unit);

        info!(id = %activity.id, title = %activity.title, capacity = %activity.capacity, "activity created");
        Ok(activity)
    }

    /// Apply an admin edit. A finite capacity may not drop below the current
    /// number of registrations.
    pub async fn update_activity(
        &self,
        principal: &Principal,
        id: Ulid,
        patch: ActivityPatch,
    ) -> Result<Activity, EngineError> {
        require_admin(principal)?;
        if patch == ActivityPatch::default() {
            return Err(EngineError::Validation("nothing to update".into()));
        }
        let capacity = self
            .activities
            .get(&id)
            .map(|a| a.capacity)
            .ok_or_else(|| EngineError::not_found("activity", id))?;

        let mut unit = self.ledger.lock(&UnitKey::Activity(id), capacity).await;
        let mut activity = self
            .activities
            .get(&id)
            .map(|a| a.clone())
            .ok_or_else(|| EngineError::not_found("activity", id))?;

        if let Some(title) = &patch.title {
            activity.title = required_text("title", title, MAX_NAME_LEN)?;
        }
        if let Some(description) = &patch.description {
            activity.description =
                optional_text("description", Some(description), MAX_TEXT_LEN)?.unwrap_or_default();
        }
        if let Some(location) = &patch.location {
            activity.location = required_text("location", location, MAX_NAME_LEN)?;
        }
        if let Some(speaker) = &patch.speaker {
            activity.speaker = optional_text("speaker", speaker.as_deref(), MAX_NAME_LEN)?;
        }
        if let Some(category) = &patch.category {
            activity.category = optional_text("category", Some(category), MAX_NAME_LEN)?
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
        }
        if let Some(start) = patch.start_time {
            activity.start_time = start;
        }
        if let Some(end) = patch.end_time {
            activity.end_time = end;
        }
        if let Some(deadline) = patch.registration_deadline {
            activity.registration_deadline = deadline;
        }
        if let Some(allow) = patch.allow_registration {
            activity.allow_registration = allow;
        }
        if let Some(status) = patch.status {
            activity.status = status;
        }
        if let Some(capacity) = patch.capacity {
            if let Capacity::Limited(n) = capacity
                && n < unit.reserved
            {
                return Err(EngineError::Validation(format!(
                    "capacity {n} is below the {} current registrations",
                    unit.reserved
                )));
            }
            activity.capacity = capacity;
        }
        validate_window(activity.start_time, activity.end_time, activity.registration_deadline)?;

        self.persist(Event::ActivityUpdated {
            activity: activity.clone(),
        })
        .await?;
        unit.capacity = activity.capacity;
        drop(unit);

        info!(%id, status = activity.status.as_str(), capacity = %activity.capacity, "activity updated");
        Ok(activity)
    }

    pub async fn register(
        &self,
        principal: &Principal,
        activity_id: Ulid,
        registration_id: Ulid,
    ) -> Result<Registration, EngineError> {
        let result = self.try_register(principal, activity_id, registration_id).await;
        record_reservation("activity", &result);
        result
    }

    async fn try_register(
        &self,
        principal: &Principal,
        activity_id: Ulid,
        registration_id: Ulid,
    ) -> Result<Registration, EngineError> {
        let Some(_claim) = IdClaim::take(&self.ids_in_flight, registration_id) else {
            return Err(EngineError::already_exists("registration", registration_id));
        };
        self.register_claimed(principal, activity_id, registration_id).await
    }

    /// The per-activity lock only serializes one activity; the id claim held by
    /// the caller keeps the same registration id out of every other activity.
    async fn register_claimed(
        &self,
        principal: &Principal,
        activity_id: Ulid,
        registration_id: Ulid,
    ) -> Result<Registration, EngineError> {
        if self.registrations.contains_key(&registration_id) {
            return Err(EngineError::already_exists("registration", registration_id));
        }
        if principal.user_id.is_empty() || principal.user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::Validation("invalid user id".into()));
        }
        let capacity = self
            .activities
            .get(&activity_id)
            .map(|a| a.capacity)
            .ok_or_else(|| EngineError::not_found("activity", activity_id))?;

        let key = UnitKey::Activity(activity_id);
        let mut unit = self.ledger.lock(&key, capacity).await;
        let activity = self
            .activities
            .get(&activity_id)
            .map(|a| a.clone())
            .ok_or_else(|| EngineError::not_found("activity", activity_id))?;

        let now = self.now();
        if !activity.allow_registration || activity.status == ActivityStatus::Cancelled {
            return Err(EngineError::RegistrationClosed(activity_id));
        }
        if activity.registration_deadline.is_some_and(|d| now > d) {
            return Err(EngineError::DeadlinePassed(activity_id));
        }
        if now > activity.end_time {
            return Err(EngineError::ActivityEnded(activity_id));
        }
        if self
            .active_registrations
            .contains_key(&(activity_id, principal.user_id.clone()))
        {
            return Err(EngineError::AlreadyRegistered(activity_id));
        }
        if let Err(e) = unit.try_reserve(1) {
            debug!(%key, "registration rejected: {e}");
            return Err(EngineError::SlotFull(key));
        }

        let registration = Registration {
            id: registration_id,
            activity_id,
            user_id: principal.user_id.clone(),
            status: RegistrationStatus::Registered,
            registration_time: now,
            cancelled_at: None,
        };
        let event = Event::RegistrationCreated {
            registration: registration.clone(),
        };
        if let Err(e) = self.persist(event).await {
            unit.release(1);
            warn!(%key, "reservation released after WAL failure: {e}");
            metrics::counter!(observability::WAL_COMPENSATIONS_TOTAL).increment(1);
            return Err(e);
        }
        drop(unit);

        info!(id = %registration.id, activity = %activity_id, "registered");
        Ok(registration)
    }

    /// Withdraw the caller's active registration and free its seat.
    pub async fn cancel_registration(
        &self,
        principal: &Principal,
        activity_id: Ulid,
    ) -> Result<Registration, EngineError> {
        let capacity = self
            .activities
            .get(&activity_id)
            .map(|a| a.capacity)
            .ok_or_else(|| EngineError::not_found("activity", activity_id))?;

        let mut unit = self.ledger.lock(&UnitKey::Activity(activity_id), capacity).await;
        let end_time = self
            .activities
            .get(&activity_id)
            .map(|a| a.end_time)
            .ok_or_else(|| EngineError::not_found("activity", activity_id))?;
        let registration_id = self
            .active_registrations
            .get(&(activity_id, principal.user_id.clone()))
            .map(|r| *r.value())
            .ok_or(EngineError::NotRegistered(activity_id))?;
        let now = self.now();
        if now > end_time {
            return Err(EngineError::ActivityEnded(activity_id));
        }

        self.persist(Event::RegistrationCancelled {
            id: registration_id,
            activity_id,
            at: now,
        })
        .await?;
        unit.release(1);
        drop(unit);
        record_release("activity");

        info!(id = %registration_id, activity = %activity_id, "registration cancelled");
        self.registrations
            .get(&registration_id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::not_found("registration", registration_id))
    }
}
