mod activities;
mod appointments;
mod error;
pub mod ledger;
mod queries;

pub use error::EngineError;
pub use ledger::{CapacityLedger, LedgerError, UnitCounter, UnitKey};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::clock::{self, Clock};
use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to each sender with its own event's outcome.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            commit_batch(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    commit_batch(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let results = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for ((_, tx), result) in batch.drain(..).zip(results) {
        let _ = tx.send(result);
    }
}

/// One result per event. Every encodable event of the batch becomes durable,
/// or none does: a failed write or fsync rolls the log back to its last
/// durable length, so no caller is told "failed" about a record that replays.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> Vec<io::Result<()>> {
    let encoded: Vec<io::Result<Vec<u8>>> = batch.iter().map(|(event, _)| Wal::encode(event)).collect();
    let written = encoded
        .iter()
        .flatten()
        .try_for_each(|record| wal.append_encoded(record))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &written {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
        if let Err(e) = wal.discard_pending() {
            tracing::error!("WAL rollback failed: {e}");
        }
    }
    encoded
        .into_iter()
        .map(|record| match (record, &written) {
            (Err(e), _) => Err(e),
            (Ok(_), Ok(())) => Ok(()),
            (Ok(_), Err(e)) => Err(io::Error::new(e.kind(), e.to_string())),
        })
        .collect()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// Business knobs; transport and storage settings live in [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many days ahead (Shanghai calendar) a visit may be booked.
    pub booking_horizon_days: i64,
    pub capacity_mode: CapacityMode,
    /// Capacity given to each slot of the seeded default schedule.
    pub default_slot_capacity: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            booking_horizon_days: 30,
            capacity_mode: CapacityMode::PerBooking,
            default_slot_capacity: 30,
        }
    }
}

pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared across WAL append + apply; compaction takes it
    /// exclusively so its snapshot never misses an appended-but-unapplied event.
    pub(super) compaction_gate: RwLock<()>,
    /// Serializes schedule edits.
    pub(super) schedule_lock: Mutex<()>,
    pub ledger: CapacityLedger,
    /// Daily schedule keyed by normalized slot label.
    pub(super) schedule: DashMap<String, TimeSlotConfig>,
    /// Ids of appointments and registrations being created. A create claims its
    /// id here before reserving capacity and gives it back once the record is
    /// applied or the attempt fails.
    pub(super) ids_in_flight: DashSet<Ulid>,
    pub(super) appointments: DashMap<Ulid, Appointment>,
    /// (owner, date) → the owner's live appointment on that date.
    pub(super) date_claims: DashMap<(UserId, NaiveDate), Ulid>,
    pub(super) activities: DashMap<Ulid, Activity>,
    pub(super) registrations: DashMap<Ulid, Registration>,
    /// (activity, user) → the user's active registration.
    pub(super) active_registrations: DashMap<(Ulid, UserId), Ulid>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>, config: EngineConfig) -> io::Result<Self> {
        let (events, wal) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self::with_wal_sender(wal_tx, clock, config);
        // Replay: we're the sole owner of every unit lock here, so try_lock
        // always succeeds. Never block: this may run inside an async context.
        for event in &events {
            engine.replay_event(event);
        }
        Ok(engine)
    }

    fn with_wal_sender(wal_tx: mpsc::Sender<WalCommand>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            config,
            clock,
            wal_tx,
            compaction_gate: RwLock::new(()),
            schedule_lock: Mutex::new(()),
            ledger: CapacityLedger::new(),
            schedule: DashMap::new(),
            ids_in_flight: DashSet::new(),
            appointments: DashMap::new(),
            date_claims: DashMap::new(),
            activities: DashMap::new(),
            registrations: DashMap::new(),
            active_registrations: DashMap::new(),
        }
    }

    /// An engine whose WAL writer is gone: every append fails.
    #[cfg(test)]
    pub(crate) fn with_failing_wal(clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let (wal_tx, wal_rx) = mpsc::channel(1);
        drop(wal_rx);
        Self::with_wal_sender(wal_tx, clock, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Current Shanghai calendar day.
    pub fn today(&self) -> NaiveDate {
        clock::today(self.clock.as_ref())
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply to the in-memory records. Ledger counters are the
    /// caller's business: it holds the unit lock around this call.
    pub(super) async fn persist(&self, event: Event) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        self.wal_append(&event).await?;
        self.apply_record(&event);
        Ok(())
    }

    /// Capacity of a (date, slot) unit according to the current schedule.
    /// Unknown labels get zero capacity.
    pub(super) fn slot_capacity(&self, time_slot: &str) -> Capacity {
        Capacity::Limited(self.schedule.get(time_slot).map_or(0, |c| c.capacity))
    }

    /// Lock the unit of a (date, slot) pair. The schedule is authoritative for
    /// slot capacity, so the counter is brought in line with it under the lock.
    pub(super) async fn lock_slot(&self, date: NaiveDate, time_slot: &str) -> OwnedMutexGuard<UnitCounter> {
        let capacity = self.slot_capacity(time_slot);
        let mut unit = self.ledger.lock(&UnitKey::slot(date, time_slot), capacity).await;
        unit.capacity = capacity;
        unit
    }

    /// Apply an event to records and indexes. Never touches ledger counters.
    pub(super) fn apply_record(&self, event: &Event) {
        match event {
            Event::TimeSlotConfigured {
                time_slot,
                capacity,
                active,
            } => match TimeSlot::parse(time_slot) {
                Ok(slot) => {
                    self.schedule.insert(
                        slot.label.clone(),
                        TimeSlotConfig {
                            slot,
                            capacity: *capacity,
                            active: *active,
                        },
                    );
                }
                Err(e) => warn!("ignoring unparseable time slot in WAL: {e}"),
            },
            Event::AppointmentCreated { appointment } => {
                if appointment.status.is_live() {
                    self.date_claims
                        .insert((appointment.owner.clone(), appointment.date), appointment.id);
                }
                self.appointments.insert(appointment.id, appointment.clone());
            }
            Event::AppointmentUpdated {
                id,
                status,
                admin_notes,
                at,
            } => {
                if let Some(mut appt) = self.appointments.get_mut(id) {
                    appt.status = *status;
                    appt.admin_notes = admin_notes.clone();
                    appt.updated_at = *at;
                    if !status.is_live() {
                        self.date_claims
                            .remove_if(&(appt.owner.clone(), appt.date), |_, claim| claim == id);
                    }
                }
            }
            Event::ActivityCreated { activity } | Event::ActivityUpdated { activity } => {
                self.activities.insert(activity.id, activity.clone());
            }
            Event::RegistrationCreated { registration } => {
                if registration.status == RegistrationStatus::Registered {
                    self.active_registrations.insert(
                        (registration.activity_id, registration.user_id.clone()),
                        registration.id,
                    );
                }
                self.registrations.insert(registration.id, registration.clone());
            }
            Event::RegistrationCancelled { id, activity_id, at } => {
                if let Some(mut reg) = self.registrations.get_mut(id) {
                    reg.status = RegistrationStatus::Cancelled;
                    reg.cancelled_at = Some(*at);
                    self.active_registrations
                        .remove_if(&(*activity_id, reg.user_id.clone()), |_, active| active == id);
                }
            }
        }
    }

    /// Apply a replayed event to records and rebuild the ledger counters it implies.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::TimeSlotConfigured {
                time_slot, capacity, ..
            } => {
                self.apply_record(event);
                if let Ok(slot) = TimeSlot::parse(time_slot) {
                    for key in self.ledger.keys() {
                        if matches!(&key, UnitKey::Slot { time_slot: label, .. } if *label == slot.label)
                            && let Some(unit) = self.ledger.get(&key)
                            && let Ok(mut counter) = unit.try_lock()
                        {
                            counter.capacity = Capacity::Limited(*capacity);
                        }
                    }
                }
            }
            Event::AppointmentCreated { appointment } => {
                self.apply_record(event);
                if appointment.status != AppointmentStatus::Cancelled {
                    let key = UnitKey::slot(appointment.date, appointment.time_slot.clone());
                    let unit = self.ledger.unit(&key, self.slot_capacity(&appointment.time_slot));
                    if let Ok(mut counter) = unit.try_lock() {
                        counter.restore(appointment.units);
                    }
                }
            }
            Event::AppointmentUpdated { id, status, .. } => {
                let prior = self.appointments.get(id).map(|a| {
                    (a.status, a.units, UnitKey::slot(a.date, a.time_slot.clone()))
                });
                self.apply_record(event);
                if let Some((prior_status, units, key)) = prior
                    && *status == AppointmentStatus::Cancelled
                    && prior_status != AppointmentStatus::Cancelled
                    && let Some(unit) = self.ledger.get(&key)
                    && let Ok(mut counter) = unit.try_lock()
                {
                    counter.release(units);
                }
            }
            Event::ActivityCreated { activity } | Event::ActivityUpdated { activity } => {
                self.apply_record(event);
                let unit = self.ledger.unit(&UnitKey::Activity(activity.id), activity.capacity);
                if let Ok(mut counter) = unit.try_lock() {
                    counter.capacity = activity.capacity;
                }
            }
            Event::RegistrationCreated { registration } => {
                self.apply_record(event);
                if registration.status == RegistrationStatus::Registered {
                    let key = UnitKey::Activity(registration.activity_id);
                    let capacity = self
                        .activities
                        .get(&registration.activity_id)
                        .map_or(Capacity::Limited(0), |a| a.capacity);
                    if let Ok(mut counter) = self.ledger.unit(&key, capacity).try_lock() {
                        counter.restore(1);
                    }
                }
            }
            Event::RegistrationCancelled { id, activity_id, .. } => {
                let was_active = self
                    .registrations
                    .get(id)
                    .is_some_and(|r| r.status == RegistrationStatus::Registered);
                self.apply_record(event);
                if was_active
                    && let Some(unit) = self.ledger.get(&UnitKey::Activity(*activity_id))
                    && let Ok(mut counter) = unit.try_lock()
                {
                    counter.release(1);
                }
            }
        }
    }

    /// Compact the WAL by rewriting it with one event per current record.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let mut events = Vec::new();

        let mut slots: Vec<TimeSlotConfig> = self.schedule.iter().map(|e| e.value().clone()).collect();
        slots.sort_by_key(|c| c.slot.start);
        events.extend(slots.into_iter().map(|c| Event::TimeSlotConfigured {
            time_slot: c.slot.label,
            capacity: c.capacity,
            active: c.active,
        }));

        let mut activities: Vec<Activity> = self.activities.iter().map(|e| e.value().clone()).collect();
        activities.sort_by_key(|a| a.id);
        events.extend(activities.into_iter().map(|activity| Event::ActivityCreated { activity }));

        let mut appointments: Vec<Appointment> =
            self.appointments.iter().map(|e| e.value().clone()).collect();
        appointments.sort_by_key(|a| a.id);
        events.extend(
            appointments
                .into_iter()
                .map(|appointment| Event::AppointmentCreated { appointment }),
        );

        let mut registrations: Vec<Registration> =
            self.registrations.iter().map(|e| e.value().clone()).collect();
        registrations.sort_by_key(|r| r.id);
        events.extend(
            registrations
                .into_iter()
                .map(|registration| Event::RegistrationCreated { registration }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Count a reservation attempt by unit kind and outcome.
/// Holds one id in `Engine::ids_in_flight`; dropping it gives the id back,
/// including when the create future is dropped mid-await.
pub(super) struct IdClaim<'a> {
    ids: &'a DashSet<Ulid>,
    id: Ulid,
}

impl<'a> IdClaim<'a> {
    /// `None` if another create holds the same id.
    pub(super) fn take(ids: &'a DashSet<Ulid>, id: Ulid) -> Option<Self> {
        ids.insert(id).then_some(Self { ids, id })
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}

pub(super) fn record_reservation<T>(kind: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "kind" => kind, "outcome" => outcome)
        .increment(1);
}

pub(super) fn record_release(kind: &'static str) {
    metrics::counter!(crate::observability::CAPACITY_RELEASES_TOTAL, "kind" => kind).increment(1);
}

/// Reject a non-admin caller.
pub(super) fn require_admin(principal: &Principal) -> Result<(), EngineError> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden("admin privilege required"))
    }
}

/// Trim and bound a required text field.
pub(super) fn required_text(field: &str, value: &str, max: usize) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    if trimmed.len() > max {
        return Err(EngineError::Validation(format!("{field} is too long")));
    }
    Ok(trimmed.to_string())
}

/// Trim and bound an optional text field; blank becomes `None`.
pub(super) fn optional_text(
    field: &str,
    value: Option<&str>,
    max: usize,
) -> Result<Option<String>, EngineError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) if v.len() > max => Err(EngineError::Validation(format!("{field} is too long"))),
        Some(v) => Ok(Some(v.to_string())),
    }
}
