use ulid::Ulid;

use super::ledger::UnitKey;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input: missing fields, non-positive counts, unknown slot, bad dates.
    Validation(String),
    NotFound(String),
    Forbidden(&'static str),
    AlreadyExists(String),
    SlotFull(UnitKey),
    DeadlinePassed(Ulid),
    RegistrationClosed(Ulid),
    ActivityEnded(Ulid),
    AlreadyRegistered(Ulid),
    AlreadyCancelled(Ulid),
    NotRegistered(Ulid),
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        to: &'static str,
    },
    AlreadyTerminal {
        id: Ulid,
        status: &'static str,
    },
    /// The owner already holds a live appointment on this date.
    AlreadyBooked(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }

    pub fn already_exists(what: &str, id: impl std::fmt::Display) -> Self {
        EngineError::AlreadyExists(format!("{what} {id}"))
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::SlotFull(_) => "slot_full",
            EngineError::DeadlinePassed(_) => "deadline_passed",
            EngineError::RegistrationClosed(_) => "registration_closed",
            EngineError::ActivityEnded(_) => "activity_ended",
            EngineError::AlreadyRegistered(_) => "already_registered",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::NotRegistered(_) => "not_registered",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::AlreadyTerminal { .. } => "already_terminal",
            EngineError::AlreadyBooked(_) => "already_booked",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// SQLSTATE reported over the wire. `RB***` is our own class.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::NotFound(_) => "P0002",
            EngineError::Forbidden(_) => "42501",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::SlotFull(_) => "RB001",
            EngineError::DeadlinePassed(_) => "RB002",
            EngineError::RegistrationClosed(_) => "RB003",
            EngineError::ActivityEnded(_) => "RB004",
            EngineError::AlreadyRegistered(_) => "RB005",
            EngineError::AlreadyCancelled(_) => "RB006",
            EngineError::NotRegistered(_) => "RB007",
            EngineError::InvalidTransition { .. } => "RB008",
            EngineError::AlreadyTerminal { .. } => "RB009",
            EngineError::AlreadyBooked(_) => "RB010",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Expected business outcomes, as opposed to infrastructure failures.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::SlotFull(unit) => write!(f, "{unit} is full"),
            EngineError::DeadlinePassed(id) => {
                write!(f, "registration deadline has passed for activity {id}")
            }
            EngineError::RegistrationClosed(id) => {
                write!(f, "registration is closed for activity {id}")
            }
            EngineError::ActivityEnded(id) => write!(f, "activity {id} has ended"),
            EngineError::AlreadyRegistered(id) => {
                write!(f, "already registered for activity {id}")
            }
            EngineError::AlreadyCancelled(id) => {
                write!(f, "appointment {id} is already cancelled or completed")
            }
            EngineError::NotRegistered(id) => write!(f, "not registered for activity {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "appointment {id}: cannot move from {from} to {to}")
            }
            EngineError::AlreadyTerminal { id, status } => {
                write!(f, "appointment {id} is already {status}")
            }
            EngineError::AlreadyBooked(id) => {
                write!(f, "an appointment already exists for this date: {id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
