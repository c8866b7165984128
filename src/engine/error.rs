use ulid::Ulid;

use crate::model::{ConfigError, Ms};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    NotFoundSlug(String),
    AlreadyExists(Ulid),
    SlugTaken(String),
    Conflict(Ulid),
    SlotNotOffered,
    InvalidInterval,
    InvalidConfig(ConfigError),
    InvalidInput(&'static str),
    PageInactive(Ulid),
    PageExpired(Ulid),
    CancelDeadlinePassed(Ms),
    AlreadyCancelled(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::NotFoundSlug(slug) => write!(f, "no booking page at '{slug}'"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlugTaken(slug) => write!(f, "slug already in use: {slug}"),
            EngineError::Conflict(_) => {
                write!(f, "this time is no longer available, please choose another")
            }
            EngineError::SlotNotOffered => {
                write!(f, "requested time is not an offered slot for this page")
            }
            EngineError::InvalidInterval => write!(f, "start must be before end"),
            EngineError::InvalidConfig(e) => write!(f, "invalid page configuration: {e}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::PageInactive(id) => write!(f, "booking page {id} is not active"),
            EngineError::PageExpired(id) => write!(f, "booking page {id} has expired"),
            EngineError::CancelDeadlinePassed(deadline) => {
                write!(f, "cancellation deadline passed at {deadline}")
            }
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::InvalidConfig(e)
    }
}
