use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{MeetingType, Ms};

/// What a provider needs to create a conferencing link for one booking.
#[derive(Debug, Clone)]
pub struct MeetingRequest {
    pub booking_id: Ulid,
    pub owner_id: Ulid,
    pub meeting_type: MeetingType,
    pub title: String,
    pub guest_name: String,
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingError {
    /// No provider is wired up for this meeting type.
    NotConfigured(MeetingType),
    Provider(String),
}

impl std::fmt::Display for MeetingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeetingError::NotConfigured(kind) => {
                write!(f, "no meeting provider configured for {}", kind.as_str())
            }
            MeetingError::Provider(msg) => write!(f, "meeting provider error: {msg}"),
        }
    }
}

impl std::error::Error for MeetingError {}

/// Creates video meeting links for confirmed bookings. Called outside any
/// engine lock; a failure never undoes the booking.
#[async_trait]
pub trait MeetingProvisioner: Send + Sync {
    async fn create_meeting(&self, req: &MeetingRequest) -> Result<String, MeetingError>;
}

/// Provisioner used when no provider credentials are available.
pub struct Unconfigured;

#[async_trait]
impl MeetingProvisioner for Unconfigured {
    async fn create_meeting(&self, req: &MeetingRequest) -> Result<String, MeetingError> {
        Err(MeetingError::NotConfigured(req.meeting_type))
    }
}
