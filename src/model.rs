use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;

/// Unix milliseconds. The only instant type inside the engine.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
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

    /// A span with `start >= end` covers no time at all.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// `a.start < b.end && a.end > b.start`. Touching endpoints do not overlap,
    /// and an empty span overlaps nothing.
    pub fn overlaps(&self, other: &Span) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start < other.end
            && self.end > other.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Set of weekdays, numbered `0 = Sunday` through `6 = Saturday`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Weekdays(u8);

impl Weekdays {
    /// Build from day numbers. Returns `None` if any number is outside `0..=6`.
    pub fn from_days(days: &[u8]) -> Option<Self> {
        let mut bits = 0u8;
        for &d in days {
            if d > 6 {
                return None;
            }
            bits |= 1 << d;
        }
        Some(Self(bits))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Day numbers in ascending order.
    pub fn days(&self) -> Vec<u8> {
        (0..7).filter(|d| self.0 & (1 << d) != 0).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeetingType {
    Zoom,
    GoogleMeet,
    Onsite,
}

impl MeetingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingType::Zoom => "zoom",
            MeetingType::GoogleMeet => "google_meet",
            MeetingType::Onsite => "onsite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zoom" => Some(MeetingType::Zoom),
            "google_meet" => Some(MeetingType::GoogleMeet),
            "onsite" => Some(MeetingType::Onsite),
            _ => None,
        }
    }
}

/// Scheduling parameters of a booking page. Immutable for the duration of a
/// single slot computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageConfig {
    pub duration_minutes: u32,
    pub available_days: Weekdays,
    /// Daily window `[start_time, end_time)` in wall-clock time of `timezone`.
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub min_notice_hours: u32,
    pub max_days_ahead: u32,
    /// The one zone every wall-clock time of this page is resolved in.
    pub timezone: Tz,
}

impl PageConfig {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }

    pub fn notice_ms(&self) -> Ms {
        self.min_notice_hours as Ms * HOUR_MS
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration_minutes == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        if self.duration_minutes > MAX_DURATION_MINUTES {
            return Err(ConfigError::DurationTooLong(self.duration_minutes));
        }
        if self.available_days.is_empty() {
            return Err(ConfigError::NoWeekdays);
        }
        if self.end_time <= self.start_time {
            return Err(ConfigError::EmptyWindow {
                start: self.start_time,
                end: self.end_time,
            });
        }
        if self.min_notice_hours > MAX_NOTICE_HOURS {
            return Err(ConfigError::NoticeTooLong(self.min_notice_hours));
        }
        if self.max_days_ahead == 0 {
            return Err(ConfigError::ZeroHorizon);
        }
        if self.max_days_ahead > MAX_DAYS_AHEAD {
            return Err(ConfigError::HorizonTooFar(self.max_days_ahead));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroDuration,
    DurationTooLong(u32),
    NoWeekdays,
    EmptyWindow { start: NaiveTime, end: NaiveTime },
    NoticeTooLong(u32),
    ZeroHorizon,
    HorizonTooFar(u32),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroDuration => write!(f, "duration must be at least one minute"),
            ConfigError::DurationTooLong(m) => {
                write!(f, "duration {m} minutes exceeds {MAX_DURATION_MINUTES}")
            }
            ConfigError::NoWeekdays => write!(f, "at least one weekday must be available"),
            ConfigError::EmptyWindow { start, end } => {
                write!(f, "end time {end} must be after start time {start}")
            }
            ConfigError::NoticeTooLong(h) => {
                write!(f, "minimum notice {h} hours exceeds {MAX_NOTICE_HOURS}")
            }
            ConfigError::ZeroHorizon => write!(f, "booking horizon must be at least one day"),
            ConfigError::HorizonTooFar(d) => {
                write!(f, "booking horizon {d} days exceeds {MAX_DAYS_AHEAD}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A shareable page describing when and how its owner can be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPage {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub slug: String,
    pub title: String,
    pub config: PageConfig,
    pub meeting_type: MeetingType,
    pub location_address: Option<String>,
    pub expires_at: Option<Ms>,
    pub is_active: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl BookingPage {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub page_id: Ulid,
    pub owner_id: Ulid,
    pub guest_name: String,
    pub span: Span,
    pub meeting_type: MeetingType,
    pub location_address: Option<String>,
    pub meeting_url: Option<String>,
    pub status: BookingStatus,
    pub cancelled_at: Option<Ms>,
    pub cancel_deadline: Ms,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    NewBooking,
    BookingCancelled,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NewBooking => "new_booking",
            NotificationKind::BookingCancelled => "booking_cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub kind: NotificationKind,
    pub booking_id: Ulid,
    pub is_read: bool,
    pub created_at: Ms,
}

/// Everything the engine knows about one owner's calendar.
#[derive(Debug, Clone)]
pub struct OwnerState {
    pub id: Ulid,
    /// Confirmed bookings, sorted by `span.start`.
    pub confirmed: Vec<Booking>,
    pub cancelled: Vec<Booking>,
    /// Oldest first.
    pub notifications: Vec<Notification>,
}

impl OwnerState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            confirmed: Vec::new(),
            cancelled: Vec::new(),
            notifications: Vec::new(),
        }
    }

    /// Insert a confirmed booking maintaining sort order by span.start.
    pub fn insert_confirmed(&mut self, booking: Booking) {
        let pos = self
            .confirmed
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.confirmed.insert(pos, booking);
    }

    pub fn remove_confirmed(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.confirmed.iter().position(|b| b.id == id)?;
        Some(self.confirmed.remove(pos))
    }

    pub fn find_booking(&self, id: &Ulid) -> Option<&Booking> {
        self.confirmed
            .iter()
            .chain(self.cancelled.iter())
            .find(|b| b.id == *id)
    }

    pub fn find_booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.confirmed
            .iter_mut()
            .chain(self.cancelled.iter_mut())
            .find(|b| b.id == *id)
    }

    pub fn booking_count(&self) -> usize {
        self.confirmed.len() + self.cancelled.len()
    }

    /// Confirmed bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .confirmed
            .partition_point(|b| b.span.start < query.end);
        self.confirmed[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn confirmed_spans(&self) -> Vec<Span> {
        self.confirmed.iter().map(|b| b.span).collect()
    }
}

/// The event types. This is the WAL record format and the change-feed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PageCreated {
        page: BookingPage,
    },
    PageUpdated {
        page: BookingPage,
    },
    PageDeleted {
        id: Ulid,
        owner_id: Ulid,
    },
    BookingConfirmed {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        owner_id: Ulid,
        cancelled_at: Ms,
    },
    MeetingUrlSet {
        id: Ulid,
        owner_id: Ulid,
        meeting_url: Option<String>,
    },
    NotificationCreated {
        notification: Notification,
    },
    NotificationRead {
        id: Ulid,
        owner_id: Ulid,
    },
}

impl Event {
    pub fn owner_id(&self) -> Ulid {
        match self {
            Event::PageCreated { page } | Event::PageUpdated { page } => page.owner_id,
            Event::BookingConfirmed { booking } => booking.owner_id,
            Event::NotificationCreated { notification } => notification.owner_id,
            Event::PageDeleted { owner_id, .. }
            | Event::BookingCancelled { owner_id, .. }
            | Event::MeetingUrlSet { owner_id, .. }
            | Event::NotificationRead { owner_id, .. } => *owner_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::PageCreated { .. } => "page_created",
            Event::PageUpdated { .. } => "page_updated",
            Event::PageDeleted { .. } => "page_deleted",
            Event::BookingConfirmed { .. } => "booking_confirmed",
            Event::BookingCancelled { .. } => "booking_cancelled",
            Event::MeetingUrlSet { .. } => "meeting_url_set",
            Event::NotificationCreated { .. } => "notification_created",
            Event::NotificationRead { .. } => "notification_read",
        }
    }
}
