use std::sync::Arc;

use chrono::NaiveTime;
use chrono_tz::Tz;
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::meeting::MeetingRequest;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, validate_span};
use super::queries::ensure_bookable;
use super::slots::{cancel_deadline, is_offered_slot};
use super::{Engine, EngineError, WalCommand};

/// Who is cancelling. Guests go through the public link and are held to the
/// cancel deadline; owners cancel from their dashboard at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPolicy {
    Guest,
    Owner,
}

/// Page columns as supplied by a client. On create, missing optional fields
/// take their defaults; on update, only present fields change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageFields {
    pub title: Option<String>,
    pub slug: Option<String>,
    pub duration_minutes: Option<u32>,
    pub available_days: Option<Weekdays>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub min_notice_hours: Option<u32>,
    pub max_days_ahead: Option<u32>,
    pub timezone: Option<Tz>,
    pub meeting_type: Option<MeetingType>,
    pub location_address: Option<Option<String>>,
    pub expires_at: Option<Option<Ms>>,
    pub is_active: Option<bool>,
}

impl PageFields {
    fn apply_to(self, page: &mut BookingPage) {
        if let Some(v) = self.title {
            page.title = v;
        }
        if let Some(v) = self.duration_minutes {
            page.config.duration_minutes = v;
        }
        if let Some(v) = self.available_days {
            page.config.available_days = v;
        }
        if let Some(v) = self.start_time {
            page.config.start_time = v;
        }
        if let Some(v) = self.end_time {
            page.config.end_time = v;
        }
        if let Some(v) = self.min_notice_hours {
            page.config.min_notice_hours = v;
        }
        if let Some(v) = self.max_days_ahead {
            page.config.max_days_ahead = v;
        }
        if let Some(v) = self.timezone {
            page.config.timezone = v;
        }
        if let Some(v) = self.meeting_type {
            page.meeting_type = v;
        }
        if let Some(v) = self.location_address {
            page.location_address = v;
        }
        if let Some(v) = self.expires_at {
            page.expires_at = v;
        }
        if let Some(v) = self.is_active {
            page.is_active = v;
        }
    }
}

/// Lowercase ASCII word characters of `title`, separator runs (whitespace,
/// `_`, `-`) folded into single hyphens, cut to the slug prefix length.
pub(crate) fn slug_base(title: &str) -> String {
    let mut out = String::new();
    let mut pending_sep = false;
    for c in title.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c);
        } else if c.is_whitespace() || c == '_' || c == '-' {
            pending_sep = true;
        }
    }
    out.truncate(SLUG_PREFIX_LEN);
    out.trim_end_matches('-').to_string()
}

fn random_suffix() -> String {
    let id = Ulid::new().to_string().to_lowercase();
    id[id.len() - SLUG_SUFFIX_LEN..].to_string()
}

fn validate_slug(slug: &str) -> Result<(), EngineError> {
    if slug.is_empty() || slug.len() > MAX_SLUG_LEN {
        return Err(EngineError::InvalidInput("slug must be 1-64 characters"));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(EngineError::InvalidInput(
            "slug may only contain lowercase letters, digits and hyphens",
        ));
    }
    Ok(())
}

fn validate_page(page: &BookingPage) -> Result<(), EngineError> {
    if page.title.trim().is_empty() {
        return Err(EngineError::InvalidInput("title is required"));
    }
    if page.title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    page.config.validate()?;
    let location = page.location_address.as_deref().map(str::trim);
    if page.meeting_type == MeetingType::Onsite && location.is_none_or(str::is_empty) {
        return Err(EngineError::InvalidInput("onsite meetings need a location address"));
    }
    if location.is_some_and(|l| l.len() > MAX_LOCATION_LEN) {
        return Err(EngineError::LimitExceeded("location address too long"));
    }
    Ok(())
}

/// The inbox entry recorded alongside a booking change.
fn owner_notification(owner_id: Ulid, kind: NotificationKind, booking_id: Ulid, now: Ms) -> Event {
    Event::NotificationCreated {
        notification: Notification {
            id: Ulid::new(),
            owner_id,
            kind,
            booking_id,
            is_read: false,
            created_at: now,
        },
    }
}

impl Engine {
    /// Claim `slug` for `page_id`. False if another page holds it.
    fn reserve_slug(&self, slug: &str, page_id: Ulid) -> bool {
        match self.slugs.entry(slug.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(page_id);
                true
            }
        }
    }

    fn release_slug(&self, slug: &str, page_id: Ulid) {
        self.slugs.remove_if(slug, |_, holder| *holder == page_id);
    }

    /// Reserve the client's slug, or generate one from the title.
    fn claim_slug(&self, requested: Option<String>, title: &str, page_id: Ulid) -> Result<String, EngineError> {
        if let Some(slug) = requested {
            validate_slug(&slug)?;
            if !self.reserve_slug(&slug, page_id) {
                return Err(EngineError::SlugTaken(slug));
            }
            return Ok(slug);
        }
        let base = slug_base(title);
        for _ in 0..MAX_SLUG_ATTEMPTS {
            let suffix = random_suffix();
            let slug = if base.is_empty() {
                suffix
            } else {
                format!("{base}-{suffix}")
            };
            if self.reserve_slug(&slug, page_id) {
                return Ok(slug);
            }
        }
        Err(EngineError::LimitExceeded("could not allocate a unique slug"))
    }

    pub async fn create_page(
        &self,
        id: Ulid,
        owner_id: Ulid,
        fields: PageFields,
        now: Ms,
    ) -> Result<BookingPage, EngineError> {
        let _gate = self.write_gate.read().await;
        if self.pages.len() >= MAX_PAGES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many booking pages"));
        }
        // Reserve before checking the map: a finished create is in `pages`
        // before its reservation goes away.
        if !self.pending_pages.insert(id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let result = self.create_reserved_page(id, owner_id, fields, now).await;
        self.pending_pages.remove(&id);
        result
    }

    async fn create_reserved_page(
        &self,
        id: Ulid,
        owner_id: Ulid,
        fields: PageFields,
        now: Ms,
    ) -> Result<BookingPage, EngineError> {
        if self.pages.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let config = PageConfig {
            duration_minutes: fields
                .duration_minutes
                .ok_or(EngineError::InvalidInput("duration_minutes is required"))?,
            available_days: fields
                .available_days
                .ok_or(EngineError::InvalidInput("available_days is required"))?,
            start_time: fields
                .start_time
                .ok_or(EngineError::InvalidInput("start_time is required"))?,
            end_time: fields
                .end_time
                .ok_or(EngineError::InvalidInput("end_time is required"))?,
            min_notice_hours: fields.min_notice_hours.unwrap_or(DEFAULT_MIN_NOTICE_HOURS),
            max_days_ahead: fields.max_days_ahead.unwrap_or(DEFAULT_MAX_DAYS_AHEAD),
            timezone: fields.timezone.unwrap_or(self.default_tz),
        };
        let mut page = BookingPage {
            id,
            owner_id,
            slug: String::new(),
            title: fields
                .title
                .clone()
                .ok_or(EngineError::InvalidInput("title is required"))?,
            config,
            meeting_type: fields
                .meeting_type
                .ok_or(EngineError::InvalidInput("meeting_type is required"))?,
            location_address: None,
            expires_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let requested_slug = fields.slug.clone();
        fields.apply_to(&mut page);
        validate_page(&page)?;

        page.slug = self.claim_slug(requested_slug, &page.title, id)?;

        let event = Event::PageCreated { page: page.clone() };
        if let Err(e) = self.wal_append(&event).await {
            self.release_slug(&page.slug, id);
            return Err(e);
        }
        self.pages.insert(id, Arc::new(RwLock::new(page.clone())));
        self.notify.send(&event);
        info!(page = %id, slug = %page.slug, "booking page created");
        Ok(page)
    }

    pub async fn update_page(
        &self,
        id: Ulid,
        fields: PageFields,
        now: Ms,
    ) -> Result<BookingPage, EngineError> {
        let _gate = self.write_gate.read().await;
        let page_state = self.get_page_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = page_state.write().await;

        let mut updated = guard.clone();
        let requested_slug = fields.slug.clone().filter(|s| *s != guard.slug);
        fields.apply_to(&mut updated);
        validate_page(&updated)?;
        if let Some(slug) = &requested_slug {
            validate_slug(slug)?;
            if !self.reserve_slug(slug, id) {
                return Err(EngineError::SlugTaken(slug.clone()));
            }
            updated.slug = slug.clone();
        }
        updated.updated_at = now;

        let event = Event::PageUpdated { page: updated.clone() };
        if let Err(e) = self.wal_append(&event).await {
            if let Some(slug) = &requested_slug {
                self.release_slug(slug, id);
            }
            return Err(e);
        }
        if requested_slug.is_some() {
            self.release_slug(&guard.slug, id);
        }
        *guard = updated.clone();
        self.notify.send(&event);
        Ok(updated)
    }

    /// Remove a page and free its slug. Bookings made through it are kept.
    pub async fn delete_page(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let page_state = self.get_page_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = page_state.write().await;

        let event = Event::PageDeleted {
            id,
            owner_id: guard.owner_id,
        };
        self.wal_append(&event).await?;
        self.pages.remove(&id);
        self.release_slug(&guard.slug, id);
        self.notify.send(&event);
        info!(page = %id, "booking page deleted");
        Ok(())
    }

    /// Book `span` on a page. The requested span must be one the page offers,
    /// and the owner's calendar is re-checked for overlap under its write lock
    /// immediately before the commit.
    pub async fn create_booking(
        &self,
        id: Ulid,
        page_id: Ulid,
        guest_name: &str,
        span: Span,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let guest_name = guest_name.trim();
        if guest_name.is_empty() {
            return Err(EngineError::InvalidInput("guest name is required"));
        }
        if guest_name.len() > MAX_GUEST_NAME_LEN {
            return Err(EngineError::LimitExceeded("guest name too long"));
        }
        validate_span(&span)?;

        let (booking, page) = {
            let _gate = self.write_gate.read().await;
            if self.entity_to_owner.contains_key(&id) {
                return Err(EngineError::AlreadyExists(id));
            }
            let page = self
                .get_page_state(&page_id)
                .ok_or(EngineError::NotFound(page_id))?
                .read()
                .await
                .clone();
            ensure_bookable(&page, now)?;
            if !is_offered_slot(&page.config, &span, now) {
                return Err(EngineError::SlotNotOffered);
            }

            let owner = self.owner_or_create(page.owner_id);
            let mut guard = owner.write().await;
            if guard.booking_count() >= MAX_BOOKINGS_PER_OWNER {
                return Err(EngineError::LimitExceeded("too many bookings for owner"));
            }
            if guard.notifications.len() >= MAX_NOTIFICATIONS_PER_OWNER {
                return Err(EngineError::LimitExceeded("too many notifications for owner"));
            }
            if let Err(e) = check_no_conflict(&guard, &span) {
                metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                warn!(page = %page_id, start = span.start, end = span.end, "booking rejected: {e}");
                return Err(e);
            }

            let booking = Booking {
                id,
                page_id,
                owner_id: page.owner_id,
                guest_name: guest_name.to_string(),
                span,
                meeting_type: page.meeting_type,
                location_address: match page.meeting_type {
                    MeetingType::Onsite => page.location_address.clone(),
                    _ => None,
                },
                meeting_url: None,
                status: BookingStatus::Confirmed,
                cancelled_at: None,
                cancel_deadline: cancel_deadline(page.config.timezone, span.start),
                created_at: now,
            };
            let events = [
                Event::BookingConfirmed { booking: booking.clone() },
                owner_notification(guard.id, NotificationKind::NewBooking, id, now),
            ];
            self.persist_and_apply_all(&mut guard, &events).await?;
            (booking, page)
        };

        metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        info!(booking = %id, page = %page_id, start = span.start, "booking confirmed");
        Ok(self.provision_meeting(booking, &page).await)
    }

    /// Ask the provider for a conferencing link. A failure leaves the booking
    /// confirmed with no link.
    async fn provision_meeting(&self, booking: Booking, page: &BookingPage) -> Booking {
        if booking.meeting_type == MeetingType::Onsite {
            return booking;
        }
        let req = MeetingRequest {
            booking_id: booking.id,
            owner_id: booking.owner_id,
            meeting_type: booking.meeting_type,
            title: page.title.clone(),
            guest_name: booking.guest_name.clone(),
            start: booking.span.start,
            end: booking.span.end,
        };
        match self.meetings.create_meeting(&req).await {
            Ok(url) => match self.set_meeting_url(booking.id, Some(url)).await {
                Ok(updated) => updated,
                Err(e) => {
                    warn!(booking = %booking.id, "could not store meeting link: {e}");
                    booking
                }
            },
            Err(e) => {
                metrics::counter!(observability::MEETING_PROVISION_FAILURES_TOTAL).increment(1);
                warn!(booking = %booking.id, "meeting provisioning failed: {e}");
                booking
            }
        }
    }

    pub async fn cancel_booking(
        &self,
        id: Ulid,
        now: Ms,
        policy: CancelPolicy,
    ) -> Result<Booking, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let booking = guard.find_booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::AlreadyCancelled(id));
        }
        if policy == CancelPolicy::Guest && booking.cancel_deadline < now {
            return Err(EngineError::CancelDeadlinePassed(booking.cancel_deadline));
        }

        let events = [
            Event::BookingCancelled {
                id,
                owner_id: guard.id,
                cancelled_at: now,
            },
            owner_notification(guard.id, NotificationKind::BookingCancelled, id, now),
        ];
        self.persist_and_apply_all(&mut guard, &events).await?;

        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!(booking = %id, ?policy, "booking cancelled");
        guard
            .find_booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Attach, replace or clear the conferencing link of a confirmed booking.
    pub async fn set_meeting_url(&self, id: Ulid, meeting_url: Option<String>) -> Result<Booking, EngineError> {
        if meeting_url.as_ref().is_some_and(|u| u.len() > MAX_URL_LEN) {
            return Err(EngineError::LimitExceeded("meeting url too long"));
        }
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let booking = guard.find_booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::AlreadyCancelled(id));
        }

        let event = Event::MeetingUrlSet {
            id,
            owner_id: guard.id,
            meeting_url,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .find_booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn mark_notification_read(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let notification = guard
            .notifications
            .iter()
            .find(|n| n.id == id)
            .ok_or(EngineError::NotFound(id))?;
        if notification.is_read {
            return Ok(());
        }
        let event = Event::NotificationRead {
            id,
            owner_id: guard.id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Returns how many notifications changed.
    pub async fn mark_all_notifications_read(&self, owner_id: Ulid) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let Some(owner) = self.get_owner(&owner_id) else {
            return Ok(0);
        };
        let mut guard = owner.write().await;
        let unread: Vec<Ulid> = guard
            .notifications
            .iter()
            .filter(|n| !n.is_read)
            .map(|n| n.id)
            .collect();
        for id in &unread {
            let event = Event::NotificationRead { id: *id, owner_id };
            self.persist_and_apply(&mut guard, &event).await?;
        }
        Ok(unread.len())
    }

    /// Rewrite the WAL with the minimal event set that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();

        let pages: Vec<_> = self.pages.iter().map(|e| e.value().clone()).collect();
        for page in pages {
            events.push(Event::PageCreated {
                page: page.read().await.clone(),
            });
        }

        let owners: Vec<_> = self.owners.iter().map(|e| e.value().clone()).collect();
        for owner in owners {
            let guard = owner.read().await;
            for booking in guard.confirmed.iter().chain(guard.cancelled.iter()) {
                events.push(Event::BookingConfirmed {
                    booking: booking.clone(),
                });
            }
            for notification in &guard.notifications {
                events.push(Event::NotificationCreated {
                    notification: notification.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!(events = count, "WAL compacted");
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_base_sanitizes_title() {
        assert_eq!(slug_base("Intro Call"), "intro-call");
        assert_eq!(slug_base("  30 min -- chat!  "), "30-min-cha");
        assert_eq!(slug_base("snake_case_name"), "snake-case");
        assert_eq!(slug_base("a.b/c"), "abc");
        assert_eq!(slug_base("会議"), "");
        assert_eq!(slug_base("abcdefghi jk"), "abcdefghi");
    }

    #[test]
    fn random_suffix_shape() {
        let s = random_suffix();
        assert_eq!(s.len(), SLUG_SUFFIX_LEN);
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn slug_validation() {
        assert!(validate_slug("team-sync-2").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("Has Caps").is_err());
        assert!(validate_slug(&"x".repeat(MAX_SLUG_LEN + 1)).is_err());
    }
}
