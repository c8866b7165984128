use chrono::{Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::slots::{self, local_instant};
use super::{Engine, EngineError};

/// A page takes bookings only while active and not past `expires_at`.
pub(super) fn ensure_bookable(page: &BookingPage, now: Ms) -> Result<(), EngineError> {
    if !page.is_active {
        return Err(EngineError::PageInactive(page.id));
    }
    if page.is_expired(now) {
        return Err(EngineError::PageExpired(page.id));
    }
    Ok(())
}

impl Engine {
    pub async fn get_page(&self, id: Ulid) -> Result<BookingPage, EngineError> {
        let page = self.get_page_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = page.read().await;
        Ok(guard.clone())
    }

    /// Public lookup by slug. Distinguishes missing, switched-off and expired
    /// pages so the guest sees the right message.
    pub async fn page_by_slug(&self, slug: &str, now: Ms) -> Result<BookingPage, EngineError> {
        let id = self
            .slugs
            .get(slug)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::NotFoundSlug(slug.to_string()))?;
        let page = self
            .get_page(id)
            .await
            .map_err(|_| EngineError::NotFoundSlug(slug.to_string()))?;
        ensure_bookable(&page, now)?;
        Ok(page)
    }

    /// An owner's pages, oldest first.
    pub async fn list_pages(&self, owner_id: Ulid) -> Vec<BookingPage> {
        let states: Vec<_> = self.pages.iter().map(|e| e.value().clone()).collect();
        let mut pages = Vec::new();
        for state in states {
            let guard = state.read().await;
            if guard.owner_id == owner_id {
                pages.push(guard.clone());
            }
        }
        pages.sort_by_key(|p| (p.created_at, p.id));
        pages
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let owner_id = self
            .get_owner_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let owner = self.get_owner(&owner_id).ok_or(EngineError::NotFound(id))?;
        let guard = owner.read().await;
        guard.find_booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Confirmed bookings lying entirely within `[start, end]`, by start time.
    pub async fn list_bookings(&self, owner_id: Ulid, start: Ms, end: Ms) -> Result<Vec<Booking>, EngineError> {
        if end < start {
            return Err(EngineError::InvalidInterval);
        }
        if end.checked_sub(start).is_none_or(|w| w > MAX_QUERY_WINDOW_MS) {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let Some(owner) = self.get_owner(&owner_id) else {
            return Ok(Vec::new());
        };
        let guard = owner.read().await;
        Ok(guard
            .confirmed
            .iter()
            .filter(|b| b.span.start >= start && b.span.end <= end)
            .cloned()
            .collect())
    }

    /// The owner's confirmed spans that could touch `date` in `page`'s zone.
    async fn busy_spans_on(&self, page: &BookingPage, date: NaiveDate) -> Vec<Span> {
        let Some(owner) = self.get_owner(&page.owner_id) else {
            return Vec::new();
        };
        let tz = page.config.timezone;
        let day_start = local_instant(tz, date, NaiveTime::MIN);
        let day_end = date
            .checked_add_days(Days::new(1))
            .map(|next| local_instant(tz, next, NaiveTime::MIN))
            .unwrap_or(day_start + DAY_MS);
        if day_end <= day_start {
            return Vec::new();
        }
        let guard = owner.read().await;
        guard
            .overlapping(&Span::new(day_start, day_end))
            .map(|b| b.span)
            .collect()
    }

    /// Slots a guest can pick on `date`, against the owner's latest bookings.
    pub async fn compute_slots(&self, page_id: Ulid, date: NaiveDate, now: Ms) -> Result<Vec<Span>, EngineError> {
        let page = self.get_page(page_id).await?;
        ensure_bookable(&page, now)?;
        let busy = self.busy_spans_on(&page, date).await;
        let offered = slots::generate_slots(&page.config, date, &busy, now);
        metrics::histogram!(observability::SLOTS_GENERATED).record(offered.len() as f64);
        Ok(offered)
    }

    pub async fn compute_eligible_dates(&self, page_id: Ulid, now: Ms) -> Result<Vec<NaiveDate>, EngineError> {
        let page = self.get_page(page_id).await?;
        ensure_bookable(&page, now)?;
        Ok(slots::compute_eligible_dates(&page.config, now))
    }

    /// Every confirmed booking of `owner_id` that overlaps `span`, optionally
    /// ignoring one booking (the one being rescheduled).
    pub async fn find_conflicts(
        &self,
        owner_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        if span.is_empty() {
            return Err(EngineError::InvalidInterval);
        }
        let Some(owner) = self.get_owner(&owner_id) else {
            return Ok(Vec::new());
        };
        let guard = owner.read().await;
        Ok(guard
            .overlapping(&span)
            .filter(|b| Some(b.id) != exclude && b.span.overlaps(&span))
            .cloned()
            .collect())
    }

    /// Newest first.
    pub async fn list_notifications(&self, owner_id: Ulid, unread_only: bool) -> Vec<Notification> {
        let Some(owner) = self.get_owner(&owner_id) else {
            return Vec::new();
        };
        let guard = owner.read().await;
        guard
            .notifications
            .iter()
            .rev()
            .filter(|n| !unread_only || !n.is_read)
            .cloned()
            .collect()
    }
}
