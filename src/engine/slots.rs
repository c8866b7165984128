use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDate, NaiveTime, Offset, TimeZone};
use chrono_tz::Tz;

use crate::limits::CANCEL_NOTICE_DAYS;
use crate::model::*;

use super::conflict::has_conflict;

// ── Slot Generator ────────────────────────────────────────────────

/// Resolve a wall-clock time in `tz` to an instant.
///
/// Ambiguous times (clocks falling back) take the earlier instant. Times that
/// do not exist (clocks springing forward) are shifted by the offset in effect
/// before the gap, which lands them just past it.
pub fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Ms {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        LocalResult::None => {
            // A day earlier is safely before any transition on this date.
            let before = naive.checked_sub_days(Days::new(1)).unwrap_or(naive);
            let offset_secs = tz.offset_from_utc_datetime(&before).fix().local_minus_utc();
            naive.and_utc().timestamp_millis() - offset_secs as Ms * 1000
        }
    }
}

/// Calendar date of `at` in `tz`.
pub fn local_date(tz: Tz, at: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(at).map(|dt| dt.with_timezone(&tz).date_naive())
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN)
}

/// Latest instant a day may start at and still be bookable: `now` plus
/// `max_days_ahead` calendar days in the page timezone.
fn horizon(config: &PageConfig, now: Ms) -> Option<Ms> {
    let local_now = DateTime::from_timestamp_millis(now)?.with_timezone(&config.timezone);
    local_now
        .checked_add_days(Days::new(config.max_days_ahead as u64))
        .map(|dt| dt.timestamp_millis())
}

/// Whether guests may pick `date` at all. Checked in order: weekday allowed,
/// not before today, day ends after the notice threshold, day starts within
/// the horizon.
pub fn is_date_eligible(config: &PageConfig, date: NaiveDate, now: Ms) -> bool {
    let tz = config.timezone;
    if !config.available_days.contains(date.weekday()) {
        return false;
    }
    let Some(today) = local_date(tz, now) else {
        return false;
    };
    if date < today {
        return false;
    }
    if local_instant(tz, date, end_of_day()) < now + config.notice_ms() {
        return false;
    }
    match horizon(config, now) {
        Some(max) => local_instant(tz, date, NaiveTime::MIN) <= max,
        None => false,
    }
}

/// Every eligible date from today through today + `max_days_ahead`.
pub fn compute_eligible_dates(config: &PageConfig, now: Ms) -> Vec<NaiveDate> {
    if config.validate().is_err() {
        return Vec::new();
    }
    let Some(today) = local_date(config.timezone, now) else {
        return Vec::new();
    };
    today
        .iter_days()
        .take(config.max_days_ahead as usize + 1)
        .filter(|d| is_date_eligible(config, *d, now))
        .collect()
}

/// Offerable slots for `date`: back-to-back `duration`-sized steps through the
/// daily window, keeping only starts strictly after `now + notice` that do not
/// overlap an `existing` booking. Never yields a partial trailing slot.
pub fn generate_slots(config: &PageConfig, date: NaiveDate, existing: &[Span], now: Ms) -> Vec<Span> {
    if config.validate().is_err() || !is_date_eligible(config, date, now) {
        return Vec::new();
    }
    let tz = config.timezone;
    let window_start = local_instant(tz, date, config.start_time);
    let window_end = local_instant(tz, date, config.end_time);
    let duration = config.duration_ms();
    let earliest_start = now + config.notice_ms();

    let mut slots = Vec::new();
    let mut start = window_start;
    while start + duration <= window_end {
        let slot = Span::new(start, start + duration);
        if slot.start > earliest_start && !has_conflict(&slot, existing) {
            slots.push(slot);
        }
        start += duration;
    }
    slots
}

/// True iff `span` is exactly one of the slots the generator offers for its
/// local date, ignoring existing bookings.
pub fn is_offered_slot(config: &PageConfig, span: &Span, now: Ms) -> bool {
    let Some(date) = local_date(config.timezone, span.start) else {
        return false;
    };
    generate_slots(config, date, &[], now).contains(span)
}

/// Guests may cancel until this instant: the booking's local start moved back
/// by a fixed number of calendar days.
pub fn cancel_deadline(tz: Tz, start: Ms) -> Ms {
    let shifted = DateTime::from_timestamp_millis(start)
        .map(|dt| dt.with_timezone(&tz).naive_local())
        .and_then(|local| local.checked_sub_days(Days::new(CANCEL_NOTICE_DAYS)));
    match shifted {
        Some(local) => local_instant(tz, local.date(), local.time()),
        None => start - CANCEL_NOTICE_DAYS as Ms * crate::limits::DAY_MS,
    }
}
