use std::path::PathBuf;

use chrono::{Datelike, NaiveDate, NaiveTime};

use super::*;
use crate::meeting::fake::FakeProvisioner;
use crate::meeting::Unconfigured;

const H: Ms = 3_600_000;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// 2030-01-07 is a Monday.
fn monday() -> NaiveDate {
    date(2030, 1, 7)
}

fn at(d: NaiveDate, h: u32, m: u32) -> Ms {
    local_instant(chrono_tz::UTC, d, hm(h, m))
}

/// Sunday noon before `monday()`.
fn now() -> Ms {
    at(date(2030, 1, 6), 12, 0)
}

fn slot(d: NaiveDate, h: u32) -> Span {
    Span::new(at(d, h, 0), at(d, h + 1, 0))
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("nevermiss_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_with(path: PathBuf, meetings: Arc<dyn MeetingProvisioner>) -> Engine {
    Engine::new(path, Arc::new(NotifyHub::new()), meetings, chrono_tz::UTC).unwrap()
}

fn test_engine(name: &str) -> Engine {
    engine_with(test_wal_path(name), Arc::new(Unconfigured))
}

/// Hourly slots, weekdays 09:00-18:00, no notice.
fn page_fields(meeting_type: MeetingType) -> PageFields {
    PageFields {
        title: Some("Intro Call".into()),
        duration_minutes: Some(60),
        available_days: Weekdays::from_days(&[1, 2, 3, 4, 5]),
        start_time: Some(hm(9, 0)),
        end_time: Some(hm(18, 0)),
        min_notice_hours: Some(0),
        meeting_type: Some(meeting_type),
        location_address: match meeting_type {
            MeetingType::Onsite => Some(Some("1 Main St".into())),
            _ => None,
        },
        ..Default::default()
    }
}

async fn onsite_page(engine: &Engine, owner_id: Ulid) -> BookingPage {
    engine
        .create_page(Ulid::new(), owner_id, page_fields(MeetingType::Onsite), now())
        .await
        .unwrap()
}

// ── Pages ────────────────────────────────────────────────

#[tokio::test]
async fn create_page_applies_defaults() {
    let engine = test_engine("page_defaults.wal");
    let owner = Ulid::new();
    let fields = PageFields {
        min_notice_hours: None,
        ..page_fields(MeetingType::Zoom)
    };
    let page = engine.create_page(Ulid::new(), owner, fields, now()).await.unwrap();

    assert_eq!(page.config.min_notice_hours, 24);
    assert_eq!(page.config.max_days_ahead, 30);
    assert_eq!(page.config.timezone, chrono_tz::UTC);
    assert!(page.is_active);
    assert_eq!(page.expires_at, None);
    assert!(page.slug.starts_with("intro-call-"));
    assert_eq!(page.slug.len(), "intro-call-".len() + 6);
    assert_eq!(engine.get_page(page.id).await.unwrap(), page);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_with_one_id_keep_one_page() {
    let engine = Arc::new(test_engine("page_create_race.wal"));
    let owner = Ulid::new();
    let id = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let fields = PageFields {
                slug: Some(format!("race-{i}")),
                ..page_fields(MeetingType::Zoom)
            };
            engine.create_page(id, owner, fields, now()).await
        }));
    }

    let mut winners = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(page) => winners.push(page),
            Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners.len(), 1);
    let winner = &winners[0];
    assert_eq!(engine.get_page(id).await.unwrap(), *winner);
    assert_eq!(engine.list_pages(owner).await.len(), 1);

    // Every losing slug is free again.
    for i in 0..8 {
        let slug = format!("race-{i}");
        if slug == winner.slug {
            continue;
        }
        assert!(matches!(
            engine.page_by_slug(&slug, now()).await,
            Err(EngineError::NotFoundSlug(_))
        ));
        let fields = PageFields {
            slug: Some(slug),
            ..page_fields(MeetingType::Zoom)
        };
        engine.create_page(Ulid::new(), owner, fields, now()).await.unwrap();
    }
}

#[tokio::test]
async fn create_page_validation() {
    let engine = test_engine("page_validation.wal");
    let owner = Ulid::new();

    let no_title = PageFields {
        title: None,
        ..page_fields(MeetingType::Zoom)
    };
    assert!(matches!(
        engine.create_page(Ulid::new(), owner, no_title, now()).await,
        Err(EngineError::InvalidInput(_))
    ));

    let no_location = PageFields {
        location_address: None,
        ..page_fields(MeetingType::Onsite)
    };
    assert!(matches!(
        engine.create_page(Ulid::new(), owner, no_location, now()).await,
        Err(EngineError::InvalidInput(_))
    ));

    let backwards = PageFields {
        start_time: Some(hm(18, 0)),
        end_time: Some(hm(9, 0)),
        ..page_fields(MeetingType::Zoom)
    };
    assert!(matches!(
        engine.create_page(Ulid::new(), owner, backwards, now()).await,
        Err(EngineError::InvalidConfig(ConfigError::EmptyWindow { .. }))
    ));

    let zero = PageFields {
        duration_minutes: Some(0),
        ..page_fields(MeetingType::Zoom)
    };
    assert!(matches!(
        engine.create_page(Ulid::new(), owner, zero, now()).await,
        Err(EngineError::InvalidConfig(ConfigError::ZeroDuration))
    ));

    assert!(engine.list_pages(owner).await.is_empty());
}

#[tokio::test]
async fn duplicate_page_id_rejected() {
    let engine = test_engine("page_dup.wal");
    let id = Ulid::new();
    engine
        .create_page(id, Ulid::new(), page_fields(MeetingType::Zoom), now())
        .await
        .unwrap();
    assert!(matches!(
        engine
            .create_page(id, Ulid::new(), page_fields(MeetingType::Zoom), now())
            .await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn explicit_slugs_are_unique_and_freed_on_delete() {
    let engine = test_engine("page_slug.wal");
    let owner = Ulid::new();
    let with_slug = || PageFields {
        slug: Some("team-sync".into()),
        ..page_fields(MeetingType::Zoom)
    };

    let first = engine.create_page(Ulid::new(), owner, with_slug(), now()).await.unwrap();
    assert_eq!(first.slug, "team-sync");
    assert!(matches!(
        engine.create_page(Ulid::new(), owner, with_slug(), now()).await,
        Err(EngineError::SlugTaken(_))
    ));

    engine.delete_page(first.id).await.unwrap();
    assert!(matches!(engine.get_page(first.id).await, Err(EngineError::NotFound(_))));
    engine.create_page(Ulid::new(), owner, with_slug(), now()).await.unwrap();
}

#[tokio::test]
async fn update_page_changes_only_given_fields() {
    let engine = test_engine("page_update.wal");
    let page = onsite_page(&engine, Ulid::new()).await;

    let fields = PageFields {
        title: Some("Renamed".into()),
        slug: Some("renamed".into()),
        ..Default::default()
    };
    let updated = engine.update_page(page.id, fields, now() + 1).await.unwrap();
    assert_eq!(updated.title, "Renamed");
    assert_eq!(updated.slug, "renamed");
    assert_eq!(updated.config, page.config);
    assert_eq!(updated.updated_at, now() + 1);
    assert_eq!(updated.created_at, page.created_at);

    // Old slug is free, new one resolves.
    assert!(matches!(
        engine.page_by_slug(&page.slug, now()).await,
        Err(EngineError::NotFoundSlug(_))
    ));
    assert_eq!(engine.page_by_slug("renamed", now()).await.unwrap().id, page.id);

    // An update that breaks validation leaves the page alone.
    let clear_location = PageFields {
        location_address: Some(None),
        ..Default::default()
    };
    assert!(engine.update_page(page.id, clear_location, now()).await.is_err());
    assert_eq!(engine.get_page(page.id).await.unwrap().title, "Renamed");
}

#[tokio::test]
async fn list_pages_by_owner_in_creation_order() {
    let engine = test_engine("page_list.wal");
    let owner = Ulid::new();
    let a = onsite_page(&engine, owner).await;
    let b = engine
        .create_page(Ulid::new(), owner, page_fields(MeetingType::Zoom), now() + 5)
        .await
        .unwrap();
    onsite_page(&engine, Ulid::new()).await;

    let ids: Vec<_> = engine.list_pages(owner).await.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);
}

#[tokio::test]
async fn public_lookup_distinguishes_states() {
    let engine = test_engine("page_public.wal");
    let page = onsite_page(&engine, Ulid::new()).await;

    assert!(matches!(
        engine.page_by_slug("nope", now()).await,
        Err(EngineError::NotFoundSlug(_))
    ));

    let off = PageFields {
        is_active: Some(false),
        ..Default::default()
    };
    engine.update_page(page.id, off, now()).await.unwrap();
    assert!(matches!(
        engine.page_by_slug(&page.slug, now()).await,
        Err(EngineError::PageInactive(_))
    ));

    let expired = PageFields {
        is_active: Some(true),
        expires_at: Some(Some(now() - 1)),
        ..Default::default()
    };
    engine.update_page(page.id, expired, now()).await.unwrap();
    assert!(matches!(
        engine.page_by_slug(&page.slug, now()).await,
        Err(EngineError::PageExpired(_))
    ));
    // The instant itself is not past.
    assert!(engine.page_by_slug(&page.slug, now() - 1).await.is_ok());
}

// ── Slots ────────────────────────────────────────────────

#[tokio::test]
async fn slots_honour_default_notice() {
    let engine = test_engine("slots_notice.wal");
    let fields = PageFields {
        min_notice_hours: None,
        ..page_fields(MeetingType::Zoom)
    };
    let page = engine.create_page(Ulid::new(), Ulid::new(), fields, now()).await.unwrap();

    // Notice runs to Monday 12:00; only later starts are offered.
    let slots = engine.compute_slots(page.id, monday(), now()).await.unwrap();
    let starts: Vec<_> = slots.iter().map(|s| s.start).collect();
    assert_eq!(
        starts,
        (13..18).map(|h| at(monday(), h, 0)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn eligible_dates_cover_the_horizon() {
    let engine = test_engine("slots_dates.wal");
    let page = onsite_page(&engine, Ulid::new()).await;
    let dates = engine.compute_eligible_dates(page.id, now()).await.unwrap();

    assert_eq!(dates.first(), Some(&monday()));
    assert_eq!(dates.last(), Some(&date(2030, 2, 5)));
    assert_eq!(dates.len(), 22);
    assert!(dates.iter().all(|d| d.weekday().number_from_monday() <= 5));
}

#[tokio::test]
async fn slot_queries_need_a_bookable_page() {
    let engine = test_engine("slots_inactive.wal");
    let page = onsite_page(&engine, Ulid::new()).await;
    let off = PageFields {
        is_active: Some(false),
        ..Default::default()
    };
    engine.update_page(page.id, off, now()).await.unwrap();

    assert!(matches!(
        engine.compute_slots(page.id, monday(), now()).await,
        Err(EngineError::PageInactive(_))
    ));
    assert!(matches!(
        engine.compute_eligible_dates(page.id, now()).await,
        Err(EngineError::PageInactive(_))
    ));
    assert!(matches!(
        engine.compute_slots(Ulid::new(), monday(), now()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Bookings ─────────────────────────────────────────────

#[tokio::test]
async fn booking_confirms_and_blocks_its_slot() {
    let engine = test_engine("booking_basic.wal");
    let owner = Ulid::new();
    let page = onsite_page(&engine, owner).await;

    let id = Ulid::new();
    let booking = engine
        .create_booking(id, page.id, "  Ada Lovelace ", slot(monday(), 10), now())
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.guest_name, "Ada Lovelace");
    assert_eq!(booking.owner_id, owner);
    assert_eq!(booking.location_address.as_deref(), Some("1 Main St"));
    assert_eq!(booking.cancel_deadline, at(date(2030, 1, 4), 10, 0));
    assert_eq!(engine.get_booking(id).await.unwrap(), booking);

    let slots = engine.compute_slots(page.id, monday(), now()).await.unwrap();
    assert_eq!(slots.len(), 8);
    assert!(!slots.contains(&slot(monday(), 10)));
}

#[tokio::test]
async fn booking_input_checks() {
    let engine = test_engine("booking_input.wal");
    let page = onsite_page(&engine, Ulid::new()).await;

    assert!(matches!(
        engine.create_booking(Ulid::new(), page.id, "   ", slot(monday(), 10), now()).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine
            .create_booking(Ulid::new(), page.id, "Ada", Span::new(at(monday(), 10, 0), at(monday(), 10, 0)), now())
            .await,
        Err(EngineError::InvalidInterval)
    ));
    assert!(matches!(
        engine.create_booking(Ulid::new(), Ulid::new(), "Ada", slot(monday(), 10), now()).await,
        Err(EngineError::NotFound(_))
    ));

    let id = Ulid::new();
    engine
        .create_booking(id, page.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();
    assert!(matches!(
        engine.create_booking(id, page.id, "Ada", slot(monday(), 11), now()).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn off_grid_and_closed_day_spans_rejected() {
    let engine = test_engine("booking_offgrid.wal");
    let page = onsite_page(&engine, Ulid::new()).await;

    let half_past = Span::new(at(monday(), 10, 30), at(monday(), 11, 30));
    assert!(matches!(
        engine.create_booking(Ulid::new(), page.id, "Ada", half_past, now()).await,
        Err(EngineError::SlotNotOffered)
    ));

    let saturday = slot(date(2030, 1, 12), 10);
    assert!(matches!(
        engine.create_booking(Ulid::new(), page.id, "Ada", saturday, now()).await,
        Err(EngineError::SlotNotOffered)
    ));

    let past_horizon = slot(date(2030, 3, 4), 10);
    assert!(matches!(
        engine.create_booking(Ulid::new(), page.id, "Ada", past_horizon, now()).await,
        Err(EngineError::SlotNotOffered)
    ));
}

#[tokio::test]
async fn inactive_or_expired_page_takes_no_bookings() {
    let engine = test_engine("booking_inactive.wal");
    let page = onsite_page(&engine, Ulid::new()).await;

    let off = PageFields {
        is_active: Some(false),
        ..Default::default()
    };
    engine.update_page(page.id, off, now()).await.unwrap();
    assert!(matches!(
        engine.create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now()).await,
        Err(EngineError::PageInactive(_))
    ));

    let expired = PageFields {
        is_active: Some(true),
        expires_at: Some(Some(now() - H)),
        ..Default::default()
    };
    engine.update_page(page.id, expired, now()).await.unwrap();
    assert!(matches!(
        engine.create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now()).await,
        Err(EngineError::PageExpired(_))
    ));
}

#[tokio::test]
async fn overlap_across_pages_of_one_owner_is_a_conflict() {
    let engine = test_engine("booking_cross_page.wal");
    let owner = Ulid::new();
    let hourly = onsite_page(&engine, owner).await;
    let half_hourly = engine
        .create_page(
            Ulid::new(),
            owner,
            PageFields {
                duration_minutes: Some(30),
                ..page_fields(MeetingType::Onsite)
            },
            now(),
        )
        .await
        .unwrap();

    let first = engine
        .create_booking(Ulid::new(), hourly.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();

    let inside = Span::new(at(monday(), 10, 30), at(monday(), 11, 0));
    match engine.create_booking(Ulid::new(), half_hourly.id, "Bob", inside, now()).await {
        Err(EngineError::Conflict(id)) => assert_eq!(id, first.id),
        other => panic!("expected conflict, got {other:?}"),
    }

    // Touching the end is fine.
    let after = Span::new(at(monday(), 11, 0), at(monday(), 11, 30));
    engine
        .create_booking(Ulid::new(), half_hourly.id, "Bob", after, now())
        .await
        .unwrap();

    let offered = engine.compute_slots(half_hourly.id, monday(), now()).await.unwrap();
    assert_eq!(offered.len(), 18 - 3);
}

#[tokio::test]
async fn other_owners_do_not_conflict() {
    let engine = test_engine("booking_owners.wal");
    let a = onsite_page(&engine, Ulid::new()).await;
    let b = onsite_page(&engine, Ulid::new()).await;
    engine
        .create_booking(Ulid::new(), a.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();
    engine
        .create_booking(Ulid::new(), b.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_one_slot_yield_one_booking() {
    let engine = Arc::new(test_engine("booking_race.wal"));
    let owner = Ulid::new();
    let page = onsite_page(&engine, owner).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(Ulid::new(), page.id, &format!("guest {i}"), slot(monday(), 14), now())
                .await
        }));
    }

    let mut confirmed = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => confirmed += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(confirmed, 1);
    assert_eq!(conflicts, 15);

    let day = Span::new(at(monday(), 0, 0), at(monday(), 23, 59));
    assert_eq!(engine.list_bookings(owner, day.start, day.end).await.unwrap().len(), 1);
}

#[tokio::test]
async fn list_bookings_window() {
    let engine = test_engine("booking_list.wal");
    let owner = Ulid::new();
    let page = onsite_page(&engine, owner).await;
    for h in [15, 9, 12] {
        engine
            .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), h), now())
            .await
            .unwrap();
    }

    let all = engine
        .list_bookings(owner, at(monday(), 0, 0), at(monday(), 23, 0))
        .await
        .unwrap();
    let starts: Vec<_> = all.iter().map(|b| b.span.start).collect();
    assert_eq!(starts, vec![at(monday(), 9, 0), at(monday(), 12, 0), at(monday(), 15, 0)]);

    // Only bookings fully inside count.
    let partial = engine
        .list_bookings(owner, at(monday(), 9, 30), at(monday(), 16, 0))
        .await
        .unwrap();
    assert_eq!(partial.len(), 2);

    assert!(matches!(
        engine.list_bookings(owner, 10, 5).await,
        Err(EngineError::InvalidInterval)
    ));
    assert!(engine.list_bookings(Ulid::new(), 0, H).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_bookings_rejects_overflowing_window() {
    let engine = test_engine("booking_list_overflow.wal");
    let owner = Ulid::new();
    onsite_page(&engine, owner).await;
    assert!(matches!(
        engine
            .list_bookings(owner, -9_000_000_000_000_000_000, 9_000_000_000_000_000_000)
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.list_bookings(owner, Ms::MIN, Ms::MAX).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn find_conflicts_with_exclusion() {
    let engine = test_engine("booking_find_conflicts.wal");
    let owner = Ulid::new();
    let page = onsite_page(&engine, owner).await;
    let a = engine
        .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();
    let b = engine
        .create_booking(Ulid::new(), page.id, "Bob", slot(monday(), 11), now())
        .await
        .unwrap();

    let probe = Span::new(at(monday(), 10, 30), at(monday(), 11, 30));
    let ids: Vec<_> = engine
        .find_conflicts(owner, probe, None)
        .await
        .unwrap()
        .iter()
        .map(|x| x.id)
        .collect();
    assert_eq!(ids, vec![a.id, b.id]);

    let ids: Vec<_> = engine
        .find_conflicts(owner, probe, Some(a.id))
        .await
        .unwrap()
        .iter()
        .map(|x| x.id)
        .collect();
    assert_eq!(ids, vec![b.id]);

    let touching = Span::new(at(monday(), 12, 0), at(monday(), 13, 0));
    assert!(engine.find_conflicts(owner, touching, None).await.unwrap().is_empty());
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn guest_cancel_respects_deadline() {
    let engine = test_engine("cancel_guest.wal");
    let page = onsite_page(&engine, Ulid::new()).await;

    // Deadline is the Friday before; already past on Sunday.
    let soon = engine
        .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();
    match engine.cancel_booking(soon.id, now(), CancelPolicy::Guest).await {
        Err(EngineError::CancelDeadlinePassed(deadline)) => {
            assert_eq!(deadline, soon.cancel_deadline)
        }
        other => panic!("expected deadline error, got {other:?}"),
    }

    let later = engine
        .create_booking(Ulid::new(), page.id, "Ada", slot(date(2030, 1, 14), 10), now())
        .await
        .unwrap();
    let cancelled = engine
        .cancel_booking(later.id, now(), CancelPolicy::Guest)
        .await
        .unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.cancelled_at, Some(now()));
}

#[tokio::test]
async fn owner_cancel_ignores_deadline_and_frees_slot() {
    let engine = test_engine("cancel_owner.wal");
    let owner = Ulid::new();
    let page = onsite_page(&engine, owner).await;
    let booking = engine
        .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();

    engine
        .cancel_booking(booking.id, now(), CancelPolicy::Owner)
        .await
        .unwrap();
    assert!(matches!(
        engine.cancel_booking(booking.id, now(), CancelPolicy::Owner).await,
        Err(EngineError::AlreadyCancelled(_))
    ));
    assert_eq!(
        engine.get_booking(booking.id).await.unwrap().status,
        BookingStatus::Cancelled
    );

    assert!(engine
        .compute_slots(page.id, monday(), now())
        .await
        .unwrap()
        .contains(&slot(monday(), 10)));
    engine
        .create_booking(Ulid::new(), page.id, "Bob", slot(monday(), 10), now())
        .await
        .unwrap();
    assert!(matches!(
        engine.set_meeting_url(booking.id, Some("https://x.test".into())).await,
        Err(EngineError::AlreadyCancelled(_))
    ));
}

#[tokio::test]
async fn cancel_unknown_booking() {
    let engine = test_engine("cancel_unknown.wal");
    assert!(matches!(
        engine.cancel_booking(Ulid::new(), now(), CancelPolicy::Owner).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Meeting links ────────────────────────────────────────

#[tokio::test]
async fn video_booking_gets_meeting_link() {
    let meetings = Arc::new(FakeProvisioner::working());
    let engine = engine_with(test_wal_path("meeting_ok.wal"), meetings.clone());
    let page = engine
        .create_page(Ulid::new(), Ulid::new(), page_fields(MeetingType::Zoom), now())
        .await
        .unwrap();

    let booking = engine
        .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();
    let url = booking.meeting_url.clone().unwrap();
    assert!(url.contains("zoom") && url.ends_with(&booking.id.to_string()));
    assert_eq!(booking.location_address, None);
    assert_eq!(engine.get_booking(booking.id).await.unwrap().meeting_url, Some(url));
    assert_eq!(meetings.call_count(), 1);
}

#[tokio::test]
async fn provider_failure_keeps_booking() {
    let meetings = Arc::new(FakeProvisioner::broken());
    let engine = engine_with(test_wal_path("meeting_fail.wal"), meetings.clone());
    let page = engine
        .create_page(Ulid::new(), Ulid::new(), page_fields(MeetingType::GoogleMeet), now())
        .await
        .unwrap();

    let booking = engine
        .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.meeting_url, None);
    assert_eq!(meetings.call_count(), 1);

    // The owner can attach a link by hand later.
    let fixed = engine
        .set_meeting_url(booking.id, Some("https://meet.test/abc".into()))
        .await
        .unwrap();
    assert_eq!(fixed.meeting_url.as_deref(), Some("https://meet.test/abc"));
}

#[tokio::test]
async fn onsite_booking_skips_provider() {
    let meetings = Arc::new(FakeProvisioner::working());
    let engine = engine_with(test_wal_path("meeting_onsite.wal"), meetings.clone());
    let page = onsite_page(&engine, Ulid::new()).await;
    let booking = engine
        .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();
    assert_eq!(booking.meeting_url, None);
    assert_eq!(meetings.call_count(), 0);
}

// ── Notifications and feed ───────────────────────────────

#[tokio::test]
async fn owner_notified_of_bookings_and_cancellations() {
    let engine = test_engine("notify_flow.wal");
    let owner = Ulid::new();
    let page = onsite_page(&engine, owner).await;
    let booking = engine
        .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();
    engine
        .cancel_booking(booking.id, now() + 1, CancelPolicy::Owner)
        .await
        .unwrap();

    let all = engine.list_notifications(owner, false).await;
    let kinds: Vec<_> = all.iter().map(|n| n.kind).collect();
    assert_eq!(
        kinds,
        vec![NotificationKind::BookingCancelled, NotificationKind::NewBooking]
    );
    assert!(all.iter().all(|n| n.booking_id == booking.id && !n.is_read));

    engine.mark_notification_read(all[1].id).await.unwrap();
    let unread = engine.list_notifications(owner, true).await;
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].id, all[0].id);

    assert_eq!(engine.mark_all_notifications_read(owner).await.unwrap(), 1);
    assert!(engine.list_notifications(owner, true).await.is_empty());
    assert_eq!(engine.mark_all_notifications_read(owner).await.unwrap(), 0);
    assert!(matches!(
        engine.mark_notification_read(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn feed_carries_owner_events() {
    let engine = test_engine("notify_feed.wal");
    let owner = Ulid::new();
    let page = onsite_page(&engine, owner).await;
    let mut rx = engine.notify.subscribe(owner);
    let mut stranger = engine.notify.subscribe(Ulid::new());

    let booking = engine
        .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();

    match rx.try_recv().unwrap() {
        Event::BookingConfirmed { booking: b } => assert_eq!(b.id, booking.id),
        other => panic!("unexpected {}", other.name()),
    }
    assert!(matches!(
        rx.try_recv().unwrap(),
        Event::NotificationCreated { .. }
    ));
    assert!(stranger.try_recv().is_err());
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_rebuilt_from_wal() {
    let path = test_wal_path("replay.wal");
    let owner = Ulid::new();
    let (page, kept, dropped) = {
        let engine = engine_with(path.clone(), Arc::new(Unconfigured));
        let page = onsite_page(&engine, owner).await;
        let kept = engine
            .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
            .await
            .unwrap();
        let dropped = engine
            .create_booking(Ulid::new(), page.id, "Bob", slot(monday(), 11), now())
            .await
            .unwrap();
        engine
            .cancel_booking(dropped.id, now(), CancelPolicy::Owner)
            .await
            .unwrap();
        engine.mark_all_notifications_read(owner).await.unwrap();
        (page, kept, dropped)
    };

    let engine = engine_with(path, Arc::new(Unconfigured));
    assert_eq!(engine.get_page(page.id).await.unwrap(), page);
    assert_eq!(engine.page_by_slug(&page.slug, now()).await.unwrap().id, page.id);
    assert_eq!(engine.get_booking(kept.id).await.unwrap(), kept);
    assert_eq!(
        engine.get_booking(dropped.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    assert_eq!(engine.list_notifications(owner, false).await.len(), 3);
    assert!(engine.list_notifications(owner, true).await.is_empty());

    // The replayed calendar still guards the slot.
    assert!(matches!(
        engine.create_booking(Ulid::new(), page.id, "Cy", slot(monday(), 10), now()).await,
        Err(EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn booking_and_its_notification_share_one_append() {
    let path = test_wal_path("booking_notification_append.wal");
    let owner = Ulid::new();
    let engine = engine_with(path.clone(), Arc::new(Unconfigured));
    let page = onsite_page(&engine, owner).await;
    let booking = engine
        .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
        .await
        .unwrap();
    engine
        .cancel_booking(booking.id, now(), CancelPolicy::Owner)
        .await
        .unwrap();

    let events = crate::wal::Wal::replay(&path).unwrap();
    assert_eq!(events.len(), 5);
    assert!(matches!(&events[1], Event::BookingConfirmed { booking: b } if b.id == booking.id));
    assert!(matches!(
        &events[2],
        Event::NotificationCreated { notification: n }
            if n.booking_id == booking.id && n.kind == NotificationKind::NewBooking
    ));
    assert!(matches!(&events[3], Event::BookingCancelled { id, .. } if *id == booking.id));
    assert!(matches!(
        &events[4],
        Event::NotificationCreated { notification: n }
            if n.booking_id == booking.id && n.kind == NotificationKind::BookingCancelled
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let owner = Ulid::new();
    let (page, booking) = {
        let engine = engine_with(path.clone(), Arc::new(Unconfigured));
        let deleted = onsite_page(&engine, owner).await;
        engine.delete_page(deleted.id).await.unwrap();
        let page = onsite_page(&engine, owner).await;
        let booking = engine
            .create_booking(Ulid::new(), page.id, "Ada", slot(monday(), 10), now())
            .await
            .unwrap();
        let gone = engine
            .create_booking(Ulid::new(), page.id, "Bob", slot(monday(), 12), now())
            .await
            .unwrap();
        engine
            .cancel_booking(gone.id, now(), CancelPolicy::Owner)
            .await
            .unwrap();

        assert!(engine.wal_appends_since_compact().await >= 8);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (page, booking)
    };

    let engine = engine_with(path, Arc::new(Unconfigured));
    assert_eq!(engine.list_pages(owner).await, vec![page.clone()]);
    assert_eq!(engine.get_booking(booking.id).await.unwrap(), booking);
    assert_eq!(engine.list_notifications(owner, false).await.len(), 3);
    let offered = engine.compute_slots(page.id, monday(), now()).await.unwrap();
    assert_eq!(offered.len(), 8);
}
