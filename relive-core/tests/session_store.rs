use chrono::{Duration, NaiveDate, NaiveDateTime};

use relive_core::ArchiveStore;

fn store() -> (tempfile::TempDir, ArchiveStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::new(dir.path().join("archive.sqlite")).unwrap();
    store.initialize().unwrap();
    (dir, store)
}

fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 2, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

#[test]
fn session_lifecycle_open_then_close() {
    let (_dir, store) = store();
    let id = store.open_session("S", at(24, 10, 0)).unwrap();

    let open = store.latest_open_session("S").unwrap().unwrap();
    assert_eq!(open.id, id);
    assert_eq!(open.start_time, Some(at(24, 10, 0)));
    assert!(open.end_time.is_none());

    store.close_session(id, at(24, 12, 0)).unwrap();
    assert!(store.latest_open_session("S").unwrap().is_none());
}

#[test]
fn close_latest_open_session_picks_the_most_recent_start() {
    let (_dir, store) = store();
    store.open_session("S", at(23, 10, 0)).unwrap();
    let newer = store.open_session("S", at(24, 10, 0)).unwrap();

    let closed = store
        .close_latest_open_session("S", at(24, 12, 0))
        .unwrap();
    assert_eq!(closed, Some(newer));
}

#[test]
fn closing_a_missing_session_is_an_error() {
    let (_dir, store) = store();
    assert!(store.close_session(999, at(24, 12, 0)).is_err());
}

#[test]
fn end_only_sessions_record_the_offline_edge() {
    let (_dir, store) = store();
    store.insert_end_only_session("S", at(24, 12, 0)).unwrap();
    // An end-only session is never "open": it has no start time.
    assert!(store.latest_open_session("S").unwrap().is_none());
}

#[test]
fn recent_sessions_include_the_open_one_last() {
    let (_dir, store) = store();
    let first = store.open_session("S", at(22, 10, 0)).unwrap();
    store.close_session(first, at(22, 12, 0)).unwrap();
    let open = store.open_session("S", at(24, 10, 0)).unwrap();

    let sessions = store.recent_sessions("S", 3, at(24, 14, 0)).unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, first);
    assert_eq!(sessions[1].id, open);
    assert!(sessions[1].end_time.is_none());
}

#[test]
fn recent_sessions_drop_entries_past_the_lookback() {
    let (_dir, store) = store();
    let old = store.open_session("S", at(19, 10, 0)).unwrap();
    store.close_session(old, at(19, 12, 0)).unwrap();

    let sessions = store.recent_sessions("S", 3, at(24, 14, 0)).unwrap();
    assert!(sessions.is_empty());
}

#[test]
fn stale_sessions_get_a_clamped_end_time() {
    let (_dir, store) = store();
    let stale = store.open_session("S", at(22, 10, 0)).unwrap();
    let fresh = store.open_session("S", at(24, 9, 0)).unwrap();

    let now = at(24, 10, 0);
    let closed = store.close_stale_sessions(Duration::hours(24), now).unwrap();
    assert_eq!(closed, 1);

    let sessions = store.sessions_for_streamer("S", 10).unwrap();
    let stale_session = sessions.iter().find(|s| s.id == stale).unwrap();
    // start + 12h is before now, so it is used as-is.
    assert_eq!(stale_session.end_time, Some(at(22, 22, 0)));
    let fresh_session = sessions.iter().find(|s| s.id == fresh).unwrap();
    assert!(fresh_session.end_time.is_none());
}

#[test]
fn stale_end_time_never_lands_in_the_future() {
    let (_dir, store) = store();
    store.open_session("S", at(24, 18, 0)).unwrap();

    // With a short threshold start + 12h would overshoot now, so the end is
    // clamped to now.
    let now = at(24, 23, 0);
    let closed = store.close_stale_sessions(Duration::hours(2), now).unwrap();
    assert_eq!(closed, 1);
    let sessions = store.sessions_for_streamer("S", 10).unwrap();
    assert_eq!(sessions[0].end_time, Some(now));
}

#[test]
fn upload_records_round_trip_through_windows() {
    let (_dir, store) = store();
    store
        .insert_upload(Some("BV1xx411c7mD"), "parent", "a.mp4", at(24, 10, 5))
        .unwrap();
    store
        .insert_upload(None, "P2 (分P)", "b.mp4", at(24, 10, 30))
        .unwrap();
    store
        .insert_upload(None, "outside", "c.mp4", at(24, 13, 0))
        .unwrap();

    let start = at(24, 10, 0);
    let end = at(24, 12, 0);
    assert_eq!(store.count_uploads_in_window(start, end).unwrap(), 2);
    let records = store.find_uploads_in_window(start, end).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].first_part_filename, "a.mp4");
    assert_eq!(
        store.latest_bvid_in_window(start, end).unwrap().as_deref(),
        Some("BV1xx411c7mD")
    );
    assert!(store.has_pending_in_window(start, end).unwrap());
}

#[test]
fn window_boundaries_are_inclusive() {
    let (_dir, store) = store();
    store
        .insert_upload(None, "edge", "edge.mp4", at(24, 10, 0))
        .unwrap();
    assert_eq!(
        store
            .count_uploads_in_window(at(24, 10, 0), at(24, 12, 0))
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .count_uploads_in_window(at(24, 8, 0), at(24, 10, 0))
            .unwrap(),
        1
    );
}

#[test]
fn bvid_backfill_and_uniqueness_guard() {
    let (_dir, store) = store();
    let pending = store
        .insert_upload(None, "pending", "p.mp4", at(24, 10, 0))
        .unwrap();
    let other = store
        .insert_upload(Some("BV1yy411c7mE"), "other", "o.mp4", at(24, 11, 0))
        .unwrap();

    assert_eq!(store.find_uploads_missing_bvid().unwrap().len(), 1);
    assert!(store.is_bvid_taken("BV1yy411c7mE", pending).unwrap());
    assert!(!store.is_bvid_taken("BV1yy411c7mE", other).unwrap());

    store.set_bvid(pending, "BV1zz411c7mF").unwrap();
    assert!(store.find_uploads_missing_bvid().unwrap().is_empty());
    assert!(store.set_bvid(12345, "BV1qq411c7mG").is_err());
}

#[test]
fn find_upload_by_filename_matches_exactly() {
    let (_dir, store) = store();
    store
        .insert_upload(None, "t", "S录播2026-02-24T10_30_00.mp4", at(24, 10, 30))
        .unwrap();
    assert!(store
        .find_upload_by_filename("S录播2026-02-24T10_30_00.mp4")
        .unwrap()
        .is_some());
    assert!(store
        .find_upload_by_filename("S录播2026-02-24T10_31_00.mp4")
        .unwrap()
        .is_none());
}
