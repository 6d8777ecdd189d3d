//! Log-based (change tracking) replication tests over the in-memory source.

use rowtap::testing::{row, test_stream, FixedClock, FixtureSource, RecordedSink};
use rowtap::{
    run_sync, Bookmark, BookmarkDetail, Capability, Catalog, LogBasedBookmark, NullStore,
    ReplicationMethod, Row, Stream, SyncOpts, SyncReport, TapError, TapState,
};
use serde_json::json;

const STREAM: &str = "app.dbo.users";

async fn sync(
    catalog: &Catalog,
    state: &mut TapState,
    source: &FixtureSource,
    sink: &mut RecordedSink,
    clock_millis: i64,
) -> anyhow::Result<SyncReport> {
    run_sync(
        catalog,
        state,
        source,
        sink,
        &NullStore,
        &FixedClock::from_millis(clock_millis),
        SyncOpts { batch_size: 100 },
    )
    .await
}

fn marker(state: &TapState, stream: &Stream) -> Option<i64> {
    match &state.get(&stream.id).unwrap().detail {
        BookmarkDetail::LogBased(lb) => lb.current_log_version,
        other => panic!("expected log-based detail, got {other:?}"),
    }
}

/// A bookmark for a stream already past its initial snapshot.
fn tracking_bookmark(version: i64, log_version: i64) -> Bookmark {
    let mut bookmark = Bookmark::new(version, ReplicationMethod::LogBased);
    bookmark.last_replication_method = Some(ReplicationMethod::LogBased);
    bookmark.initial_full_table_complete = true;
    bookmark.detail = BookmarkDetail::LogBased(LogBasedBookmark {
        current_log_version: Some(log_version),
        snapshot: Default::default(),
    });
    bookmark
}

fn key_of(id: i64) -> Row {
    let mut keys = Row::new();
    keys.insert("id".to_string(), json!(id));
    keys
}

#[tokio::test]
async fn cold_start_snapshots_and_seeds_the_marker_before_reading() {
    let stream = test_stream(ReplicationMethod::LogBased);
    let mut source = FixtureSource::default()
        .with_rows(&stream, vec![row(1, "ada"), row(2, "brendan")])
        .with_tracking(&stream.id);
    source.table_mut(&stream.id).current_version = 5;
    let catalog = Catalog {
        streams: vec![stream.clone()],
    };
    let mut state = TapState::default();
    let mut sink = RecordedSink::default();

    let report = sync(&catalog, &mut state, &source, &mut sink, 1000)
        .await
        .unwrap();

    assert!(report.ok());
    assert_eq!(sink.upserts(STREAM).len(), 2);
    assert_eq!(sink.activations(STREAM), vec![1000]);

    let bookmark = state.get(&stream.id).unwrap();
    assert!(bookmark.initial_full_table_complete);
    // Marker captured before the snapshot read, so changes landing during
    // the snapshot replay on the next run.
    assert_eq!(marker(&state, &stream), Some(5));
}

#[tokio::test]
async fn single_insert_yields_a_single_upsert_and_advances_the_marker() {
    let stream = test_stream(ReplicationMethod::LogBased);
    let mut source = FixtureSource::default()
        .with_rows(&stream, vec![row(1, "ada")])
        .with_tracking(&stream.id);
    source.table_mut(&stream.id).current_version = 5;
    let catalog = Catalog {
        streams: vec![stream.clone()],
    };
    let mut state = TapState::default();
    state.insert(&stream.id, tracking_bookmark(1000, 5));

    source.insert_row(&stream, row(2, "brendan"));

    let mut sink = RecordedSink::default();
    let report = sync(&catalog, &mut state, &source, &mut sink, 2000)
        .await
        .unwrap();

    assert!(report.ok());
    let upserts = sink.upserts(STREAM);
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0].get("id"), Some(&json!(2)));
    // No snapshot, so no cutover and no version bump.
    assert!(sink.activations(STREAM).is_empty());
    assert_eq!(state.get(&stream.id).unwrap().version, 1000);
    assert_eq!(marker(&state, &stream), Some(6));
}

#[tokio::test]
async fn delete_emits_key_columns_only() {
    let stream = test_stream(ReplicationMethod::LogBased);
    let mut source = FixtureSource::default()
        .with_rows(&stream, vec![row(1, "ada"), row(2, "brendan")])
        .with_tracking(&stream.id);
    source.table_mut(&stream.id).current_version = 3;
    let catalog = Catalog {
        streams: vec![stream.clone()],
    };
    let mut state = TapState::default();
    state.insert(&stream.id, tracking_bookmark(1000, 3));

    source.delete_row(&stream, key_of(2));

    let mut sink = RecordedSink::default();
    sync(&catalog, &mut state, &source, &mut sink, 2000)
        .await
        .unwrap();

    assert!(sink.upserts(STREAM).is_empty());
    let deletes = sink.deletes(STREAM);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].get("id"), Some(&json!(2)));
    assert_eq!(deletes[0].len(), 1);
}

#[tokio::test]
async fn rerun_with_no_changes_emits_nothing_and_keeps_the_marker() {
    let stream = test_stream(ReplicationMethod::LogBased);
    let mut source = FixtureSource::default()
        .with_rows(&stream, vec![row(1, "ada")])
        .with_tracking(&stream.id);
    source.table_mut(&stream.id).current_version = 7;
    let catalog = Catalog {
        streams: vec![stream.clone()],
    };
    let mut state = TapState::default();
    state.insert(&stream.id, tracking_bookmark(1000, 7));

    let mut sink = RecordedSink::default();
    let report = sync(&catalog, &mut state, &source, &mut sink, 2000)
        .await
        .unwrap();

    assert!(report.ok());
    assert!(sink.upserts(STREAM).is_empty());
    assert!(sink.deletes(STREAM).is_empty());
    assert_eq!(marker(&state, &stream), Some(7));
}

#[tokio::test]
async fn purged_marker_falls_back_to_a_fresh_snapshot_under_a_new_version() {
    let stream = test_stream(ReplicationMethod::LogBased);
    let mut source = FixtureSource::default()
        .with_rows(&stream, vec![row(1, "ada"), row(2, "brendan")])
        .with_tracking(&stream.id);
    source.table_mut(&stream.id).current_version = 50;
    // Retention window moved past the recorded marker.
    source.purge_changes_below(&stream.id, 40);
    let catalog = Catalog {
        streams: vec![stream.clone()],
    };
    let mut state = TapState::default();
    state.insert(&stream.id, tracking_bookmark(1000, 5));

    let mut sink = RecordedSink::default();
    let report = sync(&catalog, &mut state, &source, &mut sink, 9999)
        .await
        .unwrap();

    assert!(report.ok());
    assert_eq!(sink.upserts(STREAM).len(), 2);
    assert_eq!(sink.activations(STREAM), vec![9999]);

    let bookmark = state.get(&stream.id).unwrap();
    assert_eq!(bookmark.version, 9999);
    assert!(bookmark.initial_full_table_complete);
    assert_eq!(marker(&state, &stream), Some(50));
}

#[tokio::test]
async fn marker_rejected_at_read_time_also_falls_back_to_a_fresh_snapshot() {
    let stream = test_stream(ReplicationMethod::LogBased);
    let mut source = FixtureSource::default()
        .with_rows(&stream, vec![row(1, "ada"), row(2, "brendan")])
        .with_tracking(&stream.id);
    source.table_mut(&stream.id).current_version = 50;
    source.purge_changes_below(&stream.id, 40);
    // The source does not expose its retention floor, so the purged marker
    // only surfaces as a rejection of the read itself.
    source.table_mut(&stream.id).hidden_retention_floor = true;
    let catalog = Catalog {
        streams: vec![stream.clone()],
    };
    let mut state = TapState::default();
    state.insert(&stream.id, tracking_bookmark(1000, 5));

    let mut sink = RecordedSink::default();
    let report = sync(&catalog, &mut state, &source, &mut sink, 9999)
        .await
        .unwrap();

    assert!(report.ok());
    assert_eq!(sink.upserts(STREAM).len(), 2);
    assert_eq!(sink.activations(STREAM), vec![9999]);

    let bookmark = state.get(&stream.id).unwrap();
    assert_eq!(bookmark.version, 9999);
    assert!(bookmark.initial_full_table_complete);
    assert_eq!(marker(&state, &stream), Some(50));
}

#[tokio::test]
async fn method_switch_opens_the_tracking_window_at_the_current_position() {
    let full_stream = test_stream(ReplicationMethod::FullTable);
    let mut source = FixtureSource::default()
        .with_rows(&full_stream, vec![row(1, "ada")])
        .with_tracking(&full_stream.id);
    source.table_mut(&full_stream.id).current_version = 9;
    let mut state = TapState::default();

    let mut first = RecordedSink::default();
    sync(
        &Catalog {
            streams: vec![full_stream.clone()],
        },
        &mut state,
        &source,
        &mut first,
        1000,
    )
    .await
    .unwrap();

    // Same stream, reconfigured to LOG_BASED. The completed full pass is
    // reused; only changes after the switch flow.
    let log_stream = test_stream(ReplicationMethod::LogBased);
    let mut second = RecordedSink::default();
    let report = sync(
        &Catalog {
            streams: vec![log_stream.clone()],
        },
        &mut state,
        &source,
        &mut second,
        2000,
    )
    .await
    .unwrap();

    assert!(report.ok());
    assert!(second.upserts(STREAM).is_empty());
    assert!(second.activations(STREAM).is_empty());
    assert_eq!(state.get(&log_stream.id).unwrap().version, 1000);
    assert_eq!(marker(&state, &log_stream), Some(9));
}

#[tokio::test]
async fn tracking_reads_without_select_fail_naming_the_select_grant() {
    let stream = test_stream(ReplicationMethod::LogBased);
    let mut source = FixtureSource::default()
        .with_rows(&stream, vec![row(1, "ada")])
        .with_tracking(&stream.id);
    source.table_mut(&stream.id).grants.select = false;
    let catalog = Catalog {
        streams: vec![stream.clone()],
    };
    let mut state = TapState::default();
    state.insert(&stream.id, tracking_bookmark(1000, 0));

    let mut sink = RecordedSink::default();
    let report = sync(&catalog, &mut state, &source, &mut sink, 2000)
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    match &report.failed[0].error {
        TapError::PermissionDenied {
            capability, table, ..
        } => {
            assert_eq!(*capability, Capability::Select);
            assert_eq!(table, "users");
        }
        other => panic!("expected permission denial, got {other}"),
    }
    assert!(report.failed[0].error.to_string().contains("SELECT"));
}

#[tokio::test]
async fn tracking_reads_without_view_change_tracking_fail_naming_that_grant() {
    let stream = test_stream(ReplicationMethod::LogBased);
    let mut source = FixtureSource::default()
        .with_rows(&stream, vec![row(1, "ada")])
        .with_tracking(&stream.id);
    source.table_mut(&stream.id).grants.view_change_tracking = false;
    let catalog = Catalog {
        streams: vec![stream.clone()],
    };
    let mut state = TapState::default();
    state.insert(&stream.id, tracking_bookmark(1000, 0));

    let mut sink = RecordedSink::default();
    let report = sync(&catalog, &mut state, &source, &mut sink, 2000)
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    let message = report.failed[0].error.to_string();
    assert!(message.contains("VIEW CHANGE TRACKING"));
    assert!(message.contains("app.dbo.users"));
}
