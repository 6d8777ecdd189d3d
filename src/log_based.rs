//! Log-based sync engine.
//!
//! Emits only rows changed since the bookmarked change-tracking marker,
//! using the source's native change-tracking facility. Per-stream state
//! machine:
//!
//! ```text
//! NOT_TRACKED -> INITIAL_SNAPSHOT -> TRACKING -> [INVALID_MARKER] -> INITIAL_SNAPSHOT
//! ```
//!
//! The marker is seeded from the tracking position captured *before* the
//! initial snapshot read, so changes landing during the snapshot are not
//! missed; likewise each tracking read advances the marker only to the
//! position captured at the start of that read. When the recorded marker
//! falls outside the source's retention window the engine falls back to a
//! fresh snapshot under a new version, for that stream only.

use crate::catalog::Stream;
use crate::error::{classify, TapError};
use crate::full;
use crate::message::Message;
use crate::source::{ChangeOp, SourceError};
use crate::state::{Bookmark, BookmarkDetail, LogBasedBookmark};
use crate::sync::SyncContext;
use tracing::{info, warn};

pub async fn run_log_based_sync(
    ctx: &mut SyncContext<'_>,
    stream: &Stream,
    bookmark: &mut Bookmark,
) -> Result<u64, TapError> {
    let id = &stream.id;

    if !bookmark.initial_full_table_complete {
        return initial_snapshot(ctx, stream, bookmark).await;
    }

    let marker = match &bookmark.detail {
        BookmarkDetail::LogBased(lb) => lb.current_log_version,
        _ => {
            return Err(TapError::Configuration {
                stream: id.to_string(),
                reason: "log-based sync invoked without a log-based bookmark".into(),
            })
        }
    };

    let marker = match marker {
        Some(marker) => marker,
        None => {
            // A method switch landed here with a completed full pass but no
            // marker; the tracking window opens at the current position.
            let position = ctx
                .source
                .current_change_version(stream)
                .await
                .map_err(|e| classify(e, id))?;
            info!(stream = %id, position, "opening change tracking window at the current position");
            position
        }
    };

    // TRACKING: the source purges old markers, so check the retention
    // window before reading.
    let min_valid = ctx
        .source
        .min_valid_change_version(stream)
        .await
        .map_err(|e| classify(e, id))?;
    if let Some(min_valid) = min_valid {
        if marker < min_valid {
            warn!(
                stream = %id,
                marker,
                min_valid,
                "change tracking marker was purged; falling back to a fresh full snapshot"
            );
            return resnapshot(ctx, stream, bookmark).await;
        }
    }

    // Capture the position before the read; changes landing during the read
    // are replayed by the next run rather than skipped.
    let position = ctx
        .source
        .current_change_version(stream)
        .await
        .map_err(|e| classify(e, id))?;
    // Sources without a queryable retention floor reject purged markers
    // only at read time, and a purge can race the check above; both cases
    // recover the same way the proactive check does.
    let changes = match ctx.source.read_changes(stream, marker).await {
        Ok(changes) => changes,
        Err(SourceError::InvalidChangeMarker { requested, min_valid }) => {
            warn!(
                stream = %id,
                marker = requested,
                min_valid,
                "source rejected the change tracking marker; falling back to a fresh full snapshot"
            );
            return resnapshot(ctx, stream, bookmark).await;
        }
        Err(e) => return Err(classify(e, id)),
    };

    let version = bookmark.version;
    let mut emitted: u64 = 0;
    for change in changes {
        match change.op {
            ChangeOp::Upsert => {
                let row = change.row.unwrap_or_else(|| change.keys.clone());
                ctx.sink
                    .emit(Message::Upsert {
                        stream: id.to_string(),
                        version,
                        record: stream.emitted_row(&row),
                    })
                    .map_err(|e| TapError::source(id, e))?;
            }
            ChangeOp::Delete => {
                ctx.sink
                    .emit(Message::Delete {
                        stream: id.to_string(),
                        version,
                        keys: stream.key_only(&change.keys),
                    })
                    .map_err(|e| TapError::source(id, e))?;
            }
        }
        emitted += 1;
    }

    if let BookmarkDetail::LogBased(lb) = &mut bookmark.detail {
        // The marker never moves backwards.
        lb.current_log_version = Some(position.max(marker));
    }
    ctx.checkpoint(id, bookmark)
        .await
        .map_err(|e| TapError::source(id, e))?;

    info!(stream = %id, marker, position, changes = emitted, "log-based sync completed");
    Ok(emitted)
}

/// Replace an unusable marker with a fresh full snapshot under a new
/// version, for this stream only.
async fn resnapshot(
    ctx: &mut SyncContext<'_>,
    stream: &Stream,
    bookmark: &mut Bookmark,
) -> Result<u64, TapError> {
    bookmark.version = ctx.clock.now().timestamp_millis();
    bookmark.initial_full_table_complete = false;
    bookmark.detail = BookmarkDetail::LogBased(LogBasedBookmark::default());
    initial_snapshot(ctx, stream, bookmark).await
}

/// Run the full-table engine to seed the stream, with the tracking marker
/// captured before the snapshot read.
async fn initial_snapshot(
    ctx: &mut SyncContext<'_>,
    stream: &Stream,
    bookmark: &mut Bookmark,
) -> Result<u64, TapError> {
    let id = &stream.id;

    let needs_marker = matches!(
        &bookmark.detail,
        BookmarkDetail::LogBased(lb) if lb.current_log_version.is_none()
    );
    if needs_marker {
        let position = ctx
            .source
            .current_change_version(stream)
            .await
            .map_err(|e| classify(e, id))?;
        if let BookmarkDetail::LogBased(lb) = &mut bookmark.detail {
            lb.current_log_version = Some(position);
        }
        info!(stream = %id, position, "seeded change tracking marker before initial snapshot");
    }

    full::run_full_table_sync(ctx, stream, bookmark).await
}
