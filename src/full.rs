//! Full-table sync engine.
//!
//! Emits every row of a table ordered by primary key ascending, in bounded
//! batches, interleaving bookmark checkpoints so an interrupted pass resumes
//! mid-table. The maximum primary-key tuple captured at pass start bounds
//! the snapshot: concurrent inserts beyond it are excluded from this pass
//! and picked up by the next run.

use crate::catalog::Stream;
use crate::error::{classify, TapError};
use crate::message::Message;
use crate::state::Bookmark;
use crate::sync::SyncContext;
use crate::value::compare_key_tuple;
use std::cmp::Ordering;
use tracing::{debug, info};

/// Run one full pass (new or resumed) over the table, then activate the
/// bookmark's version. Also used by the log-based engine for its initial
/// snapshot; the pagination fields live in the bookmark's snapshot fields
/// either way.
pub async fn run_full_table_sync(
    ctx: &mut SyncContext<'_>,
    stream: &Stream,
    bookmark: &mut Bookmark,
) -> Result<u64, TapError> {
    let id = &stream.id;
    let version = bookmark.version;

    // Reuse the boundary of an interrupted pass; capture a fresh one
    // otherwise.
    let max_pk = match bookmark.snapshot_fields().and_then(|ft| ft.max_pk_values.clone()) {
        Some(max) => Some(max),
        None => ctx
            .source
            .max_primary_key(stream)
            .await
            .map_err(|e| classify(e, id))?,
    };

    let Some(max_pk) = max_pk else {
        // Empty table: the pass completes immediately, still activating the
        // version so the consumer cuts over to an empty generation.
        finish_pass(ctx, stream, bookmark, version, 0).await?;
        return Ok(0);
    };

    if let Some(ft) = bookmark.snapshot_fields_mut() {
        ft.max_pk_values = Some(max_pk.clone());
    }

    let pk_types = stream.pk_types();
    let mut emitted: u64 = 0;

    loop {
        let after = bookmark
            .snapshot_fields()
            .and_then(|ft| ft.last_pk_fetched.clone());
        let rows = ctx
            .source
            .read_key_range(stream, after.as_deref(), &max_pk, ctx.opts.batch_size)
            .await
            .map_err(|e| classify(e, id))?;
        if rows.is_empty() {
            break;
        }

        let batch_len = rows.len();
        let mut last_pk = None;
        for row in rows {
            let pk = stream.pk_tuple(&row);
            ctx.sink
                .emit(Message::Upsert {
                    stream: id.to_string(),
                    version,
                    record: stream.emitted_row(&row),
                })
                .map_err(|e| TapError::source(id, e))?;
            last_pk = Some(pk);
            emitted += 1;
        }

        let reached_boundary = last_pk
            .as_ref()
            .map(|pk| compare_key_tuple(pk, &max_pk, &pk_types) != Ordering::Less)
            .unwrap_or(false);
        if let (Some(ft), Some(pk)) = (bookmark.snapshot_fields_mut(), last_pk) {
            ft.last_pk_fetched = Some(pk);
        }
        ctx.checkpoint(id, bookmark)
            .await
            .map_err(|e| TapError::source(id, e))?;
        debug!(stream = %id, emitted, "checkpointed full-pass batch");

        if batch_len < ctx.opts.batch_size || reached_boundary {
            break;
        }
    }

    finish_pass(ctx, stream, bookmark, version, emitted).await?;
    Ok(emitted)
}

/// Mark the pass complete, clear the pagination fields, and signal the
/// consumer to cut over to this generation.
async fn finish_pass(
    ctx: &mut SyncContext<'_>,
    stream: &Stream,
    bookmark: &mut Bookmark,
    version: i64,
    emitted: u64,
) -> Result<(), TapError> {
    let id = &stream.id;

    bookmark.initial_full_table_complete = true;
    if let Some(ft) = bookmark.snapshot_fields_mut() {
        ft.last_pk_fetched = None;
        ft.max_pk_values = None;
    }

    ctx.sink
        .emit(Message::ActivateVersion {
            stream: id.to_string(),
            version,
        })
        .map_err(|e| TapError::source(id, e))?;
    ctx.checkpoint(id, bookmark)
        .await
        .map_err(|e| TapError::source(id, e))?;

    info!(stream = %id, version, records = emitted, "full table pass completed");
    Ok(())
}
