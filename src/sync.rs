//! Run orchestration.
//!
//! Streams are processed sequentially over a single source connection:
//! bookmark checkpoints and version-activation signals must be strictly
//! ordered per stream, and the source is not assumed to support concurrent
//! cursors. Configuration and empty-catalog failures abort the whole run
//! before any row is read; a failure while syncing one stream is recorded
//! and the remaining streams still run, with every completed stream's
//! checkpoints left intact.

use crate::catalog::{Catalog, Stream, StreamId};
use crate::checkpoint::StateStore;
use crate::error::TapError;
use crate::full;
use crate::incremental;
use crate::log_based;
use crate::message::{Message, MessageSink};
use crate::plan::{plan_stream, SyncStrategy};
use crate::source::{Clock, SourceConnector};
use crate::state::{validate_bookmark, Bookmark, TapState};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct SyncOpts {
    /// Rows per read batch; the bookmark is checkpointed after each batch.
    pub batch_size: usize,
}

impl Default for SyncOpts {
    fn default() -> Self {
        SyncOpts { batch_size: 1000 }
    }
}

/// Shared collaborators for one run, threaded through the engines.
pub struct SyncContext<'a> {
    pub source: &'a dyn SourceConnector,
    pub sink: &'a mut dyn MessageSink,
    pub store: &'a dyn StateStore,
    pub clock: &'a dyn Clock,
    pub state: &'a mut TapState,
    pub opts: SyncOpts,
}

impl SyncContext<'_> {
    /// Install the stream's bookmark, persist the blob durably, and report
    /// the current state snapshot downstream.
    pub async fn checkpoint(&mut self, id: &StreamId, bookmark: &Bookmark) -> anyhow::Result<()> {
        self.state.insert(id, bookmark.clone());
        self.store.persist(self.state).await?;
        self.sink.emit(Message::state(self.state)?)?;
        Ok(())
    }
}

/// A stream-scoped failure recorded during the run.
#[derive(Debug)]
pub struct StreamFailure {
    pub stream: String,
    pub error: TapError,
}

/// Outcome of one run, for the orchestrator's exit-status policy.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub streams_completed: usize,
    pub records: u64,
    pub failed: Vec<StreamFailure>,
}

impl SyncReport {
    pub fn ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sync every selected stream in the catalog, sequentially.
///
/// Returns `Err` only for run-fatal failures (configuration, empty catalog,
/// checkpoint storage); stream-scoped failures land in the report.
#[allow(clippy::too_many_arguments)]
pub async fn run_sync(
    catalog: &Catalog,
    state: &mut TapState,
    source: &dyn SourceConnector,
    sink: &mut dyn MessageSink,
    store: &dyn StateStore,
    clock: &dyn Clock,
    opts: SyncOpts,
) -> anyhow::Result<SyncReport> {
    let selected = catalog.selected_streams();
    if selected.is_empty() {
        return Err(TapError::EmptyCatalog.into());
    }

    // Configuration and state-consistency failures abort before any row is
    // read, with no partial state mutation.
    for stream in &selected {
        stream.validate().map_err(anyhow::Error::from)?;
        if let Some(bookmark) = state.get(&stream.id) {
            validate_bookmark(bookmark, stream)?;
        }
    }

    // Report the prior (loaded) snapshot before any mutation.
    sink.emit(Message::state(state)?)?;

    let mut report = SyncReport::default();
    {
        let mut ctx = SyncContext {
            source,
            sink: &mut *sink,
            store,
            clock,
            state: &mut *state,
            opts,
        };

        for stream in &selected {
            info!(
                stream = %stream.id,
                method = %stream.replication_method,
                "syncing stream"
            );
            match sync_stream(&mut ctx, stream).await {
                Ok(records) => {
                    info!(stream = %stream.id, records, "stream sync completed");
                    report.streams_completed += 1;
                    report.records += records;
                }
                Err(err) => {
                    error!(stream = %stream.id, error = %err, "stream sync failed");
                    report.failed.push(StreamFailure {
                        stream: stream.id.to_string(),
                        error: err,
                    });
                }
            }
        }
    }

    store.persist(state).await?;
    sink.emit(Message::state(state)?)?;

    info!(
        streams = report.streams_completed,
        records = report.records,
        failed = report.failed.len(),
        "run completed"
    );
    Ok(report)
}

async fn sync_stream(ctx: &mut SyncContext<'_>, stream: &Stream) -> Result<u64, TapError> {
    let prior = ctx.state.get(&stream.id).cloned();
    let plan = plan_stream(ctx.source, ctx.clock, stream, prior.as_ref()).await?;

    ctx.sink
        .emit(Message::schema(stream))
        .map_err(|e| TapError::source(&stream.id, e))?;

    let mut bookmark = plan.bookmark;
    match plan.strategy {
        SyncStrategy::FullTable => full::run_full_table_sync(ctx, stream, &mut bookmark).await,
        SyncStrategy::Incremental { key } => {
            incremental::run_incremental_sync(ctx, stream, &mut bookmark, &key).await
        }
        SyncStrategy::LogBased => log_based::run_log_based_sync(ctx, stream, &mut bookmark).await,
    }
}
