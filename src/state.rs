//! Per-stream bookmarks and the run-scoped state blob.
//!
//! A [`Bookmark`] records resumable progress for one stream. Fields shared
//! by every replication method live on the bookmark itself; method-specific
//! fields live in a tagged [`BookmarkDetail`] so a bookmark can never carry
//! stale fields from a method it is not using. The whole [`TapState`] is
//! persisted as an opaque JSON blob between runs and merged with prior state
//! on load, preserving bookmarks for streams not touched in the current run.

use crate::catalog::{ReplicationMethod, Stream, StreamId};
use crate::value::compare_key_tuple;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Pagination progress of a full-table pass. Present only mid-flight;
/// cleared once the pass completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullTableBookmark {
    /// The key tuple most recently emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pk_fetched: Option<Vec<Value>>,
    /// The key tuple bounding the snapshot taken at pass start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pk_values: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncrementalBookmark {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_key_name: Option<String>,
    /// Maximum replication-key value observed so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_key_value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogBasedBookmark {
    /// Change-tracking marker as of the last successful read. Monotonically
    /// non-decreasing. Seeded before the initial snapshot so changes made
    /// during the snapshot land in the first tracking read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_log_version: Option<i64>,
    /// Progress of the initial (or forced) full snapshot.
    #[serde(flatten)]
    pub snapshot: FullTableBookmark,
}

/// Method-specific bookmark fields, tagged by replication method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "replication", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookmarkDetail {
    FullTable(FullTableBookmark),
    Incremental(IncrementalBookmark),
    LogBased(LogBasedBookmark),
}

impl BookmarkDetail {
    pub fn empty(method: ReplicationMethod) -> Self {
        match method {
            ReplicationMethod::FullTable => BookmarkDetail::FullTable(Default::default()),
            ReplicationMethod::Incremental => BookmarkDetail::Incremental(Default::default()),
            ReplicationMethod::LogBased => BookmarkDetail::LogBased(Default::default()),
        }
    }

    pub fn method(&self) -> ReplicationMethod {
        match self {
            BookmarkDetail::FullTable(_) => ReplicationMethod::FullTable,
            BookmarkDetail::Incremental(_) => ReplicationMethod::Incremental,
            BookmarkDetail::LogBased(_) => ReplicationMethod::LogBased,
        }
    }
}

/// Resumable progress for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Generation identifier of the current full extraction; changes only
    /// when a full re-extraction is forced.
    pub version: i64,
    /// False until the first complete pass over the stream finishes.
    #[serde(default)]
    pub initial_full_table_complete: bool,
    /// Method used in the prior run, for detecting method transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_replication_method: Option<ReplicationMethod>,
    #[serde(flatten)]
    pub detail: BookmarkDetail,
}

impl Bookmark {
    pub fn new(version: i64, method: ReplicationMethod) -> Self {
        Bookmark {
            version,
            initial_full_table_complete: false,
            last_replication_method: None,
            detail: BookmarkDetail::empty(method),
        }
    }

    pub fn method(&self) -> ReplicationMethod {
        self.detail.method()
    }

    /// Full-pass pagination fields, whether the bookmark belongs to a
    /// `FULL_TABLE` stream or to a `LOG_BASED` stream mid initial snapshot.
    pub fn snapshot_fields(&self) -> Option<&FullTableBookmark> {
        match &self.detail {
            BookmarkDetail::FullTable(ft) => Some(ft),
            BookmarkDetail::LogBased(lb) => Some(&lb.snapshot),
            BookmarkDetail::Incremental(_) => None,
        }
    }

    pub fn snapshot_fields_mut(&mut self) -> Option<&mut FullTableBookmark> {
        match &mut self.detail {
            BookmarkDetail::FullTable(ft) => Some(ft),
            BookmarkDetail::LogBased(lb) => Some(&mut lb.snapshot),
            BookmarkDetail::Incremental(_) => None,
        }
    }

    /// True while a full pass over the stream is mid-flight.
    pub fn mid_full_pass(&self) -> bool {
        self.snapshot_fields()
            .map_or(false, |ft| ft.last_pk_fetched.is_some())
    }
}

/// Validate a loaded bookmark against the stream it belongs to.
///
/// Inconsistent bookmarks are reported, not silently repaired: a stream is
/// never simultaneously mid full pass and complete, mid-pass progress never
/// exceeds the snapshot boundary, and incremental key values never appear
/// without their key name.
pub fn validate_bookmark(bookmark: &Bookmark, stream: &Stream) -> anyhow::Result<()> {
    let id = &stream.id;

    if let Some(ft) = bookmark.snapshot_fields() {
        if ft.last_pk_fetched.is_some() && bookmark.initial_full_table_complete {
            anyhow::bail!(
                "bookmark for {id} is both mid full pass and marked complete"
            );
        }
        match (&ft.last_pk_fetched, &ft.max_pk_values) {
            (Some(_), None) => {
                anyhow::bail!("bookmark for {id} has pagination progress but no snapshot boundary")
            }
            (Some(last), Some(max)) => {
                let types = stream.pk_types();
                if compare_key_tuple(last, max, &types) == std::cmp::Ordering::Greater {
                    anyhow::bail!(
                        "bookmark for {id} has pagination progress beyond the snapshot boundary"
                    );
                }
            }
            _ => {}
        }
    }

    if let BookmarkDetail::Incremental(inc) = &bookmark.detail {
        if inc.replication_key_value.is_some() && inc.replication_key_name.is_none() {
            anyhow::bail!(
                "bookmark for {id} has a replication key value but no replication key name"
            );
        }
    }

    Ok(())
}

/// Mapping from stream identifier to its bookmark, persisted as one blob.
///
/// Absence of a stream's entry is equivalent to "never synced".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapState {
    #[serde(default)]
    pub bookmarks: BTreeMap<String, Bookmark>,
}

impl TapState {
    pub fn get(&self, id: &StreamId) -> Option<&Bookmark> {
        self.bookmarks.get(&id.to_string())
    }

    pub fn insert(&mut self, id: &StreamId, bookmark: Bookmark) {
        self.bookmarks.insert(id.to_string(), bookmark);
    }

    /// Take over bookmarks from a prior run for streams this state does not
    /// know about yet, so untouched streams keep their progress.
    pub fn merge_prior(&mut self, prior: TapState) {
        for (key, bookmark) in prior.bookmarks {
            self.bookmarks.entry(key).or_insert(bookmark);
        }
    }
}
