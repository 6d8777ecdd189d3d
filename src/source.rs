//! Source database boundary.
//!
//! The engine never talks to a driver directly; it reads through
//! [`SourceConnector`], which a real driver implements per source database.
//! The crate ships a deterministic in-memory implementation in
//! [`crate::testing`] so the replication state machines can be driven in
//! tests without a live database.

use crate::catalog::Stream;
use crate::error::Capability;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row as read from the source, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Operation reported by the source's change-tracking facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Upsert,
    Delete,
}

/// A single tracked change. Deletes carry key columns only; the row payload
/// is gone by the time the change is read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub op: ChangeOp,
    pub keys: Row,
    #[serde(default)]
    pub row: Option<Row>,
}

/// Driver-boundary failure, classified by [`crate::error::classify`] into a
/// stream-attributed [`crate::error::TapError`].
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("permission denied for {capability}")]
    PermissionDenied { capability: Capability },

    #[error("object does not exist")]
    ObjectMissing,

    #[error("change marker {requested} is below the minimum retained marker {min_valid}")]
    InvalidChangeMarker { requested: i64, min_valid: i64 },

    #[error("login failed for principal {principal}")]
    AuthenticationFailed { principal: String },

    #[error("{0}")]
    Other(String),
}

/// Read access to one source database, one connection, no concurrent
/// cursors. All reads are bounded and ordered so the engine can checkpoint
/// between batches.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// The maximum primary-key tuple currently in the table, or `None` when
    /// the table is empty. Captured at full-pass start to bound the
    /// snapshot.
    async fn max_primary_key(&self, stream: &Stream)
        -> Result<Option<Vec<Value>>, SourceError>;

    /// Rows with primary key strictly greater than `after` (from the
    /// beginning when `None`) and at most `upper`, in ascending primary-key
    /// order, at most `limit` rows.
    async fn read_key_range(
        &self,
        stream: &Stream,
        after: Option<&[Value]>,
        upper: &[Value],
        limit: usize,
    ) -> Result<Vec<Row>, SourceError>;

    /// Rows with replication-key value strictly greater than `value` (all
    /// rows when `None`), ascending by that key with the primary key as the
    /// tie-break, at most `limit` rows. When `after_pk` is given, rows
    /// sharing `value` exactly are also returned if their primary key is
    /// greater, so a page boundary inside a group of rows with equal key
    /// values does not skip the rest of the group.
    async fn read_after_key(
        &self,
        stream: &Stream,
        key: &str,
        value: Option<&Value>,
        after_pk: Option<&[Value]>,
        limit: usize,
    ) -> Result<Vec<Row>, SourceError>;

    /// Whether change tracking is enabled for this stream's database and
    /// table.
    async fn change_tracking_enabled(&self, stream: &Stream) -> Result<bool, SourceError>;

    /// The source's current change-tracking position for this stream.
    async fn current_change_version(&self, stream: &Stream) -> Result<i64, SourceError>;

    /// The oldest change-tracking marker the source still retains, or `None`
    /// when the source does not expose one. Markers below it have been
    /// purged.
    async fn min_valid_change_version(
        &self,
        stream: &Stream,
    ) -> Result<Option<i64>, SourceError>;

    /// All changes recorded after `since`, in the order the source recorded
    /// them.
    async fn read_changes(&self, stream: &Stream, since: i64)
        -> Result<Vec<Change>, SourceError>;
}

/// Time source for version generation, injectable so tests are
/// deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
