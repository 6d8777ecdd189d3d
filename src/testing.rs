//! Deterministic collaborators for driving the engine without a live
//! database.
//!
//! [`FixtureSource`] is a serde-loadable, in-memory [`SourceConnector`]
//! with per-table rows, a change log, grant flags, and drop simulation, so
//! the replication state machines can be exercised end to end. The same
//! type backs the `rowtap sync --fixture` CLI path and the integration
//! tests, together with [`RecordedSink`] and [`FixedClock`].

use crate::catalog::{
    Column, DataType, Inclusion, ReplicationMethod, Stream, StreamId,
};
use crate::error::Capability;
use crate::message::{Message, MessageSink};
use crate::source::{Change, ChangeOp, Clock, Row, SourceConnector, SourceError};
use crate::value::{compare_key_tuple, compare_typed};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Table-level grants for the configured principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grants {
    #[serde(default = "default_true")]
    pub select: bool,
    #[serde(default = "default_true")]
    pub view_change_tracking: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Grants {
    fn default() -> Self {
        Grants {
            select: true,
            view_change_tracking: true,
        }
    }
}

/// One recorded change-tracking entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureChange {
    pub version: i64,
    pub op: ChangeOp,
    pub keys: Row,
    #[serde(default)]
    pub row: Option<Row>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureTable {
    #[serde(default)]
    pub rows: Vec<Row>,
    /// Whether change tracking is enabled on this table.
    #[serde(default)]
    pub change_tracking: bool,
    #[serde(default)]
    pub changes: Vec<FixtureChange>,
    /// The source's current change-tracking position.
    #[serde(default)]
    pub current_version: i64,
    /// Oldest marker still retained; entries below it have been purged.
    #[serde(default)]
    pub min_valid_version: i64,
    /// When set the source does not expose its retention floor and purged
    /// markers only surface when a read is attempted.
    #[serde(default)]
    pub hidden_retention_floor: bool,
    #[serde(default)]
    pub grants: Grants,
    /// Simulates the table being dropped between check and sync.
    #[serde(default)]
    pub dropped: bool,
}

/// In-memory source database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureSource {
    /// Tables keyed by `database.schema.table`.
    #[serde(default)]
    pub tables: HashMap<String, FixtureTable>,
    /// When set, every operation fails authentication for this principal.
    #[serde(default)]
    pub failed_principal: Option<String>,
}

impl FixtureSource {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let blob = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&blob)?)
    }

    pub fn table_mut(&mut self, id: &StreamId) -> &mut FixtureTable {
        self.tables.entry(id.to_string()).or_default()
    }

    pub fn with_rows(mut self, stream: &Stream, rows: Vec<Row>) -> Self {
        self.table_mut(&stream.id).rows = rows;
        self
    }

    pub fn with_tracking(mut self, id: &StreamId) -> Self {
        self.table_mut(id).change_tracking = true;
        self
    }

    /// Insert a row, recording a change-tracking entry and advancing the
    /// tracking position.
    pub fn insert_row(&mut self, stream: &Stream, row: Row) {
        let keys = stream.key_only(&row);
        let table = self.table_mut(&stream.id);
        table.current_version += 1;
        let version = table.current_version;
        table.rows.push(row.clone());
        table.changes.push(FixtureChange {
            version,
            op: ChangeOp::Upsert,
            keys,
            row: Some(row),
        });
    }

    /// Replace the row with the same primary key, recording a change entry.
    pub fn update_row(&mut self, stream: &Stream, row: Row) {
        let keys = stream.key_only(&row);
        let table = self.table_mut(&stream.id);
        table.current_version += 1;
        let version = table.current_version;
        for existing in table.rows.iter_mut() {
            if stream.key_only(existing) == keys {
                *existing = row.clone();
            }
        }
        table.changes.push(FixtureChange {
            version,
            op: ChangeOp::Upsert,
            keys,
            row: Some(row),
        });
    }

    /// Delete rows matching the key columns, recording a key-only change.
    pub fn delete_row(&mut self, stream: &Stream, keys: Row) {
        let table = self.table_mut(&stream.id);
        table.current_version += 1;
        let version = table.current_version;
        table.rows.retain(|row| stream.key_only(row) != keys);
        table.changes.push(FixtureChange {
            version,
            op: ChangeOp::Delete,
            keys,
            row: None,
        });
    }

    /// Simulate the source purging change-tracking entries below `version`.
    pub fn purge_changes_below(&mut self, id: &StreamId, version: i64) {
        let table = self.table_mut(id);
        table.min_valid_version = version;
        table.changes.retain(|c| c.version >= version);
    }

    fn guard_auth(&self) -> Result<(), SourceError> {
        match &self.failed_principal {
            Some(principal) => Err(SourceError::AuthenticationFailed {
                principal: principal.clone(),
            }),
            None => Ok(()),
        }
    }

    fn table(&self, id: &StreamId) -> Result<&FixtureTable, SourceError> {
        match self.tables.get(&id.to_string()) {
            Some(table) if !table.dropped => Ok(table),
            _ => Err(SourceError::ObjectMissing),
        }
    }

    fn guard_select(table: &FixtureTable) -> Result<(), SourceError> {
        if table.grants.select {
            Ok(())
        } else {
            Err(SourceError::PermissionDenied {
                capability: Capability::Select,
            })
        }
    }

    fn guard_view_change_tracking(table: &FixtureTable) -> Result<(), SourceError> {
        if table.grants.view_change_tracking {
            Ok(())
        } else {
            Err(SourceError::PermissionDenied {
                capability: Capability::ViewChangeTracking,
            })
        }
    }

    fn sorted_by_pk(&self, stream: &Stream, table: &FixtureTable) -> Vec<Row> {
        let types = stream.pk_types();
        let mut rows = table.rows.clone();
        rows.sort_by(|a, b| {
            compare_key_tuple(&stream.pk_tuple(a), &stream.pk_tuple(b), &types)
        });
        rows
    }
}

#[async_trait]
impl SourceConnector for FixtureSource {
    async fn max_primary_key(
        &self,
        stream: &Stream,
    ) -> Result<Option<Vec<Value>>, SourceError> {
        self.guard_auth()?;
        let table = self.table(&stream.id)?;
        Self::guard_select(table)?;
        let rows = self.sorted_by_pk(stream, table);
        Ok(rows.last().map(|row| stream.pk_tuple(row)))
    }

    async fn read_key_range(
        &self,
        stream: &Stream,
        after: Option<&[Value]>,
        upper: &[Value],
        limit: usize,
    ) -> Result<Vec<Row>, SourceError> {
        self.guard_auth()?;
        let table = self.table(&stream.id)?;
        Self::guard_select(table)?;

        let types = stream.pk_types();
        let mut out: Vec<Row> = self
            .sorted_by_pk(stream, table)
            .into_iter()
            .filter(|row| {
                let pk = stream.pk_tuple(row);
                let above = match after {
                    Some(after) => compare_key_tuple(&pk, after, &types) == Ordering::Greater,
                    None => true,
                };
                above && compare_key_tuple(&pk, upper, &types) != Ordering::Greater
            })
            .collect();
        out.truncate(limit);
        Ok(out)
    }

    async fn read_after_key(
        &self,
        stream: &Stream,
        key: &str,
        value: Option<&Value>,
        after_pk: Option<&[Value]>,
        limit: usize,
    ) -> Result<Vec<Row>, SourceError> {
        self.guard_auth()?;
        let table = self.table(&stream.id)?;
        Self::guard_select(table)?;

        let key_type = stream
            .column(key)
            .map(|c| c.datatype.clone())
            .unwrap_or(DataType::String);
        let pk_types = stream.pk_types();

        let mut out: Vec<Row> = table
            .rows
            .iter()
            .filter(|row| {
                let candidate = row.get(key).cloned().unwrap_or(Value::Null);
                match value {
                    Some(since) => match compare_typed(&candidate, since, &key_type) {
                        Ordering::Greater => true,
                        Ordering::Equal => after_pk.map_or(false, |after_pk| {
                            compare_key_tuple(&stream.pk_tuple(row), after_pk, &pk_types)
                                == Ordering::Greater
                        }),
                        Ordering::Less => false,
                    },
                    None => true,
                }
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            let ka = a.get(key).cloned().unwrap_or(Value::Null);
            let kb = b.get(key).cloned().unwrap_or(Value::Null);
            compare_typed(&ka, &kb, &key_type).then_with(|| {
                compare_key_tuple(&stream.pk_tuple(a), &stream.pk_tuple(b), &pk_types)
            })
        });
        out.truncate(limit);
        Ok(out)
    }

    async fn change_tracking_enabled(&self, stream: &Stream) -> Result<bool, SourceError> {
        self.guard_auth()?;
        Ok(self.table(&stream.id)?.change_tracking)
    }

    async fn current_change_version(&self, stream: &Stream) -> Result<i64, SourceError> {
        self.guard_auth()?;
        let table = self.table(&stream.id)?;
        Self::guard_view_change_tracking(table)?;
        Ok(table.current_version)
    }

    async fn min_valid_change_version(
        &self,
        stream: &Stream,
    ) -> Result<Option<i64>, SourceError> {
        self.guard_auth()?;
        let table = self.table(&stream.id)?;
        Self::guard_view_change_tracking(table)?;
        if table.hidden_retention_floor {
            return Ok(None);
        }
        Ok(Some(table.min_valid_version))
    }

    async fn read_changes(
        &self,
        stream: &Stream,
        since: i64,
    ) -> Result<Vec<Change>, SourceError> {
        self.guard_auth()?;
        let table = self.table(&stream.id)?;
        Self::guard_view_change_tracking(table)?;
        // Reading row payloads out of the change table needs SELECT on the
        // underlying table, same as the real facility.
        Self::guard_select(table)?;

        if since < table.min_valid_version {
            return Err(SourceError::InvalidChangeMarker {
                requested: since,
                min_valid: table.min_valid_version,
            });
        }

        let mut entries: Vec<&FixtureChange> =
            table.changes.iter().filter(|c| c.version > since).collect();
        entries.sort_by_key(|c| c.version);
        Ok(entries
            .into_iter()
            .map(|c| Change {
                op: c.op,
                keys: c.keys.clone(),
                row: c.row.clone(),
            })
            .collect())
    }
}

/// Sink that records every emitted message for inspection.
#[derive(Debug, Default)]
pub struct RecordedSink {
    pub messages: Vec<Message>,
}

impl MessageSink for RecordedSink {
    fn emit(&mut self, message: Message) -> anyhow::Result<()> {
        self.messages.push(message);
        Ok(())
    }
}

impl RecordedSink {
    pub fn upserts(&self, stream: &str) -> Vec<&Row> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Upsert { stream: s, record, .. } if s == stream => Some(record),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self, stream: &str) -> Vec<&Row> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Delete { stream: s, keys, .. } if s == stream => Some(keys),
                _ => None,
            })
            .collect()
    }

    pub fn activations(&self, stream: &str) -> Vec<i64> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::ActivateVersion { stream: s, version } if s == stream => Some(*version),
                _ => None,
            })
            .collect()
    }
}

/// Clock pinned to one instant.
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn from_millis(millis: i64) -> Self {
        FixedClock(
            Utc.timestamp_millis_opt(millis)
                .single()
                .expect("valid timestamp"),
        )
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A small selected stream over `app.dbo.users` with an integer primary
/// key, used across the test suite.
pub fn test_stream(method: ReplicationMethod) -> Stream {
    let replication_key = match method {
        ReplicationMethod::Incremental => Some("updated_at".to_string()),
        _ => None,
    };
    Stream {
        id: StreamId::new("app", "dbo", "users"),
        columns: vec![
            Column {
                name: "id".to_string(),
                datatype: DataType::Integer,
                inclusion: Inclusion::Automatic,
                selected_by_default: true,
                selected: None,
            },
            Column {
                name: "name".to_string(),
                datatype: DataType::String,
                inclusion: Inclusion::Available,
                selected_by_default: true,
                selected: None,
            },
            Column {
                name: "updated_at".to_string(),
                datatype: DataType::DateTime,
                inclusion: Inclusion::Available,
                selected_by_default: true,
                selected: None,
            },
            Column {
                name: "raw".to_string(),
                datatype: DataType::SourceSpecific("hierarchyid".to_string()),
                inclusion: Inclusion::Unsupported,
                selected_by_default: false,
                selected: None,
            },
        ],
        primary_keys: vec!["id".to_string()],
        foreign_keys: vec![],
        replication_method: method,
        replication_key,
        selected: true,
    }
}

/// Build a row with an integer id and a name.
pub fn row(id: i64, name: &str) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), serde_json::json!(id));
    row.insert("name".to_string(), serde_json::json!(name));
    row
}

/// Build a row carrying an `updated_at` replication-key value.
pub fn row_at(id: i64, name: &str, updated_at: &str) -> Row {
    let mut row = row(id, name);
    row.insert("updated_at".to_string(), serde_json::json!(updated_at));
    row
}
