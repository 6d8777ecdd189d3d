//! Catalog model: discovered streams, their columns, and selection metadata.
//!
//! The catalog is produced by the discovery layer and consumed read-only by
//! the engine for one run. Selection metadata (selected streams and columns,
//! replication-method and replication-key overrides) is applied by the
//! operator before the catalog reaches the engine.

use crate::error::TapError;
use crate::source::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three supported extraction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMethod {
    FullTable,
    Incremental,
    LogBased,
}

impl std::fmt::Display for ReplicationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicationMethod::FullTable => "FULL_TABLE",
            ReplicationMethod::Incremental => "INCREMENTAL",
            ReplicationMethod::LogBased => "LOG_BASED",
        };
        f.write_str(s)
    }
}

/// Inclusion class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inclusion {
    /// Always emitted; key columns are classified automatic by discovery.
    Automatic,
    /// Emitted when selected.
    Available,
    /// Present in the schema but never emitted in record payloads.
    Unsupported,
}

/// Normalized datatype tag for a column.
///
/// Generic across source databases so the engine can order key values
/// consistently between full and incremental reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    Decimal {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    String,
    Bytes,
    Date,
    Time,
    DateTime,
    /// Monotonic binary counter, carried as a fixed-width lowercase hex
    /// string so lexical order equals byte order.
    RowVersion,
    Uuid,
    /// Source-specific type the engine cannot convert or order.
    SourceSpecific(String),
}

impl DataType {
    pub fn is_supported(&self) -> bool {
        !matches!(self, DataType::SourceSpecific(_))
    }
}

/// Fully qualified stream identifier: database.schema.table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl StreamId {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        StreamId {
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.schema, self.table)
    }
}

/// A discovered column with its selection metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub datatype: DataType,
    pub inclusion: Inclusion,
    #[serde(default = "default_true")]
    pub selected_by_default: bool,
    /// Operator override; falls back to `selected_by_default` when unset.
    #[serde(default)]
    pub selected: Option<bool>,
}

fn default_true() -> bool {
    true
}

impl Column {
    /// Whether this column appears in emitted record payloads.
    pub fn is_emitted(&self) -> bool {
        match self.inclusion {
            Inclusion::Automatic => true,
            Inclusion::Unsupported => false,
            Inclusion::Available => self.selected.unwrap_or(self.selected_by_default),
        }
    }
}

/// A discovered stream plus its per-run selection metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub columns: Vec<Column>,
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<String>,
    pub replication_method: ReplicationMethod,
    /// Column used to order and bound incremental reads. Only meaningful for
    /// `INCREMENTAL` streams; a stream has at most one.
    #[serde(default)]
    pub replication_key: Option<String>,
    #[serde(default)]
    pub selected: bool,
}

impl Stream {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Datatypes of the primary-key columns, in key order.
    pub fn pk_types(&self) -> Vec<DataType> {
        self.primary_keys
            .iter()
            .map(|name| {
                self.column(name)
                    .map(|c| c.datatype.clone())
                    .unwrap_or(DataType::String)
            })
            .collect()
    }

    /// Primary-key tuple of a row, in key order. Missing columns read as null.
    pub fn pk_tuple(&self, row: &Row) -> Vec<Value> {
        self.primary_keys
            .iter()
            .map(|name| row.get(name).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Project a row down to the columns that are emitted for this stream.
    pub fn emitted_row(&self, row: &Row) -> Row {
        let mut out = Row::new();
        for column in &self.columns {
            if !column.is_emitted() {
                continue;
            }
            if let Some(value) = row.get(&column.name) {
                out.insert(column.name.clone(), value.clone());
            }
        }
        out
    }

    /// Project a row down to its primary-key columns only. Used for delete
    /// actions, which carry no payload beyond the keys.
    pub fn key_only(&self, row: &Row) -> Row {
        let mut out = Row::new();
        for name in &self.primary_keys {
            out.insert(
                name.clone(),
                row.get(name).cloned().unwrap_or(Value::Null),
            );
        }
        out
    }

    /// Validate the stream's method/key configuration.
    ///
    /// Illegal combinations are fatal before any row is read.
    pub fn validate(&self) -> Result<(), TapError> {
        let config_err = |reason: String| TapError::Configuration {
            stream: self.id.to_string(),
            reason,
        };

        if self.primary_keys.is_empty() {
            return Err(config_err("stream has no primary key columns".into()));
        }
        for name in &self.primary_keys {
            match self.column(name) {
                None => {
                    return Err(config_err(format!(
                        "primary key column {name} is not in the column list"
                    )))
                }
                Some(c) if !c.datatype.is_supported() => {
                    return Err(config_err(format!(
                        "primary key column {name} has an unsupported type"
                    )))
                }
                Some(_) => {}
            }
        }

        if self.replication_method == ReplicationMethod::Incremental {
            match &self.replication_key {
                None => {
                    return Err(config_err(
                        "INCREMENTAL replication requires exactly one replication key".into(),
                    ))
                }
                Some(key) => match self.column(key) {
                    None => {
                        return Err(config_err(format!(
                            "replication key column {key} is not in the column list"
                        )))
                    }
                    Some(c) if !c.datatype.is_supported() => {
                        return Err(config_err(format!(
                            "replication key column {key} has an unsupported type"
                        )))
                    }
                    Some(_) => {}
                },
            }
        }

        // Automatic columns must be key columns of some kind.
        for column in &self.columns {
            if column.inclusion != Inclusion::Automatic {
                continue;
            }
            let is_key = self.primary_keys.contains(&column.name)
                || self.foreign_keys.contains(&column.name)
                || self.replication_key.as_deref() == Some(column.name.as_str());
            if !is_key {
                return Err(config_err(format!(
                    "column {} is classified automatic but is not a key column",
                    column.name
                )));
            }
        }

        Ok(())
    }
}

/// The full set of discovered streams for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<Stream>,
}

impl Catalog {
    pub fn selected_streams(&self) -> Vec<&Stream> {
        self.streams.iter().filter(|s| s.selected).collect()
    }
}
