//! Typed failures surfaced by the replication engine.
//!
//! Driver-level failures cross the source boundary as
//! [`crate::source::SourceError`] and are classified here into engine
//! outcomes that always name the offending database, schema, and table.

use crate::catalog::StreamId;
use crate::source::SourceError;
use serde::{Deserialize, Serialize};

/// A capability the configured principal may lack on a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Select,
    ViewChangeTracking,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::Select => "SELECT",
            Capability::ViewChangeTracking => "VIEW CHANGE TRACKING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TapError {
    /// Illegal method/key combination. Fatal to the whole run, before any
    /// row is read.
    #[error("configuration error for stream {stream}: {reason}")]
    Configuration { stream: String, reason: String },

    /// Fatal to the stream; the stream's prior bookmark is left untouched.
    #[error(
        "permission denied: the configured principal lacks {capability} on {database}.{schema}.{table}"
    )]
    PermissionDenied {
        capability: Capability,
        database: String,
        schema: String,
        table: String,
    },

    /// The recorded change-tracking marker fell outside the source's
    /// retention window. Recoverable via a fresh snapshot of that stream.
    #[error("change tracking marker for {stream} is no longer valid; a fresh full snapshot is required")]
    InvalidChangeMarker { stream: String },

    /// Fatal to the stream for this run. The catalog entry is retained since
    /// the table may reappear.
    #[error("object {database}.{schema}.{table} does not exist or is not visible")]
    ObjectMissing {
        database: String,
        schema: String,
        table: String,
    },

    #[error("authentication failed for principal {principal}")]
    AuthenticationFailed { principal: String },

    /// Discovery found zero accessible streams. Fatal to the whole run.
    #[error("discovery found no accessible streams in the catalog")]
    EmptyCatalog,

    /// Any other source failure, attributed to the stream being processed.
    #[error("source failure on stream {stream}: {message}")]
    Source { stream: String, message: String },
}

impl TapError {
    pub fn source(stream: &StreamId, err: impl std::fmt::Display) -> Self {
        TapError::Source {
            stream: stream.to_string(),
            message: err.to_string(),
        }
    }
}

/// Map a driver-level failure to a typed engine outcome attributed to the
/// stream being processed.
pub fn classify(err: SourceError, stream: &StreamId) -> TapError {
    match err {
        SourceError::PermissionDenied { capability } => TapError::PermissionDenied {
            capability,
            database: stream.database.clone(),
            schema: stream.schema.clone(),
            table: stream.table.clone(),
        },
        SourceError::ObjectMissing => TapError::ObjectMissing {
            database: stream.database.clone(),
            schema: stream.schema.clone(),
            table: stream.table.clone(),
        },
        SourceError::InvalidChangeMarker { .. } => TapError::InvalidChangeMarker {
            stream: stream.to_string(),
        },
        SourceError::AuthenticationFailed { principal } => {
            TapError::AuthenticationFailed { principal }
        }
        SourceError::Other(message) => TapError::Source {
            stream: stream.to_string(),
            message,
        },
    }
}
