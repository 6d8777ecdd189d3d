//! Output message model.
//!
//! The engine emits an ordered sequence of `schema`, `upsert`, `delete`,
//! `activate_version`, and `state` events per stream. The downstream
//! consumer applies upserts and deletes under the stream's current version
//! and atomically cuts over to a new generation only on `activate_version`.

use crate::catalog::Stream;
use crate::source::Row;
use crate::state::TapState;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Schema {
        stream: String,
        key_properties: Vec<String>,
        schema: serde_json::Value,
    },
    Upsert {
        stream: String,
        version: i64,
        record: Row,
    },
    /// Carries key columns only; the row payload is gone once the source
    /// reports the delete.
    Delete {
        stream: String,
        version: i64,
        keys: Row,
    },
    /// Emitted exactly once per completed full pass.
    ActivateVersion {
        stream: String,
        version: i64,
    },
    State {
        value: serde_json::Value,
    },
}

impl Message {
    /// Describe a stream's columns, including unsupported ones, which are
    /// counted in the schema even though they never appear in payloads.
    pub fn schema(stream: &Stream) -> Self {
        let mut properties = serde_json::Map::new();
        for column in &stream.columns {
            properties.insert(
                column.name.clone(),
                serde_json::json!({
                    "datatype": column.datatype,
                    "inclusion": column.inclusion,
                    "selected": column.is_emitted(),
                }),
            );
        }
        Message::Schema {
            stream: stream.id.to_string(),
            key_properties: stream.primary_keys.clone(),
            schema: serde_json::Value::Object(properties),
        }
    }

    pub fn state(state: &TapState) -> anyhow::Result<Self> {
        Ok(Message::State {
            value: serde_json::to_value(state)?,
        })
    }
}

/// Downstream consumer boundary. Messages must be emitted in order; the
/// sink is invoked from a single stream at a time.
pub trait MessageSink: Send {
    fn emit(&mut self, message: Message) -> anyhow::Result<()>;
}

/// Writes one JSON document per line, the wire format consumed by the
/// downstream loader.
pub struct JsonLinesSink<W: std::io::Write + Send> {
    out: W,
}

impl<W: std::io::Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        JsonLinesSink { out }
    }
}

impl<W: std::io::Write + Send> MessageSink for JsonLinesSink<W> {
    fn emit(&mut self, message: Message) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.out, &message)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}
