//! Types shared across the remote storage boundary.

use crate::{DataFormat, DeliveryError, StreamLabel, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload handed to remote storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    /// A recording such as an image or audio clip.
    File { bytes: Vec<u8> },
    /// A batch of tabular rows.
    Records { rows: Vec<serde_json::Value> },
}

impl Artifact {
    /// Build the artifact for a terminal unit on a stream of `format`.
    pub fn from_value(format: DataFormat, value: &Value) -> Self {
        if format.is_record() {
            return Artifact::journal(std::iter::once(value));
        }

        let bytes = match value {
            Value::Bytes(bytes) => bytes.clone(),
            Value::Text(text) => text.clone().into_bytes(),
            other => other.to_json().to_string().into_bytes(),
        };
        Artifact::File { bytes }
    }

    /// One record batch holding the rows of every value, in order.
    pub fn journal<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let rows = values
            .into_iter()
            .flat_map(|value| match value {
                Value::Array(items) => items.iter().map(Value::to_json).collect(),
                other => vec![other.to_json()],
            })
            .collect();
        Artifact::Records { rows }
    }

    pub fn size(&self) -> usize {
        match self {
            Artifact::File { bytes } => bytes.len(),
            Artifact::Records { rows } => rows.iter().map(|row| row.to_string().len()).sum(),
        }
    }
}

/// A terminal output on its way to remote storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryUnit {
    pub graph: String,
    pub container: String,
    pub origin: StreamLabel,
    /// Monotonically increasing per stream.
    pub sequence: u64,
    pub format: DataFormat,
    pub artifact: Artifact,
    pub produced_at: DateTime<Utc>,
    /// Data units carried; more than one for a journal batch.
    #[serde(default = "one_unit")]
    pub units: u64,
    /// Failed write attempts so far.
    pub attempts: u32,
}

fn one_unit() -> u64 {
    1
}

impl DeliveryUnit {
    /// Deterministic object name, so re-delivery overwrites instead of duplicating.
    pub fn blob_name(&self) -> String {
        format!(
            "{}.{}.{}.{}.{:010}.{}",
            self.graph,
            self.origin.node,
            self.origin.stream,
            self.produced_at.format("%Y%m%dT%H%M%S%3f"),
            self.sequence,
            self.format.extension()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acknowledged by remote storage.
    Delivered,
    /// Accepted by the background delivery task.
    Queued,
    /// Retries exhausted; held in the in-memory spill buffer.
    Spilled,
}

/// Boundary to remote durable storage.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn put(
        &self,
        container: &str,
        blob_name: &str,
        artifact: &Artifact,
        sequence: u64,
    ) -> Result<(), DeliveryError>;

    /// Cheap reachability probe used before redelivering spilled units.
    async fn check_connection(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_streams_become_row_batches() {
        let value = Value::from_json(serde_json::json!({"temp": 20.0}));
        let artifact = Artifact::from_value(DataFormat::Csv, &value);
        assert_eq!(
            artifact,
            Artifact::Records {
                rows: vec![serde_json::json!({"temp": 20.0})]
            }
        );
    }

    #[test]
    fn journal_flattens_rows_of_every_value() {
        let values = vec![
            Value::from(1.5),
            Value::Array(vec![Value::from(2.0), Value::from(3.0)]),
        ];
        let artifact = Artifact::journal(&values);
        assert_eq!(
            artifact,
            Artifact::Records {
                rows: vec![
                    serde_json::json!(1.5),
                    serde_json::json!(2.0),
                    serde_json::json!(3.0)
                ]
            }
        );
    }

    #[test]
    fn blob_name_is_stable_per_sequence() {
        use chrono::TimeZone;

        let unit = DeliveryUnit {
            graph: "climate".to_string(),
            container: "raw".to_string(),
            origin: StreamLabel::new("cam", 2),
            sequence: 42,
            format: DataFormat::Jpg,
            artifact: Artifact::from_value(DataFormat::Jpg, &Value::Bytes(vec![1, 2])),
            produced_at: Utc.with_ymd_and_hms(2026, 5, 1, 12, 30, 0).unwrap(),
            units: 1,
            attempts: 0,
        };
        assert_eq!(
            unit.blob_name(),
            "climate.cam.2.20260501T123000000.0000000042.jpg"
        );
        assert_eq!(unit.artifact.size(), 2);
    }
}
