use crate::{GraphError, NodeId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage format of the data carried on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Df,
    Csv,
    Log,
    Jpg,
    Png,
    Mp4,
    Avi,
    H264,
    Wav,
    Txt,
    Yaml,
}

impl DataFormat {
    /// Record formats are delivered as record batches, everything else as files.
    pub fn is_record(&self) -> bool {
        matches!(self, DataFormat::Df | DataFormat::Csv | DataFormat::Log)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DataFormat::Df | DataFormat::Csv => "csv",
            DataFormat::Log => "log",
            DataFormat::Jpg => "jpg",
            DataFormat::Png => "png",
            DataFormat::Mp4 => "mp4",
            DataFormat::Avi => "avi",
            DataFormat::H264 => "h264",
            DataFormat::Wav => "wav",
            DataFormat::Txt => "txt",
            DataFormat::Yaml => "yaml",
        }
    }
}

/// A named, typed output slot on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    pub name: String,
    pub type_id: String,
    pub index: u32,
    pub format: DataFormat,
    pub destination_container: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_sample_rate() -> f64 {
    1.0
}

impl Stream {
    pub fn new(
        name: impl Into<String>,
        type_id: impl Into<String>,
        index: u32,
        format: DataFormat,
    ) -> Self {
        Self {
            name: name.into(),
            type_id: type_id.into(),
            index,
            format,
            destination_container: "edgeflow-upload".to_string(),
            sample_rate: default_sample_rate(),
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.destination_container = container.into();
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if !(0.0..=1.0).contains(&self.sample_rate) || self.sample_rate.is_nan() {
            return Err(GraphError::SampleRate {
                stream: self.name.clone(),
                rate: self.sample_rate,
            });
        }
        Ok(())
    }
}

/// Identifies one output stream of one node; the key used for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamLabel {
    pub node: NodeId,
    pub stream: u32,
}

impl StreamLabel {
    pub fn new(node: impl Into<NodeId>, stream: u32) -> Self {
        Self {
            node: node.into(),
            stream,
        }
    }
}

impl fmt::Display for StreamLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.stream)
    }
}

/// One unit of data travelling along a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUnit {
    pub value: Value,
    pub produced_at: DateTime<Utc>,
    pub origin: StreamLabel,
}

impl DataUnit {
    pub fn new(origin: StreamLabel, value: Value) -> Self {
        Self {
            value,
            produced_at: Utc::now(),
            origin,
        }
    }
}
