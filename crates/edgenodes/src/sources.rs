use crate::config::{optional_f64, optional_str, optional_u64, required_str, Config};
use async_trait::async_trait;
use chrono::Utc;
use edgecore::{AcquisitionSource, NodeError, NodeInstance, NodeOutput, NodeRole, Value};
use edgeruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Emulated sensor counting up from `start` by `step`.
pub struct CounterSource {
    next: f64,
    step: f64,
    remaining: Option<u64>,
}

impl CounterSource {
    pub fn from_config(config: &Config) -> Result<Self, NodeError> {
        Ok(Self {
            next: optional_f64(config, "start")?.unwrap_or(0.0),
            step: optional_f64(config, "step")?.unwrap_or(1.0),
            remaining: optional_u64(config, "limit")?,
        })
    }
}

#[async_trait]
impl AcquisitionSource for CounterSource {
    fn source_type(&self) -> &str {
        "sim.counter"
    }

    async fn read(&mut self) -> Result<NodeOutput, NodeError> {
        match self.remaining {
            // An exhausted emulator behaves like a sensor with nothing to report.
            Some(0) => return std::future::pending().await,
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        let value = self.next;
        self.next += self.step;
        Ok(NodeOutput::new().with_output(0, value))
    }
}

pub struct CounterSourceFactory;

impl NodeFactory for CounterSourceFactory {
    fn create(&self, config: &Config) -> Result<NodeInstance, NodeError> {
        Ok(NodeInstance::Acquisition(Box::new(CounterSource::from_config(config)?)))
    }

    fn node_type(&self) -> &str {
        "sim.counter"
    }

    fn role(&self) -> NodeRole {
        NodeRole::Acquisition
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Emulated sensor emitting an increasing number per read".to_string(),
            category: "sim".to_string(),
            outputs: vec![PortDefinition {
                index: 0,
                name: "count".to_string(),
                description: "start, start + step, ...".to_string(),
            }],
        }
    }
}

/// Periodic device-health record.
///
/// Each read emits `device_id`, `sequence`, `uptime_s`, `timestamp`, any
/// configured `tags` and, where the host exposes it, `load_1m` and
/// `cpu_temperature`.
pub struct HeartbeatSource {
    device_id: String,
    tags: BTreeMap<String, Value>,
    temperature_path: Option<PathBuf>,
    started: Instant,
    sequence: u64,
}

impl HeartbeatSource {
    pub fn from_config(config: &Config) -> Result<Self, NodeError> {
        let tags = match config.get("tags") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Record(fields)) => fields.clone(),
            Some(other) => {
                return Err(NodeError::Configuration(format!(
                    "'tags' must be a record, got {}",
                    other.kind()
                )))
            }
        };

        Ok(Self {
            device_id: optional_str(config, "device_id")?.unwrap_or_else(|| "unknown".to_string()),
            tags,
            temperature_path: optional_str(config, "temperature_path")?.map(PathBuf::from),
            started: Instant::now(),
            sequence: 0,
        })
    }
}

#[async_trait]
impl AcquisitionSource for HeartbeatSource {
    fn source_type(&self) -> &str {
        "system.heartbeat"
    }

    async fn initialize(&mut self) -> Result<(), NodeError> {
        self.started = Instant::now();
        Ok(())
    }

    async fn read(&mut self) -> Result<NodeOutput, NodeError> {
        let mut record = BTreeMap::new();
        record.insert("device_id".to_string(), Value::from(self.device_id.clone()));
        record.insert("sequence".to_string(), Value::from(self.sequence));
        record.insert(
            "uptime_s".to_string(),
            Value::from(self.started.elapsed().as_secs_f64()),
        );
        record.insert("timestamp".to_string(), Value::from(Utc::now().to_rfc3339()));
        if !self.tags.is_empty() {
            record.insert("tags".to_string(), Value::Record(self.tags.clone()));
        }

        // Best effort: missing host metrics leave the field out.
        if let Ok(loadavg) = tokio::fs::read_to_string("/proc/loadavg").await {
            if let Some(load) = loadavg.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()) {
                record.insert("load_1m".to_string(), Value::from(load));
            }
        }
        if let Some(path) = &self.temperature_path {
            match read_number(path).await {
                Ok(millidegrees) => {
                    record.insert("cpu_temperature".to_string(), Value::from(millidegrees / 1000.0));
                }
                Err(e) => tracing::debug!("Heartbeat skipped temperature: {}", e),
            }
        }

        self.sequence += 1;
        Ok(NodeOutput::new().with_output(0, Value::Record(record)))
    }
}

pub struct HeartbeatSourceFactory;

impl NodeFactory for HeartbeatSourceFactory {
    fn create(&self, config: &Config) -> Result<NodeInstance, NodeError> {
        Ok(NodeInstance::Acquisition(Box::new(HeartbeatSource::from_config(config)?)))
    }

    fn node_type(&self) -> &str {
        "system.heartbeat"
    }

    fn role(&self) -> NodeRole {
        NodeRole::Acquisition
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Device health record (uptime, load, temperature, tags)".to_string(),
            category: "system".to_string(),
            outputs: vec![PortDefinition {
                index: 0,
                name: "heart".to_string(),
                description: "one record per read".to_string(),
            }],
        }
    }
}

/// Reads one number from a file on every read, sysfs style.
pub struct FileProbeSource {
    path: PathBuf,
    scale: f64,
}

impl FileProbeSource {
    pub fn from_config(config: &Config) -> Result<Self, NodeError> {
        Ok(Self {
            path: PathBuf::from(required_str(config, "path")?),
            scale: optional_f64(config, "scale")?.unwrap_or(1.0),
        })
    }
}

#[async_trait]
impl AcquisitionSource for FileProbeSource {
    fn source_type(&self) -> &str {
        "system.file_probe"
    }

    async fn initialize(&mut self) -> Result<(), NodeError> {
        tokio::fs::metadata(&self.path).await.map_err(|e| {
            NodeError::InitializationFailed(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(())
    }

    async fn read(&mut self) -> Result<NodeOutput, NodeError> {
        let raw = read_number(&self.path).await?;
        Ok(NodeOutput::new().with_output(0, raw * self.scale))
    }
}

async fn read_number(path: &Path) -> Result<f64, NodeError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| NodeError::ReadFailed(format!("{}: {}", path.display(), e)))?;
    let trimmed = text.trim();
    trimmed.parse::<f64>().map_err(|_| {
        NodeError::ReadFailed(format!("{}: not a number: {:?}", path.display(), trimmed))
    })
}

pub struct FileProbeSourceFactory;

impl NodeFactory for FileProbeSourceFactory {
    fn create(&self, config: &Config) -> Result<NodeInstance, NodeError> {
        Ok(NodeInstance::Acquisition(Box::new(FileProbeSource::from_config(config)?)))
    }

    fn node_type(&self) -> &str {
        "system.file_probe"
    }

    fn role(&self) -> NodeRole {
        NodeRole::Acquisition
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Reads a number from a file (e.g. a thermal zone)".to_string(),
            category: "system".to_string(),
            outputs: vec![PortDefinition {
                index: 0,
                name: "value".to_string(),
                description: "file contents times `scale`".to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config(entries: &[(&str, Value)]) -> Config {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn first_number(output: &NodeOutput) -> Option<f64> {
        output.outputs.first().and_then(|(_, value)| value.as_f64())
    }

    #[tokio::test]
    async fn counter_steps_from_start() {
        let mut source = CounterSource::from_config(&config(&[
            ("start", Value::from(10i64)),
            ("step", Value::from(5i64)),
        ]))
        .unwrap();

        assert_eq!(first_number(&source.read().await.unwrap()), Some(10.0));
        assert_eq!(first_number(&source.read().await.unwrap()), Some(15.0));
    }

    #[tokio::test(start_paused = true)]
    async fn counter_goes_quiet_after_limit() {
        let mut source = CounterSource::from_config(&config(&[("limit", Value::from(1i64))])).unwrap();
        source.read().await.unwrap();

        let next = tokio::time::timeout(std::time::Duration::from_secs(60), source.read()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn heartbeat_counts_and_tags() {
        let mut tags = BTreeMap::new();
        tags.insert("site".to_string(), Value::from("north-field"));
        let mut source = HeartbeatSource::from_config(&config(&[
            ("device_id", Value::from("d01")),
            ("tags", Value::Record(tags)),
        ]))
        .unwrap();
        source.initialize().await.unwrap();

        source.read().await.unwrap();
        let output = source.read().await.unwrap();
        let record = output.outputs[0].1.as_record().unwrap();
        assert_eq!(record["device_id"].as_str(), Some("d01"));
        assert_eq!(record["sequence"].as_f64(), Some(1.0));
        assert_eq!(
            record["tags"].as_record().unwrap()["site"].as_str(),
            Some("north-field")
        );
    }

    #[test]
    fn heartbeat_rejects_non_record_tags() {
        assert!(HeartbeatSource::from_config(&config(&[("tags", Value::from("x"))])).is_err());
    }

    #[tokio::test]
    async fn file_probe_scales_the_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "48312").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let mut source = FileProbeSource::from_config(&config(&[
            ("path", Value::from(path)),
            ("scale", Value::from(0.001)),
        ]))
        .unwrap();
        source.initialize().await.unwrap();

        let value = first_number(&source.read().await.unwrap()).unwrap();
        assert!((value - 48.312).abs() < 1e-9);
    }

    #[tokio::test]
    async fn file_probe_reports_garbage_as_read_failure() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "n/a").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let mut source = FileProbeSource::from_config(&config(&[("path", Value::from(path))])).unwrap();
        assert!(matches!(source.read().await, Err(NodeError::ReadFailed(_))));
    }

    #[test]
    fn file_probe_requires_a_path() {
        assert!(matches!(
            FileProbeSourceFactory.create(&Config::new()),
            Err(NodeError::Configuration(_))
        ));
    }
}
