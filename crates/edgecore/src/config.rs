use crate::GraphSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Resolved configuration for one device: its graphs plus delivery and
/// supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub graphs: Vec<GraphSpec>,
    #[serde(default)]
    pub delivery: DeliverySettings,
    #[serde(default)]
    pub supervision: SupervisionSettings,
}

fn default_device_id() -> String {
    "unknown".to_string()
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_id: default_device_id(),
            tags: BTreeMap::new(),
            graphs: Vec::new(),
            delivery: DeliverySettings::default(),
            supervision: SupervisionSettings::default(),
        }
    }

    pub fn with_graph(mut self, graph: GraphSpec) -> Self {
        self.graphs.push(graph);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The worker waits for the remote write or retry exhaustion.
    Synchronous,
    /// The worker enqueues and a background task does the writing.
    #[default]
    Asynchronous,
}

/// Remote storage backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendSpec {
    /// In-memory emulator; nothing leaves the device.
    Memory,
    Http {
        base_url: String,
        #[serde(default)]
        auth_token: Option<String>,
        #[serde(default = "default_http_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

impl Default for BackendSpec {
    fn default() -> Self {
        BackendSpec::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub mode: DeliveryMode,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub queue_capacity: usize,
    pub spill_capacity: usize,
    pub spill_max_bytes: usize,
    pub redelivery_interval_ms: u64,
    pub backend: BackendSpec,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Asynchronous,
            max_retries: 5,
            initial_backoff_ms: 2000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            queue_capacity: 1024,
            spill_capacity: 512,
            spill_max_bytes: 64 * 1024 * 1024,
            redelivery_interval_ms: 60_000,
            backend: BackendSpec::Memory,
        }
    }
}

impl DeliverySettings {
    pub fn redelivery_interval(&self) -> Duration {
        Duration::from_millis(self.redelivery_interval_ms)
    }
}

/// Health sweep and restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionSettings {
    pub health_interval_ms: u64,
    /// How long a task must stay unhealthy before it is restarted.
    pub restart_after_ms: u64,
    pub max_restarts: u32,
    pub stop_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub event_buffer_size: usize,
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            health_interval_ms: 10_000,
            restart_after_ms: 0,
            max_restarts: 3,
            stop_timeout_ms: 5_000,
            startup_timeout_ms: 5_000,
            event_buffer_size: 1000,
        }
    }
}

impl SupervisionSettings {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn restart_after(&self) -> Duration {
        Duration::from_millis(self.restart_after_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_device_config_uses_defaults() {
        let config: DeviceConfig = serde_json::from_str(
            r#"{"name": "hive-01", "delivery": {"mode": "synchronous", "backend": {"type": "http", "base_url": "https://store.example"}}}"#,
        )
        .unwrap();

        assert_eq!(config.device_id, "unknown");
        assert!(config.graphs.is_empty());
        assert_eq!(config.delivery.mode, DeliveryMode::Synchronous);
        assert_eq!(config.delivery.max_retries, 5);
        assert_eq!(
            config.delivery.backend,
            BackendSpec::Http {
                base_url: "https://store.example".to_string(),
                auth_token: None,
                timeout_ms: 30_000,
            }
        );
        assert_eq!(config.supervision.max_restarts, 3);
    }
}
