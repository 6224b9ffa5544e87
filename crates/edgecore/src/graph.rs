use crate::{NodeId, NodeRole, OverflowPolicy, Stream, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub type GraphId = Uuid;

/// Complete data-flow graph definition: one acquisition root feeding a tree
/// (or DAG) of transforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default = "Uuid::new_v4")]
    pub id: GraphId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub settings: GraphSettings,
}

impl GraphSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            settings: GraphSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(&mut self, from_node: impl Into<NodeId>, from_stream: u32, to_node: impl Into<NodeId>) {
        self.edges.push(EdgeSpec {
            from_node: from_node.into(),
            from_stream,
            to_node: to_node.into(),
        });
    }

    pub fn with_settings(mut self, settings: GraphSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Node specification in a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub role: NodeRole,
    pub node_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub outputs: Vec<Stream>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
}

impl NodeSpec {
    pub fn acquisition(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self::with_role(id, NodeRole::Acquisition, node_type)
    }

    pub fn transform(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self::with_role(id, NodeRole::Transform, node_type)
    }

    fn with_role(id: impl Into<NodeId>, role: NodeRole, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            node_type: node_type.into(),
            description: String::new(),
            outputs: Vec::new(),
            config: HashMap::new(),
            acquisition: AcquisitionSettings::default(),
        }
    }

    pub fn with_output(mut self, stream: Stream) -> Self {
        self.outputs.push(stream);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_acquisition(mut self, settings: AcquisitionSettings) -> Self {
        self.acquisition = settings;
        self
    }

    pub fn find_stream(&self, index: u32) -> Option<&Stream> {
        self.outputs.iter().find(|s| s.index == index)
    }
}

/// Edge from one output stream of a node to a downstream node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from_node: NodeId,
    pub from_stream: u32,
    pub to_node: NodeId,
}

/// How a transform with several inbound edges is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanInPolicy {
    /// Invoke with whatever inbound streams currently have data.
    #[default]
    Eager,
    /// Hold inputs until every inbound stream has at least one unit.
    WaitAll,
}

/// Per-graph scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    pub tick_interval_ms: u64,
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
    pub publish_timeout_ms: u64,
    pub fan_in: FanInPolicy,
    /// Record-format terminal streams collect rows into one journal batch
    /// and flush it once this old. 0 flushes at the end of every tick.
    pub journal_window_ms: u64,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            buffer_capacity: 256,
            overflow: OverflowPolicy::EvictOldest,
            publish_timeout_ms: 500,
            fan_in: FanInPolicy::Eager,
            journal_window_ms: 0,
        }
    }
}

impl GraphSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn journal_window(&self) -> Duration {
        Duration::from_millis(self.journal_window_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Read in a loop for as long as the node runs.
    #[default]
    Continuous,
    /// Read once per external trigger.
    Review,
}

/// Acquisition loop settings for the root node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    pub mode: AcquisitionMode,
    pub read_interval_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub failure_ceiling: u32,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            mode: AcquisitionMode::Continuous,
            read_interval_ms: 0,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            failure_ceiling: 10,
        }
    }
}

impl AcquisitionSettings {
    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataFormat;

    #[test]
    fn graph_spec_round_trips_through_json_with_defaults() {
        let json = r#"{
            "name": "climate",
            "nodes": [
                {"id": "sht31", "role": "acquisition", "node_type": "sim.counter",
                 "outputs": [{"name": "raw", "type_id": "RAW", "index": 0, "format": "log",
                              "destination_container": "raw"}]},
                {"id": "fwd", "role": "transform", "node_type": "transform.forward"}
            ],
            "edges": [{"from_node": "sht31", "from_stream": 0, "to_node": "fwd"}]
        }"#;

        let spec: GraphSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.settings.buffer_capacity, 256);
        assert_eq!(spec.settings.fan_in, FanInPolicy::Eager);
        let root = spec.find_node("sht31").unwrap();
        assert_eq!(root.acquisition.failure_ceiling, 10);
        assert_eq!(root.find_stream(0).map(|s| s.format), Some(DataFormat::Log));
    }
}
