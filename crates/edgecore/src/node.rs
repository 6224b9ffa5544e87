use crate::{DataUnit, NodeError, StreamLabel, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type NodeId = String;

/// The two kinds of node a graph can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Wraps an external data source and runs on its own task.
    Acquisition,
    /// Derives outputs from upstream data; driven by the graph's worker.
    Transform,
}

/// A node that reads from a physical or external source.
#[async_trait]
pub trait AcquisitionSource: Send {
    /// Unique type identifier (e.g., "sim.counter", "system.file_probe")
    fn source_type(&self) -> &str;

    /// Optional: open devices or handles before the first read
    async fn initialize(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Read one reading. Each output names the stream index it belongs to.
    async fn read(&mut self) -> Result<NodeOutput, NodeError>;

    /// Optional: release devices or handles
    async fn shutdown(&mut self) -> Result<(), NodeError> {
        Ok(())
    }
}

/// A node that turns upstream units into zero or more outputs.
///
/// Implementations must not spawn tasks; all effects are returned outputs.
pub trait Transform: Send {
    /// Unique type identifier (e.g., "transform.forward")
    fn node_type(&self) -> &str;

    fn process(&mut self, inputs: &Inputs) -> Result<NodeOutput, NodeError>;
}

/// A constructed node, ready to be driven by the runtime.
pub enum NodeInstance {
    Acquisition(Box<dyn AcquisitionSource>),
    Transform(Box<dyn Transform>),
}

impl NodeInstance {
    pub fn role(&self) -> NodeRole {
        match self {
            NodeInstance::Acquisition(_) => NodeRole::Acquisition,
            NodeInstance::Transform(_) => NodeRole::Transform,
        }
    }

    pub fn into_source(self) -> Option<Box<dyn AcquisitionSource>> {
        match self {
            NodeInstance::Acquisition(source) => Some(source),
            NodeInstance::Transform(_) => None,
        }
    }

    pub fn into_transform(self) -> Option<Box<dyn Transform>> {
        match self {
            NodeInstance::Transform(transform) => Some(transform),
            NodeInstance::Acquisition(_) => None,
        }
    }
}

/// Units available to one transform invocation, grouped by the stream they
/// arrived on. Each group is in publish order.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    units: BTreeMap<StreamLabel, Vec<DataUnit>>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: StreamLabel, units: Vec<DataUnit>) {
        if !units.is_empty() {
            self.units.entry(label).or_default().extend(units);
        }
    }

    pub fn get(&self, label: &StreamLabel) -> &[DataUnit] {
        self.units.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Units from `label`, or `MissingInput` when nothing arrived on it.
    pub fn require(&self, label: &StreamLabel) -> Result<&[DataUnit], NodeError> {
        match self.units.get(label) {
            Some(units) if !units.is_empty() => Ok(units),
            _ => Err(NodeError::MissingInput(label.to_string())),
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &StreamLabel> {
        self.units.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StreamLabel, &[DataUnit])> {
        self.units.iter().map(|(label, units)| (label, units.as_slice()))
    }

    /// Every unit, grouped by label and FIFO within a label.
    pub fn units(&self) -> impl Iterator<Item = &DataUnit> {
        self.units.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.units.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Output from one read or one transform invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// `(stream_index, value)` pairs, published in order.
    pub outputs: Vec<(u32, Value)>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, stream: u32, value: impl Into<Value>) -> Self {
        self.outputs.push((stream, value.into()));
        self
    }

    pub fn push(&mut self, stream: u32, value: impl Into<Value>) {
        self.outputs.push((stream, value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_group_units_by_label_in_order() {
        let a = StreamLabel::new("a", 0);
        let b = StreamLabel::new("b", 0);
        let mut inputs = Inputs::new();
        inputs.insert(b.clone(), vec![DataUnit::new(b.clone(), Value::from(3i64))]);
        inputs.insert(
            a.clone(),
            vec![
                DataUnit::new(a.clone(), Value::from(1i64)),
                DataUnit::new(a.clone(), Value::from(2i64)),
            ],
        );
        inputs.insert(a.clone(), Vec::new());

        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs.get(&a).len(), 2);
        assert_eq!(
            inputs.require(&StreamLabel::new("c", 0)),
            Err(NodeError::MissingInput("c#0".to_string()))
        );
        let order: Vec<f64> = inputs.units().filter_map(|u| u.value.as_f64()).collect();
        assert_eq!(order, vec![1.0, 2.0, 3.0]);
    }
}
