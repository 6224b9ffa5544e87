use crate::config::{optional_bool, optional_f64, optional_str, Config};
use edgecore::{Inputs, NodeError, NodeInstance, NodeOutput, NodeRole, Transform, Value};
use edgeruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::BTreeMap;

fn port(index: u32, name: &str, description: &str) -> PortDefinition {
    PortDefinition {
        index,
        name: name.to_string(),
        description: description.to_string(),
    }
}

/// Copies every input unit to stream 0.
pub struct ForwardNode;

impl Transform for ForwardNode {
    fn node_type(&self) -> &str {
        "transform.forward"
    }

    fn process(&mut self, inputs: &Inputs) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();
        for unit in inputs.units() {
            output.push(0, unit.value.clone());
        }
        Ok(output)
    }
}

pub struct ForwardNodeFactory;

impl NodeFactory for ForwardNodeFactory {
    fn create(&self, _config: &Config) -> Result<NodeInstance, NodeError> {
        Ok(NodeInstance::Transform(Box::new(ForwardNode)))
    }

    fn node_type(&self) -> &str {
        "transform.forward"
    }

    fn role(&self) -> NodeRole {
        NodeRole::Transform
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Pass units through unchanged".to_string(),
            category: "transform".to_string(),
            outputs: vec![port(0, "out", "every input unit")],
        }
    }
}

/// Logs each unit and passes it through.
pub struct LogNode {
    prefix: String,
}

impl Transform for LogNode {
    fn node_type(&self) -> &str {
        "transform.log"
    }

    fn process(&mut self, inputs: &Inputs) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();
        for (label, units) in inputs.iter() {
            for unit in units {
                tracing::info!("{}{} [{}]: {:?}", self.prefix, label, unit.value.kind(), unit.value);
                output.push(0, unit.value.clone());
            }
        }
        Ok(output)
    }
}

pub struct LogNodeFactory;

impl NodeFactory for LogNodeFactory {
    fn create(&self, config: &Config) -> Result<NodeInstance, NodeError> {
        let prefix = optional_str(config, "prefix")?
            .map(|p| format!("{} ", p))
            .unwrap_or_default();
        Ok(NodeInstance::Transform(Box::new(LogNode { prefix })))
    }

    fn node_type(&self) -> &str {
        "transform.log"
    }

    fn role(&self) -> NodeRole {
        NodeRole::Transform
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Log input values for debugging".to_string(),
            category: "debug".to_string(),
            outputs: vec![port(0, "out", "every input unit")],
        }
    }
}

/// Parse JSON text into structured values
pub struct JsonParseNode;

impl Transform for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn process(&mut self, inputs: &Inputs) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();
        for unit in inputs.units() {
            let text = match &unit.value {
                Value::Text(text) => text.as_str(),
                Value::Bytes(bytes) => std::str::from_utf8(bytes).map_err(|e| {
                    NodeError::ProcessingFailed(format!("JSON parse error: {}", e))
                })?,
                other => {
                    return Err(NodeError::InvalidInputType {
                        field: unit.origin.to_string(),
                        expected: "text".to_string(),
                        actual: other.kind().to_string(),
                    })
                }
            };
            let parsed: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| NodeError::ProcessingFailed(format!("JSON parse error: {}", e)))?;
            output.push(0, Value::from_json(parsed));
        }
        Ok(output)
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _config: &Config) -> Result<NodeInstance, NodeError> {
        Ok(NodeInstance::Transform(Box::new(JsonParseNode)))
    }

    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn role(&self) -> NodeRole {
        NodeRole::Transform
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
            outputs: vec![port(0, "parsed", "objects become records")],
        }
    }
}

/// Render values as JSON text
pub struct JsonStringifyNode {
    pretty: bool,
}

impl Transform for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn process(&mut self, inputs: &Inputs) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();
        for unit in inputs.units() {
            let json = unit.value.to_json();
            let text = if self.pretty {
                serde_json::to_string_pretty(&json)
            } else {
                serde_json::to_string(&json)
            }
            .map_err(|e| NodeError::ProcessingFailed(format!("JSON stringify error: {}", e)))?;
            output.push(0, text);
        }
        Ok(output)
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, config: &Config) -> Result<NodeInstance, NodeError> {
        let pretty = optional_bool(config, "pretty")?.unwrap_or(false);
        Ok(NodeInstance::Transform(Box::new(JsonStringifyNode { pretty })))
    }

    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn role(&self) -> NodeRole {
        NodeRole::Transform
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
            outputs: vec![port(0, "json", "one string per unit")],
        }
    }
}

/// Splits numbers around a threshold: at or above go to stream 0, below to
/// stream 1. With `field` set, the number is read from that record field and
/// the whole record is routed.
pub struct ThresholdNode {
    threshold: f64,
    field: Option<String>,
}

impl ThresholdNode {
    fn number_of(&self, value: &Value) -> Option<f64> {
        match &self.field {
            Some(field) => value.as_record()?.get(field)?.as_f64(),
            None => value.as_f64(),
        }
    }
}

impl Transform for ThresholdNode {
    fn node_type(&self) -> &str {
        "transform.threshold"
    }

    fn process(&mut self, inputs: &Inputs) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();
        for unit in inputs.units() {
            let number = self.number_of(&unit.value).ok_or_else(|| NodeError::InvalidInputType {
                field: self.field.clone().unwrap_or_else(|| unit.origin.to_string()),
                expected: "number".to_string(),
                actual: unit.value.kind().to_string(),
            })?;
            let stream = if number >= self.threshold { 0 } else { 1 };
            output.push(stream, unit.value.clone());
        }
        Ok(output)
    }
}

pub struct ThresholdNodeFactory;

impl NodeFactory for ThresholdNodeFactory {
    fn create(&self, config: &Config) -> Result<NodeInstance, NodeError> {
        let threshold = optional_f64(config, "threshold")?
            .ok_or_else(|| NodeError::Configuration("missing required 'threshold'".to_string()))?;
        Ok(NodeInstance::Transform(Box::new(ThresholdNode {
            threshold,
            field: optional_str(config, "field")?,
        })))
    }

    fn node_type(&self) -> &str {
        "transform.threshold"
    }

    fn role(&self) -> NodeRole {
        NodeRole::Transform
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Route numbers by comparing against a threshold".to_string(),
            category: "transform".to_string(),
            outputs: vec![
                port(0, "above", "values >= threshold"),
                port(1, "below", "values < threshold"),
            ],
        }
    }
}

/// Wraps each unit in a record naming where it came from, so a fan-in merge
/// keeps provenance.
pub struct TagNode {
    tag: Option<String>,
}

impl Transform for TagNode {
    fn node_type(&self) -> &str {
        "transform.tag"
    }

    fn process(&mut self, inputs: &Inputs) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();
        for unit in inputs.units() {
            let mut record = BTreeMap::new();
            record.insert("source".to_string(), Value::from(unit.origin.to_string()));
            record.insert(
                "produced_at".to_string(),
                Value::from(unit.produced_at.to_rfc3339()),
            );
            if let Some(tag) = &self.tag {
                record.insert("tag".to_string(), Value::from(tag.clone()));
            }
            record.insert("value".to_string(), unit.value.clone());
            output.push(0, Value::Record(record));
        }
        Ok(output)
    }
}

pub struct TagNodeFactory;

impl NodeFactory for TagNodeFactory {
    fn create(&self, config: &Config) -> Result<NodeInstance, NodeError> {
        Ok(NodeInstance::Transform(Box::new(TagNode {
            tag: optional_str(config, "tag")?,
        })))
    }

    fn node_type(&self) -> &str {
        "transform.tag"
    }

    fn role(&self) -> NodeRole {
        NodeRole::Transform
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Wrap units in a record carrying their source stream".to_string(),
            category: "transform".to_string(),
            outputs: vec![port(0, "tagged", "{source, produced_at, tag?, value}")],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgecore::{DataUnit, StreamLabel};

    fn inputs(label: StreamLabel, values: Vec<Value>) -> Inputs {
        let mut inputs = Inputs::new();
        inputs.insert(
            label.clone(),
            values
                .into_iter()
                .map(|value| DataUnit::new(label.clone(), value))
                .collect(),
        );
        inputs
    }

    fn create(factory: &dyn NodeFactory, config: &[(&str, Value)]) -> Box<dyn Transform> {
        let config = config
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        factory.create(&config).unwrap().into_transform().unwrap()
    }

    #[test]
    fn threshold_routes_by_value() {
        let mut node = create(&ThresholdNodeFactory, &[("threshold", Value::from(30i64))]);
        let output = node
            .process(&inputs(
                StreamLabel::new("temp", 0),
                vec![Value::from(12.5), Value::from(30i64), Value::from(41.0)],
            ))
            .unwrap();

        let streams: Vec<u32> = output.outputs.iter().map(|(stream, _)| *stream).collect();
        assert_eq!(streams, vec![1, 0, 0]);
    }

    #[test]
    fn threshold_reads_record_fields() {
        let mut node = create(
            &ThresholdNodeFactory,
            &[("threshold", Value::from(50i64)), ("field", Value::from("humidity"))],
        );
        let reading = Value::from_json(serde_json::json!({"humidity": 71.0}));
        let output = node
            .process(&inputs(StreamLabel::new("env", 0), vec![reading.clone()]))
            .unwrap();
        assert_eq!(output.outputs, vec![(0, reading)]);

        let missing = Value::from_json(serde_json::json!({"temp": 1.0}));
        assert!(matches!(
            node.process(&inputs(StreamLabel::new("env", 0), vec![missing])),
            Err(NodeError::InvalidInputType { .. })
        ));
    }

    #[test]
    fn threshold_is_required() {
        assert!(ThresholdNodeFactory.create(&Config::new()).is_err());
    }

    #[test]
    fn json_round_trips_through_text() {
        let mut parse = create(&JsonParseNodeFactory, &[]);
        let mut stringify = create(&JsonStringifyNodeFactory, &[]);

        let parsed = parse
            .process(&inputs(
                StreamLabel::new("raw", 0),
                vec![Value::from(r#"{"id":7,"ok":true}"#)],
            ))
            .unwrap();
        let record = parsed.outputs[0].1.as_record().unwrap();
        assert_eq!(record["id"].as_f64(), Some(7.0));

        let text = stringify
            .process(&inputs(StreamLabel::new("p", 0), vec![parsed.outputs[0].1.clone()]))
            .unwrap();
        assert_eq!(text.outputs[0].1.as_str(), Some(r#"{"id":7.0,"ok":true}"#));
    }

    #[test]
    fn json_parse_rejects_non_text() {
        let mut parse = create(&JsonParseNodeFactory, &[]);
        assert!(matches!(
            parse.process(&inputs(StreamLabel::new("raw", 0), vec![Value::from(1i64)])),
            Err(NodeError::InvalidInputType { .. })
        ));
        assert!(matches!(
            parse.process(&inputs(StreamLabel::new("raw", 0), vec![Value::from("{oops")])),
            Err(NodeError::ProcessingFailed(_))
        ));
    }

    #[test]
    fn tag_records_provenance() {
        let mut node = create(&TagNodeFactory, &[("tag", Value::from("hive-3"))]);
        let output = node
            .process(&inputs(StreamLabel::new("cam", 1), vec![Value::from("frame")]))
            .unwrap();

        let record = output.outputs[0].1.as_record().unwrap();
        assert_eq!(record["source"].as_str(), Some("cam#1"));
        assert_eq!(record["tag"].as_str(), Some("hive-3"));
        assert_eq!(record["value"].as_str(), Some("frame"));
    }

    #[test]
    fn forward_and_log_keep_order() {
        let values = vec![Value::from(1i64), Value::from(2i64)];
        for factory in [&ForwardNodeFactory as &dyn NodeFactory, &LogNodeFactory] {
            let mut node = create(factory, &[]);
            let output = node
                .process(&inputs(StreamLabel::new("s", 0), values.clone()))
                .unwrap();
            assert_eq!(
                output.outputs,
                vec![(0, values[0].clone()), (0, values[1].clone())]
            );
        }
    }
}
