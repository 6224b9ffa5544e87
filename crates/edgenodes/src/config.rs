//! Typed lookups over a node's free-form configuration map.

use edgecore::{NodeError, Value};
use std::collections::HashMap;

pub(crate) type Config = HashMap<String, Value>;

fn mismatch(key: &str, expected: &str, actual: &Value) -> NodeError {
    NodeError::Configuration(format!(
        "'{}' must be a {}, got {}",
        key,
        expected,
        actual.kind()
    ))
}

pub(crate) fn required_str(config: &Config, key: &str) -> Result<String, NodeError> {
    optional_str(config, key)?
        .ok_or_else(|| NodeError::Configuration(format!("missing required '{}'", key)))
}

pub(crate) fn optional_str(config: &Config, key: &str) -> Result<Option<String>, NodeError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| mismatch(key, "string", value)),
    }
}

pub(crate) fn optional_f64(config: &Config, key: &str) -> Result<Option<f64>, NodeError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| mismatch(key, "number", value)),
    }
}

pub(crate) fn optional_u64(config: &Config, key: &str) -> Result<Option<u64>, NodeError> {
    match optional_f64(config, key)? {
        Some(n) if n < 0.0 || n.fract() != 0.0 => Err(NodeError::Configuration(format!(
            "'{}' must be a non-negative integer, got {}",
            key, n
        ))),
        Some(n) => Ok(Some(n as u64)),
        None => Ok(None),
    }
}

pub(crate) fn optional_bool(config: &Config, key: &str) -> Result<Option<bool>, NodeError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| mismatch(key, "bool", value)),
    }
}
