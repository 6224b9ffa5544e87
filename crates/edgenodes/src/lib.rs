//! Standard node library
//!
//! Built-in acquisition sources, transforms and storage backends.

mod config;
mod sources;
mod storage;
mod transform;

pub use sources::{CounterSource, FileProbeSource, HeartbeatSource};
pub use storage::{backend_from_spec, HttpBackend, MemoryBackend, StoredBlob};
pub use transform::{
    ForwardNode, JsonParseNode, JsonStringifyNode, LogNode, TagNode, ThresholdNode,
};
use edgeruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(sources::CounterSourceFactory));
    registry.register(Arc::new(sources::HeartbeatSourceFactory));
    registry.register(Arc::new(sources::FileProbeSourceFactory));
    registry.register(Arc::new(transform::ForwardNodeFactory));
    registry.register(Arc::new(transform::LogNodeFactory));
    registry.register(Arc::new(transform::JsonParseNodeFactory));
    registry.register(Arc::new(transform::JsonStringifyNodeFactory));
    registry.register(Arc::new(transform::ThresholdNodeFactory));
    registry.register(Arc::new(transform::TagNodeFactory));
}

/// A registry holding every standard node.
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
