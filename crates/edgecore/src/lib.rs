//! Core abstractions for the edge data-flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: values, streams and their buffers, node contracts,
//! graph and device configuration, the storage boundary, health counters
//! and pipeline events.

mod buffer;
mod config;
mod delivery;
mod error;
pub mod events;
mod graph;
mod health;
mod node;
pub mod sampling;
mod stream;
mod value;

pub use buffer::{
    NodeOutputs, OverflowPolicy, PublishOutcome, PushOutcome, StreamBuffer, TryPublish,
};
pub use config::{BackendSpec, DeliveryMode, DeliverySettings, DeviceConfig, SupervisionSettings};
pub use delivery::{Artifact, DeliveryOutcome, DeliveryUnit, StorageBackend};
pub use error::{DeliveryError, FlowError, GraphError, NodeError};
pub use events::*;
pub use graph::{
    AcquisitionMode, AcquisitionSettings, EdgeSpec, FanInPolicy, GraphId, GraphSettings,
    GraphSpec, NodeSpec,
};
pub use health::{
    DeliveryReport, HealthSnapshot, HealthState, NodeCounters, NodeReport, NodeState,
    OrchestratorState, TaskKind, TaskReport,
};
pub use node::{AcquisitionSource, Inputs, NodeId, NodeInstance, NodeOutput, NodeRole, Transform};
pub use sampling::{RandomSource, SeededRandom, ThreadRandom};
pub use stream::{DataFormat, DataUnit, Stream, StreamLabel};
pub use value::Value;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, FlowError>;
