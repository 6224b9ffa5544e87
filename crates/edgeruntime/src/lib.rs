//! Data-flow execution runtime
//!
//! This crate turns validated graph definitions into running tasks: one
//! acquisition task and one worker per graph, a shared delivery connector,
//! and a health sweep that restarts crashed tasks.

mod acquisition;
mod backoff;
mod delivery;
mod graph;
mod health;
mod orchestrator;
mod registry;
mod worker;

pub use acquisition::AcquisitionTask;
pub use backoff::Backoff;
pub use delivery::{DeliveryConnector, SpillBuffer};
pub use graph::DataFlowGraph;
pub use health::{HealthRegistry, LivenessGuard, TaskExit, TaskLiveness};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use worker::Worker;
