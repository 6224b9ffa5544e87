// crates/edgecore/src/events/mod.rs

mod bus;

pub use bus::{EventBus, EventEmitter, PipelineEvent, RunId};
