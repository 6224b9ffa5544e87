use crate::{NodeId, OrchestratorState, StreamLabel, TaskKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type RunId = Uuid;

/// Events emitted while the pipeline runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    OrchestratorStateChanged {
        run_id: RunId,
        state: OrchestratorState,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        run_id: RunId,
        task: String,
        kind: TaskKind,
        timestamp: DateTime<Utc>,
    },
    TaskStopped {
        run_id: RunId,
        task: String,
        kind: TaskKind,
        timestamp: DateTime<Utc>,
    },
    TaskRestarted {
        run_id: RunId,
        task: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    TaskQuarantined {
        run_id: RunId,
        task: String,
        timestamp: DateTime<Utc>,
    },
    ReadFailed {
        run_id: RunId,
        graph: String,
        node: NodeId,
        consecutive: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeQuarantined {
        run_id: RunId,
        graph: String,
        node: NodeId,
        timestamp: DateTime<Utc>,
    },
    TransformFailed {
        run_id: RunId,
        graph: String,
        node: NodeId,
        discarded: usize,
        error: String,
        timestamp: DateTime<Utc>,
    },
    UnitDelivered {
        run_id: RunId,
        origin: StreamLabel,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    UnitSpilled {
        run_id: RunId,
        origin: StreamLabel,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    DeliveryFailed {
        run_id: RunId,
        origin: StreamLabel,
        sequence: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

/// Event emitter scoped to one graph, handed to the tasks that drive it
#[derive(Clone)]
pub struct EventEmitter {
    run_id: RunId,
    graph: String,
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(run_id: RunId, graph: impl Into<String>, sender: broadcast::Sender<PipelineEvent>) -> Self {
        Self {
            run_id,
            graph: graph.into(),
            sender,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn graph(&self) -> &str {
        &self.graph
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn read_failed(&self, node: &NodeId, consecutive: u64, error: impl Into<String>) {
        self.emit(PipelineEvent::ReadFailed {
            run_id: self.run_id,
            graph: self.graph.clone(),
            node: node.clone(),
            consecutive,
            error: error.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn node_quarantined(&self, node: &NodeId) {
        self.emit(PipelineEvent::NodeQuarantined {
            run_id: self.run_id,
            graph: self.graph.clone(),
            node: node.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn transform_failed(&self, node: &NodeId, discarded: usize, error: impl Into<String>) {
        self.emit(PipelineEvent::TransformFailed {
            run_id: self.run_id,
            graph: self.graph.clone(),
            node: node.clone(),
            discarded,
            error: error.into(),
            timestamp: Utc::now(),
        });
    }
}

/// Process-wide event bus; any status tool may subscribe
pub struct EventBus {
    run_id: RunId,
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            run_id: RunId::new_v4(),
            sender,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, graph: impl Into<String>) -> EventEmitter {
        EventEmitter::new(self.run_id, graph, self.sender.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_events_reach_subscribers() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let emitter = bus.create_emitter("climate");

        emitter.node_quarantined(&"sht31".to_string());

        match events.recv().await.unwrap() {
            PipelineEvent::NodeQuarantined { run_id, graph, node, .. } => {
                assert_eq!(run_id, bus.run_id());
                assert_eq!(graph, "climate");
                assert_eq!(node, "sht31");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let bus = EventBus::new(1);
        bus.create_emitter("g").transform_failed(&"t".to_string(), 3, "boom");
    }
}
