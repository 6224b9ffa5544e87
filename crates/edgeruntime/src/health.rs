//! Registry of node counters and task liveness, read by the health sweep.

use crate::graph::DataFlowGraph;
use edgecore::{
    DeliveryReport, HealthSnapshot, NodeCounters, NodeId, NodeRole, OrchestratorState, TaskKind,
    TaskReport,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// How a supervised task ended on its own terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    /// Cancelled by the orchestrator.
    Stopped,
    /// Gave up after its failure ceiling; must not be restarted.
    Quarantined,
}

/// Liveness of one supervised task, updated by the task itself.
#[derive(Debug, Default)]
pub struct TaskLiveness {
    alive: AtomicBool,
    started: AtomicBool,
    restarts: AtomicU32,
    quarantined: AtomicBool,
}

impl TaskLiveness {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// True once the task has run at least once.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Acquire)
    }

    pub fn quarantine(&self) {
        self.quarantined.store(true, Ordering::Release);
    }
}

/// Marks a task alive for as long as it is held, including across a panic.
pub struct LivenessGuard(Arc<TaskLiveness>);

impl LivenessGuard {
    pub fn enter(liveness: Arc<TaskLiveness>) -> Self {
        liveness.started.store(true, Ordering::Release);
        liveness.alive.store(true, Ordering::Release);
        Self(liveness)
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::Release);
    }
}

struct NodeEntry {
    graph: String,
    node: NodeId,
    role: NodeRole,
    counters: Arc<NodeCounters>,
}

struct TaskEntry {
    task: String,
    graph: String,
    kind: TaskKind,
    liveness: Arc<TaskLiveness>,
}

/// Single place where every node and task reports in.
#[derive(Default)]
pub struct HealthRegistry {
    nodes: RwLock<Vec<NodeEntry>>,
    tasks: RwLock<Vec<TaskEntry>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_graph(&self, graph: &DataFlowGraph) {
        let Ok(mut nodes) = self.nodes.write() else {
            return;
        };
        for (id, role) in graph.nodes() {
            if let Some(counters) = graph.counters(id) {
                nodes.push(NodeEntry {
                    graph: graph.name().to_string(),
                    node: id.clone(),
                    role,
                    counters: counters.clone(),
                });
            }
        }
    }

    pub fn register_task(
        &self,
        task: impl Into<String>,
        graph: impl Into<String>,
        kind: TaskKind,
    ) -> Arc<TaskLiveness> {
        let liveness = Arc::new(TaskLiveness::default());
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.push(TaskEntry {
                task: task.into(),
                graph: graph.into(),
                kind,
                liveness: liveness.clone(),
            });
        }
        liveness
    }

    pub fn counters(&self, graph: &str, node: &str) -> Option<Arc<NodeCounters>> {
        self.nodes.read().ok()?.iter().find_map(|entry| {
            (entry.graph == graph && entry.node == node).then(|| entry.counters.clone())
        })
    }

    pub fn clear(&self) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.clear();
        }
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.clear();
        }
    }

    /// Copy every counter into an owned snapshot.
    pub fn snapshot(&self, state: OrchestratorState, delivery: DeliveryReport) -> HealthSnapshot {
        let nodes = self
            .nodes
            .read()
            .map(|nodes| {
                nodes
                    .iter()
                    .map(|entry| entry.counters.report(&entry.graph, &entry.node, entry.role))
                    .collect()
            })
            .unwrap_or_default();

        let tasks = self
            .tasks
            .read()
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|entry| TaskReport {
                        task: entry.task.clone(),
                        graph: entry.graph.clone(),
                        kind: entry.kind,
                        alive: entry.liveness.is_alive(),
                        restarts: entry.liveness.restarts(),
                        quarantined: entry.liveness.is_quarantined(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        HealthSnapshot {
            taken_at: Utc::now(),
            orchestrator: state,
            nodes,
            tasks,
            delivery,
        }
    }
}
