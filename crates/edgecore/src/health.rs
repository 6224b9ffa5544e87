//! Per-node counters and the read-only health snapshot exposed to status tools.

use crate::{NodeId, NodeRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Lifecycle state of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Idle,
    Acquiring,
    Backoff,
    Processing,
    Quarantined,
    Stopped,
}

impl NodeState {
    fn to_u8(self) -> u8 {
        match self {
            NodeState::Idle => 0,
            NodeState::Acquiring => 1,
            NodeState::Backoff => 2,
            NodeState::Processing => 3,
            NodeState::Quarantined => 4,
            NodeState::Stopped => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => NodeState::Acquiring,
            2 => NodeState::Backoff,
            3 => NodeState::Processing,
            4 => NodeState::Quarantined,
            5 => NodeState::Stopped,
            _ => NodeState::Idle,
        }
    }
}

/// Coarse health classification shown in status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Quarantined,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl OrchestratorState {
    pub fn is_running(&self) -> bool {
        matches!(self, OrchestratorState::Starting | OrchestratorState::Running)
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorState::Stopped => "stopped",
            OrchestratorState::Starting => "starting",
            OrchestratorState::Running => "running",
            OrchestratorState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Live counters for one node, shared between the task that drives the node
/// and the health registry.
#[derive(Debug)]
pub struct NodeCounters {
    state: AtomicU8,
    produced: AtomicU64,
    sampled_out: AtomicU64,
    overflow_dropped: AtomicU64,
    inputs_dropped: AtomicU64,
    errors: AtomicU64,
    consecutive_errors: AtomicU64,
    delivered: AtomicU64,
    spilled: AtomicU64,
    invocations: AtomicU64,
    processing_micros: AtomicU64,
    last_success: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl Default for NodeCounters {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(NodeState::Idle.to_u8()),
            produced: AtomicU64::new(0),
            sampled_out: AtomicU64::new(0),
            overflow_dropped: AtomicU64::new(0),
            inputs_dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            spilled: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
            processing_micros: AtomicU64::new(0),
            last_success: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }
}

impl NodeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: NodeState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn record_published(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sampled_out(&self) {
        self.sampled_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self, evicted: u64) {
        self.overflow_dropped.fetch_add(evicted, Ordering::Relaxed);
    }

    /// Staged inputs of this node evicted before it could process them.
    pub fn record_inputs_dropped(&self, dropped: u64) {
        self.inputs_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    /// `units` data units reached remote storage, possibly as one batch.
    pub fn record_delivered(&self, units: u64) {
        self.delivered.fetch_add(units, Ordering::Relaxed);
    }

    pub fn record_spilled(&self, units: u64) {
        self.spilled.fetch_add(units, Ordering::Relaxed);
    }

    pub fn record_invocation(&self, elapsed: Duration) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.processing_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Resets the consecutive error run.
    pub fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::Release);
        if let Ok(mut last) = self.last_success.lock() {
            *last = Some(Utc::now());
        }
    }

    /// Returns the length of the current consecutive error run.
    pub fn record_error(&self, message: impl Into<String>) -> u64 {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message.into());
        }
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    pub fn overflow_dropped(&self) -> u64 {
        self.overflow_dropped.load(Ordering::Relaxed)
    }

    pub fn sampled_out(&self) -> u64 {
        self.sampled_out.load(Ordering::Relaxed)
    }

    pub fn inputs_dropped(&self) -> u64 {
        self.inputs_dropped.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> HealthState {
        match self.state() {
            NodeState::Quarantined => HealthState::Quarantined,
            NodeState::Stopped => HealthState::Stopped,
            _ if self.consecutive_errors() > 0 => HealthState::Degraded,
            _ => HealthState::Healthy,
        }
    }

    /// Copy the counters into an owned report.
    pub fn report(&self, graph: &str, node: &NodeId, role: NodeRole) -> NodeReport {
        NodeReport {
            graph: graph.to_string(),
            node: node.clone(),
            role,
            state: self.state(),
            health: self.health(),
            produced: self.produced(),
            sampled_out: self.sampled_out(),
            overflow_dropped: self.overflow_dropped(),
            inputs_dropped: self.inputs_dropped(),
            errors: self.errors(),
            consecutive_errors: self.consecutive_errors(),
            delivered: self.delivered(),
            spilled: self.spilled.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            processing_micros: self.processing_micros.load(Ordering::Relaxed),
            last_success: self.last_success.lock().ok().and_then(|last| *last),
            last_error: self.last_error.lock().ok().and_then(|last| last.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub graph: String,
    pub node: NodeId,
    pub role: NodeRole,
    pub state: NodeState,
    pub health: HealthState,
    pub produced: u64,
    pub sampled_out: u64,
    pub overflow_dropped: u64,
    pub inputs_dropped: u64,
    pub errors: u64,
    pub consecutive_errors: u64,
    pub delivered: u64,
    pub spilled: u64,
    pub invocations: u64,
    pub processing_micros: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Acquisition,
    Worker,
    Delivery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: String,
    pub graph: String,
    pub kind: TaskKind,
    pub alive: bool,
    pub restarts: u32,
    pub quarantined: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub delivered: u64,
    pub retried: u64,
    pub spilled: u64,
    pub spill_evicted: u64,
    pub redelivered: u64,
    pub terminal_failures: u64,
    pub spill_depth: usize,
}

/// Point-in-time view of the whole device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub taken_at: DateTime<Utc>,
    pub orchestrator: OrchestratorState,
    pub nodes: Vec<NodeReport>,
    pub tasks: Vec<TaskReport>,
    pub delivery: DeliveryReport,
}

impl HealthSnapshot {
    pub fn empty(orchestrator: OrchestratorState) -> Self {
        Self {
            taken_at: Utc::now(),
            orchestrator,
            nodes: Vec::new(),
            tasks: Vec::new(),
            delivery: DeliveryReport::default(),
        }
    }

    pub fn node(&self, graph: &str, node: &str) -> Option<&NodeReport> {
        self.nodes
            .iter()
            .find(|report| report.graph == graph && report.node == node)
    }

    pub fn task(&self, task: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|report| report.task == task)
    }

    /// Units handed to storage for one graph.
    pub fn delivered_for(&self, graph: &str) -> u64 {
        self.nodes
            .iter()
            .filter(|report| report.graph == graph)
            .map(|report| report.delivered)
            .sum()
    }

    pub fn quarantined_nodes(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes
            .iter()
            .filter(|report| report.health == HealthState::Quarantined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_errors_reset_on_success() {
        let counters = NodeCounters::new();
        assert_eq!(counters.record_error("i2c timeout"), 1);
        assert_eq!(counters.record_error("i2c timeout"), 2);
        assert_eq!(counters.health(), HealthState::Degraded);

        counters.record_success();
        assert_eq!(counters.consecutive_errors(), 0);
        assert_eq!(counters.errors(), 2);
        assert_eq!(counters.health(), HealthState::Healthy);
    }

    #[test]
    fn report_copies_state() {
        let counters = NodeCounters::new();
        counters.record_published();
        counters.set_state(NodeState::Quarantined);
        let report = counters.report("g", &"sensor".to_string(), NodeRole::Acquisition);

        counters.record_published();
        assert_eq!(report.produced, 1);
        assert_eq!(report.health, HealthState::Quarantined);
    }
}
