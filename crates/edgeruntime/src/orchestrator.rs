use crate::acquisition::AcquisitionTask;
use crate::delivery::DeliveryConnector;
use crate::graph::DataFlowGraph;
use crate::health::{HealthRegistry, LivenessGuard, TaskExit, TaskLiveness};
use crate::registry::NodeRegistry;
use crate::worker::Worker;
use chrono::Utc;
use edgecore::{
    DeliveryReport, DeliverySettings, DeviceConfig, EventBus, EventEmitter, FlowError, GraphError,
    GraphSpec, HealthSnapshot, NodeState, OrchestratorState, PipelineEvent, RandomSource,
    SupervisionSettings, TaskKind, ThreadRandom,
};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for the orchestrator
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub delivery: DeliverySettings,
    pub supervision: SupervisionSettings,
}

impl From<&DeviceConfig> for OrchestratorConfig {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            delivery: config.delivery.clone(),
            supervision: config.supervision.clone(),
        }
    }
}

/// Starts, supervises and stops every graph on the device.
///
/// Cheap to clone; clones share the same running set.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Arc<NodeRegistry>,
    backend: Arc<dyn edgecore::StorageBackend>,
    config: OrchestratorConfig,
    random: Arc<dyn RandomSource>,
    events: EventBus,
    health: Arc<HealthRegistry>,
    state: RwLock<OrchestratorState>,
    snapshot: RwLock<Arc<HealthSnapshot>>,
    running: Mutex<Option<RunningSet>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskTarget {
    Acquisition(usize),
    Worker(usize),
    Delivery,
}

struct GraphRuntime {
    graph: Arc<DataFlowGraph>,
    events: EventEmitter,
    trigger: Arc<Notify>,
}

struct SupervisedTask {
    name: String,
    target: TaskTarget,
    kind: TaskKind,
    handle: Option<JoinHandle<TaskExit>>,
    liveness: Arc<TaskLiveness>,
    quarantined: bool,
    unhealthy_since: Option<Instant>,
}

struct RunningSet {
    graphs: Vec<GraphRuntime>,
    tasks: Vec<SupervisedTask>,
    connector: Arc<DeliveryConnector>,
    tasks_cancel: CancellationToken,
    delivery_cancel: CancellationToken,
    sweep_cancel: CancellationToken,
    sweep: Option<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        backend: Arc<dyn edgecore::StorageBackend>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_random(registry, backend, config, Arc::new(ThreadRandom))
    }

    /// Use a specific random source for stream sampling.
    pub fn with_random(
        registry: Arc<NodeRegistry>,
        backend: Arc<dyn edgecore::StorageBackend>,
        config: OrchestratorConfig,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        let events = EventBus::new(config.supervision.event_buffer_size);
        Self {
            shared: Arc::new(Shared {
                registry,
                backend,
                config,
                random,
                events,
                health: Arc::new(HealthRegistry::new()),
                state: RwLock::new(OrchestratorState::Stopped),
                snapshot: RwLock::new(Arc::new(HealthSnapshot::empty(OrchestratorState::Stopped))),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.shared.registry
    }

    pub fn state(&self) -> OrchestratorState {
        self.shared.state()
    }

    /// Subscribe to pipeline events
    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    /// Latest snapshot published by the health sweep.
    pub fn status(&self) -> Arc<HealthSnapshot> {
        self.shared
            .snapshot
            .read()
            .map(|snapshot| snapshot.clone())
            .unwrap_or_else(|_| Arc::new(HealthSnapshot::empty(self.state())))
    }

    /// Build and publish a fresh snapshot without waiting for the sweep.
    pub async fn snapshot_now(&self) -> Arc<HealthSnapshot> {
        let running = self.shared.running.lock().await;
        self.shared.publish_snapshot(running.as_ref())
    }

    /// Validate every graph, then start all tasks. Nothing is started if any
    /// graph is invalid.
    pub async fn start_all(&self, graphs: Vec<GraphSpec>) -> Result<(), FlowError> {
        let shared = &self.shared;
        let mut running = shared.running.lock().await;
        if running.is_some() || shared.state() != OrchestratorState::Stopped {
            return Err(FlowError::Execution(format!(
                "cannot start while {}",
                shared.state()
            )));
        }
        shared.set_state(OrchestratorState::Starting);

        let built = match shared.build_graphs(graphs) {
            Ok(built) => built,
            Err(e) => {
                tracing::error!("Refusing to start: {}", e);
                shared.set_state(OrchestratorState::Stopped);
                return Err(e.into());
            }
        };

        shared.health.clear();
        for graph in &built {
            shared.health.register_graph(graph);
        }

        let tasks_cancel = CancellationToken::new();
        let delivery_cancel = CancellationToken::new();
        let sweep_cancel = CancellationToken::new();

        let connector = Arc::new(DeliveryConnector::new(
            shared.backend.clone(),
            shared.config.delivery.clone(),
            shared.health.clone(),
            shared.events.create_emitter("delivery"),
            delivery_cancel.clone(),
        ));

        let mut set = RunningSet {
            graphs: built
                .into_iter()
                .map(|graph| GraphRuntime {
                    events: shared.events.create_emitter(graph.name()),
                    graph: Arc::new(graph),
                    trigger: Arc::new(Notify::new()),
                })
                .collect(),
            tasks: Vec::new(),
            connector,
            tasks_cancel,
            delivery_cancel,
            sweep_cancel,
            sweep: None,
        };

        let mut targets = vec![TaskTarget::Delivery];
        for index in 0..set.graphs.len() {
            targets.push(TaskTarget::Acquisition(index));
            targets.push(TaskTarget::Worker(index));
        }

        for target in targets {
            let (name, graph, kind) = set.describe(target);
            let liveness = shared.health.register_task(name.clone(), graph, kind);
            let handle = match shared.spawn(&set, target, liveness.clone()) {
                Ok(handle) => handle,
                Err(e) => {
                    drop(running);
                    shared.abort(set).await;
                    return Err(e);
                }
            };
            shared.emit_task_started(&name, kind);
            set.tasks.push(SupervisedTask {
                name,
                target,
                kind,
                handle: Some(handle),
                liveness,
                quarantined: false,
                unhealthy_since: None,
            });
        }

        if !shared.wait_started(&set).await {
            tracing::error!("Tasks did not start within {:?}", shared.config.supervision.startup_timeout());
            drop(running);
            shared.abort(set).await;
            return Err(FlowError::Execution("startup timed out".to_string()));
        }

        set.sweep = Some(tokio::spawn(Shared::sweep_loop(
            self.shared.clone(),
            set.sweep_cancel.clone(),
        )));

        tracing::info!(
            "Started {} graphs with {} tasks",
            set.graphs.len(),
            set.tasks.len()
        );
        *running = Some(set);
        shared.set_state(OrchestratorState::Running);
        shared.publish_snapshot(running.as_ref());
        Ok(())
    }

    /// Start every graph of a device configuration.
    pub async fn start_device(&self, config: &DeviceConfig) -> Result<(), FlowError> {
        self.start_all(config.graphs.clone()).await
    }

    /// Cancel every task and wait for them, bounded by the stop timeout.
    /// Delivery is stopped last so final flushes still reach it.
    pub async fn stop_all(&self) -> Result<(), FlowError> {
        let shared = &self.shared;
        let set = shared.running.lock().await.take();
        let Some(set) = set else {
            return Ok(());
        };

        shared.set_state(OrchestratorState::Stopping);
        shared.shutdown(set).await;
        shared.set_state(OrchestratorState::Stopped);
        Ok(())
    }

    /// Stop everything and forget all registered nodes and tasks.
    pub async fn teardown(&self) -> Result<(), FlowError> {
        self.stop_all().await?;
        self.shared.health.clear();
        if let Ok(mut snapshot) = self.shared.snapshot.write() {
            *snapshot = Arc::new(HealthSnapshot::empty(OrchestratorState::Stopped));
        }
        Ok(())
    }

    /// Request one read from a review-mode acquisition root.
    pub async fn trigger(&self, graph: &str) -> Result<(), FlowError> {
        let running = self.shared.running.lock().await;
        let runtime = running
            .as_ref()
            .and_then(|set| set.graphs.iter().find(|rt| rt.graph.name() == graph))
            .ok_or_else(|| GraphError::NodeNotFound(graph.to_string()))?;
        runtime.trigger.notify_one();
        Ok(())
    }

    /// Run one health sweep immediately.
    pub async fn sweep(&self) {
        self.shared.sweep_once().await;
    }
}

impl RunningSet {
    fn describe(&self, target: TaskTarget) -> (String, String, TaskKind) {
        match target {
            TaskTarget::Delivery => ("delivery".to_string(), String::new(), TaskKind::Delivery),
            TaskTarget::Acquisition(index) => {
                let graph = &self.graphs[index].graph;
                (
                    format!("{}/acquisition/{}", graph.name(), graph.root()),
                    graph.name().to_string(),
                    TaskKind::Acquisition,
                )
            }
            TaskTarget::Worker(index) => {
                let graph = &self.graphs[index].graph;
                (
                    format!("{}/worker", graph.name()),
                    graph.name().to_string(),
                    TaskKind::Worker,
                )
            }
        }
    }
}

impl Shared {
    fn state(&self) -> OrchestratorState {
        self.state
            .read()
            .map(|state| *state)
            .unwrap_or(OrchestratorState::Stopped)
    }

    fn set_state(&self, state: OrchestratorState) {
        if let Ok(mut current) = self.state.write() {
            if *current == state {
                return;
            }
            tracing::info!("Orchestrator {} -> {}", *current, state);
            *current = state;
        }
        self.events.emit(PipelineEvent::OrchestratorStateChanged {
            run_id: self.events.run_id(),
            state,
            timestamp: Utc::now(),
        });
    }

    fn build_graphs(&self, specs: Vec<GraphSpec>) -> Result<Vec<DataFlowGraph>, GraphError> {
        let mut names = HashSet::new();
        let mut built = Vec::with_capacity(specs.len());
        for spec in specs {
            if !names.insert(spec.name.clone()) {
                return Err(GraphError::Invalid(format!("duplicate graph name {}", spec.name)));
            }
            let name = spec.name.clone();
            let graph = DataFlowGraph::build(spec, &self.registry, self.random.clone())
                .map_err(|e| {
                    tracing::error!("Graph {} is invalid: {}", name, e);
                    e
                })?;
            built.push(graph);
        }
        Ok(built)
    }

    fn spawn(
        &self,
        set: &RunningSet,
        target: TaskTarget,
        liveness: Arc<TaskLiveness>,
    ) -> Result<JoinHandle<TaskExit>, FlowError> {
        let handle = match target {
            TaskTarget::Delivery => {
                let connector = set.connector.clone();
                tokio::spawn(async move {
                    let _guard = LivenessGuard::enter(liveness);
                    connector.run().await;
                    TaskExit::Stopped
                })
            }
            TaskTarget::Acquisition(index) => {
                let runtime = &set.graphs[index];
                let source = runtime.graph.instantiate_source(&self.registry)?;
                let task = AcquisitionTask::new(
                    &runtime.graph,
                    source,
                    runtime.events.clone(),
                    runtime.trigger.clone(),
                )?;
                let cancel = set.tasks_cancel.child_token();
                tokio::spawn(async move {
                    let _guard = LivenessGuard::enter(liveness);
                    task.run(cancel).await
                })
            }
            TaskTarget::Worker(index) => {
                let runtime = &set.graphs[index];
                let transforms = runtime.graph.instantiate_transforms(&self.registry)?;
                let worker = Worker::new(
                    runtime.graph.clone(),
                    transforms,
                    set.connector.clone(),
                    runtime.events.clone(),
                );
                let cancel = set.tasks_cancel.child_token();
                tokio::spawn(async move {
                    let _guard = LivenessGuard::enter(liveness);
                    worker.run(cancel).await
                })
            }
        };
        Ok(handle)
    }

    async fn wait_started(&self, set: &RunningSet) -> bool {
        let deadline = Instant::now() + self.config.supervision.startup_timeout();
        loop {
            if set.tasks.iter().all(|task| task.liveness.has_started()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn emit_task_started(&self, task: &str, kind: TaskKind) {
        self.events.emit(PipelineEvent::TaskStarted {
            run_id: self.events.run_id(),
            task: task.to_string(),
            kind,
            timestamp: Utc::now(),
        });
    }

    async fn abort(&self, set: RunningSet) {
        self.set_state(OrchestratorState::Stopping);
        self.shutdown(set).await;
        self.set_state(OrchestratorState::Stopped);
    }

    async fn shutdown(&self, mut set: RunningSet) {
        let stop_timeout = self.config.supervision.stop_timeout();

        set.sweep_cancel.cancel();
        if let Some(sweep) = set.sweep.take() {
            let _ = sweep.await;
        }

        set.tasks_cancel.cancel();
        let (delivery, others): (Vec<_>, Vec<_>) = set
            .tasks
            .iter_mut()
            .partition(|task| task.kind == TaskKind::Delivery);

        let joins = others
            .into_iter()
            .filter_map(|task| Some((task.name.clone(), task.kind, task.handle.take()?)))
            .map(|(name, kind, handle)| self.join_task(name, kind, handle, stop_timeout));
        futures::future::join_all(joins).await;

        set.delivery_cancel.cancel();
        for task in delivery {
            if let Some(handle) = task.handle.take() {
                self.join_task(task.name.clone(), task.kind, handle, stop_timeout)
                    .await;
            }
        }

        for runtime in &set.graphs {
            for (id, _) in runtime.graph.nodes() {
                if let Some(counters) = runtime.graph.counters(id) {
                    if counters.state() != NodeState::Quarantined {
                        counters.set_state(NodeState::Stopped);
                    }
                }
            }
        }

        let report = set.connector.report();
        if report.spill_depth > 0 {
            tracing::warn!("{} spilled units dropped at shutdown", report.spill_depth);
        }
        self.store_snapshot(
            self.health
                .snapshot(OrchestratorState::Stopped, report),
        );
        tracing::info!("All tasks stopped");
    }

    async fn join_task(
        &self,
        name: String,
        kind: TaskKind,
        mut handle: JoinHandle<TaskExit>,
        timeout: Duration,
    ) {
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(exit)) => tracing::debug!("Task {} exited: {:?}", name, exit),
            Ok(Err(e)) => tracing::warn!("Task {} ended abnormally: {}", name, e),
            Err(_) => {
                tracing::warn!("Task {} ignored cancellation for {:?}; aborting", name, timeout);
                handle.abort();
            }
        }
        self.events.emit(PipelineEvent::TaskStopped {
            run_id: self.events.run_id(),
            task: name,
            kind,
            timestamp: Utc::now(),
        });
    }

    async fn sweep_loop(shared: Arc<Shared>, cancel: CancellationToken) {
        let interval = shared.config.supervision.health_interval();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => shared.sweep_once().await,
            }
        }
    }

    /// Reap finished tasks, restart crashed ones per policy, then publish a
    /// fresh snapshot.
    async fn sweep_once(&self) {
        let mut running = self.running.lock().await;
        let Some(set) = running.as_mut() else {
            return;
        };

        let supervision = &self.config.supervision;
        let now = Instant::now();
        let mut restart = Vec::new();
        let mut given_up = Vec::new();

        for (index, task) in set.tasks.iter_mut().enumerate() {
            if task.quarantined {
                continue;
            }

            if task.handle.as_ref().is_some_and(JoinHandle::is_finished) {
                if let Some(handle) = task.handle.take() {
                    match handle.await {
                        Ok(TaskExit::Quarantined) => {
                            tracing::warn!("Task {} quarantined itself", task.name);
                            task.quarantined = true;
                            task.liveness.quarantine();
                            self.emit_task_quarantined(&task.name);
                            continue;
                        }
                        Ok(TaskExit::Stopped) => {
                            tracing::warn!("Task {} exited unexpectedly", task.name);
                        }
                        Err(e) => {
                            tracing::error!("Task {} crashed: {}", task.name, e);
                        }
                    }
                    task.unhealthy_since = Some(now);
                }
            }

            if task.handle.is_none() {
                let since = *task.unhealthy_since.get_or_insert(now);
                if now.duration_since(since) < supervision.restart_after() {
                    continue;
                }
                if task.liveness.restarts() >= supervision.max_restarts {
                    tracing::error!(
                        "Task {} exceeded {} restarts; quarantining",
                        task.name,
                        supervision.max_restarts
                    );
                    task.quarantined = true;
                    task.liveness.quarantine();
                    self.emit_task_quarantined(&task.name);
                    given_up.push(task.target);
                    continue;
                }
                restart.push(index);
            }
        }

        for target in given_up {
            set.quarantine_nodes(target);
        }

        for index in restart {
            let target = set.tasks[index].target;
            let liveness = set.tasks[index].liveness.clone();
            liveness.record_restart();
            let attempt = liveness.restarts();

            match self.spawn(set, target, liveness) {
                Ok(handle) => {
                    let task = &mut set.tasks[index];
                    tracing::warn!("Restarted task {} (attempt {})", task.name, attempt);
                    task.handle = Some(handle);
                    task.unhealthy_since = None;
                    self.events.emit(PipelineEvent::TaskRestarted {
                        run_id: self.events.run_id(),
                        task: task.name.clone(),
                        attempt,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to restart task {}: {}", set.tasks[index].name, e);
                }
            }
        }

        self.publish_snapshot(Some(&*set));
    }

    fn emit_task_quarantined(&self, task: &str) {
        self.events.emit(PipelineEvent::TaskQuarantined {
            run_id: self.events.run_id(),
            task: task.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn publish_snapshot(&self, set: Option<&RunningSet>) -> Arc<HealthSnapshot> {
        let delivery = set
            .map(|set| set.connector.report())
            .unwrap_or_else(DeliveryReport::default);
        let snapshot = Arc::new(self.health.snapshot(self.state(), delivery));
        self.store(snapshot.clone());
        snapshot
    }

    fn store_snapshot(&self, snapshot: HealthSnapshot) {
        self.store(Arc::new(snapshot));
    }

    fn store(&self, snapshot: Arc<HealthSnapshot>) {
        if let Ok(mut current) = self.snapshot.write() {
            *current = snapshot;
        }
    }
}

impl RunningSet {
    /// Mark the nodes driven by a permanently failed task as quarantined.
    fn quarantine_nodes(&self, target: TaskTarget) {
        let (graph, nodes): (&DataFlowGraph, Vec<&String>) = match target {
            TaskTarget::Delivery => return,
            TaskTarget::Acquisition(index) => {
                let graph = self.graphs[index].graph.as_ref();
                (graph, vec![graph.root()])
            }
            TaskTarget::Worker(index) => {
                let graph = self.graphs[index].graph.as_ref();
                (graph, graph.transform_order().iter().collect())
            }
        };
        for node in nodes {
            if let Some(counters) = graph.counters(node) {
                counters.set_state(NodeState::Quarantined);
            }
        }
    }
}
