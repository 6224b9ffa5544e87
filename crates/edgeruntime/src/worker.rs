use crate::delivery::DeliveryConnector;
use crate::graph::DataFlowGraph;
use crate::health::TaskExit;
use edgecore::{
    Artifact, DataUnit, DeliveryOutcome, DeliveryUnit, EventEmitter, FanInPolicy, Inputs, NodeError,
    NodeId, NodeOutput, NodeOutputs, NodeState, StreamLabel, Transform, TryPublish,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rows of one record-format terminal stream waiting to go out as a batch.
struct Journal {
    opened: Instant,
    units: Vec<DataUnit>,
}

/// Per-graph scheduler: moves units from stream buffers into transforms in
/// topological order and hands terminal outputs to delivery.
pub struct Worker {
    graph: Arc<DataFlowGraph>,
    transforms: HashMap<NodeId, Box<dyn Transform>>,
    delivery: Arc<DeliveryConnector>,
    events: EventEmitter,
    staged: HashMap<NodeId, BTreeMap<StreamLabel, VecDeque<DataUnit>>>,
    journals: BTreeMap<StreamLabel, Journal>,
}

impl Worker {
    pub fn new(
        graph: Arc<DataFlowGraph>,
        transforms: HashMap<NodeId, Box<dyn Transform>>,
        delivery: Arc<DeliveryConnector>,
        events: EventEmitter,
    ) -> Self {
        Self {
            graph,
            transforms,
            delivery,
            events,
            staged: HashMap::new(),
            journals: BTreeMap::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> TaskExit {
        let cadence = self.graph.settings().tick_interval();
        tracing::info!(
            "Worker for {} started ({} transforms, tick {:?})",
            self.graph.name(),
            self.transforms.len(),
            cadence
        );

        loop {
            let moved = self.tick(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            if moved > 0 {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(cadence) => {}
            }
        }

        // Hand whatever acquisition already published to delivery. The stop
        // token is cancelled, so failed writes spill instead of backing off.
        let flushed = self.tick(&cancel).await;
        self.flush_journals(true, &cancel).await;
        for id in self.graph.transform_order() {
            if let Some(counters) = self.graph.counters(id) {
                counters.set_state(NodeState::Stopped);
            }
        }
        tracing::info!(
            "Worker for {} stopped ({} units in final flush)",
            self.graph.name(),
            flushed
        );
        TaskExit::Stopped
    }

    /// One scheduling pass over the graph. Returns the number of units moved.
    ///
    /// `stop` bounds any delivery backoff the pass runs into.
    pub async fn tick(&mut self, stop: &CancellationToken) -> usize {
        let graph = self.graph.clone();
        let mut moved = self.route_outputs(graph.root(), stop).await;

        for node in graph.transform_order() {
            if let Some(inputs) = self.take_inputs(node) {
                moved += inputs.len();
                self.invoke(node, &inputs, stop).await;
            }
            moved += self.route_outputs(node, stop).await;
        }
        self.flush_journals(false, stop).await;
        moved
    }

    /// Drain every stream of `node`: stage for downstream transforms, add to
    /// the stream's journal, or deliver when the stream is terminal.
    async fn route_outputs(&mut self, node: &NodeId, stop: &CancellationToken) -> usize {
        let graph = self.graph.clone();
        let delivery = self.delivery.clone();
        let Some(outputs) = graph.outputs(node) else {
            return 0;
        };

        let mut moved = 0;
        for buffer in outputs.streams() {
            let units = buffer.drain();
            if units.is_empty() {
                continue;
            }
            moved += units.len();

            let label = buffer.label();
            let targets = graph.routes_from(label);
            if targets.is_empty() {
                if buffer.stream().format.is_record() {
                    self.journals
                        .entry(label.clone())
                        .or_insert_with(|| Journal {
                            opened: Instant::now(),
                            units: Vec::new(),
                        })
                        .units
                        .extend(units);
                } else {
                    for unit in units {
                        deliver(&graph, &delivery, &[unit], stop).await;
                    }
                }
                continue;
            }

            let capacity = graph.settings().buffer_capacity.max(1);
            for target in targets {
                let queue = self
                    .staged
                    .entry(target.clone())
                    .or_default()
                    .entry(label.clone())
                    .or_default();
                queue.extend(units.iter().cloned());

                let excess = queue.len().saturating_sub(capacity);
                if excess > 0 {
                    queue.drain(..excess);
                    if let Some(counters) = graph.counters(target) {
                        counters.record_inputs_dropped(excess as u64);
                    }
                    tracing::warn!(
                        "Inputs of {} from {} over capacity; dropped {} oldest",
                        target,
                        label,
                        excess
                    );
                }
            }
        }
        moved
    }

    /// Deliver journals that are old or large enough, or all of them.
    async fn flush_journals(&mut self, all: bool, stop: &CancellationToken) {
        if self.journals.is_empty() {
            return;
        }
        let window = self.graph.settings().journal_window();
        let max_rows = self.graph.settings().buffer_capacity.max(1);
        let due: Vec<StreamLabel> = self
            .journals
            .iter()
            .filter(|(_, journal)| {
                all || journal.opened.elapsed() >= window || journal.units.len() >= max_rows
            })
            .map(|(label, _)| label.clone())
            .collect();

        for label in due {
            if let Some(journal) = self.journals.remove(&label) {
                tracing::debug!("Flushing journal {} ({} rows)", label, journal.units.len());
                deliver(&self.graph, &self.delivery, &journal.units, stop).await;
            }
        }
    }

    /// Inputs ready for `node` under the graph's fan-in policy.
    fn take_inputs(&mut self, node: &NodeId) -> Option<Inputs> {
        let staged = self.staged.get_mut(node)?;
        if staged.values().all(VecDeque::is_empty) {
            return None;
        }

        if self.graph.settings().fan_in == FanInPolicy::WaitAll {
            let ready = self.graph.inbound(node).iter().all(|label| {
                staged
                    .get(label)
                    .map(|queue| !queue.is_empty())
                    .unwrap_or(false)
            });
            if !ready {
                return None;
            }
        }

        let mut inputs = Inputs::new();
        for (label, queue) in staged.iter_mut() {
            inputs.insert(label.clone(), queue.drain(..).collect());
        }
        Some(inputs)
    }

    async fn invoke(&mut self, node: &NodeId, inputs: &Inputs, stop: &CancellationToken) {
        let Some(outputs) = self.graph.outputs(node).cloned() else {
            return;
        };
        let counters = outputs.counters().clone();
        let Some(transform) = self.transforms.get_mut(node) else {
            tracing::error!("No instance for transform {}", node);
            return;
        };

        counters.set_state(NodeState::Processing);
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| transform.process(inputs)));
        counters.record_invocation(started.elapsed());

        let failure = match result {
            Ok(Ok(output)) => {
                counters.record_success();
                match self.publish_routed(node, &outputs, output, stop).await {
                    Ok(()) => None,
                    Err(e) => Some(format!("published to an undeclared stream: {}", e)),
                }
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };

        if let Some(error) = failure {
            let consecutive = counters.record_error(error.clone());
            tracing::warn!(
                "Transform {}/{} failed ({} in a row), discarding {} inputs: {}",
                self.graph.name(),
                node,
                consecutive,
                inputs.len(),
                error
            );
            self.events.transform_failed(node, inputs.len(), error);
        }
        counters.set_state(NodeState::Idle);
    }

    /// Publish a transform's outputs onto its own streams. The worker is the
    /// only consumer of those streams, so a full one is routed on the spot
    /// rather than waited on.
    async fn publish_routed(
        &mut self,
        node: &NodeId,
        outputs: &NodeOutputs,
        output: NodeOutput,
        stop: &CancellationToken,
    ) -> Result<(), NodeError> {
        for (index, value) in output.outputs {
            if let TryPublish::Full(unit) = outputs.try_publish(index, value)? {
                self.route_outputs(node, stop).await;
                outputs.publish_now(unit)?;
            }
        }
        Ok(())
    }
}

/// Deliver units of one terminal stream as a single delivery unit: a record
/// stream's rows form one journal batch, anything else is a single file.
async fn deliver(
    graph: &DataFlowGraph,
    delivery: &DeliveryConnector,
    units: &[DataUnit],
    stop: &CancellationToken,
) {
    let Some(first) = units.first() else {
        return;
    };
    let Some(stream) = graph.stream(&first.origin) else {
        return;
    };

    let artifact = if stream.format.is_record() {
        Artifact::journal(units.iter().map(|unit| &unit.value))
    } else {
        Artifact::from_value(stream.format, &first.value)
    };
    let delivery_unit = DeliveryUnit {
        graph: graph.name().to_string(),
        container: stream.destination_container.clone(),
        sequence: graph.next_sequence(&first.origin),
        format: stream.format,
        artifact,
        produced_at: first.produced_at,
        origin: first.origin.clone(),
        units: units.len() as u64,
        attempts: 0,
    };

    match delivery.deliver(delivery_unit, stop).await {
        Ok(DeliveryOutcome::Spilled) => {
            tracing::debug!("Unit from {} spilled", graph.name());
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Delivery from {} failed: {}", graph.name(), e),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
