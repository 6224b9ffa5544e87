use crate::backoff::Backoff;
use crate::graph::DataFlowGraph;
use crate::health::TaskExit;
use edgecore::{
    AcquisitionMode, AcquisitionSettings, AcquisitionSource, EventEmitter, GraphError, NodeId,
    NodeOutputs, NodeState,
};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Drives the acquisition root of one graph on its own task.
///
/// Read failures back off exponentially; after `failure_ceiling` consecutive
/// failures the node is quarantined and the task ends.
pub struct AcquisitionTask {
    graph: String,
    node: NodeId,
    source: Box<dyn AcquisitionSource>,
    outputs: Arc<NodeOutputs>,
    settings: AcquisitionSettings,
    events: EventEmitter,
    trigger: Arc<Notify>,
}

impl AcquisitionTask {
    pub fn new(
        graph: &DataFlowGraph,
        source: Box<dyn AcquisitionSource>,
        events: EventEmitter,
        trigger: Arc<Notify>,
    ) -> Result<Self, GraphError> {
        let spec = graph
            .root_spec()
            .ok_or_else(|| GraphError::NodeNotFound(graph.root().clone()))?;
        let outputs = graph
            .outputs(&spec.id)
            .cloned()
            .ok_or_else(|| GraphError::NodeNotFound(spec.id.clone()))?;

        Ok(Self {
            graph: graph.name().to_string(),
            node: spec.id.clone(),
            settings: spec.acquisition.clone(),
            source,
            outputs,
            events,
            trigger,
        })
    }

    pub async fn run(self, cancel: CancellationToken) -> TaskExit {
        let AcquisitionTask {
            graph,
            node,
            mut source,
            outputs,
            settings,
            events,
            trigger,
        } = self;

        let counters = outputs.counters().clone();
        let backoff = Backoff::for_acquisition(&settings);
        let ceiling = settings.failure_ceiling.max(1);
        let mut failures: u32 = 0;
        let mut initialized = false;

        tracing::info!(
            "Acquisition {}/{} ({}) started in {:?} mode",
            graph,
            node,
            source.source_type(),
            settings.mode
        );
        counters.set_state(NodeState::Idle);

        let exit = loop {
            // A failed review read is retried without waiting for a new trigger.
            if settings.mode == AcquisitionMode::Review && failures == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break TaskExit::Stopped,
                    _ = trigger.notified() => {}
                }
            }

            counters.set_state(NodeState::Acquiring);
            let read = async {
                if !initialized {
                    source.initialize().await?;
                    initialized = true;
                }
                source.read().await
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => break TaskExit::Stopped,
                result = read => result,
            };

            match result {
                Ok(output) => {
                    failures = 0;
                    counters.record_success();
                    if let Err(e) = outputs.publish_all(output).await {
                        counters.record_error(e.to_string());
                        tracing::warn!("Acquisition {}/{} published badly: {}", graph, node, e);
                    }
                    counters.set_state(NodeState::Idle);

                    let interval = settings.read_interval();
                    if settings.mode == AcquisitionMode::Continuous {
                        if interval.is_zero() {
                            tokio::task::yield_now().await;
                        } else {
                            tokio::select! {
                                _ = cancel.cancelled() => break TaskExit::Stopped,
                                _ = tokio::time::sleep(interval) => {}
                            }
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    let consecutive = counters.record_error(e.to_string());
                    events.read_failed(&node, consecutive, e.to_string());

                    if failures >= ceiling {
                        counters.set_state(NodeState::Quarantined);
                        tracing::error!(
                            "Acquisition {}/{} quarantined after {} consecutive failures: {}",
                            graph,
                            node,
                            failures,
                            e
                        );
                        events.node_quarantined(&node);
                        break TaskExit::Quarantined;
                    }

                    let delay = backoff.delay(failures - 1);
                    tracing::warn!(
                        "Acquisition {}/{} failed ({}/{}): {}; retrying in {:?}",
                        graph,
                        node,
                        failures,
                        ceiling,
                        e,
                        delay
                    );
                    counters.set_state(NodeState::Backoff);
                    tokio::select! {
                        _ = cancel.cancelled() => break TaskExit::Stopped,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        if initialized {
            if let Err(e) = source.shutdown().await {
                tracing::warn!("Acquisition {}/{} shutdown failed: {}", graph, node, e);
            }
        }
        if exit == TaskExit::Stopped {
            counters.set_state(NodeState::Stopped);
        }
        tracing::info!("Acquisition {}/{} exited: {:?}", graph, node, exit);
        exit
    }
}
