//! Bounded per-stream buffers and the publishing side of a node.

use crate::sampling::{self, RandomSource};
use crate::{DataUnit, NodeCounters, NodeError, NodeId, NodeOutput, Stream, StreamLabel, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What a full buffer does with a new unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest queued unit immediately.
    #[default]
    EvictOldest,
    /// Wait up to the publish timeout for the worker to make room, then evict.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Evicted,
}

/// Bounded FIFO of pending units for one stream.
///
/// Single producer (the owning node), single consumer (the graph's worker).
#[derive(Debug)]
pub struct StreamBuffer {
    label: StreamLabel,
    stream: Stream,
    capacity: usize,
    policy: OverflowPolicy,
    publish_timeout: Duration,
    queue: Mutex<VecDeque<DataUnit>>,
    space: Notify,
    evicted: AtomicU64,
}

impl StreamBuffer {
    pub fn new(
        label: StreamLabel,
        stream: Stream,
        capacity: usize,
        policy: OverflowPolicy,
        publish_timeout: Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            label,
            stream,
            capacity,
            policy,
            publish_timeout,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Notify::new(),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DataUnit>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn label(&self) -> &StreamLabel {
        &self.label
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Total number of units evicted because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Enqueue a unit, evicting the oldest one if there is no room.
    ///
    /// Under [`OverflowPolicy::Block`] this waits at most `publish_timeout`.
    pub async fn push(&self, unit: DataUnit) -> PushOutcome {
        if self.policy == OverflowPolicy::Block {
            self.wait_for_space().await;
        }
        self.push_now(unit)
    }

    /// Enqueue without waiting, evicting the oldest unit if there is no room.
    pub fn push_now(&self, unit: DataUnit) -> PushOutcome {
        let mut queue = self.lock();
        let outcome = if queue.len() >= self.capacity {
            queue.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
            PushOutcome::Evicted
        } else {
            PushOutcome::Queued
        };
        queue.push_back(unit);
        outcome
    }

    /// Enqueue only if there is room; a full buffer hands the unit back.
    pub fn try_push(&self, unit: DataUnit) -> Result<(), DataUnit> {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            return Err(unit);
        }
        queue.push_back(unit);
        Ok(())
    }

    async fn wait_for_space(&self) {
        let deadline = Instant::now() + self.publish_timeout;
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.len() < self.capacity {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return;
            }
        }
    }

    /// Remove and return every queued unit in publish order.
    pub fn drain(&self) -> Vec<DataUnit> {
        let drained: Vec<DataUnit> = self.lock().drain(..).collect();
        if !drained.is_empty() {
            self.space.notify_waiters();
        }
        drained
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Queued,
    SampledOut,
    QueuedWithEviction,
}

/// Result of a publish that must not wait for space.
#[derive(Debug)]
pub enum TryPublish {
    Done(PublishOutcome),
    /// The stream is full; the unit already passed sampling and should be
    /// handed to [`NodeOutputs::publish_now`] once the buffer is drained.
    Full(DataUnit),
}

/// The output side of one node: its stream buffers plus sampling and counters.
pub struct NodeOutputs {
    node: NodeId,
    streams: BTreeMap<u32, Arc<StreamBuffer>>,
    counters: Arc<NodeCounters>,
    random: Arc<dyn RandomSource>,
}

impl NodeOutputs {
    pub fn new(
        node: NodeId,
        streams: impl IntoIterator<Item = Arc<StreamBuffer>>,
        counters: Arc<NodeCounters>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        let streams = streams
            .into_iter()
            .map(|buffer| (buffer.stream().index, buffer))
            .collect();
        Self {
            node,
            streams,
            counters,
            random,
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn counters(&self) -> &Arc<NodeCounters> {
        &self.counters
    }

    pub fn stream(&self, index: u32) -> Option<&Arc<StreamBuffer>> {
        self.streams.get(&index)
    }

    pub fn streams(&self) -> impl Iterator<Item = &Arc<StreamBuffer>> {
        self.streams.values()
    }

    /// Total units waiting across every stream of this node.
    pub fn pending(&self) -> usize {
        self.streams.values().map(|buffer| buffer.len()).sum()
    }

    pub async fn publish(&self, index: u32, value: Value) -> Result<PublishOutcome, NodeError> {
        let buffer = self
            .streams
            .get(&index)
            .ok_or(NodeError::UnknownStream(index))?;

        if !sampling::keep(buffer.stream().sample_rate, self.random.as_ref()) {
            self.counters.record_sampled_out();
            return Ok(PublishOutcome::SampledOut);
        }

        let unit = DataUnit::new(buffer.label().clone(), value);
        self.counters.record_published();
        Ok(self.pushed(buffer, buffer.push(unit).await))
    }

    /// Publish without ever waiting: a full stream returns the sampled unit
    /// instead of blocking, whatever the overflow policy.
    pub fn try_publish(&self, index: u32, value: Value) -> Result<TryPublish, NodeError> {
        let buffer = self
            .streams
            .get(&index)
            .ok_or(NodeError::UnknownStream(index))?;

        if !sampling::keep(buffer.stream().sample_rate, self.random.as_ref()) {
            self.counters.record_sampled_out();
            return Ok(TryPublish::Done(PublishOutcome::SampledOut));
        }

        let unit = DataUnit::new(buffer.label().clone(), value);
        match buffer.try_push(unit) {
            Ok(()) => {
                self.counters.record_published();
                Ok(TryPublish::Done(PublishOutcome::Queued))
            }
            Err(unit) => Ok(TryPublish::Full(unit)),
        }
    }

    /// Enqueue a unit returned by [`NodeOutputs::try_publish`], evicting the
    /// oldest if its stream is still full.
    pub fn publish_now(&self, unit: DataUnit) -> Result<PublishOutcome, NodeError> {
        let index = unit.origin.stream;
        let buffer = self
            .streams
            .get(&index)
            .ok_or(NodeError::UnknownStream(index))?;
        self.counters.record_published();
        Ok(self.pushed(buffer, buffer.push_now(unit)))
    }

    fn pushed(&self, buffer: &StreamBuffer, outcome: PushOutcome) -> PublishOutcome {
        match outcome {
            PushOutcome::Queued => PublishOutcome::Queued,
            PushOutcome::Evicted => {
                self.counters.record_overflow(1);
                tracing::warn!("Stream {} full; evicted oldest unit", buffer.label());
                PublishOutcome::QueuedWithEviction
            }
        }
    }

    /// Publish every output of one node invocation, in order.
    pub async fn publish_all(&self, output: NodeOutput) -> Result<(), NodeError> {
        for (index, value) in output.outputs {
            self.publish(index, value).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for NodeOutputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeOutputs")
            .field("node", &self.node)
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .finish()
    }
}
