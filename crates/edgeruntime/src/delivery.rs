//! Delivery of terminal outputs to remote storage: retry with backoff, then
//! spill to a bounded in-memory buffer that is redelivered once the backend
//! is reachable again.

use crate::backoff::Backoff;
use crate::health::HealthRegistry;
use chrono::Utc;
use edgecore::{
    DeliveryError, DeliveryMode, DeliveryOutcome, DeliveryReport, DeliverySettings, DeliveryUnit,
    EventEmitter, PipelineEvent, StorageBackend,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Bounded by unit count and by total artifact bytes; evicts oldest first.
#[derive(Debug)]
pub struct SpillBuffer {
    capacity: usize,
    max_bytes: usize,
    units: VecDeque<DeliveryUnit>,
    bytes: usize,
}

impl SpillBuffer {
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_bytes,
            units: VecDeque::new(),
            bytes: 0,
        }
    }

    /// Store a unit, returning how many units were evicted to make room.
    ///
    /// A unit larger than the byte budget on its own is rejected and counted
    /// as evicted.
    pub fn push(&mut self, unit: DeliveryUnit) -> usize {
        let size = unit.artifact.size();
        if size > self.max_bytes {
            return 1;
        }

        let mut evicted = 0;
        while !self.units.is_empty()
            && (self.units.len() >= self.capacity || self.bytes + size > self.max_bytes)
        {
            self.pop_front();
            evicted += 1;
        }
        self.bytes += size;
        self.units.push_back(unit);
        evicted
    }

    pub fn pop_front(&mut self) -> Option<DeliveryUnit> {
        let unit = self.units.pop_front()?;
        self.bytes = self.bytes.saturating_sub(unit.artifact.size());
        Some(unit)
    }

    /// Put a unit back at the head after a failed redelivery. Returns how
    /// many units were evicted, oldest first, if the buffer overflowed since.
    pub fn requeue(&mut self, unit: DeliveryUnit) -> usize {
        self.bytes += unit.artifact.size();
        self.units.push_front(unit);

        let mut evicted = 0;
        while self.units.len() > self.capacity || self.bytes > self.max_bytes {
            if self.pop_front().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeliveryUnit> {
        self.units.iter()
    }
}

#[derive(Debug, Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    retried: AtomicU64,
    spilled: AtomicU64,
    spill_evicted: AtomicU64,
    redelivered: AtomicU64,
    terminal_failures: AtomicU64,
}

/// Sends terminal outputs to remote storage on behalf of every graph.
pub struct DeliveryConnector {
    backend: Arc<dyn StorageBackend>,
    settings: DeliverySettings,
    backoff: Backoff,
    health: Arc<HealthRegistry>,
    events: EventEmitter,
    spill: Mutex<SpillBuffer>,
    stats: DeliveryStats,
    queue_tx: mpsc::Sender<DeliveryUnit>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<DeliveryUnit>>,
    cancel: CancellationToken,
}

impl DeliveryConnector {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        settings: DeliverySettings,
        health: Arc<HealthRegistry>,
        events: EventEmitter,
        cancel: CancellationToken,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            backoff: Backoff::for_delivery(&settings),
            spill: Mutex::new(SpillBuffer::new(
                settings.spill_capacity,
                settings.spill_max_bytes,
            )),
            backend,
            settings,
            health,
            events,
            stats: DeliveryStats::default(),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            cancel,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    fn spill_buffer(&self) -> MutexGuard<'_, SpillBuffer> {
        self.spill.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a unit to remote storage according to the delivery mode.
    ///
    /// In synchronous mode this returns after the write succeeds, retries
    /// are exhausted or `stop` is cancelled; the last two spill the unit. A
    /// terminal backend error is returned as `Err` and the unit is dropped.
    pub async fn deliver(
        &self,
        unit: DeliveryUnit,
        stop: &CancellationToken,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        match self.settings.mode {
            DeliveryMode::Synchronous => self.deliver_with_retry(unit, stop).await,
            DeliveryMode::Asynchronous => match self.queue_tx.try_send(unit) {
                Ok(()) => Ok(DeliveryOutcome::Queued),
                Err(TrySendError::Full(unit)) => {
                    tracing::warn!("Delivery queue full; spilling {}", unit.blob_name());
                    self.spill(unit);
                    Ok(DeliveryOutcome::Spilled)
                }
                Err(TrySendError::Closed(unit)) => {
                    self.spill(unit);
                    Ok(DeliveryOutcome::Spilled)
                }
            },
        }
    }

    /// Write one unit, retrying retryable failures with exponential backoff.
    ///
    /// Once `stop` or the connector itself is cancelled a failed write is
    /// spilled straight away instead of waiting for another attempt.
    pub async fn deliver_with_retry(
        &self,
        mut unit: DeliveryUnit,
        stop: &CancellationToken,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let blob_name = unit.blob_name();
        loop {
            match self
                .backend
                .put(&unit.container, &blob_name, &unit.artifact, unit.sequence)
                .await
            {
                Ok(()) => {
                    self.record_delivered(&unit);
                    return Ok(DeliveryOutcome::Delivered);
                }
                Err(e) if !e.is_retryable() => {
                    self.record_terminal(&unit, &e);
                    return Err(e);
                }
                Err(e) => {
                    unit.attempts += 1;
                    if self.cancel.is_cancelled() || stop.is_cancelled() {
                        tracing::warn!("Stopping; spilling {}: {}", blob_name, e);
                        self.spill(unit);
                        return Ok(DeliveryOutcome::Spilled);
                    }
                    if unit.attempts > self.settings.max_retries {
                        tracing::warn!(
                            "Giving up on {} after {} attempts: {}",
                            blob_name,
                            unit.attempts,
                            e
                        );
                        self.spill(unit);
                        return Ok(DeliveryOutcome::Spilled);
                    }

                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    let delay = self.backoff.delay(unit.attempts - 1);
                    tracing::debug!(
                        "Delivery of {} failed ({}); retry {} in {:?}",
                        blob_name,
                        e,
                        unit.attempts,
                        delay
                    );
                    let stopped = tokio::select! {
                        _ = self.cancel.cancelled() => true,
                        _ = stop.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if stopped {
                        tracing::warn!("Stopped during backoff; spilling {}", blob_name);
                        self.spill(unit);
                        return Ok(DeliveryOutcome::Spilled);
                    }
                }
            }
        }
    }

    /// Move a unit into the spill buffer, evicting the oldest if it is full.
    pub fn spill(&self, unit: DeliveryUnit) {
        let origin = unit.origin.clone();
        let sequence = unit.sequence;
        let graph = unit.graph.clone();
        let units = unit.units;

        let evicted = self.spill_buffer().push(unit);
        self.stats.spilled.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.stats
                .spill_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::warn!("Spill buffer full; dropped {} oldest units", evicted);
        }

        if let Some(counters) = self.health.counters(&graph, &origin.node) {
            counters.record_spilled(units);
        }
        self.events.emit(PipelineEvent::UnitSpilled {
            run_id: self.events.run_id(),
            origin,
            sequence,
            timestamp: Utc::now(),
        });
    }

    /// Retry spilled units oldest-first while the backend accepts them.
    ///
    /// Returns the number of units redelivered.
    pub async fn redeliver_spilled(&self) -> usize {
        if self.spill_buffer().is_empty() {
            return 0;
        }
        if !self.backend.check_connection().await {
            tracing::debug!("Backend {} unreachable; keeping spilled units", self.backend.name());
            return 0;
        }

        let mut redelivered = 0;
        loop {
            let Some(unit) = self.spill_buffer().pop_front() else {
                break;
            };
            match self
                .backend
                .put(&unit.container, &unit.blob_name(), &unit.artifact, unit.sequence)
                .await
            {
                Ok(()) => {
                    self.stats.redelivered.fetch_add(1, Ordering::Relaxed);
                    self.record_delivered(&unit);
                    redelivered += 1;
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!("Redelivery interrupted: {}", e);
                    let evicted = self.spill_buffer().requeue(unit);
                    self.stats
                        .spill_evicted
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                    break;
                }
                Err(e) => self.record_terminal(&unit, &e),
            }
        }

        if redelivered > 0 {
            tracing::info!("Redelivered {} spilled units", redelivered);
        }
        redelivered
    }

    fn record_delivered(&self, unit: &DeliveryUnit) {
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = self.health.counters(&unit.graph, &unit.origin.node) {
            counters.record_delivered(unit.units);
        }
        self.events.emit(PipelineEvent::UnitDelivered {
            run_id: self.events.run_id(),
            origin: unit.origin.clone(),
            sequence: unit.sequence,
            timestamp: Utc::now(),
        });
    }

    fn record_terminal(&self, unit: &DeliveryUnit, error: &DeliveryError) {
        self.stats.terminal_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!("Dropping {}: {}", unit.blob_name(), error);
        if let Some(counters) = self.health.counters(&unit.graph, &unit.origin.node) {
            counters.record_error(error.to_string());
        }
        self.events.emit(PipelineEvent::DeliveryFailed {
            run_id: self.events.run_id(),
            origin: unit.origin.clone(),
            sequence: unit.sequence,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Background loop: drains the async queue and periodically redelivers
    /// spilled units. Flushes whatever is still queued once cancelled.
    pub async fn run(&self) {
        let mut queue = self.queue_rx.lock().await;
        let mut redelivery = tokio::time::interval(self.settings.redelivery_interval());
        redelivery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        redelivery.tick().await;

        tracing::info!("Delivery task started (backend: {})", self.backend.name());
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(unit) => self.deliver_queued(unit).await,
                    None => break,
                },
                _ = redelivery.tick() => {
                    self.redeliver_spilled().await;
                }
            }
        }

        let mut flushed = 0;
        while let Ok(unit) = queue.try_recv() {
            self.deliver_queued(unit).await;
            flushed += 1;
        }
        tracing::info!("Delivery task stopped ({} queued units flushed)", flushed);
    }

    async fn deliver_queued(&self, unit: DeliveryUnit) {
        match self.deliver_with_retry(unit, &self.cancel).await {
            Ok(outcome) => tracing::trace!("Queued unit: {:?}", outcome),
            // Already counted and reported as a delivery failure.
            Err(e) => tracing::debug!("Queued unit dropped: {}", e),
        }
    }

    /// Units currently held in the spill buffer, oldest first.
    pub fn spilled_units(&self) -> Vec<DeliveryUnit> {
        self.spill_buffer().iter().cloned().collect()
    }

    pub fn report(&self) -> DeliveryReport {
        DeliveryReport {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            spilled: self.stats.spilled.load(Ordering::Relaxed),
            spill_evicted: self.stats.spill_evicted.load(Ordering::Relaxed),
            redelivered: self.stats.redelivered.load(Ordering::Relaxed),
            terminal_failures: self.stats.terminal_failures.load(Ordering::Relaxed),
            spill_depth: self.spill_buffer().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use edgecore::{Artifact, DataFormat, EventBus, StreamLabel};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Fails the first `failures` writes with the given error.
    struct Flaky {
        failures: u32,
        terminal: bool,
        calls: AtomicU32,
        reachable: std::sync::atomic::AtomicBool,
        stored: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                terminal: false,
                calls: AtomicU32::new(0),
                reachable: std::sync::atomic::AtomicBool::new(true),
                stored: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StorageBackend for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn put(
            &self,
            _container: &str,
            blob_name: &str,
            _artifact: &Artifact,
            _sequence: u64,
        ) -> Result<(), DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.terminal {
                    DeliveryError::Terminal("403 forbidden".into())
                } else {
                    DeliveryError::Retryable("503 unavailable".into())
                });
            }
            self.stored.lock().unwrap().push(blob_name.to_string());
            Ok(())
        }

        async fn check_connection(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }
    }

    fn settings(max_retries: u32) -> DeliverySettings {
        DeliverySettings {
            mode: DeliveryMode::Synchronous,
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            spill_capacity: 3,
            ..DeliverySettings::default()
        }
    }

    fn connector(backend: Arc<Flaky>, settings: DeliverySettings) -> DeliveryConnector {
        let bus = EventBus::new(64);
        DeliveryConnector::new(
            backend,
            settings,
            Arc::new(HealthRegistry::new()),
            bus.create_emitter("delivery"),
            CancellationToken::new(),
        )
    }

    fn unit(sequence: u64) -> DeliveryUnit {
        DeliveryUnit {
            graph: "climate".to_string(),
            container: "raw".to_string(),
            origin: StreamLabel::new("sht31", 0),
            sequence,
            format: DataFormat::Txt,
            artifact: Artifact::File {
                bytes: vec![0; 8],
            },
            produced_at: Utc::now(),
            units: 1,
            attempts: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_below_the_ceiling_deliver_once() {
        let backend = Arc::new(Flaky::new(3));
        let connector = connector(backend.clone(), settings(5));

        let started = tokio::time::Instant::now();
        let outcome = connector.deliver(unit(0), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(backend.stored.lock().unwrap().len(), 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_millis(10 + 20 + 40));
        let report = connector.report();
        assert_eq!(report.retried, 3);
        assert_eq!(report.spilled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_spill_the_unit() {
        let backend = Arc::new(Flaky::new(10));
        let connector = connector(backend.clone(), settings(2));

        let outcome = connector.deliver(unit(0), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Spilled);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(connector.spilled_units().len(), 1);
        assert_eq!(connector.spilled_units()[0].attempts, 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let backend = Arc::new(Flaky {
            terminal: true,
            ..Flaky::new(1)
        });
        let connector = connector(backend.clone(), settings(5));

        let result = connector.deliver(unit(0), &CancellationToken::new()).await;

        assert!(matches!(result, Err(DeliveryError::Terminal(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.report().terminal_failures, 1);
        assert_eq!(connector.report().spill_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_spills_a_unit_waiting_on_backoff() {
        let backend = Arc::new(Flaky::new(10));
        let connector = connector(
            backend.clone(),
            DeliverySettings {
                initial_backoff_ms: 60_000,
                max_backoff_ms: 60_000,
                ..settings(5)
            },
        );
        let stop = CancellationToken::new();

        let started = tokio::time::Instant::now();
        let (outcome, ()) = tokio::join!(connector.deliver(unit(0), &stop), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            stop.cancel();
        });

        assert_eq!(outcome.unwrap(), DeliveryOutcome::Spilled);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.report().spill_depth, 1);

        // After the stop a failed write is spilled without any backoff.
        assert_eq!(
            connector.deliver(unit(1), &stop).await.unwrap(),
            DeliveryOutcome::Spilled
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(connector.report().retried, 1);
        assert_eq!(connector.report().spill_depth, 2);
    }

    #[tokio::test]
    async fn spill_is_bounded_and_redelivered_oldest_first() {
        let backend = Arc::new(Flaky::new(0));
        backend.reachable.store(false, Ordering::SeqCst);
        let connector = connector(backend.clone(), settings(0));

        for sequence in 0..5 {
            connector.spill(unit(sequence));
        }
        assert_eq!(connector.report().spill_depth, 3);
        assert_eq!(connector.report().spill_evicted, 2);
        assert_eq!(connector.redeliver_spilled().await, 0);

        backend.reachable.store(true, Ordering::SeqCst);
        assert_eq!(connector.redeliver_spilled().await, 3);

        let stored = backend.stored.lock().unwrap().clone();
        let sequences: Vec<&str> = stored
            .iter()
            .map(|name| name.rsplit('.').nth(1).unwrap())
            .collect();
        assert_eq!(sequences, vec!["0000000002", "0000000003", "0000000004"]);
        assert_eq!(connector.report().redelivered, 3);
    }

    #[test]
    fn spill_buffer_respects_byte_budget() {
        let mut spill = SpillBuffer::new(10, 20);
        assert_eq!(spill.push(unit(0)), 0);
        assert_eq!(spill.push(unit(1)), 0);
        assert_eq!(spill.push(unit(2)), 1);
        assert_eq!(spill.len(), 2);
        assert_eq!(spill.bytes(), 16);

        let oversized = DeliveryUnit {
            artifact: Artifact::File {
                bytes: vec![0; 64],
            },
            ..unit(3)
        };
        assert_eq!(spill.push(oversized), 1);
        assert_eq!(spill.len(), 2);
    }

    #[tokio::test]
    async fn async_mode_delivers_through_background_task() {
        let backend = Arc::new(Flaky::new(0));
        let connector = Arc::new(connector(
            backend.clone(),
            DeliverySettings {
                mode: DeliveryMode::Asynchronous,
                ..settings(3)
            },
        ));

        for sequence in 0..4 {
            assert_eq!(
                connector
                    .deliver(unit(sequence), &CancellationToken::new())
                    .await
                    .unwrap(),
                DeliveryOutcome::Queued
            );
        }

        let runner = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.run().await })
        };
        connector.cancel.cancel();
        runner.await.unwrap();

        assert_eq!(backend.stored.lock().unwrap().len(), 4);
        assert_eq!(connector.report().delivered, 4);
    }
}
