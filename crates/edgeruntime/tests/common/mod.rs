#![allow(dead_code)]

use async_trait::async_trait;
use edgecore::{
    AcquisitionSource, Artifact, DataFormat, DeliveryError, Inputs, NodeError, NodeInstance,
    NodeOutput, NodeRole, StorageBackend, Stream, Transform, Value,
};
use edgeruntime::{NodeFactory, NodeRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

fn config_u64(config: &HashMap<String, Value>, key: &str) -> Option<u64> {
    config.get(key).and_then(Value::as_f64).map(|n| n as u64)
}

fn config_bool(config: &HashMap<String, Value>, key: &str) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Emits `reading-N` on stream 0 (and stream 1 when `mirror` is set).
///
/// Config: `limit` stops emitting after N readings, `fail_first` fails the
/// first N reads, `fail_always` never succeeds, `panic_on` panics on read N
/// (counted across instances), `panic_always` panics on every read and
/// `hang_on_shutdown` ignores the stop request.
pub struct ScriptedSource {
    node_type: &'static str,
    next: u64,
    limit: Option<u64>,
    fail_first: u64,
    fail_always: bool,
    panic_on: Option<u64>,
    panic_always: bool,
    hang_on_shutdown: bool,
    mirror: bool,
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl AcquisitionSource for ScriptedSource {
    fn source_type(&self) -> &str {
        self.node_type
    }

    async fn read(&mut self) -> Result<NodeOutput, NodeError> {
        let attempt = self.reads.fetch_add(1, Ordering::SeqCst) as u64;
        if self.panic_always || Some(attempt) == self.panic_on {
            panic!("driver crashed on read {}", attempt);
        }
        if self.fail_always || attempt < self.fail_first {
            return Err(NodeError::ReadFailed("device not responding".into()));
        }
        if self.limit.is_some_and(|limit| self.next >= limit) {
            return std::future::pending().await;
        }

        let value = format!("reading-{}", self.next);
        self.next += 1;
        let mut output = NodeOutput::new().with_output(0, value.clone());
        if self.mirror {
            output.push(1, value);
        }
        Ok(output)
    }

    async fn shutdown(&mut self) -> Result<(), NodeError> {
        if self.hang_on_shutdown {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }
}

/// Shares one read counter across every instance it creates, so restarts
/// are visible to the test.
pub struct ScriptedFactory {
    node_type: &'static str,
    reads: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new(node_type: &'static str) -> Arc<Self> {
        Arc::new(Self {
            node_type,
            reads: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl NodeFactory for ScriptedFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<NodeInstance, NodeError> {
        Ok(NodeInstance::Acquisition(Box::new(ScriptedSource {
            node_type: self.node_type,
            next: 0,
            limit: config_u64(config, "limit"),
            fail_first: config_u64(config, "fail_first").unwrap_or(0),
            fail_always: config_bool(config, "fail_always"),
            panic_on: config_u64(config, "panic_on"),
            panic_always: config_bool(config, "panic_always"),
            hang_on_shutdown: config_bool(config, "hang_on_shutdown"),
            mirror: config_bool(config, "mirror"),
            reads: self.reads.clone(),
        })))
    }

    fn node_type(&self) -> &str {
        self.node_type
    }

    fn role(&self) -> NodeRole {
        NodeRole::Acquisition
    }
}

/// Copies every input unit to stream 0.
pub struct Forward;

impl Transform for Forward {
    fn node_type(&self) -> &str {
        "test.forward"
    }

    fn process(&mut self, inputs: &Inputs) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();
        for unit in inputs.units() {
            output.push(0, unit.value.clone());
        }
        Ok(output)
    }
}

/// Always fails.
pub struct Broken;

impl Transform for Broken {
    fn node_type(&self) -> &str {
        "test.broken"
    }

    fn process(&mut self, _inputs: &Inputs) -> Result<NodeOutput, NodeError> {
        Err(NodeError::ProcessingFailed("calibration table missing".into()))
    }
}

/// Emits one `labels=N units=M` summary per invocation.
pub struct Merge;

impl Transform for Merge {
    fn node_type(&self) -> &str {
        "test.merge"
    }

    fn process(&mut self, inputs: &Inputs) -> Result<NodeOutput, NodeError> {
        let summary = format!("labels={} units={}", inputs.labels().count(), inputs.len());
        Ok(NodeOutput::new().with_output(0, summary))
    }
}

pub struct TransformFactory {
    node_type: &'static str,
    build: fn() -> Box<dyn Transform>,
}

impl NodeFactory for TransformFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<NodeInstance, NodeError> {
        Ok(NodeInstance::Transform((self.build)()))
    }

    fn node_type(&self) -> &str {
        self.node_type
    }

    fn role(&self) -> NodeRole {
        NodeRole::Transform
    }
}

pub fn registry(sources: &[Arc<ScriptedFactory>]) -> Arc<NodeRegistry> {
    let mut registry = NodeRegistry::new();
    for source in sources {
        registry.register(source.clone());
    }
    registry.register(Arc::new(TransformFactory {
        node_type: "test.forward",
        build: || Box::new(Forward),
    }));
    registry.register(Arc::new(TransformFactory {
        node_type: "test.broken",
        build: || Box::new(Broken),
    }));
    registry.register(Arc::new(TransformFactory {
        node_type: "test.merge",
        build: || Box::new(Merge),
    }));
    Arc::new(registry)
}

pub fn text_stream(index: u32) -> Stream {
    Stream::new(format!("out{}", index), "TEXT", index, DataFormat::Txt).with_container("raw")
}

#[derive(Debug, Clone)]
pub struct Stored {
    pub container: String,
    pub blob_name: String,
    pub sequence: u64,
    pub body: String,
}

/// In-memory backend that can be scripted to fail.
#[derive(Default)]
pub struct RecordingBackend {
    pub stored: Mutex<Vec<Stored>>,
    pub fail_next: AtomicU32,
    pub offline: AtomicBool,
    pub calls: AtomicUsize,
}

impl RecordingBackend {
    pub fn stored(&self) -> Vec<Stored> {
        self.stored.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.stored().into_iter().map(|s| s.body).collect()
    }

    pub fn count(&self) -> usize {
        self.stored.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    async fn put(
        &self,
        container: &str,
        blob_name: &str,
        artifact: &Artifact,
        sequence: u64,
    ) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(DeliveryError::Retryable("connection refused".into()));
        }
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(DeliveryError::Retryable("503 service unavailable".into()));
        }

        let body = match artifact {
            Artifact::File { bytes } => String::from_utf8_lossy(bytes).into_owned(),
            Artifact::Records { rows } => serde_json::to_string(rows).unwrap(),
        };
        self.stored.lock().unwrap().push(Stored {
            container: container.to_string(),
            blob_name: blob_name.to_string(),
            sequence,
            body,
        });
        Ok(())
    }

    async fn check_connection(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
