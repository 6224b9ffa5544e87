//! Remote storage backends.
//!
//! `MemoryBackend` emulates the cloud store on the device and is what tests
//! and dry runs deliver into. `HttpBackend` PUTs each artifact to
//! `{base_url}/{container}/{blob_name}`.

use async_trait::async_trait;
use edgecore::{Artifact, BackendSpec, DeliveryError, StorageBackend};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    pub container: String,
    pub name: String,
    pub sequence: u64,
    pub artifact: Artifact,
}

/// In-memory store keyed by container and blob name; a repeated write of the
/// same name overwrites.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: Mutex<BTreeMap<(String, String), StoredBlob>>,
    offline: AtomicBool,
    fail_next: AtomicU32,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every write fails with a retryable error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` writes with a retryable error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, container: &str, name: &str) -> Option<StoredBlob> {
        self.blobs
            .lock()
            .ok()?
            .get(&(container.to_string(), name.to_string()))
            .cloned()
    }

    /// Every stored blob, ordered by container then name.
    pub fn blobs(&self) -> Vec<StoredBlob> {
        self.blobs
            .lock()
            .map(|blobs| blobs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|blobs| blobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful writes, counting overwrites.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(
        &self,
        container: &str,
        blob_name: &str,
        artifact: &Artifact,
        sequence: u64,
    ) -> Result<(), DeliveryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DeliveryError::Retryable("storage offline".to_string()));
        }
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if scripted.is_ok() {
            return Err(DeliveryError::Retryable("scripted failure".to_string()));
        }

        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| DeliveryError::Terminal("memory store poisoned".to_string()))?;
        blobs.insert(
            (container.to_string(), blob_name.to_string()),
            StoredBlob {
                container: container.to_string(),
                name: blob_name.to_string(),
                sequence,
                artifact: artifact.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Stored {}/{} ({} bytes)", container, blob_name, artifact.size());
        Ok(())
    }

    async fn check_connection(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

/// Object store reached over HTTP.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpBackend {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Terminal(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn url(&self, container: &str, blob_name: &str) -> String {
        format!("{}/{}/{}", self.base_url, container, blob_name)
    }
}

/// Auth and not-found problems will not fix themselves; throttling, timeouts
/// and server errors might.
fn classify(status: StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("storage responded {}", status);
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Err(DeliveryError::Retryable(message))
        }
        s if s.is_server_error() => Err(DeliveryError::Retryable(message)),
        _ => Err(DeliveryError::Terminal(message)),
    }
}

#[async_trait]
impl StorageBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn put(
        &self,
        container: &str,
        blob_name: &str,
        artifact: &Artifact,
        sequence: u64,
    ) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .put(self.url(container, blob_name))
            .header("x-edgeflow-sequence", sequence.to_string());
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        request = match artifact {
            Artifact::File { bytes } => request
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes.clone()),
            Artifact::Records { rows } => request.json(rows),
        };

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable(format!("HTTP request failed: {}", e)))?;
        classify(response.status())
    }

    async fn check_connection(&self) -> bool {
        match self.client.head(&self.base_url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Storage at {} unreachable: {}", self.base_url, e);
                false
            }
        }
    }
}

/// Build the backend a device configuration asks for.
pub fn backend_from_spec(spec: &BackendSpec) -> Result<Arc<dyn StorageBackend>, DeliveryError> {
    match spec {
        BackendSpec::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendSpec::Http {
            base_url,
            auth_token,
            timeout_ms,
        } => Ok(Arc::new(HttpBackend::new(
            base_url.clone(),
            auth_token.clone(),
            Duration::from_millis(*timeout_ms),
        )?)),
    }
}
