//! Batch upload of collected traces to a remote collector.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracekeep_config::{AutoUploadConfig, CollectorConfig};
use tracekeep_core::{now_ms, TraceError, UploadPayload, UploadResult};

use crate::collector::TraceCollector;
use crate::store::{keys, write_json};

/// Sends a JSON body and reports the response status.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(&self, url: &str, body: String) -> Result<u16, TraceError>;
}

/// [`HttpTransport`] backed by a shared `reqwest` client.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, body: String) -> Result<u16, TraceError> {
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| TraceError::Transport(e.to_string()))?;

        Ok(response.status().as_u16())
    }
}

struct UploadInner {
    collector: TraceCollector,
    transport: Arc<dyn HttpTransport>,
    endpoint: String,
    auto: Mutex<AutoUploadConfig>,
    task: Mutex<Option<JoinHandle<()>>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl Drop for UploadInner {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().ok().and_then(Option::take) {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Uploads traces that have not been uploaded yet, manually or on a timer.
///
/// Delivery is at-least-once: traces are only marked uploaded after the
/// collector accepts them, so failed or cancelled attempts retry next time.
#[derive(Clone)]
pub struct UploadClient {
    inner: Arc<UploadInner>,
}

impl UploadClient {
    /// Creates a client and starts auto-upload if the persisted (or configured)
    /// settings enable it. Must be called inside a Tokio runtime.
    pub fn new(
        collector: TraceCollector,
        transport: Arc<dyn HttpTransport>,
        config: &CollectorConfig,
    ) -> Self {
        let auto = match collector.storage().get(keys::AUTO_UPLOAD_CONFIG) {
            Ok(Some(raw)) => AutoUploadConfig::parse_or_default(&raw),
            Ok(None) => config.auto_upload,
            Err(e) => {
                tracing::warn!("Failed to read auto-upload config: {}", e);
                config.auto_upload
            }
        };

        let client = Self {
            inner: Arc::new(UploadInner {
                collector,
                transport,
                endpoint: config.upload_endpoint(),
                auto: Mutex::new(auto),
                task: Mutex::new(None),
                in_flight: tokio::sync::Mutex::new(()),
            }),
        };
        client.restart_auto_upload(auto);
        client
    }

    /// Creates a client that posts with `reqwest`.
    pub fn with_reqwest(collector: TraceCollector, config: &CollectorConfig) -> Self {
        Self::new(collector, Arc::new(ReqwestTransport::new()), config)
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Uploads all traces not yet uploaded, with the feedback for their threads.
    ///
    /// Never errors; failures are reported in the result and leave the traces
    /// pending. An empty batch succeeds without contacting the server.
    pub async fn upload_to_server(&self, cancel: Option<&CancellationToken>) -> UploadResult {
        let _in_flight = self.inner.in_flight.lock().await;
        let collector = &self.inner.collector;
        collector.settle().await;

        let (traces, feedback) = collector.pending_upload();
        if traces.is_empty() {
            return UploadResult::ok(0, "No new traces to upload");
        }

        let count = traces.len();
        let ids: Vec<String> = traces.iter().map(|t| t.id.clone()).collect();
        let payload = UploadPayload::new(traces, feedback, now_ms());
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => return UploadResult::failed(TraceError::from(e).to_string()),
        };

        match self.post(body, cancel).await {
            Ok(status) => {
                if let Err(e) = collector.mark_uploaded(&ids) {
                    tracing::warn!("Uploaded traces but failed to record them: {}", e);
                }
                tracing::info!(count, status, endpoint = %self.inner.endpoint, "Uploaded traces");
                UploadResult::ok(count, format!("Uploaded {} traces", count))
            }
            Err(e) => {
                tracing::warn!(count, "Trace upload failed: {}", e);
                UploadResult::failed(e.to_string())
            }
        }
    }

    async fn post(
        &self,
        body: String,
        cancel: Option<&CancellationToken>,
    ) -> Result<u16, TraceError> {
        let request = self.inner.transport.post_json(&self.inner.endpoint, body);
        let status = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TraceError::Cancelled),
                result = request => result?,
            },
            None => request.await?,
        };

        if status >= 400 {
            return Err(TraceError::Status(status));
        }
        Ok(status)
    }

    pub fn get_auto_upload_config(&self) -> AutoUploadConfig {
        *lock(&self.inner.auto)
    }

    /// Applies and persists new auto-upload settings, restarting the timer.
    ///
    /// The settings take effect even when persisting them fails.
    pub fn set_auto_upload_config(&self, config: AutoUploadConfig) -> Result<(), TraceError> {
        *lock(&self.inner.auto) = config;
        self.restart_auto_upload(config);

        let storage = self.inner.collector.storage();
        write_json(storage.as_ref(), keys::AUTO_UPLOAD_CONFIG, &config)?;
        Ok(())
    }

    fn restart_auto_upload(&self, config: AutoUploadConfig) {
        let mut task = lock(&self.inner.task);
        if let Some(handle) = task.take() {
            handle.abort();
        }
        if !config.enabled {
            tracing::debug!("Auto-upload disabled");
            return;
        }

        let period = Duration::from_millis(config.interval_ms.max(1));
        let weak = Arc::downgrade(&self.inner);
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let result = UploadClient { inner }.upload_to_server(None).await;
                if !result.success {
                    tracing::warn!("Auto-upload failed: {}", result.message);
                }
            }
        }));
        tracing::info!(interval_ms = config.interval_ms, "Auto-upload enabled");
    }
}
