//! Backend HTTP Client and Backend Sink: serializes and posts telemetry and
//! alert batches to the cloud, with a bounded queue and periodic flush.

use crate::config::BackendConfig;
use crate::error::{EdgeError, Result};
use crate::health::AlertEvent;
use crate::logging::{get_logger, StructuredLogger};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const TELEMETRY_QUEUE_CAPACITY: usize = 2000;

/// One unit's telemetry record, as posted to the ingest endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload {
    pub consus_id: String,
    pub mode: String,
    pub source_type: &'static str,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl TelemetryPayload {
    pub fn new(consus_id: impl Into<String>, mode: impl Into<String>, payload: Value) -> Self {
        Self {
            consus_id: consus_id.into(),
            mode: mode.into(),
            source_type: "modbus",
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Thin wrapper over an HTTP client: request construction and response-status
/// interpretation only. Retry/backoff policy lives in [`BackendSink`].
pub struct BackendClient {
    http: reqwest::Client,
    config: BackendConfig,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| EdgeError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    pub async fn post_telemetry(&self, batch: &[TelemetryPayload]) -> Result<()> {
        let response = self
            .authorize(self.http.post(self.config.ingest_url()).json(batch))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EdgeError::backend(format!(
                "telemetry post failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn post_health_alerts(&self, batch: &[AlertEvent]) -> Result<()> {
        let response = self
            .authorize(self.http.post(self.config.health_url()).json(batch))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EdgeError::backend(format!(
                "alert post failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

struct Queues {
    telemetry: VecDeque<TelemetryPayload>,
    alerts: VecDeque<AlertEvent>,
}

/// Bounded in-memory queue with a background flush worker. Telemetry is
/// ephemeral: a failed post drops the batch rather than retrying it.
pub struct BackendSink {
    client: Arc<BackendClient>,
    queues: Arc<Mutex<Queues>>,
    active: Arc<AtomicBool>,
    posting_interval: Duration,
    alert_batch_interval: Duration,
    logger: StructuredLogger,
}

impl BackendSink {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let posting_interval = Duration::from_secs(config.posting_interval_seconds);
        let alert_batch_interval = Duration::from_secs(config.alert_batch_interval_seconds);
        Ok(Self {
            client: Arc::new(BackendClient::new(config)?),
            queues: Arc::new(Mutex::new(Queues {
                telemetry: VecDeque::with_capacity(TELEMETRY_QUEUE_CAPACITY),
                alerts: VecDeque::new(),
            })),
            active: Arc::new(AtomicBool::new(false)),
            posting_interval,
            alert_batch_interval,
            logger: get_logger("backend_sink"),
        })
    }

    /// Whether the sink's background workers are running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start the background flush workers. Idempotent.
    pub fn start(&self) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        spawn_telemetry_worker(
            self.client.clone(),
            self.queues.clone(),
            self.active.clone(),
            self.posting_interval,
        );
        spawn_alert_worker(
            self.client.clone(),
            self.queues.clone(),
            self.active.clone(),
            self.alert_batch_interval,
        );
        self.logger.info("backend sink started");
    }

    /// Stop the background workers (they observe `active` at their next
    /// wakeup); queued data is discarded.
    pub fn pause(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.logger.info("backend sink paused");
    }

    /// Enqueue one telemetry record, dropping the oldest on overflow.
    pub async fn enqueue_telemetry(&self, payload: TelemetryPayload) {
        let mut queues = self.queues.lock().await;
        if queues.telemetry.len() == TELEMETRY_QUEUE_CAPACITY {
            queues.telemetry.pop_front();
        }
        queues.telemetry.push_back(payload);
    }

    /// Immediately post a CRITICAL alert, bypassing the batch window.
    pub async fn post_critical_alert(&self, event: AlertEvent) {
        if let Err(e) = self.client.post_health_alerts(std::slice::from_ref(&event)).await {
            self.logger.error(&format!("critical alert post failed: {e}"));
        }
    }

    /// Enqueue a non-critical alert for the next batch flush.
    pub async fn enqueue_alert(&self, event: AlertEvent) {
        self.queues.lock().await.alerts.push_back(event);
    }
}

fn spawn_telemetry_worker(
    client: Arc<BackendClient>,
    queues: Arc<Mutex<Queues>>,
    active: Arc<AtomicBool>,
    period: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if !active.load(Ordering::SeqCst) {
                continue;
            }
            let batch: Vec<TelemetryPayload> = {
                let mut q = queues.lock().await;
                q.telemetry.drain(..).collect()
            };
            if batch.is_empty() {
                continue;
            }
            if let Err(e) = client.post_telemetry(&batch).await {
                tracing::warn!("telemetry batch of {} dropped: {e}", batch.len());
            }
        }
    });
}

fn spawn_alert_worker(
    client: Arc<BackendClient>,
    queues: Arc<Mutex<Queues>>,
    active: Arc<AtomicBool>,
    period: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if !active.load(Ordering::SeqCst) {
                continue;
            }
            let batch: Vec<AlertEvent> = {
                let mut q = queues.lock().await;
                q.alerts.drain(..).collect()
            };
            if batch.is_empty() {
                continue;
            }
            if let Err(e) = client.post_health_alerts(&batch).await {
                tracing::warn!("alert batch of {} will retry next window: {e}", batch.len());
                let mut q = queues.lock().await;
                for event in batch.into_iter().rev() {
                    q.alerts.push_front(event);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_payload_defaults() {
        let payload = TelemetryPayload::new("unit-1", "active", serde_json::json!({"soc": 0.5}));
        assert_eq!(payload.source_type, "modbus");
        assert_eq!(payload.consus_id, "unit-1");
    }
}
