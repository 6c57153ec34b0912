//! Supervisor: starts and stops per-unit workers in response to bus events
//! and the global `edge_status` transitions.

use crate::backend::BackendSink;
use crate::controller::{build_field_bus, Controller};
use crate::field_bus::FieldBusAdapter;
use crate::health::{HealthMonitor, Intent, Severity};
use crate::logging::{get_logger, StructuredLogger};
use crate::registers::RegisterMap;
use crate::state_store::{EdgeStatus, StateStore, UnitConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const MIN_HEALTH_TICK_INTERVAL: Duration = Duration::from_millis(200);

struct Worker {
    control_handle: JoinHandle<()>,
    health_handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// Owns the `unit -> worker` map and reacts to unit add/remove and global
/// pause/resume transitions.
pub struct Supervisor {
    store: Arc<StateStore>,
    backend: Arc<BackendSink>,
    register_map: RegisterMap,
    site_id: String,
    health_poll_hz: f64,
    workers: Mutex<HashMap<String, Worker>>,
    last_edge_status: Mutex<EdgeStatus>,
    logger: StructuredLogger,
}

impl Supervisor {
    pub fn new(
        store: Arc<StateStore>,
        backend: Arc<BackendSink>,
        register_map: RegisterMap,
        site_id: impl Into<String>,
        health_poll_hz: f64,
    ) -> Self {
        Self {
            store,
            backend,
            register_map,
            site_id: site_id.into(),
            health_poll_hz,
            workers: Mutex::new(HashMap::new()),
            last_edge_status: Mutex::new(EdgeStatus::Inactive),
            logger: get_logger("supervisor"),
        }
    }

    /// Ensure a worker is running for `consus_id`, starting one if needed.
    pub async fn ensure_worker(&self, unit: UnitConfig) {
        let consus_id = unit.consus_id.clone();
        self.store.upsert_unit(unit.clone());

        let mut workers = self.workers.lock().await;
        if workers.contains_key(&consus_id) {
            return;
        }

        let Some(modbus_ip) = unit.modbus_ip.clone() else {
            self.logger
                .warn(&format!("[{consus_id}] no modbus_ip configured, worker not started"));
            return;
        };

        let bus = match build_field_bus(&consus_id, &modbus_ip, unit.modbus_port, self.register_map.clone()) {
            Ok(bus) => bus,
            Err(e) => {
                self.logger.error(&format!("[{consus_id}] failed to build field-bus adapter: {e}"));
                return;
            }
        };

        let bus = Arc::new(Mutex::new(bus));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();

        let controller = Controller::new(consus_id.clone(), bus.clone(), intents_rx);
        let control_handle = spawn_worker(
            consus_id.clone(),
            controller,
            self.store.clone(),
            self.backend.clone(),
            stop_rx.clone(),
        );

        let health_handle = spawn_health_worker(
            consus_id.clone(),
            self.site_id.clone(),
            bus,
            self.backend.clone(),
            health_tick_interval(self.health_poll_hz),
            intents_tx,
            stop_rx,
        );

        workers.insert(
            consus_id.clone(),
            Worker {
                control_handle,
                health_handle,
                stop: stop_tx,
            },
        );
        self.logger.info(&format!("[{consus_id}] worker started"));
    }

    /// Stop and remove the worker for `consus_id`, if running.
    pub async fn remove_worker(&self, consus_id: &str) {
        self.store.remove_unit(consus_id);
        let worker = self.workers.lock().await.remove(consus_id);
        if let Some(worker) = worker {
            let _ = worker.stop.send(true);
            worker.control_handle.abort();
            worker.health_handle.abort();
            self.logger.info(&format!("[{consus_id}] worker stopped"));
        }
    }

    /// React to a global settings update: start/stop all workers and the
    /// backend sink on an `edge_status` transition.
    pub async fn apply_global_settings(&self) {
        let settings = self.store.settings();
        let mut last = self.last_edge_status.lock().await;
        if *last == settings.edge_status {
            return;
        }

        match settings.edge_status {
            EdgeStatus::Active => {
                self.backend.start();
                let unit_ids: Vec<String> = self.store.unit_ids();
                for consus_id in unit_ids {
                    if let Some(unit) = self.store.unit(&consus_id) {
                        self.ensure_worker(unit).await;
                    }
                }
                self.logger.info("edge_status -> active, workers resumed");
            }
            EdgeStatus::Paused | EdgeStatus::Inactive => {
                let mut workers = self.workers.lock().await;
                for (consus_id, worker) in workers.drain() {
                    let _ = worker.stop.send(true);
                    worker.control_handle.abort();
                    worker.health_handle.abort();
                    self.logger.info(&format!("[{consus_id}] worker stopped (edge paused)"));
                }
                self.backend.pause();
            }
        }
        *last = settings.edge_status;
    }
}

fn spawn_worker(
    consus_id: String,
    mut controller: Controller,
    store: Arc<StateStore>,
    backend: Arc<BackendSink>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let tick_start = tokio::time::Instant::now();
            let now = chrono::Utc::now();
            controller.tick(&store, &backend, now).await;

            let elapsed = tick_start.elapsed();
            if elapsed > DEFAULT_TICK_INTERVAL {
                tracing::warn!("[{consus_id}] tick overran interval: {elapsed:?}");
            } else {
                let remaining = DEFAULT_TICK_INTERVAL - elapsed;
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            if *stop.borrow() {
                break;
            }
        }
    })
}

/// `max(0.2s, 1/health_poll_hz)`, per the health monitor's own polling rate.
fn health_tick_interval(poll_hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / poll_hz).max(MIN_HEALTH_TICK_INTERVAL)
}

/// Runs the unit's health monitor on its own cadence, decoupled from the
/// 1 Hz control tick. Shares the field-bus adapter with the control worker
/// (health is read-only on the bus, so a shared lock suffices) and forwards
/// fault-safe intents to the control worker over `intents_tx`.
fn spawn_health_worker(
    consus_id: String,
    site_id: String,
    bus: Arc<Mutex<FieldBusAdapter>>,
    backend: Arc<BackendSink>,
    interval: Duration,
    intents_tx: mpsc::UnboundedSender<Intent>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut health = HealthMonitor::new(consus_id.clone(), site_id);
        loop {
            let tick_start = tokio::time::Instant::now();
            let now = chrono::Utc::now();

            let events = {
                let mut bus = bus.lock().await;
                health.tick(&mut bus, now).await
            };
            for event in events {
                if event.severity == Severity::Critical {
                    backend.post_critical_alert(event).await;
                } else {
                    backend.enqueue_alert(event).await;
                }
            }
            for intent in health.drain_intents() {
                let _ = intents_tx.send(intent);
            }

            let elapsed = tick_start.elapsed();
            if elapsed > interval {
                tracing::warn!("[{consus_id}] health tick overran interval: {elapsed:?}");
            } else {
                let remaining = interval - elapsed;
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            if *stop.borrow() {
                break;
            }
        }
    })
}
