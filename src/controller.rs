//! Controller: the per-unit, once-a-second tick that ties every other
//! component together — drains health intents forwarded by the unit's
//! health worker, resolves run mode, reads telemetry, dispatches to the
//! EMS Applier, and reports back to the backend sink.

use crate::backend::{BackendSink, TelemetryPayload};
use crate::ems::applier::LiveInputs;
use crate::ems::EmsApplier;
use crate::field_bus::FieldBusAdapter;
use crate::health::Intent;
use crate::logging::{get_unit_logger, StructuredLogger};
use crate::registers::RegisterMap;
use crate::state_store::StateStore;
use crate::task_eval::{self, RunMode};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const PV_REGISTER_PREFIXES: &[&str] = &["pv1_power", "pv2_power", "pv3_power", "pv4_power"];
const MPPT_REGISTERS: &[&str] = &[
    "mppt_power_1",
    "mppt_power_2",
    "mppt_power_3",
    "mppt_power_4",
    "mppt_power_5",
];

/// Owns one unit's EMS applier and shares its field-bus adapter with the
/// unit's health worker. Runs the 1 Hz control tick; fault-safe intents
/// arrive asynchronously from the health worker over `intents_rx` rather
/// than being evaluated in-line, since the two now tick independently.
pub struct Controller {
    consus_id: String,
    bus: Arc<Mutex<FieldBusAdapter>>,
    intents_rx: mpsc::UnboundedReceiver<Intent>,
    applier: EmsApplier,
    fault_safe: bool,
    logger: StructuredLogger,
}

impl Controller {
    pub fn new(
        consus_id: impl Into<String>,
        bus: Arc<Mutex<FieldBusAdapter>>,
        intents_rx: mpsc::UnboundedReceiver<Intent>,
    ) -> Self {
        let consus_id = consus_id.into();
        Self {
            applier: EmsApplier::new(consus_id.clone()),
            logger: get_unit_logger("controller", &consus_id),
            consus_id,
            bus,
            intents_rx,
            fault_safe: false,
        }
    }

    /// Run one tick. Never returns an error: any internal failure is caught,
    /// logged, and surfaced as an error telemetry record instead.
    pub async fn tick(&mut self, store: &Arc<StateStore>, backend: &Arc<BackendSink>, now: DateTime<Utc>) {
        match self.tick_inner(store, backend, now).await {
            Ok(()) => {}
            Err(e) => {
                self.logger.error(&format!("tick failed: {e}"));
                backend
                    .enqueue_telemetry(TelemetryPayload::new(
                        &self.consus_id,
                        "error",
                        serde_json::json!({ "error": e.to_string() }),
                    ))
                    .await;
            }
        }
    }

    async fn tick_inner(
        &mut self,
        store: &Arc<StateStore>,
        backend: &Arc<BackendSink>,
        now: DateTime<Utc>,
    ) -> crate::error::Result<()> {
        while let Ok(intent) = self.intents_rx.try_recv() {
            if intent == Intent::FaultSafe {
                self.fault_safe = true;
                self.logger.error("fault-safe intent latched, forcing idle");
            }
        }

        let mut mode = task_eval::determine_mode(store, &self.consus_id);
        if self.fault_safe {
            mode = RunMode::Idle;
        }

        let unit = store
            .unit(&self.consus_id)
            .ok_or_else(|| crate::error::EdgeError::generic("unit config vanished mid-tick"))?;

        let mut bus = self.bus.lock().await;
        let readings = bus.read_all(unit.pv_enabled).await;
        let get = |name: &str| readings.get(name).copied().flatten().unwrap_or(0) as f64;

        let pv_power_total: f64 = if unit.pv_enabled {
            PV_REGISTER_PREFIXES
                .iter()
                .chain(MPPT_REGISTERS.iter())
                .map(|name| get(name))
                .sum()
        } else {
            0.0
        };
        let ct2 = readings.get("ct2_active_power").copied().flatten();
        let pv_power_total_ac_included = pv_power_total + ct2.map(f64::from).unwrap_or(0.0);

        let soc = get("battery_soc") / 100.0;
        let meter_power = get("meter_total_active_power");

        let tz = store.timezone();
        let today = now.with_timezone(&tz).date_naive();

        if mode == RunMode::Idle {
            let _ = bus.write("ems_power_mode", 0).await;
            let _ = bus.write("ems_power_set", 0).await;
        } else {
            let settings = store.settings();
            self.applier.commission_if_needed(&mut bus, &settings).await?;

            let windows = store.windows_for(&self.consus_id, today);
            let dyn_cap_kw = store.active_task_cap_kw(&self.consus_id, today);
            let live = LiveInputs {
                soc,
                pv_power_w: pv_power_total_ac_included,
                meter_power_w: meter_power,
            };
            self.applier
                .apply(&mut bus, now, tz, today, &windows, dyn_cap_kw, &unit, &settings, &live)
                .await?;
        }
        drop(bus);

        backend
            .enqueue_telemetry(TelemetryPayload::new(
                &self.consus_id,
                run_mode_label(mode),
                serde_json::json!({
                    "soc": soc,
                    "meter_total_active_power": meter_power,
                    "pv_power_total": pv_power_total,
                    "pv_power_total_ac_included": pv_power_total_ac_included,
                    "fault_safe": self.fault_safe,
                }),
            ))
            .await;

        Ok(())
    }
}

fn run_mode_label(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Idle => "idle",
        RunMode::Active => "active",
        RunMode::ForcedCharging => "forced_charging",
    }
}

/// Construct a field-bus adapter for a unit from its config and the shared
/// register map.
pub fn build_field_bus(consus_id: &str, unit_ip: &str, unit_port: u16, register_map: RegisterMap) -> crate::error::Result<FieldBusAdapter> {
    let addr = format!("{unit_ip}:{unit_port}")
        .parse()
        .map_err(|e| crate::error::EdgeError::config(format!("invalid modbus address {unit_ip}:{unit_port}: {e}")))?;
    Ok(FieldBusAdapter::new(consus_id, addr, 1, register_map))
}
