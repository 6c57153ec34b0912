//! EMS Applier: wraps the Decider with commissioning, clamping, ramping and
//! the actual register writes.

use super::decider::{decide, DecideInputs, EmsMode, HoldState};
use crate::error::Result;
use crate::field_bus::FieldBusAdapter;
use crate::logging::{get_unit_logger, StructuredLogger};
use crate::state_store::{GlobalSettings, UnitConfig};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Per-unit EMS runtime state, owned exclusively by the Applier.
struct UnitRuntime {
    commissioned: bool,
    last_setpoint_w: i32,
    last_setpoint_ts: Option<DateTime<Utc>>,
    hold: HoldState,
}

impl Default for UnitRuntime {
    fn default() -> Self {
        Self {
            commissioned: false,
            last_setpoint_w: 0,
            last_setpoint_ts: None,
            hold: HoldState::default(),
        }
    }
}

/// Live readings the Applier needs for one tick, gathered by the Controller.
pub struct LiveInputs {
    pub soc: f64,
    pub pv_power_w: f64,
    pub meter_power_w: f64,
}

/// Wraps the [`decide`] decision with commissioning, clamping/ramping and
/// write-back through the [`FieldBusAdapter`]. One instance per unit.
pub struct EmsApplier {
    consus_id: String,
    runtime: UnitRuntime,
    logger: StructuredLogger,
}

impl EmsApplier {
    pub fn new(consus_id: impl Into<String>) -> Self {
        let consus_id = consus_id.into();
        let logger = get_unit_logger("ems_applier", &consus_id);
        Self {
            consus_id,
            runtime: UnitRuntime::default(),
            logger,
        }
    }

    /// Write the one-time commissioning register set, retried on the next
    /// tick if it previously failed.
    pub async fn commission_if_needed(
        &mut self,
        bus: &mut FieldBusAdapter,
        settings: &GlobalSettings,
    ) -> Result<()> {
        if self.runtime.commissioned {
            return Ok(());
        }
        bus.write("manufacturer_code", 2).await?;
        bus.write("feed_power_enable", 1).await?;
        bus.write("export_power_cap", settings.export_cap_w).await?;
        if settings.external_meter {
            bus.write("external_meter_enable", 1).await?;
        }
        bus.write("meter_target_power_offset", settings.meter_bias_w).await?;
        self.runtime.commissioned = true;
        self.logger.info(&format!("[{}] commissioned", self.consus_id));
        Ok(())
    }

    /// Run one tick of decide → clamp → ramp → write.
    pub async fn apply(
        &mut self,
        bus: &mut FieldBusAdapter,
        now: DateTime<Utc>,
        tz: chrono_tz::Tz,
        today: chrono::NaiveDate,
        windows: &[(chrono::NaiveTime, chrono::NaiveTime)],
        dyn_cap_kw: Option<f64>,
        unit: &UnitConfig,
        settings: &GlobalSettings,
        live: &LiveInputs,
    ) -> Result<()> {
        let inputs = DecideInputs {
            now,
            tz,
            today,
            windows,
            soc: live.soc,
            pv_power_w: live.pv_power_w,
            dyn_cap_kw,
            settings,
        };
        let (mode, raw_setpoint, hold) = decide(&inputs, self.runtime.hold);
        self.runtime.hold = hold;

        let max_charge_w = unit.max_charge_w.or(settings.max_charge_w).unwrap_or(0.0);
        let ramp_rate = unit.max_ramp_rate_w_per_s.or(settings.max_ramp_rate_w_per_s);

        let current_mode = self.read_current_mode(bus).await;

        match mode {
            EmsMode::ImportAc => {
                let clamped = raw_setpoint.clamp(0, max_charge_w.max(0.0).round() as i32);
                let setpoint = self.ramp_limit(clamped, now, ramp_rate);

                if current_mode != Some(mode) {
                    bus.write("ems_power_mode", mode.register_value() as i32).await?;
                }
                bus.write("ems_power_set", setpoint).await?;
                self.runtime.last_setpoint_w = setpoint;
                self.runtime.last_setpoint_ts = Some(now);
            }
            EmsMode::Auto => {
                if current_mode != Some(mode) {
                    bus.write("ems_power_mode", mode.register_value() as i32).await?;
                }
                let _ = bus.write("ems_power_set", 0).await;
                self.runtime.last_setpoint_w = 0;
                self.runtime.last_setpoint_ts = Some(now);

                if let Some(trim) = settings.auto_bias_trim {
                    if trim.enable {
                        self.apply_auto_bias_trim(bus, settings, live.meter_power_w, trim)
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn read_current_mode(&mut self, bus: &mut FieldBusAdapter) -> Option<EmsMode> {
        match bus.read("ems_power_mode").await {
            Ok(v) if v == EmsMode::Auto.register_value() as i32 => Some(EmsMode::Auto),
            Ok(v) if v == EmsMode::ImportAc.register_value() as i32 => Some(EmsMode::ImportAc),
            _ => None,
        }
    }

    fn ramp_limit(&self, target: i32, now: DateTime<Utc>, ramp_rate: Option<f64>) -> i32 {
        let (Some(rate), Some(last_ts)) = (ramp_rate, self.runtime.last_setpoint_ts) else {
            return target;
        };
        if rate <= 0.0 {
            return target;
        }
        let dt = (now - last_ts)
            .to_std()
            .unwrap_or(Duration::from_millis(1))
            .as_secs_f64()
            .max(0.001);
        let max_delta = (rate * dt).round() as i32;
        let delta = target - self.runtime.last_setpoint_w;
        if delta.abs() > max_delta {
            self.runtime.last_setpoint_w + delta.signum() * max_delta
        } else {
            target
        }
    }

    async fn apply_auto_bias_trim(
        &mut self,
        bus: &mut FieldBusAdapter,
        settings: &GlobalSettings,
        meter_power_w: f64,
        trim: crate::state_store::AutoBiasTrim,
    ) -> Result<()> {
        let residual = meter_power_w - f64::from(trim.target_w);
        if residual.abs() <= f64::from(trim.deadband_w) {
            return Ok(());
        }
        let current_bias = bus
            .read("meter_target_power_offset")
            .await
            .unwrap_or(settings.meter_bias_w);
        let step = if residual > 0.0 { trim.step_w as i32 } else { -(trim.step_w as i32) };
        let new_bias = (current_bias + step).clamp(-500, 500);
        if new_bias != current_bias {
            bus.write("meter_target_power_offset", new_bias).await?;
            self.logger
                .debug(&format!("[{}] auto bias trim -> {new_bias}", self.consus_id));
        }
        Ok(())
    }
}
