//! State Store: the single source of truth for settings, unit configuration
//! and task records, shared across every worker.

use crate::tasks::{StaticTask, TaskMerger};
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Mode a unit's configuration can request from the Task Evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatteryMode {
    #[default]
    Idle,
    Active,
    Charging,
    ForcedCharging,
}

/// Per-unit configuration as received from `battery_add`/`battery_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    pub consus_id: String,
    pub capacity_kwh: Option<f64>,
    pub reserve_soc_pct: Option<f64>,
    pub max_soc_pct: Option<f64>,
    pub max_charge_w: Option<f64>,
    pub max_discharge_w: Option<f64>,
    pub max_ramp_rate_w_per_s: Option<f64>,
    pub pv_enabled: bool,
    pub battery_mode: BatteryMode,
    pub modbus_ip: Option<String>,
    pub modbus_port: u16,
}

impl UnitConfig {
    /// A bare unit config with only the identity set, used when a
    /// `battery_add` carries no extra fields yet.
    pub fn bare(consus_id: impl Into<String>) -> Self {
        Self {
            consus_id: consus_id.into(),
            capacity_kwh: None,
            reserve_soc_pct: None,
            max_soc_pct: None,
            max_charge_w: None,
            max_discharge_w: None,
            max_ramp_rate_w_per_s: None,
            pv_enabled: false,
            battery_mode: BatteryMode::default(),
            modbus_ip: None,
            modbus_port: 15002,
        }
    }
}

/// Auto bias trim sub-settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoBiasTrim {
    pub enable: bool,
    pub target_w: i32,
    pub deadband_w: u32,
    pub step_w: u32,
}

impl Default for AutoBiasTrim {
    fn default() -> Self {
        Self {
            enable: false,
            target_w: 0,
            deadband_w: 30,
            step_w: 10,
        }
    }
}

/// Global settings shared across all units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub edge_status: EdgeStatus,
    pub export_cap_w: i32,
    pub external_meter: bool,
    pub meter_bias_w: i32,
    pub import_charge_power_w: i32,
    pub min_import_w: i32,
    pub target_soc_percent: f64,
    pub max_charge_w: Option<f64>,
    pub max_ramp_rate_w_per_s: Option<f64>,
    pub auto_bias_trim: Option<AutoBiasTrim>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            edge_status: EdgeStatus::Inactive,
            export_cap_w: 0,
            external_meter: true,
            meter_bias_w: -50,
            import_charge_power_w: 3400,
            min_import_w: 0,
            target_soc_percent: 100.0,
            max_charge_w: None,
            max_ramp_rate_w_per_s: None,
            auto_bias_trim: None,
        }
    }
}

/// Operational status of the whole edge agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    Active,
    Paused,
    #[default]
    Inactive,
}

/// Central, lock-protected state shared by every worker.
///
/// Reads return owned snapshots so callers never hold the lock while doing
/// I/O; mutations go through named methods that acquire the lock for the
/// shortest time needed.
pub struct StateStore {
    inner: RwLock<Inner>,
    tz: Tz,
}

struct Inner {
    settings: GlobalSettings,
    units: HashMap<String, UnitConfig>,
    tasks: TaskMerger,
}

impl StateStore {
    /// Create a new, empty state store operating in the given timezone.
    pub fn new(tz: Tz) -> Self {
        Self {
            inner: RwLock::new(Inner {
                settings: GlobalSettings::default(),
                units: HashMap::new(),
                tasks: TaskMerger::new(),
            }),
            tz,
        }
    }

    /// The operator timezone this store resolves local times against.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Replace the global settings wholesale.
    pub fn update_settings(&self, settings: GlobalSettings) {
        self.inner.write().unwrap().settings = settings;
    }

    /// Snapshot of the current global settings.
    pub fn settings(&self) -> GlobalSettings {
        self.inner.read().unwrap().settings.clone()
    }

    /// Insert or replace a unit's configuration.
    pub fn upsert_unit(&self, config: UnitConfig) {
        self.inner.write().unwrap().units.insert(config.consus_id.clone(), config);
    }

    /// Remove a unit's configuration.
    pub fn remove_unit(&self, consus_id: &str) {
        self.inner.write().unwrap().units.remove(consus_id);
    }

    /// Snapshot of a unit's configuration, if known.
    pub fn unit(&self, consus_id: &str) -> Option<UnitConfig> {
        self.inner.read().unwrap().units.get(consus_id).cloned()
    }

    /// All currently known unit identifiers.
    pub fn unit_ids(&self) -> Vec<String> {
        self.inner.read().unwrap().units.keys().cloned().collect()
    }

    /// Route a task payload (or fallback `None`) to the task merger for a unit.
    pub fn update_task(&self, consus_id: &str, payload: Option<crate::tasks::TaskUpdate>, today: NaiveDate) {
        self.inner.write().unwrap().tasks.update(consus_id, payload, today);
    }

    /// Resolved charge windows for `consus_id` on `day`.
    pub fn windows_for(&self, consus_id: &str, day: NaiveDate) -> Vec<(chrono::NaiveTime, chrono::NaiveTime)> {
        self.inner.read().unwrap().tasks.windows_for(consus_id, day)
    }

    /// Resolved active task entry for `consus_id` on `day`, if any.
    pub fn active_task_cap_kw(&self, consus_id: &str, day: NaiveDate) -> Option<f64> {
        self.inner.read().unwrap().tasks.active_cap_kw(consus_id, day)
    }

    /// Static task entry for a unit, if any — exposed for diagnostics/tests.
    pub fn static_task(&self, consus_id: &str) -> Option<StaticTask> {
        self.inner.read().unwrap().tasks.static_task(consus_id).cloned()
    }
}
