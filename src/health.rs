//! Health Monitor: periodic register scan, per-alert debounce state machine,
//! and a bounded intent queue the Controller drains each tick.

use crate::field_bus::FieldBusAdapter;
use crate::logging::{get_unit_logger, StructuredLogger};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

const ACTIVATE_DEBOUNCE: chrono::Duration = chrono::Duration::seconds(5);
const CLEAR_DEBOUNCE_POLLS: u32 = 10;
const ACTIVE_REEMIT_SECS: i64 = 300;
const TELEMETRY_RING_CAPACITY: usize = 50;
const CRITICAL_CONTEXT_SAMPLES: usize = 20;
const INTENT_QUEUE_CAPACITY: usize = 100;

static EVENT_ID_NAMESPACE: Uuid = Uuid::NAMESPACE_OID;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertCode {
    EmsFault,
    BmsAlarm,
    ArcFault,
    BmsWarning,
    MeterCommsLoss,
}

impl AlertCode {
    fn severity(self) -> Severity {
        match self {
            Self::EmsFault | Self::BmsAlarm | Self::ArcFault => Severity::Critical,
            Self::BmsWarning | Self::MeterCommsLoss => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fsm {
    Clear,
    Active,
    Resolved,
}

/// One sample of the health monitor's rolling telemetry ring.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySample {
    pub ts: DateTime<Utc>,
    pub soc: f64,
    pub grid_w: f64,
    pub pv_w: f64,
    pub mode: i32,
    pub bias_w: i32,
}

/// Context captured at the moment an alert transition fires.
#[derive(Debug, Clone, Serialize)]
pub struct AlertContext {
    pub mode: i32,
    pub soc: f64,
    pub grid_w: f64,
    pub pv_w: f64,
    pub bias_w: i32,
}

struct AlertState {
    fsm: Fsm,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    activate_deadline: Option<DateTime<Utc>>,
    clear_count: u32,
    event_id: Option<Uuid>,
    count: u32,
    last_context: Option<AlertContext>,
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            fsm: Fsm::Clear,
            first_seen: None,
            last_seen: None,
            last_heartbeat: None,
            activate_deadline: None,
            clear_count: 0,
            event_id: None,
            count: 0,
            last_context: None,
        }
    }
}

/// State transition to ACTIVE/RESOLVED, ready to be rendered as a wire
/// [`AlertEvent`] or dropped for a silent internal transition.
pub enum Emission {
    Active { heartbeat: bool },
    Resolved,
}

/// What the Controller should do in response to a health observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    FaultSafe,
}

/// Wire payload for one alert emission.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub site_id: String,
    pub ts: DateTime<Utc>,
    pub severity: Severity,
    pub code: AlertCode,
    pub state: &'static str,
    pub event_id: Uuid,
    pub count: u32,
    pub heartbeat: bool,
    pub context: AlertContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_telemetry: Option<Vec<TelemetrySample>>,
}

/// Per-unit health monitor: owns its alert states, telemetry ring, and
/// intent queue exclusively.
pub struct HealthMonitor {
    consus_id: String,
    site_id: String,
    alerts: HashMap<AlertCode, AlertState>,
    ring: VecDeque<TelemetrySample>,
    intents: VecDeque<Intent>,
    logger: StructuredLogger,
}

impl HealthMonitor {
    pub fn new(consus_id: impl Into<String>, site_id: impl Into<String>) -> Self {
        let consus_id = consus_id.into();
        let logger = get_unit_logger("health_monitor", &consus_id);
        Self {
            consus_id,
            site_id: site_id.into(),
            alerts: HashMap::new(),
            ring: VecDeque::with_capacity(TELEMETRY_RING_CAPACITY),
            intents: VecDeque::new(),
            logger,
        }
    }

    /// Read health registers, evaluate all conditions, drive every alert's
    /// FSM, and return the alert events to deliver (immediate for CRITICAL,
    /// batched otherwise is the caller's concern — this returns all of them).
    pub async fn tick(&mut self, bus: &mut FieldBusAdapter, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let regs = bus.read_all(true).await;
        let get = |name: &str| regs.get(name).copied().flatten();

        let ems_check_status = get("ems_check_status");
        let bms_alarm_bits = get("bms_alarm_bits").unwrap_or(0);
        let arc_fault = get("arc_fault").unwrap_or(0);
        let bms_warning_bits = get("bms_warning_bits").unwrap_or(0);
        let ext_meter_comm = get("ext_meter_comm").unwrap_or(1);
        let int_meter_comm = get("int_meter_comm").unwrap_or(1);

        let sample = TelemetrySample {
            ts: now,
            soc: f64::from(get("battery_soc").unwrap_or(0)) / 100.0,
            grid_w: f64::from(get("meter_total_active_power").unwrap_or(0)),
            pv_w: f64::from(get("pv_power_total").unwrap_or(0)),
            mode: get("ems_power_mode").unwrap_or(0),
            bias_w: get("meter_target_power_offset").unwrap_or(0),
        };
        if self.ring.len() == TELEMETRY_RING_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(sample.clone());

        let context = AlertContext {
            mode: sample.mode,
            soc: sample.soc,
            grid_w: sample.grid_w,
            pv_w: sample.pv_w,
            bias_w: sample.bias_w,
        };

        let conditions = [
            (
                AlertCode::EmsFault,
                !matches!(ems_check_status, None | Some(1)),
            ),
            (AlertCode::BmsAlarm, bms_alarm_bits != 0),
            (AlertCode::ArcFault, arc_fault != 0),
            (AlertCode::BmsWarning, bms_warning_bits != 0),
            (AlertCode::MeterCommsLoss, ext_meter_comm == 0 && int_meter_comm == 0),
        ];

        let mut events = Vec::new();
        for (code, active) in conditions {
            if let Some(emission) = self.evaluate(code, active, now, &context) {
                let event = self.render(code, now, &context, emission);
                if code.severity() == Severity::Critical {
                    if matches!(event.state, "ACTIVE") {
                        self.enqueue_intent(Intent::FaultSafe);
                    }
                }
                events.push(event);
            }
        }
        events
    }

    fn evaluate(
        &mut self,
        code: AlertCode,
        active: bool,
        now: DateTime<Utc>,
        context: &AlertContext,
    ) -> Option<Emission> {
        let state = self.alerts.entry(code).or_default();
        match state.fsm {
            Fsm::Clear => {
                if active {
                    match state.activate_deadline {
                        None => {
                            state.activate_deadline = Some(now + ACTIVATE_DEBOUNCE);
                            None
                        }
                        Some(deadline) if now >= deadline => {
                            state.fsm = Fsm::Active;
                            state.first_seen = Some(now);
                            state.last_seen = Some(now);
                            state.event_id =
                                Some(derive_event_id(&self.consus_id, code, now));
                            state.count += 1;
                            state.last_context = Some(context.clone());
                            Some(Emission::Active { heartbeat: false })
                        }
                        Some(_) => None,
                    }
                } else {
                    state.activate_deadline = None;
                    state.clear_count = 0;
                    None
                }
            }
            Fsm::Active => {
                if active {
                    let episode_age = state
                        .first_seen
                        .map(|first| (now - first).num_seconds())
                        .unwrap_or(0);
                    let since_last_heartbeat = state
                        .last_heartbeat
                        .map_or(episode_age, |last| (now - last).num_seconds());
                    let reemit = episode_age >= ACTIVE_REEMIT_SECS && since_last_heartbeat >= ACTIVE_REEMIT_SECS;
                    state.last_seen = Some(now);
                    if reemit {
                        state.last_heartbeat = Some(now);
                        state.last_context = Some(context.clone());
                        Some(Emission::Active { heartbeat: true })
                    } else {
                        None
                    }
                } else {
                    state.clear_count += 1;
                    if state.clear_count >= CLEAR_DEBOUNCE_POLLS {
                        state.fsm = Fsm::Resolved;
                        Some(Emission::Resolved)
                    } else {
                        None
                    }
                }
            }
            Fsm::Resolved => {
                if active {
                    state.fsm = Fsm::Active;
                    state.clear_count = 0;
                    state.last_seen = Some(now);
                    state.count += 1;
                    state.last_context = Some(context.clone());
                    Some(Emission::Active { heartbeat: false })
                } else {
                    None
                }
            }
        }
    }

    fn render(
        &self,
        code: AlertCode,
        now: DateTime<Utc>,
        context: &AlertContext,
        emission: Emission,
    ) -> AlertEvent {
        let state = &self.alerts[&code];
        let event_id = state.event_id.unwrap_or_else(|| derive_event_id(&self.consus_id, code, now));
        let (wire_state, heartbeat) = match emission {
            Emission::Active { heartbeat } => ("ACTIVE", heartbeat),
            Emission::Resolved => ("RESOLVED", false),
        };
        let recent_telemetry = if code.severity() == Severity::Critical && wire_state == "ACTIVE" {
            Some(
                self.ring
                    .iter()
                    .rev()
                    .take(CRITICAL_CONTEXT_SAMPLES)
                    .rev()
                    .cloned()
                    .collect(),
            )
        } else {
            None
        };
        AlertEvent {
            site_id: self.site_id.clone(),
            ts: now,
            severity: code.severity(),
            code,
            state: wire_state,
            event_id,
            count: state.count,
            heartbeat,
            context: context.clone(),
            recent_telemetry,
        }
    }

    fn enqueue_intent(&mut self, intent: Intent) {
        if self.intents.len() == INTENT_QUEUE_CAPACITY {
            self.intents.pop_front();
            self.logger.warn("intent queue overflow, oldest dropped");
        }
        self.intents.push_back(intent);
    }

    /// Drain all pending intents for the Controller to act on.
    pub fn drain_intents(&mut self) -> Vec<Intent> {
        self.intents.drain(..).collect()
    }
}

fn derive_event_id(consus_id: &str, code: AlertCode, first_seen: DateTime<Utc>) -> Uuid {
    let name = format!("{consus_id}:{code:?}:{}", first_seen.to_rfc3339());
    Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes())
}
