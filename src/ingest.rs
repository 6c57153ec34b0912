//! Bridges decoded [`BusEvent`]s to the State Store and Supervisor. Kept
//! separate from the bus transport so the transport never needs to know
//! about unit lifecycle or task semantics.

use crate::bus::BusEvent;
use crate::field_bus::FieldBusAdapter;
use crate::logging::StructuredLogger;
use crate::registers::RegisterMap;
use crate::state_store::{GlobalSettings, StateStore, UnitConfig};
use crate::supervisor::Supervisor;
use crate::tasks::parse_task_update;
use serde_json::Value;
use std::sync::Arc;

/// Apply one decoded bus event to the store and supervisor. Never panics;
/// malformed payloads are logged and dropped.
pub async fn apply_event(
    event: BusEvent,
    store: &Arc<StateStore>,
    supervisor: &Supervisor,
    register_map: &RegisterMap,
    logger: &StructuredLogger,
) {
    match event {
        BusEvent::Settings { data } => match serde_json::from_value::<GlobalSettings>(data) {
            Ok(settings) => {
                store.update_settings(settings);
                supervisor.apply_global_settings().await;
            }
            Err(e) => logger.warn(&format!("dropped malformed settings payload: {e}")),
        },
        BusEvent::BatteryConfig { consus_id, data } | BusEvent::BatteryAdd { consus_id, data } => {
            match parse_unit_config(&consus_id, data) {
                Ok(unit) => supervisor.ensure_worker(unit).await,
                Err(e) => logger.warn(&format!("[{consus_id}] dropped malformed battery config: {e}")),
            }
        }
        BusEvent::BatteryRemove { consus_id } => supervisor.remove_worker(&consus_id).await,
        BusEvent::Task { consus_id, data } => match parse_task_update(&data) {
            Ok(update) => {
                let today = chrono::Utc::now().with_timezone(&store.timezone()).date_naive();
                store.update_task(&consus_id, Some(update), today);
            }
            Err(e) => logger.warn(&format!("[{consus_id}] dropped malformed task payload: {e}")),
        },
        BusEvent::TestModbus { consus_id } => {
            test_modbus_connectivity(&consus_id, store, register_map, logger).await;
        }
        BusEvent::Ping => {}
    }
}

fn parse_unit_config(consus_id: &str, mut data: Value) -> crate::error::Result<UnitConfig> {
    if let Value::Object(ref mut map) = data {
        map.insert("consus_id".to_string(), Value::String(consus_id.to_string()));
        for (key, default_value) in [
            ("pv_enabled", Value::Bool(false)),
            ("battery_mode", Value::String("idle".to_string())),
            ("modbus_port", Value::Number(15002.into())),
        ] {
            map.entry(key).or_insert(default_value);
        }
    }
    Ok(serde_json::from_value(data)?)
}

async fn test_modbus_connectivity(
    consus_id: &str,
    store: &Arc<StateStore>,
    register_map: &RegisterMap,
    logger: &StructuredLogger,
) {
    let Some(unit) = store.unit(consus_id) else {
        logger.warn(&format!("test_modbus for unknown unit {consus_id}"));
        return;
    };
    let Some(ip) = unit.modbus_ip else {
        logger.warn(&format!("[{consus_id}] test_modbus: no modbus_ip configured"));
        return;
    };
    let addr = match format!("{ip}:{}", unit.modbus_port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            logger.warn(&format!("[{consus_id}] test_modbus: invalid address: {e}"));
            return;
        }
    };
    let mut bus = FieldBusAdapter::new(consus_id, addr, 1, register_map.clone());
    match bus.connect().await {
        Ok(()) => logger.info(&format!("[{consus_id}] test_modbus: connected")),
        Err(e) => logger.warn(&format!("[{consus_id}] test_modbus: connect failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_config_fills_defaults_and_id() {
        let data = serde_json::json!({ "modbus_ip": "10.0.0.5" });
        let unit = parse_unit_config("unit-1", data).unwrap();
        assert_eq!(unit.consus_id, "unit-1");
        assert_eq!(unit.modbus_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(unit.modbus_port, 15002);
        assert!(!unit.pv_enabled);
    }

    #[test]
    fn test_parse_unit_config_rejects_wrong_shape() {
        let data = serde_json::json!("not an object");
        assert!(parse_unit_config("unit-1", data).is_err());
    }
}
