//! Task Evaluator: collapses unit mode and global status into the three
//! modes the Controller acts on.

use crate::state_store::{BatteryMode, EdgeStatus, StateStore, UnitConfig};

/// Mode the Controller should run a unit in for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Idle,
    Active,
    ForcedCharging,
}

/// Determine the run mode for `consus_id`. Any lookup failure is treated as
/// `Idle` — fail-safe, never panics, never propagates an error upward.
pub fn determine_mode(store: &StateStore, consus_id: &str) -> RunMode {
    let settings = store.settings();
    if settings.edge_status != EdgeStatus::Active {
        return RunMode::Idle;
    }

    let Some(unit) = store.unit(consus_id) else {
        return RunMode::Idle;
    };

    classify(&unit)
}

fn classify(unit: &UnitConfig) -> RunMode {
    match unit.battery_mode {
        BatteryMode::Idle => RunMode::Idle,
        BatteryMode::ForcedCharging => RunMode::ForcedCharging,
        BatteryMode::Active | BatteryMode::Charging => RunMode::Active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;

    #[test]
    fn test_idle_when_edge_status_not_active() {
        let store = StateStore::new(Tz::Europe__London);
        store.upsert_unit(UnitConfig::bare("u1"));
        assert_eq!(determine_mode(&store, "u1"), RunMode::Idle);
    }

    #[test]
    fn test_idle_when_unit_unknown() {
        let store = StateStore::new(Tz::Europe__London);
        let mut settings = store.settings();
        settings.edge_status = EdgeStatus::Active;
        store.update_settings(settings);
        assert_eq!(determine_mode(&store, "missing"), RunMode::Idle);
    }

    #[test]
    fn test_active_and_forced_charging() {
        let store = StateStore::new(Tz::Europe__London);
        let mut settings = store.settings();
        settings.edge_status = EdgeStatus::Active;
        store.update_settings(settings);

        let mut unit = UnitConfig::bare("u1");
        unit.battery_mode = BatteryMode::Active;
        store.upsert_unit(unit);
        assert_eq!(determine_mode(&store, "u1"), RunMode::Active);

        let mut unit = UnitConfig::bare("u1");
        unit.battery_mode = BatteryMode::ForcedCharging;
        store.upsert_unit(unit);
        assert_eq!(determine_mode(&store, "u1"), RunMode::ForcedCharging);
    }
}
