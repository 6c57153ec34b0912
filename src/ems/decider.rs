//! EMS Decider: the pure mode/setpoint decision at the heart of the control
//! loop. All time-dependent state (the hold-at-target latch) is threaded
//! through explicitly so the function itself stays referentially transparent.

use crate::state_store::GlobalSettings;
use crate::window;
use chrono::{DateTime, NaiveDate, NaiveTime};
use chrono_tz::Tz;

/// Inverter EMS mode register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmsMode {
    Auto = 0x0001,
    ImportAc = 0x0004,
}

impl EmsMode {
    /// The raw register value for this mode.
    pub fn register_value(self) -> u16 {
        self as u16
    }
}

/// Latched "hold at target" state carried between decider invocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct HoldState {
    pub hold_until: Option<DateTime<Tz>>,
}

/// Inputs the decider needs beyond global settings: the unit's resolved
/// charge windows for today, live SoC, live PV power, and any dynamic
/// import cap from the active task.
pub struct DecideInputs<'a> {
    pub now: DateTime<chrono::Utc>,
    pub tz: Tz,
    pub today: NaiveDate,
    pub windows: &'a [(NaiveTime, NaiveTime)],
    pub soc: f64,
    pub pv_power_w: f64,
    pub dyn_cap_kw: Option<f64>,
    pub settings: &'a GlobalSettings,
}

/// Decide the EMS mode and setpoint for one tick, returning the updated
/// hold-latch state alongside.
pub fn decide(inputs: &DecideInputs<'_>, hold: HoldState) -> (EmsMode, i32, HoldState) {
    let now_local = inputs.now.with_timezone(&inputs.tz);
    let in_window = window::covers(inputs.windows, now_local.time());

    let target = inputs.settings.target_soc_percent / 100.0;
    let base = f64::from(inputs.settings.import_charge_power_w);
    let min_import = f64::from(inputs.settings.min_import_w);

    if !in_window {
        return (EmsMode::Auto, 0, HoldState { hold_until: None });
    }

    if inputs.soc >= target * 0.99 {
        let hold_until = match hold.hold_until {
            Some(until) if inputs.now.with_timezone(&inputs.tz) < until => Some(until),
            _ => window::current_window_end(inputs.tz, inputs.windows, inputs.today, now_local.time()),
        };
        return (EmsMode::ImportAc, 0, HoldState { hold_until });
    }

    let mut effective = if base > 0.0 {
        (base - inputs.pv_power_w).max(min_import)
    } else {
        0.0
    };

    if let Some(cap_kw) = inputs.dyn_cap_kw {
        if cap_kw > 0.0 {
            effective = effective.min(cap_kw * 1000.0);
        }
    }

    let setpoint = effective.max(0.0).round() as i32;
    (EmsMode::ImportAc, setpoint, HoldState { hold_until: None })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings() -> GlobalSettings {
        let mut s = GlobalSettings::default();
        s.target_soc_percent = 100.0;
        s.import_charge_power_w = 3400;
        s.min_import_w = 0;
        s
    }

    fn utc_at(h: u32, m: u32) -> DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2026, 7, 28, h, m, 0).unwrap()
    }

    #[test]
    fn test_charging_path_subtracts_pv() {
        let settings = settings();
        let windows = vec![(NaiveTime::from_hms_opt(2, 0, 0).unwrap(), NaiveTime::from_hms_opt(5, 0, 0).unwrap())];
        let inputs = DecideInputs {
            now: utc_at(3, 0),
            tz: chrono_tz::Europe::London,
            today: NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
            windows: &windows,
            soc: 0.5,
            pv_power_w: 500.0,
            dyn_cap_kw: None,
            settings: &settings,
        };
        let (mode, setpoint, _) = decide(&inputs, HoldState::default());
        assert_eq!(mode, EmsMode::ImportAc);
        assert_eq!(setpoint, 2900);
    }

    #[test]
    fn test_hold_latch_at_target() {
        let settings = settings();
        let windows = vec![(NaiveTime::from_hms_opt(2, 0, 0).unwrap(), NaiveTime::from_hms_opt(5, 0, 0).unwrap())];
        let inputs = DecideInputs {
            now: utc_at(3, 0),
            tz: chrono_tz::Europe::London,
            today: NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
            windows: &windows,
            soc: 0.995,
            pv_power_w: 0.0,
            dyn_cap_kw: None,
            settings: &settings,
        };
        let (mode, setpoint, hold) = decide(&inputs, HoldState::default());
        assert_eq!(mode, EmsMode::ImportAc);
        assert_eq!(setpoint, 0);
        assert!(hold.hold_until.is_some());
    }

    #[test]
    fn test_outside_window_is_auto_and_clears_hold() {
        let settings = settings();
        let windows = vec![(NaiveTime::from_hms_opt(2, 0, 0).unwrap(), NaiveTime::from_hms_opt(5, 0, 0).unwrap())];
        let prior_hold = HoldState {
            hold_until: Some(chrono_tz::Europe::London.with_ymd_and_hms(2026, 7, 28, 5, 0, 0).unwrap()),
        };
        let inputs = DecideInputs {
            now: utc_at(6, 0),
            tz: chrono_tz::Europe::London,
            today: NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
            windows: &windows,
            soc: 0.8,
            pv_power_w: 0.0,
            dyn_cap_kw: None,
            settings: &settings,
        };
        let (mode, setpoint, hold) = decide(&inputs, prior_hold);
        assert_eq!(mode, EmsMode::Auto);
        assert_eq!(setpoint, 0);
        assert!(hold.hold_until.is_none());
    }

    #[test]
    fn test_dynamic_cap_limits_setpoint() {
        let settings = settings();
        let windows = vec![(NaiveTime::from_hms_opt(2, 0, 0).unwrap(), NaiveTime::from_hms_opt(5, 0, 0).unwrap())];
        let inputs = DecideInputs {
            now: utc_at(3, 0),
            tz: chrono_tz::Europe::London,
            today: NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
            windows: &windows,
            soc: 0.5,
            pv_power_w: 0.0,
            dyn_cap_kw: Some(1.0),
            settings: &settings,
        };
        let (_, setpoint, _) = decide(&inputs, HoldState::default());
        assert_eq!(setpoint, 1000);
    }
}
