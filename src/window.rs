//! Window Resolver: midnight-wrapping charge-window predicates.

use crate::state_store::StateStore;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;

/// Whether `now_local` falls inside any of `windows`. A window with
/// `start > end` wraps midnight and covers `[start, 24:00) ∪ [00:00, end)`.
pub fn covers(windows: &[(NaiveTime, NaiveTime)], now_local: NaiveTime) -> bool {
    windows.iter().any(|&(s, e)| {
        if s <= e {
            s <= now_local && now_local < e
        } else {
            now_local >= s || now_local < e
        }
    })
}

/// Whether `consus_id` is currently inside a charge window, resolved for
/// `now` (an instant in UTC) against the store's operator timezone.
pub fn in_charge_window(store: &StateStore, consus_id: &str, now: DateTime<chrono::Utc>) -> bool {
    let tz = store.timezone();
    let now_local = now.with_timezone(&tz);
    let windows = store.windows_for(consus_id, now_local.date_naive());
    if windows.is_empty() {
        return false;
    }
    covers(&windows, now_local.time())
}

/// The local datetime at which the window covering `now_local` ends, or
/// `None` if `now_local` is not inside any window. Handles a window that
/// started yesterday (ends today) and a window that wraps into tomorrow.
pub fn current_window_end(
    tz: Tz,
    windows: &[(NaiveTime, NaiveTime)],
    today: NaiveDate,
    now_local: NaiveTime,
) -> Option<DateTime<Tz>> {
    for &(s, e) in windows {
        if s <= e {
            if s <= now_local && now_local < e {
                return tz.from_local_datetime(&today.and_time(e)).single();
            }
        } else if now_local >= s {
            let tomorrow = today + Duration::days(1);
            return tz.from_local_datetime(&tomorrow.and_time(e)).single();
        } else if now_local < e {
            return tz.from_local_datetime(&today.and_time(e)).single();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_simple_window() {
        let windows = vec![(t(2, 0), t(5, 0))];
        assert!(covers(&windows, t(3, 0)));
        assert!(!covers(&windows, t(5, 0)));
        assert!(!covers(&windows, t(1, 59)));
    }

    #[test]
    fn test_midnight_spanning_window() {
        let windows = vec![(t(23, 30), t(4, 30))];
        assert!(covers(&windows, t(0, 15)));
        assert!(covers(&windows, t(23, 45)));
        assert!(!covers(&windows, t(4, 30)));
        assert!(!covers(&windows, t(12, 0)));
    }

    #[test]
    fn test_current_window_end_same_day() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let windows = vec![(t(2, 0), t(5, 0))];
        let end = current_window_end(chrono_tz::Europe::London, &windows, today, t(3, 0)).unwrap();
        assert_eq!(end.date_naive(), today);
        assert_eq!(end.time(), t(5, 0));
    }

    #[test]
    fn test_current_window_end_wraps_to_tomorrow() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let windows = vec![(t(23, 30), t(4, 30))];
        let end = current_window_end(chrono_tz::Europe::London, &windows, today, t(23, 45)).unwrap();
        assert_eq!(end.date_naive(), today + Duration::days(1));
        assert_eq!(end.time(), t(4, 30));
    }

    #[test]
    fn test_current_window_end_started_yesterday() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let windows = vec![(t(23, 30), t(4, 30))];
        let end = current_window_end(chrono_tz::Europe::London, &windows, today, t(1, 0)).unwrap();
        assert_eq!(end.date_naive(), today);
        assert_eq!(end.time(), t(4, 30));
    }

    #[test]
    fn test_no_window_returns_none() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let windows: Vec<(NaiveTime, NaiveTime)> = vec![];
        assert!(current_window_end(chrono_tz::Europe::London, &windows, today, t(12, 0)).is_none());
    }
}
