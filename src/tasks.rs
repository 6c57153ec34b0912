//! Task Merger: idempotent merge of static and day-aware dynamic tasks.
//!
//! Mirrors the conflict-resolution rules of the upstream task store: override
//! beats non-override, same idempotency key falls back to revision then
//! `updated_at`, and a different idempotency key is treated as a fresh
//! replacement family. Dynamic entries are garbage-collected down to
//! `{today, tomorrow}` after every mutation.

use crate::error::{EdgeError, Result};
use crate::logging::get_logger;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Inbound task payload as decoded from a bus message, prior to merge.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub task_type: TaskType,
    pub task_code: Option<String>,
    /// Required for dynamic tasks; ignored for static.
    pub service_day: Option<NaiveDate>,
    /// Static tasks use at most one window; dynamic tasks may use several.
    pub charge_windows: Vec<(NaiveTime, NaiveTime)>,
    pub max_import_limit_kw: Option<f64>,
    pub r#override: bool,
    pub idempotency_key: Option<String>,
    pub revision: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Kind of task payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Static,
    Dynamic,
}

/// Resolved static (evergreen) task for a unit.
#[derive(Debug, Clone)]
pub struct StaticTask {
    pub task_code: Option<String>,
    pub charge_window: Option<(NaiveTime, NaiveTime)>,
    pub max_import_limit_kw: Option<f64>,
    pub r#override: bool,
    pub updated_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub revision: u64,
}

/// Resolved dynamic (day-specific) task entry for a unit.
#[derive(Debug, Clone)]
pub struct DynamicTask {
    pub task_code: Option<String>,
    pub charge_windows: Vec<(NaiveTime, NaiveTime)>,
    pub max_import_limit_kw: Option<f64>,
    pub r#override: bool,
    pub updated_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub revision: u64,
}

/// Parse a single `HH:MM` or `HH:MM:SS` time string.
fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S").or_else(|_| NaiveTime::parse_from_str(s, "%H:%M")).ok()
}

/// Decode a `task` bus message's `data` object into a [`TaskUpdate`].
/// Normalizes `charge_window_start`/`charge_window_end` (static tasks) or
/// `charge_windows` pairs (dynamic tasks), skipping malformed pairs
/// individually rather than rejecting the whole payload.
pub fn parse_task_update(data: &Value) -> Result<TaskUpdate> {
    let task_type = match data.get("task_type").and_then(Value::as_str) {
        Some("static") => TaskType::Static,
        Some("dynamic") => TaskType::Dynamic,
        other => return Err(EdgeError::bus(format!("invalid or missing task_type: {other:?}"))),
    };

    let task_code = data.get("task_code").and_then(Value::as_str).map(String::from);
    let max_import_limit_kw = data.get("max_import_limit_kw").and_then(Value::as_f64);
    let r#override = data.get("override").and_then(Value::as_bool).unwrap_or(false);
    let idempotency_key = data.get("idempotency_key").and_then(Value::as_str).map(String::from);
    let revision = data.get("revision").and_then(Value::as_u64).unwrap_or(0);
    let updated_at = data
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let service_day = data
        .get("service_day")
        .and_then(Value::as_str)
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());

    let mut charge_windows = Vec::new();
    if let Some(pairs) = data.get("charge_windows").and_then(Value::as_array) {
        for pair in pairs {
            let Some(arr) = pair.as_array() else { continue };
            let (Some(s), Some(e)) = (arr.first().and_then(Value::as_str), arr.get(1).and_then(Value::as_str)) else {
                continue;
            };
            if let (Some(s), Some(e)) = (parse_time(s), parse_time(e)) {
                charge_windows.push((s, e));
            }
        }
    } else if let (Some(s), Some(e)) = (
        data.get("charge_window_start").and_then(Value::as_str),
        data.get("charge_window_end").and_then(Value::as_str),
    ) {
        if let (Some(s), Some(e)) = (parse_time(s), parse_time(e)) {
            charge_windows.push((s, e));
        }
    }

    Ok(TaskUpdate {
        task_type,
        task_code,
        service_day,
        charge_windows,
        max_import_limit_kw,
        r#override,
        idempotency_key,
        revision,
        updated_at,
    })
}

const FALLBACK_MAX_DAYS: i64 = 2;

/// Merges inbound task updates into per-unit static/dynamic state.
pub struct TaskMerger {
    static_tasks: HashMap<String, StaticTask>,
    dynamic_tasks: HashMap<String, HashMap<NaiveDate, DynamicTask>>,
}

impl TaskMerger {
    /// Create an empty task merger.
    pub fn new() -> Self {
        Self {
            static_tasks: HashMap::new(),
            dynamic_tasks: HashMap::new(),
        }
    }

    /// Apply a task update (or a fallback copy-forward when `payload` is
    /// `None`) for `consus_id`. `today` anchors the day-GC and fallback logic
    /// and must be computed by the caller in the operator timezone.
    pub fn update(&mut self, consus_id: &str, payload: Option<TaskUpdate>, today: NaiveDate) {
        let logger = get_logger("task_merger");
        let Some(payload) = payload else {
            self.fallback_copy_forward(consus_id, today, &logger);
            return;
        };

        match payload.task_type {
            TaskType::Static => self.merge_static(consus_id, payload, &logger),
            TaskType::Dynamic => self.merge_dynamic(consus_id, payload, today, &logger),
        }
    }

    fn merge_static(&mut self, consus_id: &str, payload: TaskUpdate, logger: &crate::logging::StructuredLogger) {
        let entry = StaticTask {
            task_code: payload.task_code,
            charge_window: payload.charge_windows.first().copied(),
            max_import_limit_kw: payload.max_import_limit_kw,
            r#override: payload.r#override,
            updated_at: payload.updated_at.unwrap_or_else(Utc::now),
            idempotency_key: payload.idempotency_key,
            revision: payload.revision,
        };

        if let Some(prev) = self.static_tasks.get(consus_id) {
            if prev.r#override && !entry.r#override {
                logger.info(&format!("ignored static non-override for {consus_id} (existing is override)"));
                return;
            }
        }

        self.static_tasks.insert(consus_id.to_string(), entry);
    }

    fn merge_dynamic(
        &mut self,
        consus_id: &str,
        payload: TaskUpdate,
        today: NaiveDate,
        logger: &crate::logging::StructuredLogger,
    ) {
        let Some(service_day) = payload.service_day else {
            logger.warn(&format!("dynamic task for {consus_id} missing service_day; rejecting"));
            return;
        };

        let entry = DynamicTask {
            task_code: payload
                .task_code
                .or_else(|| Some(format!("task-{consus_id}-{service_day}"))),
            charge_windows: payload.charge_windows,
            max_import_limit_kw: payload.max_import_limit_kw,
            r#override: payload.r#override,
            updated_at: payload.updated_at.unwrap_or_else(Utc::now),
            idempotency_key: payload.idempotency_key,
            revision: payload.revision,
        };

        let per_unit = self.dynamic_tasks.entry(consus_id.to_string()).or_default();

        let take = match per_unit.get(&service_day) {
            None => true,
            Some(existing) => {
                if entry.r#override && !existing.r#override {
                    true
                } else {
                    match (&entry.idempotency_key, &existing.idempotency_key) {
                        (Some(new_key), Some(old_key)) if !new_key.is_empty() && new_key == old_key => {
                            entry.revision > existing.revision
                                || (entry.revision == existing.revision && entry.updated_at > existing.updated_at)
                        }
                        _ => true,
                    }
                }
            }
        };

        if take {
            per_unit.insert(service_day, entry);
        } else {
            logger.info(&format!("ignored older/duplicate dynamic task for {consus_id} on {service_day}"));
        }

        self.gc_keep_today_tomorrow(today);
    }

    fn fallback_copy_forward(&mut self, consus_id: &str, today: NaiveDate, logger: &crate::logging::StructuredLogger) {
        let Some(per_unit) = self.dynamic_tasks.get(consus_id) else {
            return;
        };
        let Some(&last_day) = per_unit.keys().max() else {
            return;
        };

        let age_days = (today - last_day).num_days();
        if age_days > FALLBACK_MAX_DAYS {
            logger.warn(&format!(
                "fallback refused for {consus_id}: last task {last_day} is {age_days} days old"
            ));
            return;
        }

        let last_task = per_unit.get(&last_day).cloned();
        let Some(last_task) = last_task else { return };
        let tomorrow = today + chrono::Duration::days(1);
        let now = Utc::now();

        let per_unit = self.dynamic_tasks.get_mut(consus_id).unwrap();
        for day in [today, tomorrow] {
            per_unit.entry(day).or_insert_with(|| DynamicTask {
                task_code: Some(format!(
                    "{}-copy-{day}",
                    last_task.task_code.clone().unwrap_or_else(|| "task".to_string())
                )),
                updated_at: now,
                ..last_task.clone()
            });
        }

        self.gc_keep_today_tomorrow(today);
    }

    fn gc_keep_today_tomorrow(&mut self, today: NaiveDate) {
        let tomorrow = today + chrono::Duration::days(1);
        for per_unit in self.dynamic_tasks.values_mut() {
            per_unit.retain(|day, _| *day == today || *day == tomorrow);
        }
        self.dynamic_tasks.retain(|_, per_unit| !per_unit.is_empty());
    }

    /// Resolved windows for `consus_id` on `day`: dynamic entry if present,
    /// else static window if set, else empty.
    pub fn windows_for(&self, consus_id: &str, day: NaiveDate) -> Vec<(NaiveTime, NaiveTime)> {
        if let Some(entry) = self.dynamic_tasks.get(consus_id).and_then(|m| m.get(&day)) {
            return entry.charge_windows.clone();
        }
        if let Some(stat) = self.static_tasks.get(consus_id) {
            if let Some(window) = stat.charge_window {
                return vec![window];
            }
        }
        Vec::new()
    }

    /// The dynamic import cap (kW) active for `consus_id` on `day`, if any.
    pub fn active_cap_kw(&self, consus_id: &str, day: NaiveDate) -> Option<f64> {
        self.dynamic_tasks
            .get(consus_id)
            .and_then(|m| m.get(&day))
            .and_then(|e| e.max_import_limit_kw)
    }

    /// Resolved task type for `consus_id` on `day`.
    pub fn task_type(&self, consus_id: &str, day: NaiveDate) -> Option<TaskType> {
        if self.dynamic_tasks.get(consus_id).is_some_and(|m| m.contains_key(&day)) {
            return Some(TaskType::Dynamic);
        }
        if self.static_tasks.contains_key(consus_id) {
            return Some(TaskType::Static);
        }
        None
    }

    /// The static task entry for a unit, if any.
    pub fn static_task(&self, consus_id: &str) -> Option<&StaticTask> {
        self.static_tasks.get(consus_id)
    }
}

impl Default for TaskMerger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn naive_time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn day(offset: i64) -> NaiveDate {
        let base = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        base + chrono::Duration::days(offset)
    }

    fn dynamic_update(service_day: NaiveDate, key: &str, revision: u64, r#override: bool) -> TaskUpdate {
        TaskUpdate {
            task_type: TaskType::Dynamic,
            task_code: Some(format!("task-{key}-{revision}")),
            service_day: Some(service_day),
            charge_windows: vec![(naive_time(1, 0), naive_time(4, 0))],
            max_import_limit_kw: None,
            r#override,
            idempotency_key: Some(key.to_string()),
            revision,
            updated_at: Some(Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn test_dynamic_merge_revision_precedence() {
        let mut merger = TaskMerger::new();
        let today = day(0);

        merger.update("u1", Some(dynamic_update(today, "k1", 2, false)), today);
        merger.update("u1", Some(dynamic_update(today, "k1", 1, false)), today);
        // Lower revision on the same key is ignored.
        assert_eq!(merger.windows_for("u1", today).len(), 1);

        merger.update("u1", Some(dynamic_update(today, "k2", 1, false)), today);
        // Different idempotency key replaces the family outright.
        let windows = merger.windows_for("u1", today);
        assert_eq!(windows, vec![(naive_time(1, 0), naive_time(4, 0))]);
    }

    #[test]
    fn test_override_priority() {
        let mut merger = TaskMerger::new();
        let today = day(0);

        merger.update("u1", Some(dynamic_update(today, "k1", 1, true)), today);
        // A later non-override update must not replace an override entry.
        merger.update("u1", Some(dynamic_update(today, "k1", 5, false)), today);
        assert_eq!(merger.task_type("u1", today), Some(TaskType::Dynamic));
    }

    #[test]
    fn test_static_override_rejection() {
        let mut merger = TaskMerger::new();
        let update = TaskUpdate {
            task_type: TaskType::Static,
            task_code: Some("s1".into()),
            service_day: None,
            charge_windows: vec![(naive_time(2, 0), naive_time(5, 0))],
            max_import_limit_kw: None,
            r#override: true,
            idempotency_key: None,
            revision: 0,
            updated_at: None,
        };
        merger.update("u1", Some(update), day(0));

        let non_override = TaskUpdate {
            task_type: TaskType::Static,
            task_code: Some("s2".into()),
            service_day: None,
            charge_windows: vec![(naive_time(3, 0), naive_time(6, 0))],
            max_import_limit_kw: None,
            r#override: false,
            idempotency_key: None,
            revision: 0,
            updated_at: None,
        };
        merger.update("u1", Some(non_override), day(0));

        assert_eq!(merger.static_task("u1").unwrap().task_code, Some("s1".into()));
    }

    #[test]
    fn test_day_gc_keeps_only_today_tomorrow() {
        let mut merger = TaskMerger::new();
        let today = day(0);
        let yesterday = day(-1);

        merger.update("u1", Some(dynamic_update(yesterday, "k1", 1, false)), yesterday);
        // Advance "today" without supplying new data for the stale day.
        merger.update("u1", Some(dynamic_update(today, "k2", 1, false)), today);

        assert!(merger.windows_for("u1", yesterday).is_empty());
        assert!(!merger.windows_for("u1", today).is_empty());
    }

    #[test]
    fn test_fallback_copy_forward() {
        let mut merger = TaskMerger::new();
        let yesterday = day(-1);
        let today = day(0);
        let tomorrow = day(1);

        merger.update("u1", Some(dynamic_update(yesterday, "k1", 1, false)), yesterday);
        // No new payload arrives; fallback should copy yesterday's windows forward.
        merger.update("u1", None, today);

        assert_eq!(merger.windows_for("u1", today), vec![(naive_time(1, 0), naive_time(4, 0))]);
        assert_eq!(merger.windows_for("u1", tomorrow), vec![(naive_time(1, 0), naive_time(4, 0))]);
    }

    #[test]
    fn test_fallback_refused_when_stale() {
        let mut merger = TaskMerger::new();
        let old_day = day(-5);
        let today = day(0);

        merger.update("u1", Some(dynamic_update(old_day, "k1", 1, false)), old_day);
        merger.update("u1", None, today);

        assert!(merger.windows_for("u1", today).is_empty());
    }

    #[test]
    fn test_merge_idempotence() {
        let mut merger = TaskMerger::new();
        let today = day(0);
        let update = dynamic_update(today, "k1", 1, false);

        merger.update("u1", Some(update.clone()), today);
        let first = merger.windows_for("u1", today);
        merger.update("u1", Some(update), today);
        let second = merger.windows_for("u1", today);
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_task_update_dynamic() {
        let data = serde_json::json!({
            "task_type": "dynamic",
            "service_day": "2026-07-28",
            "charge_windows": [["02:00", "05:00"], ["bad", "pair"]],
            "max_import_limit_kw": 3.5,
            "override": true,
            "idempotency_key": "k1",
            "revision": 2,
        });
        let update = parse_task_update(&data).unwrap();
        assert_eq!(update.task_type, TaskType::Dynamic);
        assert_eq!(update.charge_windows, vec![(naive_time(2, 0), naive_time(5, 0))]);
        assert_eq!(update.max_import_limit_kw, Some(3.5));
        assert!(update.r#override);
    }

    #[test]
    fn test_parse_task_update_static_from_start_end() {
        let data = serde_json::json!({
            "task_type": "static",
            "charge_window_start": "03:00",
            "charge_window_end": "06:00:00",
        });
        let update = parse_task_update(&data).unwrap();
        assert_eq!(update.task_type, TaskType::Static);
        assert_eq!(update.charge_windows, vec![(naive_time(3, 0), naive_time(6, 0))]);
    }

    #[test]
    fn test_parse_task_update_rejects_missing_type() {
        let data = serde_json::json!({});
        assert!(parse_task_update(&data).is_err());
    }
}
