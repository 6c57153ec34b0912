//! # LAN Zone Edge Agent
//!
//! An on-site edge agent that controls one or more grid-connected
//! battery/inverter units at a customer location. For each unit it reads
//! telemetry over a field bus, decides how the unit should behave during
//! upcoming "cheap" charge windows, commits the decision to the inverter
//! under strict write-safety rules, monitors device health and escalates
//! faults, and forwards telemetry and alerts to a cloud backend.
//!
//! ## Architecture
//!
//! - `config`: process-environment configuration and validation
//! - `logging`: structured, component-scoped logging over `tracing`
//! - `error`: crate-wide error type and `Result` alias
//! - `registers`: the JSON register map and PV-register heuristic
//! - `write_guard`: process-wide write deduplication and rate limiting
//! - `field_bus`: named register read/write over Modbus-TCP
//! - `state_store`: thread-safe settings, unit config and task storage
//! - `tasks`: static/dynamic task merge, fallback copy-forward, day GC
//! - `window`: charge-window resolution and time-in-window predicates
//! - `ems`: the decider (pure mode/setpoint logic) and applier (clamp/ramp/write)
//! - `task_eval`: collapses settings and unit config into a run mode
//! - `health`: per-unit alert state machine and intent queue
//! - `controller`: the per-unit 1 Hz tick orchestrator
//! - `supervisor`: per-unit worker lifecycle
//! - `backend`: HTTP client and bounded-queue sink for telemetry/alerts
//! - `bus`: MQTT transport and envelope decoding
//! - `ingest`: bridges decoded bus events into store/supervisor actions

pub mod backend;
pub mod bus;
pub mod config;
pub mod controller;
pub mod ems;
pub mod error;
pub mod field_bus;
pub mod health;
pub mod ingest;
pub mod logging;
pub mod registers;
pub mod state_store;
pub mod supervisor;
pub mod task_eval;
pub mod tasks;
pub mod window;
pub mod write_guard;

pub use config::Config;
pub use error::{EdgeError, Result};
