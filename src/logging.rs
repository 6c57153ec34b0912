//! Structured logging and tracing for the edge agent.
//!
//! This module provides a thin, component-scoped wrapper over `tracing`. Log
//! *formatting* (ANSI, JSON, file rotation) is left entirely to
//! `tracing-subscriber`/`tracing-appender`; this module only decides what
//! gets logged and with which structured fields.

use crate::config::LoggingConfig;
use crate::error::{EdgeError, Result};
use once_cell::sync::OnceCell;
use std::sync::Once;
use tracing::{Level, debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// Keep the non-blocking worker guard alive for the entire process lifetime.
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT_ONCE: Once = Once::new();
static INIT_ERROR: OnceCell<String> = OnceCell::new();

/// Initialize the logging system based on configuration. Safe to call more
/// than once; only the first call takes effect.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INIT_ONCE.call_once(|| {
        let init_result = (|| -> Result<()> {
            let level = parse_log_level(&config.level)?;
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("lanzone_edge_agent={level},tokio_modbus=warn,rumqttc=warn").into());

            if config.stdout_only {
                init_console_only(filter, config.json_format, level);
                return Ok(());
            }

            init_file_and_console(config, filter, level)
        })();

        if let Err(e) = init_result {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });

    if let Some(err) = INIT_ERROR.get() {
        return Err(EdgeError::config(err.clone()));
    }
    Ok(())
}

fn init_console_only(filter: EnvFilter, json_format: bool, level: Level) {
    let console_layer = {
        let layer = fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false);
        if json_format {
            layer.json().with_filter(LevelFilter::from_level(level)).boxed()
        } else {
            layer.with_filter(LevelFilter::from_level(level)).boxed()
        }
    };

    tracing_subscriber::registry().with(filter).with(console_layer).init();
    info!("logging initialized, console-only, level={:?}", level);
}

fn init_file_and_console(config: &LoggingConfig, filter: EnvFilter, level: Level) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter);

    let file_appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("edge-agent")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&config.log_dir)
        .map_err(|e| EdgeError::io(format!("failed to create log file appender: {e}")))?;

    let (non_blocking_appender, guard) = non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let file_layer = {
        let base = fmt::layer()
            .with_writer(non_blocking_appender)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false);
        if config.json_format {
            base.json().with_filter(LevelFilter::from_level(level)).boxed()
        } else {
            base.with_filter(LevelFilter::from_level(level)).boxed()
        }
    };

    let subscriber = registry.with(file_layer);

    if config.console_output {
        let console_layer = {
            let base = fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false);
            if config.json_format {
                base.json().with_filter(LevelFilter::from_level(level)).boxed()
            } else {
                base.with_filter(LevelFilter::from_level(level)).boxed()
            }
        };
        subscriber.with(console_layer).init();
    } else {
        subscriber.init();
    }

    info!("logging initialized, level={:?}, dir={}", level, config.log_dir);
    Ok(())
}

fn parse_log_level(level_str: &str) -> Result<Level> {
    match level_str.to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(EdgeError::config(format!("invalid log level: {level_str}"))),
    }
}

/// Context attached to every log line emitted through a [`StructuredLogger`].
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g. "controller", "health_monitor", "write_guard").
    pub component: String,
    /// Unit identifier, when the context is scoped to one battery/inverter.
    pub consus_id: Option<String>,
    /// Additional structured fields.
    pub extra_fields: std::collections::HashMap<String, String>,
}

impl LogContext {
    /// Create a new log context for a component.
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            consus_id: None,
            extra_fields: std::collections::HashMap::new(),
        }
    }

    /// Scope this context to a specific unit.
    pub fn with_consus_id(mut self, consus_id: impl Into<String>) -> Self {
        self.consus_id = Some(consus_id.into());
        self
    }

    /// Attach an extra field.
    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// Structured logger bound to a [`LogContext`].
#[derive(Clone)]
pub struct StructuredLogger {
    context: LogContext,
}

impl StructuredLogger {
    /// Create a new structured logger from a context.
    pub fn new(context: LogContext) -> Self {
        Self { context }
    }

    /// Log an info message with context.
    pub fn info(&self, message: &str) {
        let fields = self.format_fields();
        info!(%fields, "{}", message);
    }

    /// Log a warning message with context.
    pub fn warn(&self, message: &str) {
        let fields = self.format_fields();
        warn!(%fields, "{}", message);
    }

    /// Log an error message with context.
    pub fn error(&self, message: &str) {
        let fields = self.format_fields();
        error!(%fields, "{}", message);
    }

    /// Log a debug message with context.
    pub fn debug(&self, message: &str) {
        let fields = self.format_fields();
        debug!(%fields, "{}", message);
    }

    /// Log a trace message with context.
    pub fn trace(&self, message: &str) {
        let fields = self.format_fields();
        trace!(%fields, "{}", message);
    }

    fn format_fields(&self) -> String {
        let mut fields = vec![format!("component={}", self.context.component)];
        if let Some(ref consus_id) = self.context.consus_id {
            fields.push(format!("consus_id={consus_id}"));
        }
        for (key, value) in &self.context.extra_fields {
            fields.push(format!("{key}={value}"));
        }
        fields.join(",")
    }
}

/// Create a logger for a specific component.
pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}

/// Create a logger scoped to a specific unit.
pub fn get_unit_logger(component: &str, consus_id: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component).with_consus_id(consus_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn init_test_logging() {
        INIT.call_once(|| {
            let mut config = LoggingConfig::default();
            config.stdout_only = true;
            init_logging(&config).ok();
        });
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("ERROR").unwrap(), Level::ERROR);
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_log_context() {
        let context = LogContext::new("test")
            .with_consus_id("unit-1")
            .with_field("key", "value".to_string());

        assert_eq!(context.component, "test");
        assert_eq!(context.consus_id, Some("unit-1".to_string()));
        assert_eq!(context.extra_fields.get("key"), Some(&"value".to_string()));
    }

    #[test]
    fn test_structured_logger() {
        init_test_logging();

        let logger = get_unit_logger("test_component", "unit-1");
        logger.info("test info message");
        logger.debug("test debug message");
        logger.warn("test warning message");
        logger.error("test error message");
    }

    #[test]
    fn test_get_logger() {
        let logger = get_logger("test_component");
        assert_eq!(logger.context.component, "test_component");
    }
}
