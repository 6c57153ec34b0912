use lanzone_edge_agent::config::Config;
use std::env;
use std::sync::Mutex;

// Env vars are process-global; serialize tests that touch them.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn set_required_env() {
    unsafe {
        env::set_var("MQTT_BROKER_HOST", "broker.example.com");
        env::set_var("MQTT_BROKER_PORT", "1883");
        env::set_var("group_id", "lanzone-test");
        env::set_var("KEEP_ALIVE", "60");
        env::set_var("api_base_url", "https://api.example.com");
        env::set_var("ingest_endpoint", "/blob/ingest");
        env::set_var("state_validation_endpoint", "/edge/validate-state");
        env::set_var("modbus_validation_endpoint", "/edge/validate-modbus");
        env::set_var("MQTT_USER", "");
        env::set_var("MQTT_PASSWORD", "");
        env::set_var("API_KEY", "test-key");
    }
}

fn clear_env() {
    for key in [
        "MQTT_BROKER_HOST",
        "MQTT_BROKER_PORT",
        "group_id",
        "KEEP_ALIVE",
        "api_base_url",
        "ingest_endpoint",
        "state_validation_endpoint",
        "modbus_validation_endpoint",
        "MQTT_USER",
        "MQTT_PASSWORD",
        "API_KEY",
        "TIMEZONE",
        "POLL_INTERVAL_MS",
    ] {
        unsafe {
            env::remove_var(key);
        }
    }
}

#[test]
fn loads_defaults_for_optional_keys() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    set_required_env();

    let config = Config::from_env().unwrap();
    assert_eq!(config.timezone, "Europe/London");
    assert_eq!(config.poll_interval_ms, 1000);
    assert_eq!(config.backend.health_endpoint, "/blob/health");
    assert_eq!(config.backend.posting_interval_seconds, 10);

    clear_env();
}

#[test]
fn rejects_invalid_timezone() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    set_required_env();
    unsafe {
        env::set_var("TIMEZONE", "Not/ARealZone");
    }

    assert!(Config::from_env().is_err());
    clear_env();
}

#[test]
fn rejects_zero_poll_interval() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    set_required_env();
    unsafe {
        env::set_var("POLL_INTERVAL_MS", "0");
    }

    assert!(Config::from_env().is_err());
    clear_env();
}
