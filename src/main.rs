use lanzone_edge_agent::backend::BackendSink;
use lanzone_edge_agent::bus::BusClient;
use lanzone_edge_agent::config::Config;
use lanzone_edge_agent::ingest;
use lanzone_edge_agent::logging::{get_logger, init_logging};
use lanzone_edge_agent::registers::RegisterMap;
use lanzone_edge_agent::state_store::StateStore;
use lanzone_edge_agent::supervisor::Supervisor;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let logger = get_logger("main");
    logger.info("lanzone edge agent starting up");

    let tz: chrono_tz::Tz = match config.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            logger.error(&format!("invalid timezone: {}", config.timezone));
            return ExitCode::FAILURE;
        }
    };

    let register_map = match RegisterMap::load_from_file(&config.register_map_path) {
        Ok(map) => map,
        Err(e) => {
            logger.error(&format!("failed to load register map: {e}"));
            return ExitCode::FAILURE;
        }
    };

    let store = Arc::new(StateStore::new(tz));

    let backend = match BackendSink::new(config.backend.clone()) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            logger.error(&format!("failed to construct backend sink: {e}"));
            return ExitCode::FAILURE;
        }
    };

    let site_id = config.mqtt.group_id.clone();
    let supervisor = Arc::new(Supervisor::new(
        store.clone(),
        backend.clone(),
        register_map.clone(),
        site_id,
        config.health_poll_hz,
    ));

    let (bus_client, mut events) = match BusClient::connect(config.mqtt.clone()).await {
        Ok(pair) => pair,
        Err(e) => {
            logger.error(&format!("failed to connect message bus: {e}"));
            return ExitCode::FAILURE;
        }
    };
    logger.info(&format!("subscribed to {}", bus_client.updates_topic()));

    let mut shutdown = Box::pin(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        ingest::apply_event(event, &store, &supervisor, &register_map, &logger).await;
                    }
                    None => {
                        logger.error("bus event channel closed, shutting down");
                        break;
                    }
                }
            }
            _ = &mut shutdown => {
                logger.info("shutdown signal received");
                break;
            }
        }
    }

    bus_client.disconnect().await;
    logger.info("lanzone edge agent shutdown complete");
    ExitCode::SUCCESS
}
