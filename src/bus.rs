//! Message Bus Client: the MQTT transport for inbound configuration, task
//! and lifecycle events. Decodes envelopes into [`BusEvent`]s and forwards
//! them to a channel; never panics a worker on malformed input.

use crate::config::MqttConfig;
use crate::error::{EdgeError, Result};
use crate::logging::{get_logger, StructuredLogger};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Decoded, dispatch-ready bus event. A total match over every recognized
/// envelope `type`.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Settings { data: Value },
    BatteryConfig { consus_id: String, data: Value },
    BatteryAdd { consus_id: String, data: Value },
    BatteryRemove { consus_id: String },
    Task { consus_id: String, data: Value },
    TestModbus { consus_id: String },
    Ping,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    consus_id: Option<String>,
    data: Option<Value>,
}

fn parse_envelope(payload: &[u8]) -> Result<BusEvent> {
    let envelope: Envelope =
        serde_json::from_slice(payload).map_err(|e| EdgeError::bus(format!("malformed envelope: {e}")))?;

    let require_consus_id = || {
        envelope
            .consus_id
            .clone()
            .ok_or_else(|| EdgeError::bus(format!("{} requires consus_id", envelope.kind)))
    };
    let require_data = || {
        envelope
            .data
            .clone()
            .ok_or_else(|| EdgeError::bus(format!("{} requires data", envelope.kind)))
    };

    match envelope.kind.as_str() {
        "settings" => Ok(BusEvent::Settings { data: require_data()? }),
        "battery_config" => Ok(BusEvent::BatteryConfig {
            consus_id: require_consus_id()?,
            data: require_data()?,
        }),
        "battery_add" => Ok(BusEvent::BatteryAdd {
            consus_id: require_consus_id()?,
            data: envelope.data.clone().unwrap_or(Value::Null),
        }),
        "battery_remove" => Ok(BusEvent::BatteryRemove {
            consus_id: require_consus_id()?,
        }),
        "task" => Ok(BusEvent::Task {
            consus_id: require_consus_id()?,
            data: require_data()?,
        }),
        "test_modbus" => Ok(BusEvent::TestModbus {
            consus_id: require_consus_id()?,
        }),
        "ping" => Ok(BusEvent::Ping),
        other => Err(EdgeError::bus(format!("unrecognized message type: {other}"))),
    }
}

/// Wraps `rumqttc`: connects, subscribes to the updates topic, decodes
/// envelopes, and forwards decoded events on a channel. Replies to `ping`
/// on the mirrored `pong` topic directly.
pub struct BusClient {
    client: AsyncClient,
    config: MqttConfig,
    logger: StructuredLogger,
}

impl BusClient {
    /// Connect and subscribe, returning the client and a receiver that
    /// yields every successfully decoded [`BusEvent`].
    pub async fn connect(config: MqttConfig) -> Result<(Self, mpsc::Receiver<BusEvent>)> {
        let mut options = MqttOptions::new("lanzone-edge-agent", config.broker_host.clone(), config.broker_port);
        options.set_keep_alive(Duration::from_secs(u64::from(config.keep_alive_secs)));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            if !user.is_empty() {
                options.set_credentials(user, pass);
            }
        }
        if config.broker_port == 8883 {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        client
            .subscribe(config.updates_topic(), QoS::AtLeastOnce)
            .await
            .map_err(EdgeError::from)?;

        let (tx, rx) = mpsc::channel(256);
        let logger = get_logger("bus_client");
        let pong_topic = config.pong_topic();
        let reply_client = client.clone();
        let worker_logger = logger.clone();

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match parse_envelope(&publish.payload) {
                            Ok(BusEvent::Ping) => {
                                if let Err(e) = reply_client.publish(&pong_topic, QoS::AtLeastOnce, false, b"pong".to_vec()).await {
                                    worker_logger.warn(&format!("failed to publish pong: {e}"));
                                }
                            }
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                worker_logger.warn(&format!("dropped malformed message: {e}"));
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        worker_logger.error(&format!("mqtt event loop error: {e}"));
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok((
            Self {
                client,
                config,
                logger,
            },
            rx,
        ))
    }

    /// The topic this client is subscribed to.
    pub fn updates_topic(&self) -> String {
        self.config.updates_topic()
    }

    /// Disconnect cleanly.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            self.logger.warn(&format!("error during disconnect: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        let payload = br#"{"type":"ping"}"#;
        assert!(matches!(parse_envelope(payload), Ok(BusEvent::Ping)));
    }

    #[test]
    fn test_parse_battery_remove() {
        let payload = br#"{"type":"battery_remove","consus_id":"unit-1"}"#;
        match parse_envelope(payload).unwrap() {
            BusEvent::BatteryRemove { consus_id } => assert_eq!(consus_id, "unit-1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_task() {
        let payload = br#"{"type":"task","consus_id":"unit-1","data":{"task_type":"static"}}"#;
        match parse_envelope(payload).unwrap() {
            BusEvent::Task { consus_id, data } => {
                assert_eq!(consus_id, "unit-1");
                assert_eq!(data["task_type"], "static");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let payload = br#"{"type":"unheard_of"}"#;
        assert!(parse_envelope(payload).is_err());
    }

    #[test]
    fn test_missing_consus_id_is_rejected() {
        let payload = br#"{"type":"battery_remove"}"#;
        assert!(parse_envelope(payload).is_err());
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(parse_envelope(b"not json").is_err());
    }
}
