//! MQTT publishing of decoded point values.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::config::MqttConfig;
use crate::decode::DecodedValue;

/// Error type for publish operations.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("MQTT client error: {0}")]
    Client(String),
}

/// Wire payload published for every decoded value.
#[derive(Debug, Serialize)]
struct ValuePayload<'a> {
    value: &'a DecodedValue,
}

/// Capability to publish one decoded value to the message bus.
#[async_trait]
pub trait ValueSink: Send + Sync {
    async fn publish(&self, topic: &str, value: &DecodedValue) -> Result<(), PublishError>;
}

/// Publisher backed by a shared rumqttc client.
///
/// Values go out with at-least-once delivery and the retained flag set, so
/// a late subscriber immediately receives the last value on every topic.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Build the client and spawn the event-loop driver task.
    ///
    /// The driver keeps the connection alive for the process lifetime and
    /// retries after connection errors; publish calls themselves never
    /// block on broker availability beyond the client's internal queue.
    pub fn connect(config: &MqttConfig) -> (Self, JoinHandle<()>) {
        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 16);

        let driver = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => trace!(?event, "MQTT event"),
                    Err(e) => {
                        warn!(error = %e, "MQTT connection error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (Self { client }, driver)
    }
}

#[async_trait]
impl ValueSink for MqttPublisher {
    async fn publish(&self, topic: &str, value: &DecodedValue) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(&ValuePayload { value })?;
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|e| PublishError::Client(e.to_string()))
    }
}
