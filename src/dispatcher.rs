use std::sync::Arc;

use rumqttc::QoS;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::devices::{Registry, TopicScheme};
use crate::error::GatewayError;
use crate::mqtt::Bus;

/// A control request for one device. Never persisted.
#[derive(Debug, Clone)]
pub struct ControlCommand {
    pub device_id: String,
    pub action: String,
    pub issued_at: Instant,
}

impl ControlCommand {
    pub fn new(device_id: &str, action: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            action: action.to_string(),
            issued_at: Instant::now(),
        }
    }

    fn payload(&self) -> Vec<u8> {
        json!({ "state": self.action }).to_string().into_bytes()
    }
}

/// Validates commands against the registry and publishes them to the
/// device's control topic.
pub struct CommandDispatcher {
    bus: Arc<dyn Bus>,
    registry: Arc<Registry>,
    topics: TopicScheme,
    qos: QoS,
}

impl CommandDispatcher {
    pub fn new(bus: Arc<dyn Bus>, registry: Arc<Registry>, topics: TopicScheme, qos: QoS) -> Self {
        Self {
            bus,
            registry,
            topics,
            qos,
        }
    }

    /// Publish `{"state": action}` to `<prefix>/<id>/set`.
    ///
    /// Unknown devices and actions the device class does not support are
    /// rejected before anything is published. Success only means the bus
    /// accepted the publish, not that the device acted on it.
    pub async fn issue_command(&self, device_id: &str, action: &str) -> Result<(), GatewayError> {
        let command = ControlCommand::new(device_id, action);
        let device = self.registry.resolve(&command.device_id)?;
        if !device.class.accepts(&command.action) {
            return Err(GatewayError::InvalidAction {
                device: command.device_id,
                action: command.action,
            });
        }

        let topic = self.topics.control(device);
        info!("Sending {} to {} ({})", command.action, device.logical_id, topic);
        self.bus
            .publish(&topic, command.payload(), self.qos, false)
            .await
            .map_err(|source| GatewayError::PublishFailed {
                topic: topic.clone(),
                source,
            })?;

        debug!(
            "Command for {} acknowledged after {:?}",
            command.device_id,
            command.issued_at.elapsed()
        );
        Ok(())
    }
}
