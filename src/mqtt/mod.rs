//! Message-bus capability used by the gateway core.
//!
//! The core never talks to `rumqttc` directly; it goes through [`Bus`] so the
//! command and query paths can be driven by the in-memory bus in tests.

pub mod client;
#[cfg(test)]
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;

use crate::error::BusError;

/// Callback for messages on a subscribed topic. Invoked from the bus's own task,
/// so it must not block.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Wait for the transport to (re)establish its broker connection.
    async fn connect(&self) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BusError>;

    /// Route messages on `topic` to `handler`. Several handlers may share a
    /// topic; each is released on its own with [`Bus::unsubscribe`].
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), BusError>;

    /// Drop `handler` from `topic`. The broker subscription is left only once
    /// no handler remains on the topic. Handlers other than `handler` keep
    /// receiving messages.
    async fn unsubscribe(&self, topic: &str, handler: &MessageHandler) -> Result<(), BusError>;
}
