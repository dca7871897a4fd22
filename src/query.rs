//! Synchronous status query on top of publish/subscribe.
//!
//! A query subscribes to the device's state topic, publishes a get-request,
//! and waits for the first non-empty state message or the deadline. The
//! subscription never outlives the query: every path that subscribed ends
//! with exactly one unsubscribe.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::devices::{DeviceRecord, Registry, TopicScheme};
use crate::error::GatewayError;
use crate::mqtt::{Bus, MessageHandler};

/// One in-flight status query.
pub struct PendingQuery {
    pub device_id: String,
    pub correlation_name: String,
    pub subscription_topic: String,
    pub request_topic: String,
    pub created_at: Instant,
    pub deadline: Instant,
    result: oneshot::Receiver<Vec<u8>>,
}

impl PendingQuery {
    fn new(
        device: &DeviceRecord,
        topics: &TopicScheme,
        timeout: Duration,
    ) -> (Self, MessageHandler) {
        let (handler, result) = first_message_slot();
        let created_at = Instant::now();
        let query = Self {
            device_id: device.logical_id.clone(),
            correlation_name: device.correlation_name.clone(),
            subscription_topic: topics.state(device),
            request_topic: topics.get_request(device),
            created_at,
            deadline: created_at + timeout,
            result,
        };
        (query, handler)
    }
}

/// Handler that forwards the first non-empty payload and ignores the rest.
///
/// Sending never blocks: once the waiting side has given up, the receiver is
/// gone and the payload is dropped.
fn first_message_slot() -> (MessageHandler, oneshot::Receiver<Vec<u8>>) {
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));

    let handler: MessageHandler = Arc::new(move |topic: &str, payload: &[u8]| {
        if payload.is_empty() {
            debug!("Ignoring empty message on {}", topic);
            return;
        }
        let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        match sender {
            Some(tx) => {
                if tx.send(payload.to_vec()).is_err() {
                    debug!("Dropping late state on {}: query already finished", topic);
                }
            }
            None => debug!("Ignoring further state on {}", topic),
        }
    });

    (handler, rx)
}

/// A subscription owned by one query.
///
/// Armed before the subscribe call is made, so a query dropped while waiting
/// for the SUBACK still cleans up. `release` is the normal teardown. If the
/// query future is dropped before that (e.g. the HTTP client went away), the
/// unsubscribe is spawned instead.
struct Subscription {
    bus: Arc<dyn Bus>,
    topic: String,
    handler: MessageHandler,
    active: bool,
}

impl Subscription {
    fn disarm(mut self) {
        self.active = false;
    }

    async fn release(mut self) {
        debug!("Unsubscribing from {}", self.topic);
        if let Err(e) = self.bus.unsubscribe(&self.topic, &self.handler).await {
            warn!("Failed to unsubscribe from {}: {}", self.topic, e);
        }
        self.active = false;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let bus = self.bus.clone();
        let handler = self.handler.clone();
        let topic = std::mem::take(&mut self.topic);
        warn!("Status query abandoned, releasing {}", topic);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = bus.unsubscribe(&topic, &handler).await {
                    warn!("Failed to unsubscribe from {}: {}", topic, e);
                }
            });
        }
    }
}

pub struct StatusQuery {
    bus: Arc<dyn Bus>,
    registry: Arc<Registry>,
    topics: TopicScheme,
    qos: QoS,
    timeout: Duration,
}

impl StatusQuery {
    pub fn new(
        bus: Arc<dyn Bus>,
        registry: Arc<Registry>,
        topics: TopicScheme,
        qos: QoS,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            registry,
            topics,
            qos,
            timeout,
        }
    }

    /// Ask a device for its current state and return the first state message
    /// it publishes, verbatim.
    pub async fn query_status(&self, device_id: &str) -> Result<Vec<u8>, GatewayError> {
        if !self.bus.is_connected() {
            warn!("MQTT client not connected, reconnecting before querying {}", device_id);
            self.bus
                .connect()
                .await
                .map_err(|e| GatewayError::TransportUnavailable(e.to_string()))?;
        }

        let device = self.registry.resolve(device_id)?;
        let (query, handler) = PendingQuery::new(device, &self.topics, self.timeout);

        let subscription = Subscription {
            bus: self.bus.clone(),
            topic: query.subscription_topic.clone(),
            handler: handler.clone(),
            active: true,
        };
        if let Err(source) = self
            .bus
            .subscribe(&query.subscription_topic, self.qos, handler)
            .await
        {
            subscription.disarm();
            return Err(GatewayError::SubscribeFailed {
                topic: query.subscription_topic,
                source,
            });
        }

        let outcome = self.exchange(device, query).await;
        subscription.release().await;
        outcome
    }

    async fn exchange(
        &self,
        device: &DeviceRecord,
        query: PendingQuery,
    ) -> Result<Vec<u8>, GatewayError> {
        let payload = device.class.get_request_payload().to_string().into_bytes();
        self.bus
            .publish(&query.request_topic, payload, self.qos, false)
            .await
            .map_err(|source| GatewayError::PublishFailed {
                topic: query.request_topic.clone(),
                source,
            })?;

        match tokio::time::timeout_at(query.deadline, query.result).await {
            Ok(Ok(state)) => {
                info!(
                    "Status of {} ({}) received after {:?}",
                    query.device_id,
                    query.correlation_name,
                    query.created_at.elapsed()
                );
                Ok(state)
            }
            Ok(Err(_)) => Err(GatewayError::TransportUnavailable(format!(
                "subscription to {} was dropped before any state arrived",
                query.subscription_topic
            ))),
            Err(_) => {
                warn!(
                    "Timeout waiting for {} status on {}",
                    query.device_id, query.subscription_topic
                );
                Err(GatewayError::Timeout {
                    device: query.device_id,
                    after: self.timeout,
                })
            }
        }
    }
}
