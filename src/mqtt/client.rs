use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Bus, MessageHandler};
use crate::config::MqttConfig;
use crate::error::BusError;

struct Route {
    qos: QoS,
    handlers: Vec<MessageHandler>,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

/// `rumqttc`-backed [`Bus`]. Cheap to share behind an `Arc`; the matching
/// [`MqttEventLoop`] must be running for any operation to complete.
pub struct MqttClient {
    client: AsyncClient,
    routes: Routes,
    connected: watch::Receiver<bool>,
    ack_timeout: Duration,
}

/// Drives the connection and routes incoming publishes to subscription handlers.
pub struct MqttEventLoop {
    client: AsyncClient,
    eventloop: EventLoop,
    routes: Routes,
    connected: watch::Sender<bool>,
}

impl MqttClient {
    pub fn new(config: &MqttConfig) -> (Self, MqttEventLoop) {
        let mut mqttopts = MqttOptions::new(
            &config.client_id,
            &config.broker_host,
            config.broker_port,
        );
        mqttopts.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttopts.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (connected_tx, connected_rx) = watch::channel(false);

        let bus = Self {
            client: client.clone(),
            routes: routes.clone(),
            connected: connected_rx,
            ack_timeout: config.ack_timeout,
        };
        let eventloop = MqttEventLoop {
            client,
            eventloop,
            routes,
            connected: connected_tx,
        };
        (bus, eventloop)
    }

    async fn acked<F>(&self, request: F) -> Result<(), BusError>
    where
        F: Future<Output = Result<(), ClientError>>,
    {
        tokio::time::timeout(self.ack_timeout, request)
            .await
            .map_err(|_| BusError::AckTimeout(self.ack_timeout))?
            .map_err(BusError::from)
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }

    fn lock_routes(&self) -> MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Remove one handler from `topic`. Returns true when that removed the last
/// handler on the topic; releasing a handler twice is a no-op.
fn remove_handler(
    routes: &mut HashMap<String, Route>,
    topic: &str,
    handler: &MessageHandler,
) -> bool {
    let Some(route) = routes.get_mut(topic) else {
        return false;
    };
    let before = route.handlers.len();
    route.handlers.retain(|h| !Arc::ptr_eq(h, handler));
    if route.handlers.len() == before {
        return false;
    }
    if route.handlers.is_empty() {
        routes.remove(topic);
        true
    } else {
        false
    }
}

#[async_trait]
impl Bus for MqttClient {
    async fn connect(&self) -> Result<(), BusError> {
        // rumqttc reconnects on its own while the event loop is polled; all we
        // can do is wait for the next ConnAck.
        let mut state = self.connected.clone();
        match tokio::time::timeout(self.ack_timeout, state.wait_for(|connected| *connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BusError::Rejected("MQTT event loop stopped".into())),
            Err(_) => Err(BusError::NotConnected),
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BusError> {
        self.ensure_connected()?;
        info!("Publishing {}: {}", topic, String::from_utf8_lossy(&payload));
        self.acked(self.client.publish(topic, qos, retain, payload))
            .await
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), BusError> {
        self.ensure_connected()?;

        // Route table and request queue change under one lock, so a concurrent
        // unsubscribe of the last handler cannot reorder against this SUBSCRIBE.
        let mut routes = self.lock_routes();
        // Register first so a state message racing the SUBACK is still routed
        routes
            .entry(topic.to_string())
            .or_insert_with(|| Route {
                qos,
                handlers: Vec::new(),
            })
            .handlers
            .push(handler.clone());

        debug!("Subscribing to {}", topic);
        if let Err(e) = self.client.try_subscribe(topic, qos) {
            remove_handler(&mut routes, topic, &handler);
            return Err(e.into());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, handler: &MessageHandler) -> Result<(), BusError> {
        let mut routes = self.lock_routes();
        if !remove_handler(&mut routes, topic, handler) {
            debug!("{} still has other subscribers, keeping the subscription", topic);
            return Ok(());
        }

        debug!("Unsubscribing from {}", topic);
        self.client.try_unsubscribe(topic).map_err(BusError::from)
    }
}

impl MqttEventLoop {
    /// Run the MQTT event loop. Tracks connection state, re-subscribes active
    /// topics after a reconnect without a persisted session, and hands every
    /// incoming publish to the handlers registered for its topic.
    pub async fn run(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    info!("Connected to MQTT broker");
                    self.connected.send_replace(true);
                    if !ack.session_present {
                        self.resubscribe();
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    self.dispatch(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    self.connected.send_replace(false);
                    error!("MQTT connection error: {}. Reconnecting...", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    fn resubscribe(&self) {
        let active: Vec<(String, QoS)> = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(topic, route)| (topic.clone(), route.qos))
            .collect();

        for (topic, qos) in active {
            // try_subscribe: awaiting here would block the loop that drains the request queue
            if let Err(e) = self.client.try_subscribe(&topic, qos) {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            }
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let handlers: Vec<MessageHandler> = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|route| route.handlers.clone())
            .unwrap_or_default();

        if handlers.is_empty() {
            warn!("Message on {} with no active subscription, dropping", topic);
            return;
        }
        for handler in handlers {
            handler(topic, payload);
        }
    }
}
