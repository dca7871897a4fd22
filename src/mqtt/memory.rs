//! In-process [`Bus`] for tests: records every call, can be scripted to fail
//! or to answer get-requests. Handlers on a topic are released one at a time,
//! like the `rumqttc` adapter does, and a released handler is kept aside so a
//! late delivery can be replayed against it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;

use super::{Bus, MessageHandler};
use crate::error::BusError;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect,
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        topic: String,
        qos: QoS,
    },
    Unsubscribe {
        topic: String,
    },
}

#[derive(Clone)]
struct Echo {
    state_topic: String,
    payload: Vec<u8>,
    delay: Duration,
}

#[derive(Default)]
struct State {
    connected: bool,
    connect_succeeds: bool,
    fail_subscribe: bool,
    fail_publish: bool,
    fail_unsubscribe: bool,
    stall_subscribe: bool,
    calls: Vec<Call>,
    handlers: HashMap<String, Vec<MessageHandler>>,
    retired: HashMap<String, Vec<MessageHandler>>,
    echoes: HashMap<String, Echo>,
}

#[derive(Default)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
}

impl MemoryBus {
    pub fn connected() -> Arc<Self> {
        let bus = Self::default();
        bus.with(|s| {
            s.connected = true;
            s.connect_succeeds = true;
        });
        Arc::new(bus)
    }

    pub fn disconnected(connect_succeeds: bool) -> Arc<Self> {
        let bus = Self::default();
        bus.with(|s| s.connect_succeeds = connect_succeeds);
        Arc::new(bus)
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn fail_subscribe(&self) {
        self.with(|s| s.fail_subscribe = true);
    }

    pub fn fail_publish(&self) {
        self.with(|s| s.fail_publish = true);
    }

    pub fn fail_unsubscribe(&self) {
        self.with(|s| s.fail_unsubscribe = true);
    }

    /// Register subscriptions but never complete the call, as with a SUBACK
    /// that does not arrive.
    pub fn stall_subscribe(&self) {
        self.with(|s| s.stall_subscribe = true);
    }

    /// Answer every publish on `request_topic` with `payload` on `state_topic`
    /// after `delay`, from a separate task.
    pub fn echo(&self, request_topic: &str, state_topic: &str, payload: &[u8], delay: Duration) {
        let echo = Echo {
            state_topic: state_topic.to_string(),
            payload: payload.to_vec(),
            delay,
        };
        self.with(|s| s.echoes.insert(request_topic.to_string(), echo));
    }

    /// Deliver to the handlers currently subscribed on `topic`.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        deliver_to(&self.state, topic, payload);
    }

    /// Deliver to handlers that were already unsubscribed from `topic`,
    /// as a broker would when a message was in flight during teardown.
    pub fn deliver_late(&self, topic: &str, payload: &[u8]) {
        let handlers = self.with(|s| s.retired.get(topic).cloned().unwrap_or_default());
        for handler in handlers {
            handler(topic, payload);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.topics(|c| match c {
            Call::Publish { topic, .. } => Some(topic.clone()),
            _ => None,
        })
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.topics(|c| match c {
            Call::Subscribe { topic, .. } => Some(topic.clone()),
            _ => None,
        })
    }

    pub fn unsubscribed_topics(&self) -> Vec<String> {
        self.topics(|c| match c {
            Call::Unsubscribe { topic } => Some(topic.clone()),
            _ => None,
        })
    }

    pub fn active_subscriptions(&self) -> usize {
        self.with(|s| s.handlers.values().map(Vec::len).sum())
    }

    fn topics(&self, pick: impl Fn(&Call) -> Option<String>) -> Vec<String> {
        self.with(|s| s.calls.iter().filter_map(pick).collect())
    }
}

fn deliver_to(state: &Mutex<State>, topic: &str, payload: &[u8]) {
    let handlers = state
        .lock()
        .unwrap()
        .handlers
        .get(topic)
        .cloned()
        .unwrap_or_default();
    for handler in handlers {
        handler(topic, payload);
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn connect(&self) -> Result<(), BusError> {
        self.with(|s| {
            s.calls.push(Call::Connect);
            if s.connect_succeeds {
                s.connected = true;
                Ok(())
            } else {
                Err(BusError::NotConnected)
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.with(|s| s.connected)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BusError> {
        let echo = self.with(|s| {
            s.calls.push(Call::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
            if s.fail_publish {
                return Err(BusError::Rejected("scripted publish failure".into()));
            }
            Ok(s.echoes.get(topic).cloned())
        })?;

        if let Some(echo) = echo {
            let state = self.state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(echo.delay).await;
                deliver_to(&state, &echo.state_topic, &echo.payload);
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), BusError> {
        let stall = self.with(|s| {
            s.calls.push(Call::Subscribe {
                topic: topic.to_string(),
                qos,
            });
            if s.fail_subscribe {
                return Err(BusError::Rejected("scripted subscribe failure".into()));
            }
            s.handlers
                .entry(topic.to_string())
                .or_default()
                .push(handler);
            Ok(s.stall_subscribe)
        })?;

        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, handler: &MessageHandler) -> Result<(), BusError> {
        self.with(|s| {
            s.calls.push(Call::Unsubscribe {
                topic: topic.to_string(),
            });
            if let Some(handlers) = s.handlers.get_mut(topic) {
                handlers.retain(|h| !Arc::ptr_eq(h, handler));
                if handlers.is_empty() {
                    s.handlers.remove(topic);
                }
            }
            s.retired
                .entry(topic.to_string())
                .or_default()
                .push(handler.clone());
            if s.fail_unsubscribe {
                return Err(BusError::Rejected("scripted unsubscribe failure".into()));
            }
            Ok(())
        })
    }
}
