use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;

use crate::devices::{Registry, TopicScheme};
use crate::dispatcher::CommandDispatcher;
use crate::error::GatewayError;
use crate::mqtt::Bus;
use crate::query::StatusQuery;

/// The command and query paths over one shared bus and device table.
pub struct Gateway {
    bus: Arc<dyn Bus>,
    registry: Arc<Registry>,
    dispatcher: CommandDispatcher,
    query: StatusQuery,
}

impl Gateway {
    pub fn new(
        bus: Arc<dyn Bus>,
        registry: Registry,
        topics: TopicScheme,
        qos: QoS,
        query_timeout: Duration,
    ) -> Self {
        let registry = Arc::new(registry);
        Self {
            dispatcher: CommandDispatcher::new(bus.clone(), registry.clone(), topics.clone(), qos),
            query: StatusQuery::new(bus.clone(), registry.clone(), topics, qos, query_timeout),
            bus,
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_connected()
    }

    pub async fn issue_command(&self, device_id: &str, action: &str) -> Result<(), GatewayError> {
        self.dispatcher.issue_command(device_id, action).await
    }

    pub async fn query_status(&self, device_id: &str) -> Result<Vec<u8>, GatewayError> {
        self.query.query_status(device_id).await
    }
}
