//! Protocol-backed [`Broker`].

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use qplace_core::Endpoint;
use qplace_placement::{Broker, BrokerError, BrokerResult};

use crate::link::BrokerLink;
use crate::protocol::RESOURCE_BROKER;

/// Connector service factory that binds a queue to the messaging endpoint.
pub const CONNECTOR_FACTORY: &str =
    "org.apache.activemq.artemis.integration.amqp.AMQPConnectorServiceFactory";

/// A live broker managed through its [`BrokerLink`].
///
/// Every deployed queue also gets a connector service of the same name that
/// dials the messaging endpoint, which makes the queue reachable from the
/// rest of the fabric.
pub struct ManagedBroker {
    link: BrokerLink,
    messaging: Endpoint,
}

impl ManagedBroker {
    pub fn new(link: BrokerLink, messaging: Endpoint) -> Self {
        Self { link, messaging }
    }

    pub fn broker_id(&self) -> &str {
        self.link.broker_id()
    }

    pub fn link(&self) -> &BrokerLink {
        &self.link
    }

    async fn call(&self, operation: &str, args: Value) -> BrokerResult<Value> {
        self.link
            .request(RESOURCE_BROKER, operation, args)
            .await
            .map_err(BrokerError::from)
    }

    fn connector_params(&self, name: &str) -> Value {
        json!({
            "host": self.messaging.host,
            "port": self.messaging.port.to_string(),
            "containerId": name,
            "groupId": name,
            "clientAddress": name,
            "sourceAddress": name,
        })
    }
}

#[async_trait]
impl Broker for ManagedBroker {
    async fn deploy_queue(&self, name: &str) -> BrokerResult<()> {
        self.call(
            "createQueue",
            json!([name, "ANYCAST", name, null, true, -1, false, true]),
        )
        .await?;
        self.call(
            "createConnectorService",
            json!([name, CONNECTOR_FACTORY, self.connector_params(name)]),
        )
        .await?;
        debug!(broker = %self.broker_id(), queue = %name, "queue created and connected");
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        self.call("destroyConnectorService", json!([name])).await?;
        self.call("destroyQueue", json!([name, true])).await?;
        debug!(broker = %self.broker_id(), queue = %name, "queue disconnected and destroyed");
        Ok(())
    }

    async fn queue_count(&self) -> BrokerResult<usize> {
        Ok(self.queue_names().await?.len())
    }

    async fn queue_names(&self) -> BrokerResult<BTreeSet<String>> {
        let reply = self.call("getQueueNames", json!([])).await?;
        Ok(flatten_names(&reply, self.link.reply_address()))
    }
}

/// Flatten a `getQueueNames` reply (an array of name arrays) and drop our own
/// reply address.
fn flatten_names(reply: &Value, reply_address: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut collect = |value: &Value| {
        if let Some(name) = value.as_str()
            && name != reply_address
        {
            names.insert(name.to_string());
        }
    };

    for entry in reply.as_array().into_iter().flatten() {
        match entry.as_array() {
            Some(inner) => inner.iter().for_each(&mut collect),
            None => collect(entry),
        }
    }
    names
}
