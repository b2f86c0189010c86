//! Management request/reply over a broker connection.
//!
//! A [`BrokerLink`] holds two links on one [`Connection`]: a sender attached
//! to the broker's management address and a receiver on an address the
//! broker assigns. Requests carry that address as `reply_to` and a fresh
//! message id; the broker answers with the id as correlation id.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use qplace_core::config::LinkSettings;

use crate::connection::Connection;
use crate::error::{LinkError, LinkResult};
use crate::protocol::{
    Handle, MANAGEMENT_ADDRESS, Message, PROP_OPERATION_NAME, PROP_OPERATION_SUCCEEDED,
    PROP_RESOURCE_NAME,
};

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How long a management call waits for its reply.
    pub request_timeout: Duration,
    pub attach_timeout: Duration,
    /// Total attempts at opening both links, including the first.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::from(&LinkSettings::default())
    }
}

impl From<&LinkSettings> for LinkConfig {
    fn from(settings: &LinkSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout(),
            attach_timeout: settings.attach_timeout(),
            max_attempts: settings.max_attempts,
            retry_backoff: settings.retry_backoff(),
        }
    }
}

pub struct BrokerLink {
    connection: Arc<Connection>,
    /// Sending link attached to the management address.
    sender: Handle,
    /// Dynamic receiving link replies arrive on.
    receiver: Handle,
    /// Address the broker assigned to `receiver`.
    reply_address: String,
    /// Locked for the whole of a request, so at most one is outstanding.
    replies: Mutex<mpsc::UnboundedReceiver<Message>>,
    /// Timeouts applied to every request on this link.
    config: LinkConfig,
}

impl BrokerLink {
    /// Open the management sender and the dynamic reply receiver.
    ///
    /// A failed attempt detaches whatever it opened and is retried after
    /// `retry_backoff`, up to `max_attempts` in total. A closed connection
    /// ends the retries at once.
    pub async fn establish(connection: Arc<Connection>, config: LinkConfig) -> LinkResult<Self> {
        let broker = connection.peer().container_id.clone();
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match Self::open_links(&connection, &config).await {
                Ok((sender, receiver, reply_address, replies)) => {
                    info!(%broker, %reply_address, attempt, "management link established");
                    return Ok(Self {
                        connection,
                        sender,
                        receiver,
                        reply_address,
                        replies: Mutex::new(replies),
                        config,
                    });
                }
                Err(e) => e,
            };

            if connection.is_closed() {
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(%broker, attempts = attempt, error = %err, "giving up on management link");
                return Err(LinkError::EstablishmentFailed {
                    attempts: attempt,
                    last_error: Box::new(err),
                });
            }
            warn!(%broker, attempt, error = %err, "management link attach failed, retrying");
            sleep(config.retry_backoff).await;
        }
    }

    async fn open_links(
        connection: &Connection,
        config: &LinkConfig,
    ) -> LinkResult<(Handle, Handle, String, mpsc::UnboundedReceiver<Message>)> {
        let sender = connection
            .attach_sender(MANAGEMENT_ADDRESS, config.attach_timeout)
            .await?;
        match connection.attach_dynamic_receiver(config.attach_timeout).await {
            Ok((receiver, address, replies)) => Ok((sender, receiver, address, replies)),
            Err(e) => {
                let _ = connection.detach(sender).await;
                Err(e)
            }
        }
    }

    /// Issue one management call and wait for its reply.
    ///
    /// `args` is sent as the JSON body, normally an array of positional
    /// arguments. The decoded JSON reply body is returned; an empty body
    /// decodes to `Value::Null`.
    pub async fn request(&self, resource: &str, operation: &str, args: Value) -> LinkResult<Value> {
        let mut replies = self.replies.lock().await;

        let message_id = Uuid::new_v4().to_string();
        let message = Message {
            message_id: Some(message_id.clone()),
            to: Some(MANAGEMENT_ADDRESS.to_string()),
            reply_to: Some(self.reply_address.clone()),
            body: Some(args.to_string()),
            ..Message::default()
        }
        .with_property(PROP_RESOURCE_NAME, resource)
        .with_property(PROP_OPERATION_NAME, operation);

        debug!(broker = %self.broker_id(), %operation, %message_id, "management request");
        self.connection.send_transfer(self.sender, message).await?;

        let deadline = Instant::now() + self.config.request_timeout;
        loop {
            let reply = match timeout_at(deadline, replies.recv()).await {
                Ok(Some(reply)) => reply,
                Ok(None) => return Err(LinkError::Disconnected),
                Err(_) => {
                    return Err(LinkError::RequestTimeout {
                        operation: operation.to_string(),
                        timeout: self.config.request_timeout,
                    });
                }
            };

            if reply.correlation_id.as_deref() != Some(message_id.as_str()) {
                warn!(
                    broker = %self.broker_id(),
                    %operation,
                    correlation_id = ?reply.correlation_id,
                    "discarding reply to another request"
                );
                continue;
            }
            return decode_reply(operation, reply);
        }
    }

    /// Detach both links. The connection itself stays open.
    pub async fn close(&self) {
        for handle in [self.sender, self.receiver] {
            if let Err(e) = self.connection.detach(handle).await {
                debug!(broker = %self.broker_id(), handle, error = %e, "detach failed");
            }
        }
    }

    /// The broker-assigned address replies arrive on.
    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    pub fn broker_id(&self) -> &str {
        &self.connection.peer().container_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

fn decode_reply(operation: &str, reply: Message) -> LinkResult<Value> {
    let succeeded = reply.property_bool(PROP_OPERATION_SUCCEEDED).unwrap_or(true);
    let body = reply.body.unwrap_or_default();

    if !succeeded {
        return Err(LinkError::OperationFailed {
            operation: operation.to_string(),
            reason: body,
        });
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body)
        .map_err(|e| LinkError::Protocol(format!("malformed {operation} reply: {e}")))
}
