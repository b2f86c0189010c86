//! The broker capability surface used by placement.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Errors returned by a single broker call.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// No reply within the request budget.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The broker answered but refused the operation.
    #[error("operation {operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    #[error("broker disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Queue management on one live broker.
///
/// Implementations talk to the broker on every call; queue contents are
/// never cached on this side.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the queue and bind it to the messaging fabric.
    async fn deploy_queue(&self, name: &str) -> BrokerResult<()>;

    /// Unbind and destroy the queue.
    async fn delete_queue(&self, name: &str) -> BrokerResult<()>;

    async fn queue_count(&self) -> BrokerResult<usize>;

    async fn queue_names(&self) -> BrokerResult<BTreeSet<String>>;
}

/// Shared handle to a registered broker.
pub type BrokerHandle = Arc<dyn Broker>;
