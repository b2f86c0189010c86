//! Placement error types.

use thiserror::Error;

use crate::broker::BrokerError;

/// Errors that abort a placement pass or a registration.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// A broker was registered twice without an observed removal.
    #[error("broker {broker_id} already registered in group {group_id}")]
    DuplicateRegistration { group_id: String, broker_id: String },

    #[error("broker {broker_id} call failed: {source}")]
    Broker {
        broker_id: String,
        #[source]
        source: BrokerError,
    },
}

impl PlacementError {
    pub(crate) fn broker(broker_id: &str, source: BrokerError) -> Self {
        Self::Broker {
            broker_id: broker_id.to_string(),
            source,
        }
    }

    /// Whether the pass was cut short by a broker that did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PlacementError::Broker {
                source: BrokerError::Timeout(_),
                ..
            }
        )
    }
}

pub type PlacementResult<T> = Result<T, PlacementError>;
