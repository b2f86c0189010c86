use std::io;
use std::time::Duration;

use thiserror::Error;

use qplace_placement::BrokerError;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("peer did not open the connection within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("attach to {address} timed out")]
    AttachTimeout { address: String },

    #[error("attach to {address} refused: {reason}")]
    AttachRefused { address: String, reason: String },

    /// Every attempt to open the management links failed.
    #[error("link establishment failed after {attempts} attempts: {last_error}")]
    EstablishmentFailed {
        attempts: u32,
        #[source]
        last_error: Box<LinkError>,
    },

    #[error("{operation} got no reply within {timeout:?}")]
    RequestTimeout { operation: String, timeout: Duration },

    #[error("{operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    #[error("connection closed")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type LinkResult<T> = Result<T, LinkError>;

impl From<LinkError> for BrokerError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::RequestTimeout { operation, .. } => BrokerError::Timeout(operation),
            LinkError::OperationFailed { operation, reason } => {
                BrokerError::OperationFailed { operation, reason }
            }
            LinkError::Disconnected | LinkError::Io(_) => BrokerError::Disconnected,
            other => BrokerError::Protocol(other.to_string()),
        }
    }
}
