//! Scheduler error types.

use std::io;

use thiserror::Error;

use qplace_link::LinkError;
use qplace_placement::PlacementError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Link(#[from] LinkError),

    /// The broker's `open` carried no group id.
    #[error("broker {broker_id} did not announce a group")]
    MissingGroup { broker_id: String },

    #[error("TLS handshake failed: {0}")]
    Tls(io::Error),

    #[error("scheduler worker stopped")]
    WorkerStopped,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SchedulerError {
    pub fn is_duplicate_registration(&self) -> bool {
        matches!(
            self,
            SchedulerError::Placement(PlacementError::DuplicateRegistration { .. })
        )
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
