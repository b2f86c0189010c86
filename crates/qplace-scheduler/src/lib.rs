//! qplace scheduler: funnels broker lifecycle and desired-state events into
//! the placement engine.
//!
//! # Architecture
//!
//! ```text
//! DesiredStateClient ──┐
//!                      ├──> SchedulerHandle ──> Scheduler worker ──> PlacementEngine
//! SchedulerServer ─────┘        (unbounded queue, one event at a time)
//!   └── per connection: TLS ─> open ─> BrokerLink ─> ManagedBroker
//! ```

pub mod error;
pub mod server;
pub mod tls;
pub mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use server::{SchedulerServer, ServerConfig};
pub use worker::{GroupSnapshot, Scheduler, SchedulerEvent, SchedulerHandle};
