//! qplace desired-state feed.
//!
//! Subscribes to the configuration service's address stream and turns each
//! snapshot into a [`DesiredState`](qplace_core::DesiredState): pooled
//! queues grouped by plan, every other queue grouped by its own name. The
//! connection is re-established forever after a fixed delay.

pub mod client;
pub mod decode;

pub use client::{DesiredStateCallback, DesiredStateClient, FeedConfig};
pub use decode::{AddressRecord, decode_snapshot, group_addresses};
