//! qplace placement: decides which broker hosts which queue.
//!
//! The engine keeps, per group, the desired address set and the live
//! brokers, and converges the two whenever either side changes. It never
//! caches what a broker hosts: every pass asks the brokers directly.
//!
//! # Components
//!
//! - **`broker`**: the `Broker` capability every placement call goes through
//! - **`balance`**: load-balance and scale-unit fan-out passes
//! - **`engine`**: `PlacementEngine`, the mutation API fed by the scheduler
//! - **`fake`**: in-memory `FakeBroker` for deterministic tests
//!
//! The engine takes `&mut self` for every mutation. Callers are expected to
//! own it from a single task so that no two passes interleave.

pub mod balance;
pub mod broker;
pub mod engine;
pub mod error;
#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;

pub use balance::{Assignment, balance_by_queue_count, fan_out};
pub use broker::{Broker, BrokerError, BrokerHandle, BrokerResult};
pub use engine::PlacementEngine;
pub use error::{PlacementError, PlacementResult};
#[cfg(any(test, feature = "test-helpers"))]
pub use fake::{BrokerCall, FakeBroker};
