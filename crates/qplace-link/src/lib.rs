//! qplace link: the scheduler's side of a broker connection.
//!
//! # Layers
//!
//! - **`protocol`**: frames, messages and the length-prefixed JSON codec
//! - **`connection`**: handshake and frame routing for one broker stream
//! - **`link`**: `BrokerLink`, management request/reply with retry and timeout
//! - **`management`**: `ManagedBroker`, the `Broker` capability over a link
//! - **`testing`**: `SimulatedBroker`, the broker side for tests

pub mod connection;
pub mod error;
pub mod link;
pub mod management;
pub mod protocol;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use connection::{Connection, HandshakeConfig, PeerInfo};
pub use error::{LinkError, LinkResult};
pub use link::{BrokerLink, LinkConfig};
pub use management::ManagedBroker;
#[cfg(any(test, feature = "test-helpers"))]
pub use testing::{SimulatedBroker, SimulatedBrokerConfig};
