//! Wire protocol spoken on a broker connection.
//!
//! A connection carries a sequence of [`Frame`]s:
//! 1. `open` in both directions identifies the peers
//! 2. `attach` / `attached` set up links by handle
//! 3. `transfer` carries one [`Message`] on a link
//! 4. `detach` and `close` tear links and the connection down

pub mod codec;
pub mod frame;

pub use codec::{FrameCodec, MAX_FRAME_LENGTH};
pub use frame::{Frame, Handle, Message, Role};

/// Well-known address of the broker management endpoint.
pub const MANAGEMENT_ADDRESS: &str = "activemq.management";

/// Resource name addressed by every management call.
pub const RESOURCE_BROKER: &str = "broker";

pub const PROP_RESOURCE_NAME: &str = "_AMQ_ResourceName";
pub const PROP_OPERATION_NAME: &str = "_AMQ_OperationName";
pub const PROP_OPERATION_SUCCEEDED: &str = "_AMQ_OperationSucceeded";
