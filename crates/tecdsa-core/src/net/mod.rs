//! Network provider interface consumed by the session bridge

use crate::{ProtocolMessage, Result};
use std::sync::Arc;

pub use ::async_trait::async_trait;

/// Callback invoked for every inbound protocol message
pub type Handler = Arc<dyn Fn(ProtocolMessage) -> Result<()> + Send + Sync>;

/// Per-session transport between group members.
///
/// The provider owns peer discovery and transport. For a message with no
/// explicit recipients it fans out to every member except the sender.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Install the session's receive handler. A provider accepts one handler
    /// at a time.
    fn register_receive_handler(&self, handler: Handler) -> Result<()>;

    /// Remove the handler; inbound messages are discarded from then on
    fn unregister_receive_handler(&self);

    /// Transmit a message to its recipients
    async fn send(&self, message: ProtocolMessage) -> Result<()>;
}

/// In-process network for tests and local nodes
pub mod local;

pub use local::{LocalChannel, LocalNetwork};
