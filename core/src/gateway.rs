//! Delivery transport capability.
//!
//! The engine depends only on [`SendGateway`]; concrete transports (a random
//! mock, an HTTP client, scripted test doubles) are swapped in at construction.

use crate::message::Message;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors a gateway may raise while attempting delivery.
///
/// Every variant is treated as a failed attempt; the rendered message is kept
/// as the state's last error for diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Network or connection problem reaching the provider.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered but refused the message.
    #[error("provider rejected message: {0}")]
    Rejected(String),

    /// The provider answered with something we could not interpret.
    #[error("unexpected provider response: {0}")]
    Protocol(String),
}

/// Attempts delivery of a single message.
///
/// # Contract
///
/// - `Ok(true)`: the provider accepted the message
/// - `Ok(false)`: the attempt failed without further detail
/// - `Err(_)`: the attempt failed; the error text becomes the last error
///
/// The engine enforces no timeout of its own; implementations that talk to a
/// network must bound their own calls.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so that the engine can hold an
/// `Arc<dyn SendGateway>`.
pub trait SendGateway: Send + Sync {
    /// Attempt to deliver `message` once.
    fn send<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<bool, SendError>> + Send + 'a>>;
}
