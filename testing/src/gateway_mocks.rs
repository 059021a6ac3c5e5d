//! Scripted delivery gateway.
//!
//! Outcomes are scripted per message identifier and consumed in order; once a
//! script runs out, the gateway falls back to its default outcome. Every call
//! is logged so tests can count attempts per message.

use sms_retry_core::gateway::{SendError, SendGateway};
use sms_retry_core::message::{Message, MessageId};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

/// Outcome of one scripted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Gateway accepts the message (`Ok(true)`)
    Accept,
    /// Gateway refuses without detail (`Ok(false)`)
    Reject,
    /// Gateway raises a transport error with this text
    Fail(String),
}

impl ScriptedOutcome {
    fn into_result(self) -> Result<bool, SendError> {
        match self {
            Self::Accept => Ok(true),
            Self::Reject => Ok(false),
            Self::Fail(reason) => Err(SendError::Transport(reason)),
        }
    }
}

#[derive(Debug)]
struct Script {
    default: ScriptedOutcome,
    per_message: HashMap<MessageId, VecDeque<ScriptedOutcome>>,
    calls: Vec<Message>,
}

/// Gateway with scripted outcomes and a call log.
///
/// Clones share the script and the log.
///
/// # Example
///
/// ```
/// use sms_retry_testing::{ScriptedGateway, ScriptedOutcome};
/// use sms_retry_core::{Message, MessageId, SendGateway};
///
/// # async fn example() {
/// let gateway = ScriptedGateway::rejecting();
/// gateway.script("msg-1", [ScriptedOutcome::Reject, ScriptedOutcome::Accept]);
///
/// let message = Message {
///     id: MessageId::new("msg-1"),
///     destination: "+15550100".into(),
///     body: "hi".into(),
/// };
/// assert_eq!(gateway.send(&message).await, Ok(false));
/// assert_eq!(gateway.send(&message).await, Ok(true));
/// assert_eq!(gateway.send(&message).await, Ok(false)); // default
/// assert_eq!(gateway.calls_for("msg-1"), 3);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ScriptedGateway {
    script: Arc<Mutex<Script>>,
}

impl ScriptedGateway {
    /// Create a gateway whose unscripted sends yield `default`
    #[must_use]
    pub fn new(default: ScriptedOutcome) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                default,
                per_message: HashMap::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Gateway that accepts everything unless scripted otherwise
    #[must_use]
    pub fn accepting() -> Self {
        Self::new(ScriptedOutcome::Accept)
    }

    /// Gateway that rejects everything unless scripted otherwise
    #[must_use]
    pub fn rejecting() -> Self {
        Self::new(ScriptedOutcome::Reject)
    }

    /// Queue outcomes for the next sends of `id`
    pub fn script(
        &self,
        id: impl Into<MessageId>,
        outcomes: impl IntoIterator<Item = ScriptedOutcome>,
    ) {
        self.lock()
            .per_message
            .entry(id.into())
            .or_default()
            .extend(outcomes);
    }

    /// Change the fallback outcome
    pub fn set_default(&self, outcome: ScriptedOutcome) {
        self.lock().default = outcome;
    }

    /// Number of sends for `id`
    #[must_use]
    pub fn calls_for(&self, id: impl Into<MessageId>) -> usize {
        let id = id.into();
        self.lock().calls.iter().filter(|m| m.id == id).count()
    }

    /// Total number of sends
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    /// Every message sent, in call order
    #[must_use]
    pub fn calls(&self) -> Vec<Message> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SendGateway for ScriptedGateway {
    fn send<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<bool, SendError>> + Send + 'a>> {
        let outcome = {
            let mut script = self.lock();
            script.calls.push(message.clone());
            let default = script.default.clone();
            script
                .per_message
                .get_mut(&message.id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(default)
        };
        Box::pin(async move { outcome.into_result() })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    fn message(id: &str) -> Message {
        Message {
            id: MessageId::new(id),
            destination: "+15550100".to_string(),
            body: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_scripts_are_per_message() {
        let gateway = ScriptedGateway::accepting();
        gateway.script("a", [ScriptedOutcome::Fail("timeout".into())]);

        assert_eq!(
            gateway.send(&message("a")).await,
            Err(SendError::Transport("timeout".into()))
        );
        assert_eq!(gateway.send(&message("b")).await, Ok(true));
        assert_eq!(gateway.send(&message("a")).await, Ok(true));

        assert_eq!(gateway.calls_for("a"), 2);
        assert_eq!(gateway.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_default_can_change() {
        let gateway = ScriptedGateway::rejecting();
        assert_eq!(gateway.send(&message("a")).await, Ok(false));

        gateway.set_default(ScriptedOutcome::Accept);
        assert_eq!(gateway.send(&message("a")).await, Ok(true));
    }
}
