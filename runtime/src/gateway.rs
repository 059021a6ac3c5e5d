//! Concrete [`SendGateway`] implementations.

use reqwest::{Client, StatusCode};
use serde::Serialize;
use sms_retry_core::{Message, SendError, SendGateway};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Gateway that accepts a message with a fixed probability.
///
/// Stands in for a real provider when none is configured.
#[derive(Debug, Clone, Copy)]
pub struct RandomSendGateway {
    success_rate: f64,
}

impl RandomSendGateway {
    /// Create a gateway that succeeds with probability `success_rate`.
    ///
    /// The rate is clamped to `[0, 1]`; NaN counts as 0.
    #[must_use]
    pub fn new(success_rate: f64) -> Self {
        let success_rate = if success_rate.is_nan() {
            0.0
        } else {
            success_rate.clamp(0.0, 1.0)
        };
        Self { success_rate }
    }

    /// Configured success probability.
    #[must_use]
    pub const fn success_rate(&self) -> f64 {
        self.success_rate
    }
}

impl SendGateway for RandomSendGateway {
    fn send<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<bool, SendError>> + Send + 'a>> {
        Box::pin(async move {
            let sent = rand::random::<f64>() < self.success_rate;
            tracing::trace!(message_id = %message.id, sent, "Simulated send");
            Ok(sent)
        })
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    id: &'a str,
    to: &'a str,
    body: &'a str,
}

/// Gateway that POSTs each message as JSON to a provider endpoint.
///
/// `2xx` means sent, `4xx` is a rejection, anything else is an error.
#[derive(Clone)]
pub struct HttpSendGateway {
    client: Client,
    endpoint: String,
}

impl HttpSendGateway {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a gateway posting to `endpoint` with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Transport`] if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, SendError> {
        Self::with_timeout(endpoint, Self::DEFAULT_TIMEOUT)
    }

    /// Create a gateway with an explicit per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Transport`] if the HTTP client cannot be built.
    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Endpoint messages are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, message: &Message) -> Result<bool, SendError> {
        let request = SendRequest {
            id: message.id.as_str(),
            to: &message.destination,
            body: &message.body,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        };

        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(SendError::Transport(detail)),
            status if status.is_client_error() => Err(SendError::Rejected(detail)),
            status if status.is_server_error() => Err(SendError::Transport(detail)),
            _ => Err(SendError::Protocol(detail)),
        }
    }
}

impl SendGateway for HttpSendGateway {
    fn send<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<bool, SendError>> + Send + 'a>> {
        Box::pin(self.post(message))
    }
}

impl std::fmt::Debug for HttpSendGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSendGateway")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use sms_retry_core::MessageId;

    fn message() -> Message {
        Message {
            id: MessageId::new("msg-1"),
            destination: "+15550100".to_string(),
            body: "hello".to_string(),
        }
    }

    #[test]
    fn test_success_rate_is_clamped() {
        assert!((RandomSendGateway::new(1.7).success_rate() - 1.0).abs() < f64::EPSILON);
        assert!(RandomSendGateway::new(-0.2).success_rate().abs() < f64::EPSILON);
        assert!(RandomSendGateway::new(f64::NAN).success_rate().abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_certain_outcomes() {
        let message = message();
        for _ in 0..50 {
            assert_eq!(RandomSendGateway::new(1.0).send(&message).await, Ok(true));
            assert_eq!(RandomSendGateway::new(0.0).send(&message).await, Ok(false));
        }
    }
}
