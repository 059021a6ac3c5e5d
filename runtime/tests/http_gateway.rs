//! HTTP gateway against a mock provider.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use sms_retry_core::{Message, MessageId, SendError, SendGateway};
use sms_retry_runtime::HttpSendGateway;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn message() -> Message {
    Message {
        id: MessageId::new("msg-1"),
        destination: "+15550100".to_string(),
        body: "hello".to_string(),
    }
}

async fn provider(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .respond_with(ResponseTemplate::new(status).set_body_string("provider says no"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_posts_message_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .and(body_json(serde_json::json!({
            "id": "msg-1",
            "to": "+15550100",
            "body": "hello",
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = HttpSendGateway::new(format!("{}/send", server.uri())).unwrap();
    assert_eq!(gateway.send(&message()).await, Ok(true));
}

#[tokio::test]
async fn test_client_error_is_rejection() {
    let server = provider(400).await;
    let gateway = HttpSendGateway::new(format!("{}/send", server.uri())).unwrap();

    let result = gateway.send(&message()).await;
    assert!(matches!(result, Err(SendError::Rejected(ref detail)) if detail.contains("provider says no")));
}

#[tokio::test]
async fn test_server_error_is_transport_failure() {
    let server = provider(503).await;
    let gateway = HttpSendGateway::new(format!("{}/send", server.uri())).unwrap();

    assert!(matches!(gateway.send(&message()).await, Err(SendError::Transport(_))));
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let gateway =
        HttpSendGateway::with_timeout(format!("{}/send", server.uri()), Duration::from_millis(100))
            .unwrap();

    assert!(matches!(gateway.send(&message()).await, Err(SendError::Transport(_))));
}
