//! Webhook HTTP server.
//!
//! `POST /callback` receives LINE webhook deliveries, `GET /health` answers
//! load balancer probes.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bot::Relay;
use crate::config::ServerConfig;
use crate::platform::line::{self, WebhookBody};
use crate::platform::ReplyReceipt;

#[derive(Clone)]
pub struct AppState {
    relay: Arc<Relay>,
    channel_secret: Arc<str>,
}

impl AppState {
    pub fn new(relay: Relay, channel_secret: &str) -> Self {
        Self {
            relay: Arc::new(relay),
            channel_secret: Arc::from(channel_secret),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing x-line-signature header")]
    MissingSignature,

    #[error("signature validation failed")]
    InvalidSignature,

    #[error("malformed webhook body: {0}")]
    MalformedBody(#[from] serde_json::Error),

    #[error("event handling failed: {0:#}")]
    Delivery(anyhow::Error),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match self {
            WebhookError::MissingSignature | WebhookError::InvalidSignature => {
                (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
            }
            WebhookError::MalformedBody(_) => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            // The platform gets no detail about what went wrong
            WebhookError::Delivery(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/callback", post(callback))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Vec<Option<ReplyReceipt>>>, WebhookError> {
    let span = info_span!("webhook", request_id = %Uuid::new_v4());
    process_webhook(&state, &headers, &body)
        .instrument(span)
        .await
        .map(Json)
}

async fn process_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Vec<Option<ReplyReceipt>>, WebhookError> {
    let signature = match headers
        .get(line::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(s) => s,
        None => {
            warn!("Rejected webhook without signature");
            return Err(WebhookError::MissingSignature);
        }
    };

    if !line::verify_signature(body, signature, &state.channel_secret) {
        warn!("Rejected webhook with invalid signature");
        return Err(WebhookError::InvalidSignature);
    }

    let payload = WebhookBody::parse(body).map_err(|e| {
        warn!("Rejected malformed webhook body: {}", e);
        WebhookError::MalformedBody(e)
    })?;

    debug!(
        destination = %payload.destination,
        events = payload.events.len(),
        "Webhook received"
    );

    state.relay.handle_batch(&payload.events).await.map_err(|e| {
        error!("Webhook batch failed: {:#}", e);
        WebhookError::Delivery(e)
    })
}

/// Bind the listener and serve until Ctrl-C.
pub async fn run(config: &ServerConfig, state: AppState) -> Result<()> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("Server running on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplyConfig;
    use crate::testing::{FakeGenerator, FakeSender};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const SECRET: &str = "channel-secret";

    fn app(generator: &Arc<FakeGenerator>, sender: &Arc<FakeSender>) -> Router {
        let relay = Relay::new(
            generator.clone(),
            sender.clone(),
            ReplyConfig::default(),
            16,
        );
        router(AppState::new(relay, SECRET))
    }

    fn signed_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/callback")
            .header("content-type", "application/json")
            .header(line::SIGNATURE_HEADER, line::sign(body.as_bytes(), SECRET))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    fn text_payload(token: &str, text: &str) -> String {
        serde_json::json!({
            "destination": "U0",
            "events": [{
                "type": "message",
                "replyToken": token,
                "message": { "type": "text", "id": "1", "text": text }
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_text_event_returns_receipts() {
        let generator = Arc::new(FakeGenerator::replying("Hi there!"));
        let sender = Arc::new(FakeSender::new());

        let response = app(&generator, &sender)
            .oneshot(signed_request(&text_payload("r1", "Hello")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{ "sentMessages": [{ "id": "sent-r1" }] }])
        );
        assert_eq!(sender.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_sticker_event_returns_null() {
        let generator = Arc::new(FakeGenerator::replying("unused"));
        let sender = Arc::new(FakeSender::new());
        let body = serde_json::json!({
            "events": [{
                "type": "message",
                "replyToken": "r1",
                "message": { "type": "sticker", "id": "1", "packageId": "1", "stickerId": "1" }
            }]
        })
        .to_string();

        let response = app(&generator, &sender)
            .oneshot(signed_request(&body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_bytes(response).await[..], b"[null]");
        assert!(generator.prompts().is_empty());
        assert!(sender.calls().is_empty());
    }

    #[tokio::test]
    async fn test_generation_failure_still_succeeds() {
        let generator = Arc::new(FakeGenerator::failing("quota exceeded"));
        let sender = Arc::new(FakeSender::new());

        let response = app(&generator, &sender)
            .oneshot(signed_request(&text_payload("r1", "Hello")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(sender.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_returns_500_with_empty_body() {
        let generator = Arc::new(FakeGenerator::replying("Hi"));
        let sender = Arc::new(FakeSender::failing_for("r1"));

        let response = app(&generator, &sender)
            .oneshot(signed_request(&text_payload("r1", "Hello")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_signature_is_unauthorized() {
        let generator = Arc::new(FakeGenerator::replying("Hi"));
        let sender = Arc::new(FakeSender::new());
        let request = Request::builder()
            .method("POST")
            .uri("/callback")
            .body(Body::from(text_payload("r1", "Hello")))
            .unwrap();

        let response = app(&generator, &sender).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(generator.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_signature_processes_nothing() {
        let generator = Arc::new(FakeGenerator::replying("Hi"));
        let sender = Arc::new(FakeSender::new());
        let body = text_payload("r1", "Hello");
        let request = Request::builder()
            .method("POST")
            .uri("/callback")
            .header(line::SIGNATURE_HEADER, line::sign(body.as_bytes(), "wrong"))
            .body(Body::from(body))
            .unwrap();

        let response = app(&generator, &sender).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(generator.prompts().is_empty());
        assert!(sender.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let generator = Arc::new(FakeGenerator::replying("Hi"));
        let sender = Arc::new(FakeSender::new());

        let response = app(&generator, &sender)
            .oneshot(signed_request(r#"{"destination":"U0"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_verification_request_with_no_events() {
        let generator = Arc::new(FakeGenerator::replying("Hi"));
        let sender = Arc::new(FakeSender::new());

        let response = app(&generator, &sender)
            .oneshot(signed_request(r#"{"destination":"U0","events":[]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_bytes(response).await[..], b"[]");
    }

    #[tokio::test]
    async fn test_health() {
        let generator = Arc::new(FakeGenerator::replying("Hi"));
        let sender = Arc::new(FakeSender::new());
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app(&generator, &sender).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
