//! LINE Messaging API: webhook signature check, webhook payload types and the
//! reply client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::LineConfig;
use crate::platform::{OutgoingMessage, ReplyReceipt, ReplySender};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-line-signature";

/// LINE rejects text messages longer than this
const MAX_TEXT_LEN: usize = 5000;

/// LINE accepts at most this many messages in one reply
const MAX_MESSAGES_PER_REPLY: usize = 5;

/// Verify the `x-line-signature` header against the raw request body.
///
/// The header carries base64(HMAC-SHA256(channel secret, body)).
pub fn verify_signature(body: &[u8], signature: &str, channel_secret: &str) -> bool {
    let expected = match STANDARD.decode(signature.trim()) {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!("signature header is not valid base64");
            return false;
        }
    };

    let mut mac = match HmacSha256::new_from_slice(channel_secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            warn!("failed to create HMAC");
            return false;
        }
    };

    mac.update(body);
    // Constant-time comparison
    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature LINE would send for `body`.
#[cfg(test)]
pub fn sign(body: &[u8], channel_secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(channel_secret.as_bytes()).unwrap();
    mac.update(body);
    STANDARD.encode(mac.finalize().into_bytes())
}

/// The body LINE posts to the webhook endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookBody {
    #[serde(default)]
    pub destination: String,
    pub events: Vec<WebhookEvent>,
}

impl WebhookBody {
    pub fn parse(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub reply_token: Option<String>,
    pub message: Option<EventMessage>,
    pub webhook_event_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventMessage {
    Text { text: String },
    /// Stickers, images, audio, locations and anything LINE adds later
    #[serde(other)]
    Other,
}

impl WebhookEvent {
    /// The message text, if this is a text message event.
    pub fn text(&self) -> Option<&str> {
        if self.kind != "message" {
            return None;
        }
        match &self.message {
            Some(EventMessage::Text { text }) => Some(text),
            _ => None,
        }
    }
}

/// Byte offset of the first character that takes `text` past `max_units` UTF-16 code units
fn utf16_boundary(text: &str, max_units: usize) -> usize {
    let mut units = 0;
    for (i, c) in text.char_indices() {
        units += c.len_utf16();
        if units > max_units {
            return i;
        }
    }
    text.len()
}

/// Split long text at newline or space boundaries into chunks of at most
/// `max_len` characters, counted in UTF-16 code units as LINE counts them
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.encode_utf16().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let mut end = utf16_boundary(rest, max_len);
        if end == 0 {
            // A single character wider than the limit still has to go somewhere
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let actual_end = if end < rest.len() {
            rest[..end]
                .rfind('\n')
                .or_else(|| rest[..end].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(rest[..actual_end].to_string());
        rest = &rest[actual_end..];
    }

    chunks
}

/// Build the text messages for one reply, dropping whatever exceeds the per-reply limit.
pub fn text_messages(text: &str) -> Vec<OutgoingMessage> {
    let chunks = split_message(text, MAX_TEXT_LEN);
    if chunks.len() > MAX_MESSAGES_PER_REPLY {
        warn!(
            chunks = chunks.len(),
            "reply exceeds {} messages, truncating", MAX_MESSAGES_PER_REPLY
        );
    }
    chunks
        .into_iter()
        .take(MAX_MESSAGES_PER_REPLY)
        .map(OutgoingMessage::text)
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyRequest<'a> {
    reply_token: &'a str,
    messages: Vec<OutgoingMessage>,
}

pub struct LineClient {
    client: reqwest::Client,
    config: LineConfig,
}

impl LineClient {
    pub fn new(config: LineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ReplySender for LineClient {
    async fn reply(
        &self,
        reply_token: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<ReplyReceipt> {
        let url = format!(
            "{}/v2/bot/message/reply",
            self.config.api_base_url.trim_end_matches('/')
        );

        debug!(messages = messages.len(), "Sending LINE reply");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.channel_access_token)
            .json(&ReplyRequest {
                reply_token,
                messages,
            })
            .send()
            .await
            .context("Failed to send reply to LINE")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("LINE reply API error ({}): {}", status, error_body);
        }

        response
            .json()
            .await
            .context("Failed to parse LINE reply response")
    }
}
