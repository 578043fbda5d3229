use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::ReplyConfig;
use crate::llm::Generator;
use crate::platform::line::{self, WebhookEvent};
use crate::platform::{ReplyReceipt, ReplySender};

/// Longest error detail echoed back to the user
const MAX_ERROR_DETAIL_CHARS: usize = 300;

fn truncate_detail(detail: &str) -> String {
    match detail.char_indices().nth(MAX_ERROR_DETAIL_CHARS) {
        Some((end, _)) => format!("{}…", &detail[..end]),
        None => detail.to_string(),
    }
}

/// Relays text messages to the generator and the generated text back to the sender.
pub struct Relay {
    generator: Arc<dyn Generator>,
    sender: Arc<dyn ReplySender>,
    reply: ReplyConfig,
    max_concurrent_events: usize,
}

impl Relay {
    pub fn new(
        generator: Arc<dyn Generator>,
        sender: Arc<dyn ReplySender>,
        reply: ReplyConfig,
        max_concurrent_events: usize,
    ) -> Self {
        Self {
            generator,
            sender,
            reply,
            max_concurrent_events: max_concurrent_events.max(1),
        }
    }

    /// Handle one webhook event.
    ///
    /// Returns `None` for events that are not text messages. Generation errors
    /// become a fallback reply; only a failed delivery is returned as `Err`.
    pub async fn handle_event(&self, event: &WebhookEvent) -> Result<Option<ReplyReceipt>> {
        let text = match event.text() {
            Some(t) => t,
            None => {
                debug!(kind = %event.kind, "Ignoring non-text event");
                return Ok(None);
            }
        };

        let reply_token = match event.reply_token.as_deref() {
            Some(token) => token,
            None => {
                warn!(
                    event_id = event.webhook_event_id.as_deref().unwrap_or("-"),
                    "Text message without reply token, skipping"
                );
                return Ok(None);
            }
        };

        info!(
            event_id = event.webhook_event_id.as_deref().unwrap_or("-"),
            "Text message: {}", text
        );

        let body = self.generate_reply(text).await;
        let receipt = self
            .sender
            .reply(reply_token, line::text_messages(&body))
            .await?;

        Ok(Some(receipt))
    }

    async fn generate_reply(&self, prompt: &str) -> String {
        match self.generator.generate(prompt).await {
            Ok(text) => text,
            Err(e) => {
                error!("Generation failed: {:#}", e);
                self.reply
                    .fallback_message(&truncate_detail(&format!("{:#}", e)))
            }
        }
    }

    /// Handle every event of one webhook request and collect the results in input order.
    ///
    /// All events run to completion; if any of them failed the whole batch is an error.
    pub async fn handle_batch(&self, events: &[WebhookEvent]) -> Result<Vec<Option<ReplyReceipt>>> {
        // Collected first: a stream closure over `&WebhookEvent` makes the handler future non-Send
        let pending: Vec<_> = events.iter().map(|event| self.handle_event(event)).collect();
        let outcomes: Vec<Result<Option<ReplyReceipt>>> = stream::iter(pending)
            .buffered(self.max_concurrent_events)
            .collect()
            .await;

        let total = outcomes.len();
        let mut results = Vec::with_capacity(total);
        let mut failures = 0;
        let mut first_error = None;

        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(index, "Failed to handle event: {:#}", e);
                    failures += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.context(format!("{failures} of {total} events failed"))),
            None => Ok(results),
        }
    }
}
