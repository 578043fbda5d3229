//! Fakes for the generator and reply sender that record what they were asked to do.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::llm::Generator;
use crate::platform::{OutgoingMessage, ReplyReceipt, ReplySender, SentMessage};

pub struct FakeGenerator {
    response: std::result::Result<String, String>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeGenerator {
    pub fn replying(text: &str) -> Self {
        Self::with_response(Ok(text.to_string()))
    }

    pub fn failing(error: &str) -> Self {
        Self::with_response(Err(error.to_string()))
    }

    fn with_response(response: std::result::Result<String, String>) -> Self {
        Self {
            response,
            delay: None,
            prompts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(ms));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(e) => Err(anyhow::anyhow!("{}", e)),
        }
    }
}

pub struct FakeSender {
    fail_token: Option<String>,
    calls: Mutex<Vec<(String, Vec<OutgoingMessage>)>>,
}

impl FakeSender {
    pub fn new() -> Self {
        Self {
            fail_token: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fails deliveries addressed to `token`, succeeds for all others.
    pub fn failing_for(token: &str) -> Self {
        Self {
            fail_token: Some(token.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<OutgoingMessage>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplySender for FakeSender {
    async fn reply(
        &self,
        reply_token: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<ReplyReceipt> {
        self.calls
            .lock()
            .unwrap()
            .push((reply_token.to_string(), messages));

        if self.fail_token.as_deref() == Some(reply_token) {
            anyhow::bail!("Invalid reply token");
        }

        Ok(ReplyReceipt {
            sent_messages: vec![SentMessage {
                id: format!("sent-{reply_token}"),
                quote_token: None,
            }],
        })
    }
}
