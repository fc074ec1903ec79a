//! Best-effort delivery of chat messages
//!
//! The [`Transport`] trait is the seam to the chat service. [`Dispatcher`]
//! wraps a transport with a bounded retry policy; a message that still
//! fails after the last attempt is dropped with a warning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::error::BanwatchError;

/// Destination chat, optionally a forum topic inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatTarget {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
}

impl ChatTarget {
    pub fn new(chat_id: i64, thread_id: Option<i64>) -> Self {
        Self { chat_id, thread_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

/// Inline keyboard; serializes as a Telegram `reply_markup`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InlineKeyboard {
    pub inline_keyboard: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row<I, T, D>(mut self, buttons: I) -> Self
    where
        I: IntoIterator<Item = (T, D)>,
        T: Into<String>,
        D: Into<String>,
    {
        self.inline_keyboard.push(
            buttons
                .into_iter()
                .map(|(text, data)| InlineButton {
                    text: text.into(),
                    callback_data: data.into(),
                })
                .collect(),
        );
        self
    }

    pub fn buttons(&self) -> impl Iterator<Item = &InlineButton> {
        self.inline_keyboard.iter().flatten()
    }
}

/// An in-memory image ready to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub file_name: String,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text {
        text: String,
        keyboard: Option<InlineKeyboard>,
    },
    Image {
        image: RenderedImage,
        caption: Option<String>,
        keyboard: Option<InlineKeyboard>,
    },
    CallbackAnswer {
        callback_id: String,
        text: Option<String>,
    },
}

/// One message waiting for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub target: ChatTarget,
    pub payload: Payload,
}

impl Outgoing {
    pub fn text(target: ChatTarget, text: impl Into<String>) -> Self {
        Self {
            target,
            payload: Payload::Text {
                text: text.into(),
                keyboard: None,
            },
        }
    }

    pub fn image(target: ChatTarget, image: RenderedImage, caption: Option<String>) -> Self {
        Self {
            target,
            payload: Payload::Image {
                image,
                caption,
                keyboard: None,
            },
        }
    }

    pub fn callback_answer(target: ChatTarget, callback_id: impl Into<String>) -> Self {
        Self {
            target,
            payload: Payload::CallbackAnswer {
                callback_id: callback_id.into(),
                text: None,
            },
        }
    }

    pub fn with_keyboard(mut self, markup: InlineKeyboard) -> Self {
        match &mut self.payload {
            Payload::Text { keyboard, .. } | Payload::Image { keyboard, .. } => {
                *keyboard = Some(markup);
            }
            Payload::CallbackAnswer { .. } => {}
        }
        self
    }

    fn kind(&self) -> &'static str {
        match self.payload {
            Payload::Text { .. } => "message",
            Payload::Image { .. } => "image",
            Payload::CallbackAnswer { .. } => "callback answer",
        }
    }
}

/// A failed send, classified for the retry loop
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
    /// Server-requested pause before the next attempt
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            retry_after: Some(retry_after),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(
        &self,
        target: &ChatTarget,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<(), TransportError>;

    async fn send_image(
        &self,
        target: &ChatTarget,
        image: &RenderedImage,
        caption: Option<&str>,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<(), TransportError>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), TransportError>;
}

/// Bounded exponential backoff with equal jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NotifyConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Upper bound of the wait after the `retry`-th failure (1-based)
    pub fn ceiling(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Half the ceiling plus a random share of the other half
    pub fn jittered<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(retry);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        half + Duration::from_millis(rng.gen_range(0..=spread))
    }

    /// Delay before the next attempt; the server's `retry_after` wins
    pub fn next_delay<R: Rng + ?Sized>(&self, retry: u32, error: &TransportError, rng: &mut R) -> Duration {
        match error.retry_after {
            Some(after) => after,
            None => self.jittered(retry, rng),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Dropped { attempts: u32, reason: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send with retries. Never returns an error: failures end as `Dropped`.
    pub async fn deliver(&self, message: &Outgoing) -> DeliveryOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.send_once(message).await {
                Ok(()) => {
                    debug!("Delivered {} to {} (attempt {})", message.kind(), message.target.chat_id, attempt);
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Err(e) => e,
            };

            if !err.retryable || attempt >= max_attempts {
                let reason = BanwatchError::TransportDelivery(err.message).to_string();
                warn!(
                    "Dropping {} to chat {} after {} attempt(s): {}",
                    message.kind(),
                    message.target.chat_id,
                    attempt,
                    reason
                );
                return DeliveryOutcome::Dropped {
                    attempts: attempt,
                    reason,
                };
            }

            let delay = self.policy.next_delay(attempt, &err, &mut rand::thread_rng());
            debug!(
                "Send attempt {}/{} failed ({}), retrying in {:?}",
                attempt, max_attempts, err.message, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Deliver each message in order
    pub async fn deliver_all(&self, messages: &[Outgoing]) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            outcomes.push(self.deliver(message).await);
        }
        outcomes
    }

    async fn send_once(&self, message: &Outgoing) -> Result<(), TransportError> {
        match &message.payload {
            Payload::Text { text, keyboard } => {
                self.transport
                    .send_text(&message.target, text, keyboard.as_ref())
                    .await
            }
            Payload::Image {
                image,
                caption,
                keyboard,
            } => {
                self.transport
                    .send_image(&message.target, image, caption.as_deref(), keyboard.as_ref())
                    .await
            }
            Payload::CallbackAnswer { callback_id, text } => {
                self.transport
                    .answer_callback(callback_id, text.as_deref())
                    .await
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Records every send; pops scripted failures first
    #[derive(Default)]
    pub struct MockTransport {
        pub sent: Mutex<Vec<Outgoing>>,
        pub calls: Mutex<u32>,
        pub script: Mutex<VecDeque<TransportError>>,
    }

    impl MockTransport {
        pub fn failing(errors: Vec<TransportError>) -> Self {
            Self {
                script: Mutex::new(errors.into()),
                ..Default::default()
            }
        }

        pub fn sent(&self) -> Vec<Outgoing> {
            self.sent.lock().clone()
        }

        fn record(&self, target: &ChatTarget, payload: Payload) -> Result<(), TransportError> {
            *self.calls.lock() += 1;
            if let Some(err) = self.script.lock().pop_front() {
                return Err(err);
            }
            self.sent.lock().push(Outgoing {
                target: *target,
                payload,
            });
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(
            &self,
            target: &ChatTarget,
            text: &str,
            keyboard: Option<&InlineKeyboard>,
        ) -> Result<(), TransportError> {
            self.record(
                target,
                Payload::Text {
                    text: text.to_string(),
                    keyboard: keyboard.cloned(),
                },
            )
        }

        async fn send_image(
            &self,
            target: &ChatTarget,
            image: &RenderedImage,
            caption: Option<&str>,
            keyboard: Option<&InlineKeyboard>,
        ) -> Result<(), TransportError> {
            self.record(
                target,
                Payload::Image {
                    image: image.clone(),
                    caption: caption.map(String::from),
                    keyboard: keyboard.cloned(),
                },
            )
        }

        async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), TransportError> {
            self.record(
                &ChatTarget::new(0, None),
                Payload::CallbackAnswer {
                    callback_id: callback_id.to_string(),
                    text: text.map(String::from),
                },
            )
        }
    }
}
