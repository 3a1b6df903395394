//! Two-channel outbound delivery with retry and fallback.
//!
//! The primary channel replies with the event's single-use token. Retryable
//! failures back off exponentially (or honor the server's retry-after); a
//! permanent rejection abandons the token and, for one-to-one conversations,
//! falls back to pushing to the user's durable id with its own retry budget.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::chat_contract::ChatInboundEvent;
use crate::chat_messaging_api::{ChatApiError, ChatApiFailureClass, ChatMessagingApi};
use crate::chat_outbound::{
    render_outbound_wire_messages, sanitize_outbound_messages, ChatOutboundMessage,
    CHAT_MAX_MESSAGES_PER_CALL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatDeliveryConfig {
    /// Attempts per channel, including the first call.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound applied to a server-provided retry-after.
    pub max_retry_after_ms: u64,
    pub call_timeout_ms: u64,
    pub max_messages: usize,
}

impl Default for ChatDeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 2_000,
            max_backoff_ms: 8_000,
            max_retry_after_ms: 30_000,
            call_timeout_ms: 10_000,
            max_messages: CHAT_MAX_MESSAGES_PER_CALL,
        }
    }
}

impl ChatDeliveryConfig {
    /// Delay before the attempt following `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), cap)`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.base_backoff_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_backoff_ms)
    }

    fn retry_delay_ms(&self, attempt: u32, error: &ChatApiError) -> u64 {
        match error.retry_after_ms() {
            Some(retry_after_ms) => retry_after_ms.min(self.max_retry_after_ms),
            None => self.backoff_ms(attempt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatDeliveryChannel {
    Reply,
    Push,
}

impl ChatDeliveryChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Push => "push",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// One outbound call and how it ended.
pub struct ChatDeliveryAttempt {
    pub channel: ChatDeliveryChannel,
    pub attempt: u32,
    pub message_count: usize,
    pub reason_code: Option<&'static str>,
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChatDeliveryOutcome {
    /// Nothing left to send after sanitation; no call was made.
    Skipped,
    Delivered { channel: ChatDeliveryChannel },
    Failed { reason_code: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatDeliveryReport {
    pub outcome: ChatDeliveryOutcome,
    pub fallback_used: bool,
    pub attempts: Vec<ChatDeliveryAttempt>,
}

impl ChatDeliveryReport {
    fn new(outcome: ChatDeliveryOutcome) -> Self {
        Self {
            outcome,
            fallback_used: false,
            attempts: Vec::new(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, ChatDeliveryOutcome::Delivered { .. })
    }
}

enum ChannelResult {
    Delivered,
    Rejected(ChatApiError),
    Exhausted(ChatApiError),
}

#[derive(Clone)]
pub struct ChatDeliveryEngine {
    api: Arc<dyn ChatMessagingApi>,
    config: ChatDeliveryConfig,
}

impl ChatDeliveryEngine {
    pub fn new(api: Arc<dyn ChatMessagingApi>, config: ChatDeliveryConfig) -> Self {
        Self {
            api,
            config: ChatDeliveryConfig {
                max_attempts: config.max_attempts.max(1),
                ..config
            },
        }
    }

    pub fn config(&self) -> &ChatDeliveryConfig {
        &self.config
    }

    /// Sends the handler's messages for `event`.
    ///
    /// The reply token is used by at most one successful call; once the reply
    /// channel is abandoned only the push channel is tried.
    pub async fn deliver(
        &self,
        event: &ChatInboundEvent,
        messages: Vec<ChatOutboundMessage>,
    ) -> ChatDeliveryReport {
        let messages = sanitize_outbound_messages(messages, self.config.max_messages);
        if messages.is_empty() {
            tracing::debug!(
                conversation = %event.conversation_key(),
                "nothing to deliver after sanitation"
            );
            return ChatDeliveryReport::new(ChatDeliveryOutcome::Skipped);
        }
        let wire = render_outbound_wire_messages(&messages);
        let mut report = ChatDeliveryReport::new(ChatDeliveryOutcome::Skipped);
        let fallback_target = event.source.fallback_push_target();

        let rejected_reason = match event.usable_reply_token() {
            Some(reply_token) => {
                match self
                    .run_channel(ChatDeliveryChannel::Reply, reply_token, &wire, &mut report)
                    .await
                {
                    ChannelResult::Delivered => {
                        report.outcome = ChatDeliveryOutcome::Delivered {
                            channel: ChatDeliveryChannel::Reply,
                        };
                        return report;
                    }
                    ChannelResult::Exhausted(error) => {
                        tracing::error!(
                            conversation = %event.conversation_key(),
                            reason_code = error.reason_code(),
                            "reply delivery exhausted retries"
                        );
                        report.outcome = ChatDeliveryOutcome::Failed {
                            reason_code: error.reason_code(),
                        };
                        return report;
                    }
                    ChannelResult::Rejected(error) => error.reason_code(),
                }
            }
            None => "delivery_missing_reply_token",
        };

        let Some(target) = fallback_target else {
            tracing::error!(
                conversation = %event.conversation_key(),
                reason_code = rejected_reason,
                "reply unavailable and conversation has no fallback address"
            );
            report.outcome = ChatDeliveryOutcome::Failed {
                reason_code: rejected_reason,
            };
            return report;
        };

        tracing::info!(
            conversation = %event.conversation_key(),
            reason_code = rejected_reason,
            "falling back to push delivery"
        );
        report.fallback_used = true;
        report.outcome = match self
            .run_channel(ChatDeliveryChannel::Push, target, &wire, &mut report)
            .await
        {
            ChannelResult::Delivered => ChatDeliveryOutcome::Delivered {
                channel: ChatDeliveryChannel::Push,
            },
            ChannelResult::Rejected(error) | ChannelResult::Exhausted(error) => {
                tracing::error!(
                    conversation = %event.conversation_key(),
                    reason_code = error.reason_code(),
                    "push delivery failed"
                );
                ChatDeliveryOutcome::Failed {
                    reason_code: error.reason_code(),
                }
            }
        };
        report
    }

    async fn run_channel(
        &self,
        channel: ChatDeliveryChannel,
        target: &str,
        wire: &[Value],
        report: &mut ChatDeliveryReport,
    ) -> ChannelResult {
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let result = self.call_once(channel, target, wire).await;
            let error = match result {
                Ok(()) => {
                    report.attempts.push(ChatDeliveryAttempt {
                        channel,
                        attempt,
                        message_count: wire.len(),
                        reason_code: None,
                        http_status: None,
                    });
                    return ChannelResult::Delivered;
                }
                Err(error) => error,
            };
            report.attempts.push(ChatDeliveryAttempt {
                channel,
                attempt,
                message_count: wire.len(),
                reason_code: Some(error.reason_code()),
                http_status: error.http_status(),
            });
            tracing::error!(
                channel = channel.as_str(),
                attempt,
                max_attempts = self.config.max_attempts,
                reason_code = error.reason_code(),
                http_status = error.http_status(),
                %error,
                "delivery attempt failed"
            );
            if error.failure_class() == ChatApiFailureClass::Permanent {
                return ChannelResult::Rejected(error);
            }
            if attempt >= self.config.max_attempts {
                return ChannelResult::Exhausted(error);
            }
            let delay_ms = self.config.retry_delay_ms(attempt, &error);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn call_once(
        &self,
        channel: ChatDeliveryChannel,
        target: &str,
        wire: &[Value],
    ) -> Result<(), ChatApiError> {
        let timeout = Duration::from_millis(self.config.call_timeout_ms.max(1));
        let started = Instant::now();
        let call = async {
            match channel {
                ChatDeliveryChannel::Reply => self.api.reply(target, wire).await,
                ChatDeliveryChannel::Push => self.api.push(target, wire).await,
            }
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ChatApiError::transport(format!(
                "{} call timed out after {} ms",
                channel.as_str(),
                started.elapsed().as_millis()
            ))),
        }
    }
}
