//! Chat event admission and delivery pipeline.
//!
//! Inbound webhook events pass idempotency, debounce and rate-limit
//! admission, are serialized per conversation, handled by a
//! [`ChatEventHandler`], and delivered through a reply channel with retry and
//! a push fallback.

pub mod chat_admission;
pub mod chat_contract;
pub mod chat_debounce;
pub mod chat_delivery;
pub mod chat_idempotency;
pub mod chat_messaging_api;
pub mod chat_outbound;
pub mod chat_processor;
pub mod chat_rate_limit;
pub mod chat_router;
pub mod chat_sequencer;

#[cfg(test)]
mod chat_test_support;

pub use chat_admission::{ChatAdmissionFailurePolicy, ChatAdmissionRejection};
pub use chat_contract::{
    parse_chat_webhook_batch, parse_chat_webhook_event, ChatEventKind, ChatEventPayload,
    ChatEventSource, ChatInboundEvent, ChatWebhookParseError,
};
pub use chat_debounce::{chat_debounce_key, ChatDebounceFilter, CHAT_DEBOUNCE_DEFAULT_WINDOW};
pub use chat_delivery::{
    ChatDeliveryAttempt, ChatDeliveryChannel, ChatDeliveryConfig, ChatDeliveryEngine,
    ChatDeliveryOutcome, ChatDeliveryReport,
};
pub use chat_idempotency::{
    chat_event_dedupe_key, ChatIdempotencyFilter, CHAT_IDEMPOTENCY_DEFAULT_TTL,
};
pub use chat_messaging_api::{
    parse_retry_after_ms, ChatApiError, ChatApiFailureClass, ChatMessagingApi,
    LineMessagingClient, LineMessagingConfig,
};
pub use chat_outbound::{
    render_outbound_wire_messages, sanitize_outbound_messages, ChatOutboundMessage,
    ChatQuickReply, ChatQuickReplyItem, CHAT_MAX_MESSAGES_PER_CALL, CHAT_MAX_QUICK_REPLY_ITEMS,
};
pub use chat_processor::{
    ChatBatchSummary, ChatEventProcessor, ChatPipelineConfig, ChatPipelineCounters,
    ChatPipelineCountersSnapshot, ChatReadinessReport,
};
pub use chat_rate_limit::{ChatRateLimitConfig, ChatRateLimiter};
pub use chat_router::{
    ChatAdminCommand, ChatCommand, ChatCommandRouter, ChatEventHandler, FaqCatalog, FaqTopic,
};
pub use chat_sequencer::ChatLaneSequencer;
