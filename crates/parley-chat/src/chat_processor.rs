//! Batch orchestration: admission, per-conversation dispatch, delivery.
//!
//! Admission runs sequentially in arrival order so each conversation's lane
//! receives its events in the order the platform sent them. Admitted events
//! are handed to the sequencer and the batch joins every handle at the end.
//! A failing handler or delivery only affects its own event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parley_core::duration_to_ms;
use parley_store::KvStore;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::chat_admission::{ChatAdmissionFailurePolicy, ChatAdmissionRejection};
use crate::chat_contract::ChatInboundEvent;
use crate::chat_debounce::{ChatDebounceFilter, CHAT_DEBOUNCE_DEFAULT_WINDOW};
use crate::chat_delivery::{
    ChatDeliveryConfig, ChatDeliveryEngine, ChatDeliveryOutcome, ChatDeliveryReport,
};
use crate::chat_idempotency::{ChatIdempotencyFilter, CHAT_IDEMPOTENCY_DEFAULT_TTL};
use crate::chat_messaging_api::ChatMessagingApi;
use crate::chat_rate_limit::{ChatRateLimitConfig, ChatRateLimiter};
use crate::chat_router::ChatEventHandler;
use crate::chat_sequencer::ChatLaneSequencer;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatPipelineConfig {
    pub idempotency_ttl: Duration,
    pub debounce_window: Duration,
    pub rate_limit: ChatRateLimitConfig,
    /// Global cap on lanes running at once; `None` leaves lanes uncapped.
    pub max_concurrent_lanes: Option<usize>,
    pub delivery: ChatDeliveryConfig,
    pub failure_policy: ChatAdmissionFailurePolicy,
}

impl Default for ChatPipelineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: CHAT_IDEMPOTENCY_DEFAULT_TTL,
            debounce_window: CHAT_DEBOUNCE_DEFAULT_WINDOW,
            rate_limit: ChatRateLimitConfig::default(),
            max_concurrent_lanes: None,
            delivery: ChatDeliveryConfig::default(),
            failure_policy: ChatAdmissionFailurePolicy::default(),
        }
    }
}

/// Running totals across every processed batch.
#[derive(Debug, Default)]
pub struct ChatPipelineCounters {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    debounced: AtomicU64,
    rate_limited: AtomicU64,
    delivered: AtomicU64,
    delivery_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChatPipelineCountersSnapshot {
    pub accepted: u64,
    pub duplicates: u64,
    pub debounced: u64,
    pub rate_limited: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
}

impl ChatPipelineCounters {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, rejection: ChatAdmissionRejection) {
        let counter = match rejection {
            ChatAdmissionRejection::Duplicate => &self.duplicates,
            ChatAdmissionRejection::Debounced => &self.debounced,
            ChatAdmissionRejection::RateLimited => &self.rate_limited,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, report: &ChatDeliveryReport) {
        match report.outcome {
            ChatDeliveryOutcome::Delivered { .. } => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            ChatDeliveryOutcome::Failed { .. } => {
                self.delivery_failed.fetch_add(1, Ordering::Relaxed);
            }
            ChatDeliveryOutcome::Skipped => {}
        }
    }

    pub fn snapshot(&self) -> ChatPipelineCountersSnapshot {
        ChatPipelineCountersSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            debounced: self.debounced.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failed: self.delivery_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChatBatchSummary {
    pub received: usize,
    pub duplicates: usize,
    pub debounced: usize,
    pub rate_limited: usize,
    pub dispatched: usize,
    pub delivered: usize,
    pub delivery_skipped: usize,
    pub delivery_failed: usize,
    pub handler_failed: usize,
    pub fallback_used: usize,
    pub elapsed_ms: u64,
}

impl ChatBatchSummary {
    fn record_rejection(&mut self, rejection: ChatAdmissionRejection) {
        match rejection {
            ChatAdmissionRejection::Duplicate => self.duplicates += 1,
            ChatAdmissionRejection::Debounced => self.debounced += 1,
            ChatAdmissionRejection::RateLimited => self.rate_limited += 1,
        }
    }

    fn record_dispatch(&mut self, outcome: ChatDispatchOutcome) {
        let report = match outcome {
            ChatDispatchOutcome::HandlerFailed => {
                self.handler_failed += 1;
                return;
            }
            ChatDispatchOutcome::Delivery(report) => report,
        };
        if report.fallback_used {
            self.fallback_used += 1;
        }
        match report.outcome {
            ChatDeliveryOutcome::Delivered { .. } => self.delivered += 1,
            ChatDeliveryOutcome::Skipped => self.delivery_skipped += 1,
            ChatDeliveryOutcome::Failed { .. } => self.delivery_failed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReadinessReport {
    pub store_backend: &'static str,
    pub store_reachable: bool,
    pub detail: String,
}

enum ChatDispatchOutcome {
    HandlerFailed,
    Delivery(ChatDeliveryReport),
}

pub struct ChatEventProcessor {
    store: Arc<dyn KvStore>,
    idempotency: ChatIdempotencyFilter,
    debounce: ChatDebounceFilter,
    rate_limiter: ChatRateLimiter,
    sequencer: ChatLaneSequencer,
    delivery: ChatDeliveryEngine,
    handler: Arc<dyn ChatEventHandler>,
    counters: Arc<ChatPipelineCounters>,
}

impl ChatEventProcessor {
    pub fn new(
        config: ChatPipelineConfig,
        store: Arc<dyn KvStore>,
        api: Arc<dyn ChatMessagingApi>,
        handler: Arc<dyn ChatEventHandler>,
    ) -> Self {
        let sequencer = match config.max_concurrent_lanes {
            Some(max) => ChatLaneSequencer::with_max_concurrent_lanes(max),
            None => ChatLaneSequencer::new(),
        };
        Self {
            idempotency: ChatIdempotencyFilter::new(
                Arc::clone(&store),
                config.idempotency_ttl,
                config.failure_policy,
            ),
            debounce: ChatDebounceFilter::new(
                Arc::clone(&store),
                config.debounce_window,
                config.failure_policy,
            ),
            rate_limiter: ChatRateLimiter::new(config.rate_limit),
            sequencer,
            delivery: ChatDeliveryEngine::new(api, config.delivery),
            handler,
            counters: Arc::new(ChatPipelineCounters::default()),
            store,
        }
    }

    /// Shares an externally owned counter set, e.g. one also read by `/status`.
    pub fn with_counters(mut self, counters: Arc<ChatPipelineCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn counters(&self) -> &Arc<ChatPipelineCounters> {
        &self.counters
    }

    pub fn rate_limiter(&self) -> &ChatRateLimiter {
        &self.rate_limiter
    }

    pub fn active_lanes(&self) -> usize {
        self.sequencer.active_lanes()
    }

    pub async fn process_batch(&self, events: Vec<ChatInboundEvent>) -> ChatBatchSummary {
        let started = Instant::now();
        let mut summary = ChatBatchSummary {
            received: events.len(),
            ..ChatBatchSummary::default()
        };
        let mut handles = Vec::new();
        for event in events {
            if let Err(rejection) = self.admit(&event).await {
                tracing::info!(
                    conversation = %event.conversation_key(),
                    event_id = event.event_id.as_deref().unwrap_or(""),
                    reason = rejection.as_str(),
                    "chat event rejected at admission"
                );
                self.counters.record_rejection(rejection);
                summary.record_rejection(rejection);
                continue;
            }
            self.counters.record_accepted();
            summary.dispatched += 1;
            handles.push(self.dispatch(event));
        }

        for handle in handles {
            match handle.await {
                Ok(outcome) => summary.record_dispatch(outcome),
                Err(error) => {
                    tracing::error!(%error, "chat event task aborted");
                    summary.handler_failed += 1;
                }
            }
        }
        summary.elapsed_ms = duration_to_ms(started.elapsed());
        tracing::info!(
            received = summary.received,
            dispatched = summary.dispatched,
            delivered = summary.delivered,
            delivery_failed = summary.delivery_failed,
            handler_failed = summary.handler_failed,
            elapsed_ms = summary.elapsed_ms,
            "chat batch processed"
        );
        summary
    }

    async fn admit(&self, event: &ChatInboundEvent) -> Result<(), ChatAdmissionRejection> {
        if self.idempotency.is_duplicate(event).await {
            return Err(ChatAdmissionRejection::Duplicate);
        }
        let conversation_key = event.conversation_key();
        if event.is_user_interactive() {
            if let Some(text) = event.payload_text() {
                if !self.debounce.accept(&conversation_key, text).await {
                    return Err(ChatAdmissionRejection::Debounced);
                }
            }
        }
        if !self.rate_limiter.allow(&conversation_key) {
            return Err(ChatAdmissionRejection::RateLimited);
        }
        Ok(())
    }

    fn dispatch(&self, event: ChatInboundEvent) -> JoinHandle<ChatDispatchOutcome> {
        let handler = Arc::clone(&self.handler);
        let delivery = self.delivery.clone();
        let counters = Arc::clone(&self.counters);
        let conversation_key = event.conversation_key();
        self.sequencer.run_exclusive(&conversation_key, async move {
            let messages = match handler.handle(&event).await {
                Ok(messages) => messages,
                Err(error) => {
                    tracing::error!(
                        conversation = %event.conversation_key(),
                        error = %format!("{error:#}"),
                        "chat handler failed"
                    );
                    return ChatDispatchOutcome::HandlerFailed;
                }
            };
            let report = delivery.deliver(&event, messages).await;
            counters.record_delivery(&report);
            ChatDispatchOutcome::Delivery(report)
        })
    }

    pub async fn readiness(&self) -> ChatReadinessReport {
        let store_backend = self.store.backend_name();
        match self.store.ping().await {
            Ok(()) => ChatReadinessReport {
                store_backend,
                store_reachable: true,
                detail: "ok".to_string(),
            },
            Err(error) => ChatReadinessReport {
                store_backend,
                store_reachable: false,
                detail: error.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parley_store::{InMemoryKvStore, KvStore};

    use super::{ChatEventProcessor, ChatPipelineConfig};
    use crate::chat_admission::ChatAdmissionFailurePolicy;
    use crate::chat_messaging_api::ChatApiError;
    use crate::chat_rate_limit::ChatRateLimitConfig;
    use crate::chat_test_support::{
        follow_event, text_event, FailingKvStore, RecordingHandler, ScriptedMessagingApi,
    };

    struct Harness {
        processor: ChatEventProcessor,
        api: Arc<ScriptedMessagingApi>,
        handler: Arc<RecordingHandler>,
    }

    fn harness_with(config: ChatPipelineConfig, store: Arc<dyn KvStore>) -> Harness {
        let api = Arc::new(ScriptedMessagingApi::default());
        let handler = Arc::new(RecordingHandler::default());
        let processor = ChatEventProcessor::new(config, store, api.clone(), handler.clone());
        Harness {
            processor,
            api,
            handler,
        }
    }

    fn harness() -> Harness {
        harness_with(
            ChatPipelineConfig::default(),
            Arc::new(InMemoryKvStore::new()),
        )
    }

    #[tokio::test]
    async fn functional_same_event_id_reaches_handler_once() {
        let harness = harness();
        let mut first = text_event("U1", "hours");
        first.event_id = Some("evt-1".to_string());
        let mut second = text_event("U1", "parking");
        second.event_id = Some("evt-1".to_string());

        let summary = harness.processor.process_batch(vec![first, second]).await;
        assert_eq!(summary.received, 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(harness.handler.seen(), vec!["user:U1:hours"]);
        assert_eq!(harness.processor.counters().snapshot().duplicates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_double_tap_is_debounced_then_accepted_after_window() {
        let harness = harness();
        let mut tap = text_event("U1", "Hours");
        tap.event_id = Some("evt-a".to_string());
        let mut double_tap = text_event("U1", " hours ");
        double_tap.event_id = Some("evt-b".to_string());
        let summary = harness.processor.process_batch(vec![tap, double_tap]).await;
        assert_eq!(summary.debounced, 1);
        assert_eq!(summary.dispatched, 1);

        tokio::time::advance(Duration::from_millis(1_300)).await;
        let mut later = text_event("U1", "hours");
        later.event_id = Some("evt-c".to_string());
        let summary = harness.processor.process_batch(vec![later]).await;
        assert_eq!(summary.dispatched, 1);
        assert_eq!(harness.handler.seen().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_bursts_beyond_bucket_are_rate_limited() {
        let harness = harness_with(
            ChatPipelineConfig {
                rate_limit: ChatRateLimitConfig {
                    capacity: 2.0,
                    refill_per_second: 1.0,
                    ..ChatRateLimitConfig::default()
                },
                ..ChatPipelineConfig::default()
            },
            Arc::new(InMemoryKvStore::new()),
        );
        let events = (0..4)
            .map(|index| {
                let mut event = text_event("U1", &format!("question {index}"));
                event.event_id = Some(format!("evt-{index}"));
                event
            })
            .collect::<Vec<_>>();
        let summary = harness.processor.process_batch(events).await;
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.rate_limited, 2);
        assert_eq!(harness.processor.rate_limiter().rejected_total(), 2);
    }

    #[tokio::test]
    async fn integration_per_conversation_order_matches_arrival_order() {
        let harness = harness();
        harness.handler.delay_text("a1", Duration::from_millis(30));
        harness.handler.delay_text("a2", Duration::from_millis(10));
        let events = ["a1", "b1", "a2", "a3", "b2"]
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                let user = if text.starts_with('a') { "A" } else { "B" };
                let mut event = text_event(user, text);
                event.event_id = Some(format!("evt-{index}"));
                event
            })
            .collect::<Vec<_>>();
        let summary = harness.processor.process_batch(events).await;
        assert_eq!(summary.delivered, 5);

        let seen = harness.handler.seen();
        let lane_a = seen
            .iter()
            .filter(|entry| entry.starts_with("user:A"))
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(lane_a, vec!["user:A:a1", "user:A:a2", "user:A:a3"]);
        assert_eq!(harness.processor.active_lanes(), 0);
    }

    #[tokio::test]
    async fn regression_handler_failure_does_not_block_later_events() {
        let harness = harness();
        harness.handler.fail_on_text("boom");
        let mut failing = text_event("U1", "boom");
        failing.event_id = Some("evt-1".to_string());
        let mut next = text_event("U1", "hours");
        next.event_id = Some("evt-2".to_string());

        let summary = harness.processor.process_batch(vec![failing, next]).await;
        assert_eq!(summary.handler_failed, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(harness.api.reply_count(), 1);
    }

    #[tokio::test]
    async fn functional_summary_counts_fallback_and_skips() {
        let harness = harness();
        harness
            .api
            .script_reply(Err(ChatApiError::http(410, None, "expired")));
        let mut message = text_event("U1", "hours");
        message.event_id = Some("evt-1".to_string());
        let mut silent = follow_event("U2");
        silent.event_id = Some("evt-2".to_string());
        harness.handler.silence_text("");

        let summary = harness.processor.process_batch(vec![message, silent]).await;
        assert_eq!(summary.fallback_used, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.delivery_skipped, 1);
        assert_eq!(harness.api.push_count(), 1);
    }

    #[tokio::test]
    async fn regression_store_outage_follows_failure_policy() {
        let open = harness_with(ChatPipelineConfig::default(), Arc::new(FailingKvStore));
        let summary = open
            .processor
            .process_batch(vec![text_event("U1", "hours")])
            .await;
        assert_eq!(summary.dispatched, 1);

        let closed = harness_with(
            ChatPipelineConfig {
                failure_policy: ChatAdmissionFailurePolicy::FailClosed,
                ..ChatPipelineConfig::default()
            },
            Arc::new(FailingKvStore),
        );
        let summary = closed
            .processor
            .process_batch(vec![text_event("U1", "hours")])
            .await;
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.dispatched, 0);
    }

    #[tokio::test]
    async fn unit_readiness_reflects_store_reachability() {
        let healthy = harness();
        let report = healthy.processor.readiness().await;
        assert!(report.store_reachable);
        assert_eq!(report.store_backend, "memory");

        let down = harness_with(ChatPipelineConfig::default(), Arc::new(FailingKvStore));
        let report = down.processor.readiness().await;
        assert!(!report.store_reachable);
        assert!(report.detail.contains("store offline"));
    }
}
