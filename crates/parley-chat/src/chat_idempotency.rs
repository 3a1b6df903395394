//! Redelivery suppression keyed on the event identity.

use std::sync::Arc;
use std::time::Duration;

use parley_store::KvStore;

use crate::chat_admission::ChatAdmissionFailurePolicy;
use crate::chat_contract::ChatInboundEvent;

pub const CHAT_IDEMPOTENCY_DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const CHAT_IDEMPOTENCY_KEY_PREFIX: &str = "idempotency:";

/// Rejects events already seen within the TTL window.
#[derive(Clone)]
pub struct ChatIdempotencyFilter {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    failure_policy: ChatAdmissionFailurePolicy,
}

impl ChatIdempotencyFilter {
    pub fn new(
        store: Arc<dyn KvStore>,
        ttl: Duration,
        failure_policy: ChatAdmissionFailurePolicy,
    ) -> Self {
        Self {
            store,
            ttl,
            failure_policy,
        }
    }

    /// Returns true when `event` must be dropped as a duplicate.
    ///
    /// Transport-flagged redeliveries short-circuit without touching the store.
    pub async fn is_duplicate(&self, event: &ChatInboundEvent) -> bool {
        if event.is_redelivery {
            return true;
        }
        let key = format!(
            "{CHAT_IDEMPOTENCY_KEY_PREFIX}{}",
            chat_event_dedupe_key(event)
        );
        let outcome = self.store.try_insert(&key, self.ttl).await;
        !self.failure_policy.resolve("idempotency", &key, outcome)
    }
}

/// Stable id when present, else `<kind>:<payload id>:<timestamp>`.
///
/// The composite fallback can alias two distinct events that share kind,
/// payload id and millisecond timestamp.
pub fn chat_event_dedupe_key(event: &ChatInboundEvent) -> String {
    if let Some(event_id) = event
        .event_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return format!("id:{event_id}");
    }
    format!(
        "composite:{}:{}:{}",
        event.kind.as_str(),
        event.payload_id(),
        event.timestamp_ms
    )
}
