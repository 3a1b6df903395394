//! Double-tap suppression for user-interactive events.

use std::sync::Arc;
use std::time::Duration;

use parley_core::casefold_trimmed;
use parley_store::KvStore;
use sha2::{Digest, Sha256};

use crate::chat_admission::ChatAdmissionFailurePolicy;

pub const CHAT_DEBOUNCE_DEFAULT_WINDOW: Duration = Duration::from_millis(1_200);
const CHAT_DEBOUNCE_KEY_PREFIX: &str = "debounce:";

/// Rejects repeats of the same normalized payload from one conversation
/// within the debounce window.
#[derive(Clone)]
pub struct ChatDebounceFilter {
    store: Arc<dyn KvStore>,
    window: Duration,
    failure_policy: ChatAdmissionFailurePolicy,
}

impl ChatDebounceFilter {
    pub fn new(
        store: Arc<dyn KvStore>,
        window: Duration,
        failure_policy: ChatAdmissionFailurePolicy,
    ) -> Self {
        Self {
            store,
            window,
            failure_policy,
        }
    }

    /// Returns true when the payload is accepted; false when it repeats an
    /// accepted payload inside the window.
    pub async fn accept(&self, conversation_key: &str, payload_text: &str) -> bool {
        let key = chat_debounce_key(conversation_key, payload_text);
        let outcome = self.store.try_insert(&key, self.window).await;
        self.failure_policy.resolve("debounce", &key, outcome)
    }
}

/// Store key for a (conversation, normalized payload) pair. The payload is
/// hashed so arbitrary user text never lands in a key verbatim.
pub fn chat_debounce_key(conversation_key: &str, payload_text: &str) -> String {
    let normalized = casefold_trimmed(payload_text);
    let digest = Sha256::digest(normalized.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{CHAT_DEBOUNCE_KEY_PREFIX}{conversation_key}:{hex}")
}
