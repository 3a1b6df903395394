//! Shared admission vocabulary: store failure policy and rejection reasons.

use parley_store::{KvStoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What an admission filter does when the store cannot answer.
pub enum ChatAdmissionFailurePolicy {
    /// Admit the event and temporarily lose the admission guarantee.
    #[default]
    FailOpen,
    /// Reject the event.
    FailClosed,
}

impl ChatAdmissionFailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailOpen => "fail_open",
            Self::FailClosed => "fail_closed",
        }
    }

    /// Resolves a store answer to "admit" (`true`) or "reject" (`false`).
    pub(crate) fn resolve(self, filter: &'static str, key: &str, outcome: StoreResult<bool>) -> bool {
        match outcome {
            Ok(inserted) => inserted,
            Err(error) => {
                log_store_failure(filter, key, self, &error);
                matches!(self, Self::FailOpen)
            }
        }
    }
}

fn log_store_failure(
    filter: &'static str,
    key: &str,
    policy: ChatAdmissionFailurePolicy,
    error: &KvStoreError,
) {
    tracing::warn!(
        filter,
        key,
        policy = policy.as_str(),
        %error,
        "admission store unavailable"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why an event was not dispatched.
pub enum ChatAdmissionRejection {
    Duplicate,
    Debounced,
    RateLimited,
}

impl ChatAdmissionRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Debounced => "debounced",
            Self::RateLimited => "rate_limited",
        }
    }
}
