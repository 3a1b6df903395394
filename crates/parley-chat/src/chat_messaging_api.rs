//! Downstream messaging API seam and its HTTP implementation.
//!
//! `reply` consumes a one-shot reply token; `push` addresses a durable user
//! id and may be repeated. Failures are classified into retryable and
//! permanent so the delivery engine can decide between backoff and fallback.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::truncate_for_error;
use reqwest::{redirect::Policy, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;

const CHAT_API_ERROR_DETAIL_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatApiFailureClass {
    Retryable,
    Permanent,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatApiError {
    #[error("messaging api transport error: {detail}")]
    Transport { detail: String },
    #[error("messaging api returned status {status}: {detail}")]
    Http {
        status: u16,
        retry_after_ms: Option<u64>,
        detail: String,
    },
}

impl ChatApiError {
    pub fn http(status: u16, retry_after_ms: Option<u64>, detail: impl Into<String>) -> Self {
        Self::Http {
            status,
            retry_after_ms,
            detail: detail.into(),
        }
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport {
            detail: detail.into(),
        }
    }

    pub fn failure_class(&self) -> ChatApiFailureClass {
        match self {
            Self::Transport { .. } => ChatApiFailureClass::Retryable,
            Self::Http { status, .. } => classify_provider_status(*status).1,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "delivery_transport_error",
            Self::Http { status, .. } => classify_provider_status(*status).0,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Transport { .. } => None,
            Self::Http { status, .. } => Some(*status),
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Transport { .. } => None,
            Self::Http { retry_after_ms, .. } => *retry_after_ms,
        }
    }
}

fn classify_provider_status(status: u16) -> (&'static str, ChatApiFailureClass) {
    if status == StatusCode::TOO_MANY_REQUESTS.as_u16() {
        return ("delivery_rate_limited", ChatApiFailureClass::Retryable);
    }
    if (500..600).contains(&status) {
        return (
            "delivery_provider_unavailable",
            ChatApiFailureClass::Retryable,
        );
    }
    if (400..500).contains(&status) {
        return ("delivery_request_rejected", ChatApiFailureClass::Permanent);
    }
    // Redirects are not followed, so any other status repeats on retry.
    ("delivery_unexpected_status", ChatApiFailureClass::Permanent)
}

/// Messaging API used by the delivery engine.
#[async_trait]
pub trait ChatMessagingApi: Send + Sync {
    /// Sends `messages` against a single-use reply token.
    async fn reply(&self, reply_token: &str, messages: &[Value]) -> Result<(), ChatApiError>;

    /// Sends `messages` to a durable user address.
    async fn push(&self, to: &str, messages: &[Value]) -> Result<(), ChatApiError>;
}

#[derive(Debug, Clone)]
/// Public struct `LineMessagingConfig` used by the HTTP messaging client.
pub struct LineMessagingConfig {
    pub api_base: String,
    pub access_token: String,
    pub http_timeout_ms: u64,
}

impl Default for LineMessagingConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.line.me".to_string(),
            access_token: String::new(),
            http_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LineMessagingClient {
    http: reqwest::Client,
    api_base: String,
    access_token: String,
}

impl LineMessagingClient {
    pub fn new(config: LineMessagingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms.max(1)))
            .redirect(Policy::none())
            .build()
            .context("failed to build messaging api http client")?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            access_token: config.access_token.trim().to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<(), ChatApiError> {
        let endpoint = format!("{}{path}", self.api_base);
        let response = self
            .http
            .post(endpoint.as_str())
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await
            .map_err(|error| ChatApiError::transport(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after_ms = parse_retry_after_ms(response.headers());
        let body_raw = response.text().await.unwrap_or_default();
        Err(ChatApiError::http(
            status.as_u16(),
            retry_after_ms,
            truncate_for_error(body_raw.trim(), CHAT_API_ERROR_DETAIL_MAX_CHARS),
        ))
    }
}

#[async_trait]
impl ChatMessagingApi for LineMessagingClient {
    async fn reply(&self, reply_token: &str, messages: &[Value]) -> Result<(), ChatApiError> {
        let body = json!({
            "replyToken": reply_token,
            "messages": messages,
        });
        self.post_json("/v2/bot/message/reply", &body).await
    }

    async fn push(&self, to: &str, messages: &[Value]) -> Result<(), ChatApiError> {
        let body = json!({
            "to": to,
            "messages": messages,
        });
        self.post_json("/v2/bot/message/push", &body).await
    }
}

/// Reads a `retry-after` header given either in seconds or as an HTTP date.
pub fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.saturating_mul(1000));
    }

    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delay_ms = retry_at
        .signed_duration_since(Utc::now())
        .num_milliseconds();
    if delay_ms <= 0 {
        return Some(0);
    }
    u64::try_from(delay_ms).ok()
}
