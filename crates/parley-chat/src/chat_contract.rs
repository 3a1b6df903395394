//! Inbound chat event contract and webhook batch parsing.
//!
//! Webhook bodies are converted into canonical [`ChatInboundEvent`] values
//! before admission. Signature verification happens upstream; this module
//! only shapes already-trusted JSON. Events whose source cannot be resolved
//! to a conversation are skipped with a warning rather than failing the batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ChatEventKind` values.
pub enum ChatEventKind {
    Message,
    Postback,
    Follow,
    Other,
}

impl ChatEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Postback => "postback",
            Self::Follow => "follow",
            Self::Other => "other",
        }
    }

    fn from_wire(raw: &str) -> Self {
        match raw {
            "message" => Self::Message,
            "postback" => Self::Postback,
            "follow" => Self::Follow,
            _ => Self::Other,
        }
    }
}

/// Where an event came from. Determines the conversation key and whether a
/// durable push address exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEventSource {
    User {
        user_id: String,
    },
    Group {
        group_id: String,
        user_id: Option<String>,
    },
    Room {
        room_id: String,
        user_id: Option<String>,
    },
}

impl ChatEventSource {
    /// Serialization key shared by every event of one conversation.
    pub fn conversation_key(&self) -> String {
        match self {
            Self::User { user_id } => format!("user:{user_id}"),
            Self::Group { group_id, .. } => format!("group:{group_id}"),
            Self::Room { room_id, .. } => format!("room:{room_id}"),
        }
    }

    /// Push address usable when the one-shot reply token cannot be used.
    ///
    /// Only one-to-one conversations resolve; group and room sources return
    /// `None` even when the speaking user is known.
    pub fn fallback_push_target(&self) -> Option<&str> {
        match self {
            Self::User { user_id } => Some(user_id.as_str()),
            Self::Group { .. } | Self::Room { .. } => None,
        }
    }

    pub fn speaker_user_id(&self) -> Option<&str> {
        match self {
            Self::User { user_id } => Some(user_id.as_str()),
            Self::Group { user_id, .. } | Self::Room { user_id, .. } => user_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Enumerates supported `ChatEventPayload` values.
pub enum ChatEventPayload {
    Text { message_id: String, text: String },
    NonText { message_id: String, message_type: String },
    Postback { data: String },
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Canonical inbound event handed to the admission pipeline.
pub struct ChatInboundEvent {
    pub event_id: Option<String>,
    pub kind: ChatEventKind,
    pub source: ChatEventSource,
    pub payload: ChatEventPayload,
    pub reply_token: Option<String>,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub is_redelivery: bool,
}

impl ChatInboundEvent {
    pub fn conversation_key(&self) -> String {
        self.source.conversation_key()
    }

    /// Text the user produced: message text or postback data.
    pub fn payload_text(&self) -> Option<&str> {
        match &self.payload {
            ChatEventPayload::Text { text, .. } => Some(text.as_str()),
            ChatEventPayload::Postback { data } => Some(data.as_str()),
            ChatEventPayload::NonText { .. } | ChatEventPayload::Empty => None,
        }
    }

    /// Identifier of the payload used by the composite dedupe key.
    pub fn payload_id(&self) -> &str {
        match &self.payload {
            ChatEventPayload::Text { message_id, .. }
            | ChatEventPayload::NonText { message_id, .. } => message_id.as_str(),
            ChatEventPayload::Postback { data } => data.as_str(),
            ChatEventPayload::Empty => "",
        }
    }

    /// Whether a human can double-tap this kind of event.
    pub fn is_user_interactive(&self) -> bool {
        matches!(self.kind, ChatEventKind::Message | ChatEventKind::Postback)
    }

    /// Reply token, ignoring blank values.
    pub fn usable_reply_token(&self) -> Option<&str> {
        self.reply_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum ChatWebhookParseError {
    #[error("webhook body is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("webhook event is missing '{0}'")]
    MissingField(&'static str),
    #[error("webhook event has unsupported source type '{0}'")]
    UnsupportedSource(String),
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    webhook_event_id: Option<String>,
    #[serde(default)]
    delivery_context: Option<WebhookDeliveryContext>,
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    source: Option<WebhookSource>,
    #[serde(default)]
    reply_token: Option<String>,
    #[serde(default)]
    message: Option<WebhookMessage>,
    #[serde(default)]
    postback: Option<WebhookPostback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookDeliveryContext {
    #[serde(default)]
    is_redelivery: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookSource {
    #[serde(rename = "type")]
    source_type: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookPostback {
    #[serde(default)]
    data: String,
}

/// Parses a webhook body into canonical events, preserving arrival order.
///
/// Only an unparseable body is an error; individual events that cannot be
/// normalized are logged and skipped.
pub fn parse_chat_webhook_batch(raw: &str) -> Result<Vec<ChatInboundEvent>, ChatWebhookParseError> {
    let body = serde_json::from_str::<WebhookBody>(raw)?;
    let mut events = Vec::with_capacity(body.events.len());
    for (index, value) in body.events.into_iter().enumerate() {
        match parse_chat_webhook_event(value) {
            Ok(event) => events.push(event),
            Err(error) => {
                tracing::warn!(index, %error, "skipping malformed webhook event");
            }
        }
    }
    Ok(events)
}

/// Normalizes a single webhook event object.
pub fn parse_chat_webhook_event(value: Value) -> Result<ChatInboundEvent, ChatWebhookParseError> {
    let raw = serde_json::from_value::<WebhookEvent>(value)?;
    let source = raw
        .source
        .ok_or(ChatWebhookParseError::MissingField("source"))
        .and_then(normalize_source)?;
    let kind = ChatEventKind::from_wire(raw.event_type.as_str());
    let payload = match kind {
        ChatEventKind::Message => {
            let message = raw
                .message
                .ok_or(ChatWebhookParseError::MissingField("message"))?;
            match (message.message_type.as_str(), message.text) {
                ("text", Some(text)) => ChatEventPayload::Text {
                    message_id: message.id,
                    text,
                },
                (message_type, _) => ChatEventPayload::NonText {
                    message_id: message.id,
                    message_type: message_type.to_string(),
                },
            }
        }
        ChatEventKind::Postback => {
            let postback = raw
                .postback
                .ok_or(ChatWebhookParseError::MissingField("postback"))?;
            ChatEventPayload::Postback {
                data: postback.data,
            }
        }
        ChatEventKind::Follow | ChatEventKind::Other => ChatEventPayload::Empty,
    };

    Ok(ChatInboundEvent {
        event_id: non_blank(raw.webhook_event_id),
        kind,
        source,
        payload,
        reply_token: non_blank(raw.reply_token),
        timestamp_ms: raw.timestamp,
        is_redelivery: raw
            .delivery_context
            .map(|context| context.is_redelivery)
            .unwrap_or(false),
    })
}

fn normalize_source(source: WebhookSource) -> Result<ChatEventSource, ChatWebhookParseError> {
    let user_id = non_blank(source.user_id);
    match source.source_type.as_str() {
        "user" => Ok(ChatEventSource::User {
            user_id: user_id.ok_or(ChatWebhookParseError::MissingField("source.userId"))?,
        }),
        "group" => Ok(ChatEventSource::Group {
            group_id: non_blank(source.group_id)
                .ok_or(ChatWebhookParseError::MissingField("source.groupId"))?,
            user_id,
        }),
        "room" => Ok(ChatEventSource::Room {
            room_id: non_blank(source.room_id)
                .ok_or(ChatWebhookParseError::MissingField("source.roomId"))?,
            user_id,
        }),
        other => Err(ChatWebhookParseError::UnsupportedSource(other.to_string())),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
