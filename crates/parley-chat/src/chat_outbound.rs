//! Outbound message shapes and pre-send hygiene.
//!
//! The downstream API rejects a whole request when a quick-reply attachment
//! has no items, so empty quick replies are stripped twice: when built via
//! [`ChatQuickReply::from_items`] and again in [`sanitize_outbound_messages`]
//! right before transmission.

use serde_json::{json, Map, Value};

pub const CHAT_MAX_MESSAGES_PER_CALL: usize = 5;
pub const CHAT_MAX_QUICK_REPLY_ITEMS: usize = 13;
const CHAT_QUICK_REPLY_LABEL_MAX_CHARS: usize = 20;
const CHAT_TEXT_MAX_CHARS: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One selectable quick-reply option, sent back as a postback.
pub struct ChatQuickReplyItem {
    pub label: String,
    pub data: String,
    pub display_text: Option<String>,
}

impl ChatQuickReplyItem {
    pub fn postback(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
            display_text: None,
        }
    }

    pub fn with_display_text(mut self, display_text: impl Into<String>) -> Self {
        self.display_text = Some(display_text.into());
        self
    }

    fn is_selectable(&self) -> bool {
        !self.label.trim().is_empty() && !self.data.trim().is_empty()
    }

    fn to_wire_value(&self) -> Value {
        let label = self
            .label
            .trim()
            .chars()
            .take(CHAT_QUICK_REPLY_LABEL_MAX_CHARS)
            .collect::<String>();
        let mut action = json!({
            "type": "postback",
            "label": label,
            "data": self.data,
        });
        if let Some(display_text) = self
            .display_text
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            action["displayText"] = Value::String(display_text.to_string());
        }
        json!({ "type": "action", "action": action })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatQuickReply {
    pub items: Vec<ChatQuickReplyItem>,
}

impl ChatQuickReply {
    /// Builds a quick reply, or `None` when no selectable item remains.
    pub fn from_items(items: impl IntoIterator<Item = ChatQuickReplyItem>) -> Option<Self> {
        let items = items
            .into_iter()
            .filter(ChatQuickReplyItem::is_selectable)
            .take(CHAT_MAX_QUICK_REPLY_ITEMS)
            .collect::<Vec<_>>();
        if items.is_empty() {
            return None;
        }
        Some(Self { items })
    }

    fn to_wire_value(&self) -> Value {
        json!({
            "items": self
                .items
                .iter()
                .map(ChatQuickReplyItem::to_wire_value)
                .collect::<Vec<_>>()
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Enumerates supported `ChatOutboundMessage` values.
pub enum ChatOutboundMessage {
    Text {
        text: String,
        quick_reply: Option<ChatQuickReply>,
    },
    Flex {
        alt_text: String,
        contents: Value,
        quick_reply: Option<ChatQuickReply>,
    },
    Image {
        original_content_url: String,
        preview_image_url: String,
        quick_reply: Option<ChatQuickReply>,
    },
}

impl ChatOutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            quick_reply: None,
        }
    }

    pub fn with_quick_reply(mut self, quick_reply: Option<ChatQuickReply>) -> Self {
        *self.quick_reply_mut() = quick_reply;
        self
    }

    pub fn quick_reply(&self) -> Option<&ChatQuickReply> {
        match self {
            Self::Text { quick_reply, .. }
            | Self::Flex { quick_reply, .. }
            | Self::Image { quick_reply, .. } => quick_reply.as_ref(),
        }
    }

    fn quick_reply_mut(&mut self) -> &mut Option<ChatQuickReply> {
        match self {
            Self::Text { quick_reply, .. }
            | Self::Flex { quick_reply, .. }
            | Self::Image { quick_reply, .. } => quick_reply,
        }
    }

    /// True when the message carries nothing the API would accept.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text { text, .. } => text.trim().is_empty(),
            Self::Flex {
                alt_text, contents, ..
            } => alt_text.trim().is_empty() || contents.is_null(),
            Self::Image {
                original_content_url,
                preview_image_url,
                ..
            } => original_content_url.trim().is_empty() || preview_image_url.trim().is_empty(),
        }
    }

    pub fn to_wire_value(&self) -> Value {
        let mut body = Map::new();
        match self {
            Self::Text { text, .. } => {
                body.insert("type".to_string(), json!("text"));
                let text = text.chars().take(CHAT_TEXT_MAX_CHARS).collect::<String>();
                body.insert("text".to_string(), Value::String(text));
            }
            Self::Flex {
                alt_text, contents, ..
            } => {
                body.insert("type".to_string(), json!("flex"));
                body.insert("altText".to_string(), Value::String(alt_text.clone()));
                body.insert("contents".to_string(), contents.clone());
            }
            Self::Image {
                original_content_url,
                preview_image_url,
                ..
            } => {
                body.insert("type".to_string(), json!("image"));
                body.insert(
                    "originalContentUrl".to_string(),
                    Value::String(original_content_url.clone()),
                );
                body.insert(
                    "previewImageUrl".to_string(),
                    Value::String(preview_image_url.clone()),
                );
            }
        }
        if let Some(quick_reply) = self.quick_reply().filter(|reply| !reply.items.is_empty()) {
            body.insert("quickReply".to_string(), quick_reply.to_wire_value());
        }
        Value::Object(body)
    }
}

/// Applies pre-send hygiene: caps the list at `max_messages`, drops empty
/// entries, and strips quick replies left without a selectable item.
pub fn sanitize_outbound_messages(
    messages: Vec<ChatOutboundMessage>,
    max_messages: usize,
) -> Vec<ChatOutboundMessage> {
    messages
        .into_iter()
        .take(max_messages.clamp(1, CHAT_MAX_MESSAGES_PER_CALL))
        .filter(|message| !message.is_empty())
        .map(|mut message| {
            let slot = message.quick_reply_mut();
            if let Some(existing) = slot.take() {
                *slot = ChatQuickReply::from_items(existing.items);
            }
            message
        })
        .collect()
}

/// Renders sanitized messages into the request body array.
pub fn render_outbound_wire_messages(messages: &[ChatOutboundMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(ChatOutboundMessage::to_wire_value)
        .collect()
}
