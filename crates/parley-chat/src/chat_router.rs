//! Event handler seam and the FAQ command router.
//!
//! Dispatch precedence: admin commands, FAQ topics, follow greeting, then a
//! generic fallback that offers the catalog topics as quick replies.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parley_core::casefold_trimmed;
use serde::Deserialize;

use crate::chat_contract::{ChatEventKind, ChatEventPayload, ChatInboundEvent};
use crate::chat_outbound::{ChatOutboundMessage, ChatQuickReply, ChatQuickReplyItem};
use crate::chat_processor::ChatPipelineCounters;

const FAQ_POSTBACK_PREFIX: &str = "faq=";

/// Domain logic invoked once per admitted event, serialized per conversation.
#[async_trait]
pub trait ChatEventHandler: Send + Sync {
    async fn handle(&self, event: &ChatInboundEvent) -> Result<Vec<ChatOutboundMessage>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FaqTopic {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub answer: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub preview_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FaqCatalog {
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_fallback")]
    pub fallback: String,
    pub topics: Vec<FaqTopic>,
}

fn default_greeting() -> String {
    "Thanks for adding us! Pick a topic below or ask a question.".to_string()
}

fn default_fallback() -> String {
    "Sorry, I did not catch that. Here is what I can help with:".to_string()
}

impl Default for FaqCatalog {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
            fallback: default_fallback(),
            topics: Vec::new(),
        }
    }
}

impl FaqCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read faq catalog {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("invalid faq catalog {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let catalog = serde_json::from_str::<Self>(raw).context("failed to parse faq catalog")?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for topic in &self.topics {
            let id = topic.id.trim();
            if id.is_empty() {
                bail!("faq topic id cannot be empty");
            }
            if !seen.insert(id) {
                bail!("duplicate faq topic id '{id}'");
            }
            if topic.answer.trim().is_empty() {
                bail!("faq topic '{id}' has an empty answer");
            }
        }
        Ok(())
    }

    pub fn topic(&self, id: &str) -> Option<&FaqTopic> {
        let id = id.trim();
        self.topics.iter().find(|topic| topic.id == id)
    }

    /// First topic in catalog order with a keyword contained in `text`.
    pub fn match_keyword(&self, text: &str) -> Option<&FaqTopic> {
        let normalized = casefold_trimmed(text);
        if normalized.is_empty() {
            return None;
        }
        self.topics.iter().find(|topic| {
            topic
                .keywords
                .iter()
                .map(|keyword| casefold_trimmed(keyword))
                .any(|keyword| !keyword.is_empty() && normalized.contains(keyword.as_str()))
        })
    }

    fn topic_quick_reply(&self) -> Option<ChatQuickReply> {
        ChatQuickReply::from_items(self.topics.iter().map(|topic| {
            ChatQuickReplyItem::postback(
                topic.title.as_str(),
                format!("{FAQ_POSTBACK_PREFIX}{}", topic.id),
            )
            .with_display_text(topic.title.as_str())
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatAdminCommand {
    Status,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Parsed intent of an inbound event, in dispatch precedence order.
pub enum ChatCommand {
    Admin(ChatAdminCommand),
    Faq { topic_id: String },
    Greeting,
    Fallback,
    Ignore,
}

pub struct ChatCommandRouter {
    catalog: FaqCatalog,
    admin_user_ids: HashSet<String>,
    counters: Option<Arc<ChatPipelineCounters>>,
}

impl ChatCommandRouter {
    pub fn new(catalog: FaqCatalog) -> Self {
        Self {
            catalog,
            admin_user_ids: HashSet::new(),
            counters: None,
        }
    }

    pub fn with_admin_user_ids(mut self, admin_user_ids: impl IntoIterator<Item = String>) -> Self {
        self.admin_user_ids = admin_user_ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        self
    }

    /// Counters reported by `/status`.
    pub fn with_counters(mut self, counters: Arc<ChatPipelineCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn parse_command(&self, event: &ChatInboundEvent) -> ChatCommand {
        match (&event.kind, &event.payload) {
            (ChatEventKind::Message, ChatEventPayload::Text { text, .. }) => {
                if let Some(admin) = self.parse_admin_command(event, text) {
                    return ChatCommand::Admin(admin);
                }
                match self.catalog.match_keyword(text) {
                    Some(topic) => ChatCommand::Faq {
                        topic_id: topic.id.clone(),
                    },
                    None => ChatCommand::Fallback,
                }
            }
            (ChatEventKind::Postback, ChatEventPayload::Postback { data }) => data
                .trim()
                .strip_prefix(FAQ_POSTBACK_PREFIX)
                .and_then(|topic_id| self.catalog.topic(topic_id))
                .map(|topic| ChatCommand::Faq {
                    topic_id: topic.id.clone(),
                })
                .unwrap_or(ChatCommand::Fallback),
            (ChatEventKind::Message, _) => ChatCommand::Fallback,
            (ChatEventKind::Follow, _) => ChatCommand::Greeting,
            _ => ChatCommand::Ignore,
        }
    }

    fn parse_admin_command(&self, event: &ChatInboundEvent, text: &str) -> Option<ChatAdminCommand> {
        let command = match casefold_trimmed(text).as_str() {
            "/status" => ChatAdminCommand::Status,
            "/ping" => ChatAdminCommand::Ping,
            _ => return None,
        };
        let speaker = event.source.speaker_user_id()?;
        self.admin_user_ids.contains(speaker).then_some(command)
    }

    fn render_admin(&self, command: ChatAdminCommand) -> Vec<ChatOutboundMessage> {
        match command {
            ChatAdminCommand::Ping => vec![ChatOutboundMessage::text("pong")],
            ChatAdminCommand::Status => {
                let text = match &self.counters {
                    Some(counters) => {
                        let snapshot = counters.snapshot();
                        format!(
                            "accepted={} duplicates={} debounced={} rate_limited={} delivered={} delivery_failed={}",
                            snapshot.accepted,
                            snapshot.duplicates,
                            snapshot.debounced,
                            snapshot.rate_limited,
                            snapshot.delivered,
                            snapshot.delivery_failed
                        )
                    }
                    None => "status unavailable".to_string(),
                };
                vec![ChatOutboundMessage::text(text)]
            }
        }
    }

    fn render_topic(&self, topic: &FaqTopic) -> Vec<ChatOutboundMessage> {
        let mut messages = vec![ChatOutboundMessage::text(topic.answer.as_str())];
        if let Some(image_url) = topic.image_url.as_deref() {
            messages.push(ChatOutboundMessage::Image {
                original_content_url: image_url.to_string(),
                preview_image_url: topic
                    .preview_image_url
                    .clone()
                    .unwrap_or_else(|| image_url.to_string()),
                quick_reply: None,
            });
        }
        messages
    }

    fn with_topic_menu(&self, text: &str) -> Vec<ChatOutboundMessage> {
        vec![ChatOutboundMessage::text(text).with_quick_reply(self.catalog.topic_quick_reply())]
    }
}

#[async_trait]
impl ChatEventHandler for ChatCommandRouter {
    async fn handle(&self, event: &ChatInboundEvent) -> Result<Vec<ChatOutboundMessage>> {
        let command = self.parse_command(event);
        tracing::debug!(
            conversation = %event.conversation_key(),
            ?command,
            "routing chat event"
        );
        let messages = match command {
            ChatCommand::Admin(admin) => self.render_admin(admin),
            ChatCommand::Faq { topic_id } => match self.catalog.topic(&topic_id) {
                Some(topic) => self.render_topic(topic),
                None => bail!("faq topic '{topic_id}' disappeared from catalog"),
            },
            ChatCommand::Greeting => self.with_topic_menu(&self.catalog.greeting),
            ChatCommand::Fallback => self.with_topic_menu(&self.catalog.fallback),
            ChatCommand::Ignore => Vec::new(),
        };
        Ok(messages)
    }
}
