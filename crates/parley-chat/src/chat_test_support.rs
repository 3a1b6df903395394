use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parley_store::{KvStore, KvStoreError, StoreResult};
use serde_json::Value;
use tokio::time::Instant;

use crate::chat_contract::{ChatEventKind, ChatEventPayload, ChatEventSource, ChatInboundEvent};
use crate::chat_delivery::ChatDeliveryChannel;
use crate::chat_messaging_api::{ChatApiError, ChatMessagingApi};
use crate::chat_outbound::ChatOutboundMessage;
use crate::chat_router::ChatEventHandler;

pub(crate) const TEST_TIMESTAMP_MS: u64 = 1_760_000_000_000;

pub(crate) fn text_event(user_id: &str, text: &str) -> ChatInboundEvent {
    ChatInboundEvent {
        event_id: None,
        kind: ChatEventKind::Message,
        source: ChatEventSource::User {
            user_id: user_id.to_string(),
        },
        payload: ChatEventPayload::Text {
            message_id: format!("m-{user_id}-{text}"),
            text: text.to_string(),
        },
        reply_token: Some(format!("reply-{user_id}")),
        timestamp_ms: TEST_TIMESTAMP_MS,
        is_redelivery: false,
    }
}

pub(crate) fn group_text_event(group_id: &str, user_id: Option<&str>, text: &str) -> ChatInboundEvent {
    ChatInboundEvent {
        source: ChatEventSource::Group {
            group_id: group_id.to_string(),
            user_id: user_id.map(str::to_string),
        },
        reply_token: Some(format!("reply-{group_id}")),
        ..text_event(group_id, text)
    }
}

pub(crate) fn postback_event(user_id: &str, data: &str) -> ChatInboundEvent {
    ChatInboundEvent {
        kind: ChatEventKind::Postback,
        payload: ChatEventPayload::Postback {
            data: data.to_string(),
        },
        ..text_event(user_id, data)
    }
}

pub(crate) fn follow_event(user_id: &str) -> ChatInboundEvent {
    ChatInboundEvent {
        kind: ChatEventKind::Follow,
        payload: ChatEventPayload::Empty,
        ..text_event(user_id, "")
    }
}

/// Store whose backend is always down.
pub(crate) struct FailingKvStore;

#[async_trait]
impl KvStore for FailingKvStore {
    async fn try_insert(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
        Err(KvStoreError::Unavailable("store offline".to_string()))
    }

    async fn sweep_expired(&self) -> StoreResult<usize> {
        Err(KvStoreError::Unavailable("store offline".to_string()))
    }

    async fn ping(&self) -> StoreResult<()> {
        Err(KvStoreError::Unavailable("store offline".to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub channel: ChatDeliveryChannel,
    pub target: String,
    pub messages: Vec<Value>,
    pub at: Instant,
}

struct ScriptedResponse {
    delay: Option<Duration>,
    result: Result<(), ChatApiError>,
}

/// Messaging API fake. Each channel pops scripted responses in order and
/// succeeds once its script is empty.
#[derive(Default)]
pub(crate) struct ScriptedMessagingApi {
    reply_script: Mutex<VecDeque<ScriptedResponse>>,
    push_script: Mutex<VecDeque<ScriptedResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedMessagingApi {
    pub fn script_reply(&self, result: Result<(), ChatApiError>) {
        self.reply_script
            .lock()
            .expect("reply script")
            .push_back(ScriptedResponse {
                delay: None,
                result,
            });
    }

    pub fn script_reply_delay(&self, delay: Duration) {
        self.reply_script
            .lock()
            .expect("reply script")
            .push_back(ScriptedResponse {
                delay: Some(delay),
                result: Ok(()),
            });
    }

    pub fn script_push(&self, result: Result<(), ChatApiError>) {
        self.push_script
            .lock()
            .expect("push script")
            .push_back(ScriptedResponse {
                delay: None,
                result,
            });
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn reply_count(&self) -> usize {
        self.count(ChatDeliveryChannel::Reply)
    }

    pub fn push_count(&self) -> usize {
        self.count(ChatDeliveryChannel::Push)
    }

    fn count(&self, channel: ChatDeliveryChannel) -> usize {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|call| call.channel == channel)
            .count()
    }

    async fn respond(
        &self,
        channel: ChatDeliveryChannel,
        target: &str,
        messages: &[Value],
    ) -> Result<(), ChatApiError> {
        self.calls.lock().expect("calls").push(RecordedCall {
            channel,
            target: target.to_string(),
            messages: messages.to_vec(),
            at: Instant::now(),
        });
        let script = match channel {
            ChatDeliveryChannel::Reply => &self.reply_script,
            ChatDeliveryChannel::Push => &self.push_script,
        };
        let next = script.lock().expect("script").pop_front();
        let Some(response) = next else {
            return Ok(());
        };
        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        response.result
    }
}

#[async_trait]
impl ChatMessagingApi for ScriptedMessagingApi {
    async fn reply(&self, reply_token: &str, messages: &[Value]) -> Result<(), ChatApiError> {
        self.respond(ChatDeliveryChannel::Reply, reply_token, messages)
            .await
    }

    async fn push(&self, to: &str, messages: &[Value]) -> Result<(), ChatApiError> {
        self.respond(ChatDeliveryChannel::Push, to, messages).await
    }
}

/// Handler that echoes payload text and records `<conversation>:<text>` once
/// each event finishes.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    seen: Mutex<Vec<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
    silent: Mutex<HashSet<String>>,
}

impl RecordingHandler {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().expect("seen").clone()
    }

    pub fn delay_text(&self, text: &str, delay: Duration) {
        self.delays
            .lock()
            .expect("delays")
            .insert(text.to_string(), delay);
    }

    pub fn fail_on_text(&self, text: &str) {
        self.failing.lock().expect("failing").insert(text.to_string());
    }

    pub fn silence_text(&self, text: &str) {
        self.silent.lock().expect("silent").insert(text.to_string());
    }
}

#[async_trait]
impl ChatEventHandler for RecordingHandler {
    async fn handle(&self, event: &ChatInboundEvent) -> anyhow::Result<Vec<ChatOutboundMessage>> {
        let text = event.payload_text().unwrap_or_default().to_string();
        let delay = self.delays.lock().expect("delays").get(&text).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.seen
            .lock()
            .expect("seen")
            .push(format!("{}:{text}", event.conversation_key()));
        if self.failing.lock().expect("failing").contains(&text) {
            bail!("handler rejected '{text}'");
        }
        if self.silent.lock().expect("silent").contains(&text) {
            return Ok(Vec::new());
        }
        Ok(vec![ChatOutboundMessage::text(format!("echo: {text}"))])
    }
}
