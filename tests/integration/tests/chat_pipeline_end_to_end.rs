use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use httpmock::prelude::*;
use parley_chat::{
    parse_chat_webhook_batch, ChatCommandRouter, ChatDeliveryConfig, ChatEventHandler,
    ChatEventProcessor, ChatInboundEvent, ChatOutboundMessage, ChatPipelineConfig, FaqCatalog,
    LineMessagingClient, LineMessagingConfig,
};
use parley_store::{InMemoryKvStore, KvStore, SqliteKvStore};
use serde_json::{json, Value};
use tempfile::tempdir;

fn fast_pipeline_config() -> ChatPipelineConfig {
    ChatPipelineConfig {
        delivery: ChatDeliveryConfig {
            base_backoff_ms: 10,
            max_backoff_ms: 40,
            call_timeout_ms: 2_000,
            ..ChatDeliveryConfig::default()
        },
        ..ChatPipelineConfig::default()
    }
}

fn client_for(server: &MockServer) -> Arc<LineMessagingClient> {
    Arc::new(
        LineMessagingClient::new(LineMessagingConfig {
            api_base: server.base_url(),
            access_token: "integration-token".to_string(),
            http_timeout_ms: 2_000,
        })
        .expect("messaging client"),
    )
}

fn faq_router() -> Arc<ChatCommandRouter> {
    let catalog = FaqCatalog::from_json_str(
        r#"{
            "topics": [
                { "id": "hours", "title": "Opening hours", "keywords": ["hours"],
                  "answer": "We are open 9-18." },
                { "id": "parking", "title": "Parking", "keywords": ["parking"],
                  "answer": "Parking is behind the building." }
            ]
        }"#,
    )
    .expect("catalog");
    Arc::new(ChatCommandRouter::new(catalog))
}

fn webhook_body(events: Vec<Value>) -> String {
    json!({ "destination": "Ubot", "events": events }).to_string()
}

fn message(event_id: &str, source: Value, text: &str) -> Value {
    json!({
        "type": "message",
        "webhookEventId": event_id,
        "deliveryContext": { "isRedelivery": false },
        "timestamp": 1_760_000_000_000u64,
        "source": source,
        "replyToken": format!("reply-{event_id}"),
        "message": { "type": "text", "id": format!("m-{event_id}"), "text": text }
    })
}

fn user(user_id: &str) -> Value {
    json!({ "type": "user", "userId": user_id })
}

struct OrderRecordingHandler {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl ChatEventHandler for OrderRecordingHandler {
    async fn handle(&self, event: &ChatInboundEvent) -> anyhow::Result<Vec<ChatOutboundMessage>> {
        let text = event.payload_text().unwrap_or_default().to_string();
        if text.ends_with("slow") {
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        self.seen
            .lock()
            .expect("seen")
            .push(format!("{}:{text}", event.conversation_key()));
        Ok(vec![ChatOutboundMessage::text(format!("ack {text}"))])
    }
}

#[tokio::test]
async fn integration_redelivered_and_duplicate_events_reply_once() {
    let server = MockServer::start();
    let reply = server.mock(|when, then| {
        when.method(POST)
            .path("/v2/bot/message/reply")
            .header("authorization", "Bearer integration-token")
            .json_body_includes(r#"{ "replyToken": "reply-evt-1" }"#);
        then.status(200).json_body(json!({}));
    });
    let mut redelivered = message("evt-1", user("U1"), "hours");
    redelivered["deliveryContext"]["isRedelivery"] = json!(true);
    let events = parse_chat_webhook_batch(&webhook_body(vec![
        message("evt-1", user("U1"), "hours"),
        message("evt-1", user("U1"), "hours"),
        redelivered,
    ]))
    .expect("batch");

    let processor = ChatEventProcessor::new(
        fast_pipeline_config(),
        Arc::new(InMemoryKvStore::new()),
        client_for(&server),
        faq_router(),
    );
    let summary = processor.process_batch(events).await;
    assert_eq!(summary.received, 3);
    assert_eq!(summary.duplicates, 2);
    assert_eq!(summary.delivered, 1);
    reply.assert_calls(1);
}

#[tokio::test]
async fn integration_shared_sqlite_store_deduplicates_across_processors() {
    let server = MockServer::start();
    let reply = server.mock(|when, then| {
        when.method(POST).path("/v2/bot/message/reply");
        then.status(200).json_body(json!({}));
    });
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("admission.sqlite");
    let first_store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::new(&path).expect("store a"));
    let second_store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::new(&path).expect("store b"));
    let first = ChatEventProcessor::new(
        fast_pipeline_config(),
        first_store,
        client_for(&server),
        faq_router(),
    );
    let second = ChatEventProcessor::new(
        fast_pipeline_config(),
        second_store,
        client_for(&server),
        faq_router(),
    );
    let body = webhook_body(vec![message("evt-shared", user("U1"), "parking")]);

    let summary = first
        .process_batch(parse_chat_webhook_batch(&body).expect("batch"))
        .await;
    assert_eq!(summary.delivered, 1);
    let summary = second
        .process_batch(parse_chat_webhook_batch(&body).expect("batch"))
        .await;
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.dispatched, 0);
    reply.assert_calls(1);
    assert_eq!(second.readiness().await.store_backend, "sqlite");
}

#[tokio::test]
async fn integration_each_conversation_is_handled_in_arrival_order() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v2/bot/message/reply");
        then.status(200).json_body(json!({}));
    });
    let handler = Arc::new(OrderRecordingHandler {
        seen: Mutex::new(Vec::new()),
    });
    let processor = ChatEventProcessor::new(
        fast_pipeline_config(),
        Arc::new(InMemoryKvStore::new()),
        client_for(&server),
        handler.clone(),
    );
    let events = parse_chat_webhook_batch(&webhook_body(vec![
        message("e1", user("A"), "first slow"),
        message("e2", user("B"), "other"),
        message("e3", user("A"), "second"),
        message("e4", user("A"), "third slow"),
        message("e5", user("A"), "fourth"),
    ]))
    .expect("batch");
    let summary = processor.process_batch(events).await;
    assert_eq!(summary.delivered, 5);

    let lane_a = handler
        .seen
        .lock()
        .expect("seen")
        .iter()
        .filter(|entry| entry.starts_with("user:A:"))
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(
        lane_a,
        vec![
            "user:A:first slow",
            "user:A:second",
            "user:A:third slow",
            "user:A:fourth"
        ]
    );
}

#[tokio::test]
async fn integration_group_conversation_gets_no_push_fallback() {
    let server = MockServer::start();
    let reply = server.mock(|when, then| {
        when.method(POST).path("/v2/bot/message/reply");
        then.status(410).json_body(json!({ "message": "expired" }));
    });
    let push = server.mock(|when, then| {
        when.method(POST).path("/v2/bot/message/push");
        then.status(200).json_body(json!({}));
    });
    let processor = ChatEventProcessor::new(
        fast_pipeline_config(),
        Arc::new(InMemoryKvStore::new()),
        client_for(&server),
        faq_router(),
    );
    let events = parse_chat_webhook_batch(&webhook_body(vec![message(
        "evt-g",
        json!({ "type": "group", "groupId": "G1", "userId": "U1" }),
        "hours",
    )]))
    .expect("batch");
    let summary = processor.process_batch(events).await;
    assert_eq!(summary.delivery_failed, 1);
    assert_eq!(summary.fallback_used, 0);
    reply.assert_calls(1);
    push.assert_calls(0);
}

#[tokio::test]
async fn integration_server_errors_are_retried_until_budget_is_spent() {
    let server = MockServer::start();
    let reply = server.mock(|when, then| {
        when.method(POST).path("/v2/bot/message/reply");
        then.status(503).json_body(json!({ "message": "unavailable" }));
    });
    let processor = ChatEventProcessor::new(
        fast_pipeline_config(),
        Arc::new(InMemoryKvStore::new()),
        client_for(&server),
        faq_router(),
    );
    let events = parse_chat_webhook_batch(&webhook_body(vec![message(
        "evt-5xx",
        user("U1"),
        "hours",
    )]))
    .expect("batch");
    let summary = processor.process_batch(events).await;
    assert_eq!(summary.delivery_failed, 1);
    reply.assert_calls(4);
    assert_eq!(processor.counters().snapshot().delivery_failed, 1);
}

#[tokio::test]
async fn integration_fallback_menu_without_topics_sends_no_quick_reply() {
    let server = MockServer::start();
    let reply = server.mock(|when, then| {
        when.method(POST)
            .path("/v2/bot/message/reply")
            .json_body(json!({
                "replyToken": "reply-evt-menu",
                "messages": [{
                    "type": "text",
                    "text": "Sorry, I did not catch that. Here is what I can help with:"
                }]
            }));
        then.status(200).json_body(json!({}));
    });
    let processor = ChatEventProcessor::new(
        fast_pipeline_config(),
        Arc::new(InMemoryKvStore::new()),
        client_for(&server),
        Arc::new(ChatCommandRouter::new(FaqCatalog::default())),
    );
    let events = parse_chat_webhook_batch(&webhook_body(vec![message(
        "evt-menu",
        user("U1"),
        "something unrelated",
    )]))
    .expect("batch");
    let summary = processor.process_batch(events).await;
    assert_eq!(summary.delivered, 1);
    reply.assert_calls(1);
}
