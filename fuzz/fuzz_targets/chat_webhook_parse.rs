#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_chat::{chat_debounce_key, chat_event_dedupe_key, parse_chat_webhook_batch};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let Ok(events) = parse_chat_webhook_batch(&raw) else {
        return;
    };
    for event in events {
        let conversation_key = event.conversation_key();
        assert!(!conversation_key.is_empty());
        assert!(!chat_event_dedupe_key(&event).is_empty());
        if let Some(text) = event.payload_text() {
            assert!(chat_debounce_key(&conversation_key, text).starts_with("debounce:"));
        }
    }
});
