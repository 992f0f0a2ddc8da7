//! Wire types shared by the gateway: payload accessors for the incoming
//! request body, the chat-completion response envelopes, and SSE framing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SSE_DATA_PREFIX: &str = "data:";
pub const SSE_DONE_SENTINEL: &str = "[DONE]";

/// The request body is kept as a raw JSON object so pipeline stages can
/// mutate arbitrary keys. These accessors read the fields the gateway
/// itself cares about.
pub fn is_stream(payload: &Value) -> bool {
    payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn model_name(payload: &Value) -> &str {
    payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("default")
}

pub fn last_message_content(payload: &Value) -> Option<&str> {
    payload
        .get("messages")?
        .as_array()?
        .last()?
        .get("content")?
        .as_str()
}

pub fn completion_id() -> String {
    format!("chatcmpl-{:032x}", rand::random::<u128>())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String, // "chat.completion"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatCompletionMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: String, // always "assistant" for responses
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionStreamResponse {
    pub id: String,
    pub object: String, // "chat.completion.chunk"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatStreamChoice>,
    pub system_fingerprint: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamChoice {
    pub index: u32,
    pub delta: ChatMessageDelta,
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_filter_results: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Format one chunk as an SSE data line. Serialization of these envelopes
/// cannot realistically fail; if it ever does the chunk is logged and
/// skipped rather than aborting the stream.
pub fn sse_event(chunk: &ChatCompletionStreamResponse) -> Option<Bytes> {
    match serde_json::to_string(chunk) {
        Ok(json) => Some(Bytes::from(format!("data: {}\n\n", json))),
        Err(e) => {
            log::error!("failed to encode stream chunk: {}", e);
            None
        }
    }
}

pub fn sse_done() -> Bytes {
    Bytes::from("data: [DONE]\n\n")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_payload_accessors() {
        let payload = json!({
            "model": "m1",
            "stream": true,
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "user", "content": "last"},
            ],
        });
        assert!(is_stream(&payload));
        assert_eq!(model_name(&payload), "m1");
        assert_eq!(last_message_content(&payload), Some("last"));
    }

    #[test]
    fn test_payload_accessor_defaults() {
        let payload = json!({"messages": []});
        assert!(!is_stream(&payload));
        assert_eq!(model_name(&payload), "default");
        assert_eq!(last_message_content(&payload), None);
    }

    #[test]
    fn test_sse_event_framing() {
        let chunk = ChatCompletionStreamResponse {
            id: "chatcmpl-test".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 0,
            model: "m1".to_string(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta: ChatMessageDelta::default(),
                finish_reason: Some("stop".to_string()),
                content_filter_results: None,
            }],
            system_fingerprint: None,
            usage: None,
        };
        let bytes = sse_event(&chunk).unwrap();
        let line = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(line.starts_with("data: {"));
        assert!(line.ends_with("\n\n"));
        // empty delta must serialize as an empty object
        assert!(line.contains("\"delta\":{}"));
    }
}
