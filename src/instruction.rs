//! Control-instruction detection and response fabrication.
//!
//! A message whose content starts with `/` followed by a known command is a
//! control directive for the gateway itself, not conversational content.
//! Detection is closed over a fixed command table; anything else starting
//! with `/` is ordinary user text and passes through untouched.

use bytes::Bytes;
use serde_json::json;

use crate::io_struct::{
    ChatChoice, ChatCompletionMessage, ChatCompletionResponse, ChatCompletionStreamResponse,
    ChatMessageDelta, ChatStreamChoice, completion_id, sse_done, sse_event,
};

pub const INSTRUCTION_PREFIX: char = '/';

const COMMANDS: &[(&str, &str)] = &[(
    "/skip",
    "Message intercepted; nothing was sent to the upstream API",
)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub command: String,
    pub extra_info: String,
    pub result: String,
    pub skip_api: bool,
}

/// Parse a message as a control instruction. Returns `None` for plain text,
/// unknown commands, an empty message, or a bare prefix.
pub fn detect(message_text: &str) -> Option<Instruction> {
    let trimmed = message_text.trim();
    if !trimmed.starts_with(INSTRUCTION_PREFIX) {
        return None;
    }
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next()?;
    let extra_info = parts.next().unwrap_or("").trim_start();
    let result = COMMANDS.iter().find(|(c, _)| *c == command)?.1;
    Some(Instruction {
        command: command.to_string(),
        extra_info: extra_info.to_string(),
        result: result.to_string(),
        skip_api: true,
    })
}

fn describe(instruction: &Instruction) -> String {
    json!({
        "instruction": instruction.command,
        "result": instruction.result,
        "extra_info": instruction.extra_info,
    })
    .to_string()
}

/// Fabricate the non-streaming response for an intercepted instruction,
/// matching the upstream's single-message response shape.
pub fn static_response(instruction: &Instruction, model: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp() as u64,
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatCompletionMessage {
                role: "assistant".to_string(),
                content: describe(instruction),
            },
            finish_reason: Some("stop".to_string()),
        }],
        system_fingerprint: None,
        usage: None,
    }
}

/// Fabricate the streaming event sequence for an intercepted instruction:
/// a role-declaration chunk, one content chunk per fragment of the
/// description, a finish chunk with an empty delta, and the `[DONE]`
/// sentinel. All chunks share one id, timestamp, and model.
pub fn stream_events(instruction: &Instruction, model: &str) -> Vec<Bytes> {
    let id = completion_id();
    let created = chrono::Utc::now().timestamp() as u64;
    let text = describe(instruction);

    let mut events = Vec::new();
    let mut push = |delta: ChatMessageDelta, finish_reason: Option<&str>| {
        let chunk = ChatCompletionStreamResponse {
            id: id.clone(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
                content_filter_results: Some(json!({})),
            }],
            system_fingerprint: None,
            usage: None,
        };
        if let Some(bytes) = sse_event(&chunk) {
            events.push(bytes);
        }
    };

    push(
        ChatMessageDelta {
            role: Some("assistant".to_string()),
            ..Default::default()
        },
        None,
    );
    for fragment in text.split_inclusive(' ') {
        push(
            ChatMessageDelta {
                content: Some(fragment.to_string()),
                ..Default::default()
            },
            None,
        );
    }
    push(ChatMessageDelta::default(), Some("stop"));
    events.push(sse_done());
    events
}
