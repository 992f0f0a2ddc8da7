//! Built-in pipeline stages. Stage ordering is declared here explicitly;
//! the list handed to `Pipeline::new` is the load order.

use serde_json::Value;

use crate::instruction;
use crate::io_struct;
use crate::pipeline::{RequestContext, Stage};

pub fn default_stages() -> Vec<Box<dyn Stage>> {
    vec![Box::new(InstructionRemove)]
}

/// Strips stale control messages from the conversation history so they
/// never reach the upstream model. A live instruction in the final message
/// is left alone for the dispatcher to intercept.
pub struct InstructionRemove;

impl Stage for InstructionRemove {
    fn name(&self) -> &str {
        "instruction_remove"
    }

    fn preprocess(&self, mut payload: Value, ctx: &RequestContext) -> anyhow::Result<Value> {
        let live = io_struct::last_message_content(&payload)
            .and_then(instruction::detect)
            .is_some();
        if live {
            log::info!(
                "[{}] [instruction_remove] final message is an instruction, leaving it for interception",
                ctx.request_id
            );
            return Ok(payload);
        }

        if let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) {
            let before = messages.len();
            messages.retain(|message| {
                let stale = message
                    .get("content")
                    .and_then(Value::as_str)
                    .and_then(instruction::detect)
                    .is_some();
                if stale {
                    log::info!(
                        "[{}] [instruction_remove] dropping stale control message: {}",
                        ctx.request_id,
                        message
                    );
                }
                !stale
            });
            let dropped = before - messages.len();
            if dropped > 0 {
                log::info!(
                    "[{}] [instruction_remove] removed {} stale control message(s)",
                    ctx.request_id,
                    dropped
                );
            }
        }
        Ok(payload)
    }

    fn postprocess(&self, payload: Value, _ctx: &RequestContext) -> anyhow::Result<Value> {
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn run_preprocess(payload: Value) -> Value {
        let ctx = RequestContext::new(false);
        InstructionRemove.preprocess(payload, &ctx).unwrap()
    }

    #[test]
    fn test_stale_instructions_are_removed() {
        let out = run_preprocess(json!({
            "messages": [
                {"role": "user", "content": "/skip old question"},
                {"role": "user", "content": "what is rust?"},
            ],
        }));
        assert_eq!(
            out["messages"],
            json!([{"role": "user", "content": "what is rust?"}])
        );
    }

    #[test]
    fn test_live_instruction_is_left_in_place() {
        let payload = json!({
            "messages": [
                {"role": "user", "content": "/skip old question"},
                {"role": "user", "content": "/skip now"},
            ],
        });
        assert_eq!(run_preprocess(payload.clone()), payload);
    }

    #[test]
    fn test_unknown_slash_text_is_kept() {
        let payload = json!({
            "messages": [
                {"role": "user", "content": "/unknown thing"},
                {"role": "user", "content": "hello"},
            ],
        });
        assert_eq!(run_preprocess(payload.clone()), payload);
    }
}
