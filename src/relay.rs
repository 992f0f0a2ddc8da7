//! The streaming relay: consumes the upstream event stream line by line,
//! forwards every line to the client as soon as it is complete, accumulates
//! the incremental content and reasoning fragments, and runs the pipeline's
//! postprocess chain exactly once when the stream terminates, whether via
//! the `[DONE]` sentinel, upstream EOF, or client disconnection.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt, channel::mpsc::UnboundedSender};
use serde_json::{Value, json};

use crate::io_struct::{SSE_DATA_PREFIX, SSE_DONE_SENTINEL};
use crate::pipeline::{Pipeline, RequestContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Streaming,
    Done,
    Disconnected,
}

/// Reassembles complete lines out of the upstream's raw byte chunks.
/// A chunk that fails UTF-8 decoding is dropped; the relay carries on.
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        LineBuffer {
            pending: String::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> bool {
        match std::str::from_utf8(chunk) {
            Ok(text) => {
                self.pending.push_str(text);
                true
            }
            Err(e) => {
                log::warn!("dropping undecodable stream chunk: {}", e);
                false
            }
        }
    }

    /// The next complete line, including its newline, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.find('\n')?;
        Some(self.pending.drain(..=pos).collect())
    }

    pub fn take_remaining(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request accumulation state for one streamed upstream response.
pub struct RelaySession {
    content: String,
    reasoning: String,
    reasoning_opened: bool,
    reasoning_closed: bool,
    state: RelayState,
}

impl RelaySession {
    pub fn new() -> Self {
        RelaySession {
            content: String::new(),
            reasoning: String::new(),
            reasoning_opened: false,
            reasoning_closed: false,
            state: RelayState::Streaming,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Inspect one complete raw line. Returns `false` once the sentinel has
    /// been seen and no further input should be consumed. Parse failures
    /// are logged and never stop the caller from forwarding the line.
    pub fn scan_line(&mut self, line: &str) -> bool {
        let Some(data) = line.strip_prefix(SSE_DATA_PREFIX) else {
            return true;
        };
        let data = data.trim();
        if data.is_empty() {
            return true;
        }
        if data == SSE_DONE_SENTINEL {
            self.state = RelayState::Done;
            return false;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(event) => self.ingest_event(&event),
            Err(e) => log::warn!("unparsable stream event: {}", e),
        }
        true
    }

    fn ingest_event(&mut self, event: &Value) {
        let Some(delta) = event.pointer("/choices/0/delta") else {
            log::warn!("stream event without choices[0].delta");
            return;
        };
        let reasoning = delta
            .get("reasoning_content")
            .and_then(Value::as_str)
            .unwrap_or("");
        let content = delta.get("content").and_then(Value::as_str).unwrap_or("");

        if !reasoning.is_empty() {
            if !self.reasoning_opened {
                echo("<think>\n");
                self.reasoning_opened = true;
            }
            echo(reasoning);
            self.reasoning.push_str(reasoning);
        } else if !self.reasoning_closed && !self.reasoning.is_empty() {
            echo("\n</think>\n");
            self.reasoning_closed = true;
        }
        if !content.is_empty() {
            echo(content);
            self.content.push_str(content);
        }
    }

    /// Client went away; terminal unless the sentinel already arrived.
    pub fn disconnected(&mut self) {
        if self.state == RelayState::Streaming {
            self.state = RelayState::Disconnected;
        }
    }

    /// Upstream EOF without a sentinel still terminates the session.
    pub fn finish(&mut self) {
        if self.state == RelayState::Streaming {
            self.state = RelayState::Done;
        }
    }
}

impl Default for RelaySession {
    fn default() -> Self {
        Self::new()
    }
}

// operator-facing incremental echo of the stream, interleaving reasoning
// inside <think> tags; display only
fn echo(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

/// Drive one streaming request to a terminal state. Every complete line is
/// forwarded verbatim through `tx` the moment it is available; a failed
/// send means the client disconnected, which stops the relay without
/// touching the upstream again. Postprocessing runs exactly once on the
/// accumulated content, whichever way the session terminated.
pub async fn relay_stream<S, E>(
    mut upstream: S,
    tx: UnboundedSender<Result<Bytes, actix_web::Error>>,
    pipeline: Arc<Pipeline>,
    original_request: Value,
    ctx: RequestContext,
) -> RelaySession
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut session = RelaySession::new();
    let mut buffer = LineBuffer::new();

    'read: while let Some(chunk) = upstream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                log::error!("[{}] upstream stream failed: {}", ctx.request_id, e);
                break 'read;
            }
        };
        if !buffer.push_chunk(&chunk) {
            continue;
        }
        while let Some(line) = buffer.next_line() {
            let keep_reading = session.scan_line(&line);
            if tx.unbounded_send(Ok(Bytes::from(line))).is_err() {
                session.disconnected();
                log::info!("[{}] client disconnected, stopping relay", ctx.request_id);
                break 'read;
            }
            if !keep_reading {
                break 'read;
            }
        }
    }

    // a final line may arrive without a trailing newline
    if session.state() == RelayState::Streaming {
        if let Some(rest) = buffer.take_remaining() {
            session.scan_line(&rest);
            let _ = tx.unbounded_send(Ok(Bytes::from(rest)));
        }
    }
    session.finish();
    drop(upstream);
    drop(tx);

    log::info!(
        "[{}] stream relay finished ({:?}, {} bytes of content)",
        ctx.request_id,
        session.state(),
        session.content().len()
    );

    let payload = json!({
        "type": "stream",
        "original_request": original_request,
        "response": session.content(),
    });
    pipeline.run_postprocess(payload, &ctx);
    session
}
