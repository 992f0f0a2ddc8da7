//! Gateway state and the per-request dispatch orchestration: preprocess,
//! instruction interception, upstream dispatch, relay/postprocess.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use actix_web::HttpResponse;
use bytes::Bytes;
use futures::{Stream, channel::mpsc};
use serde_json::{Value, json};

use crate::instruction;
use crate::io_struct;
use crate::pipeline::{Pipeline, RequestContext};
use crate::relay;

const SERVICE_UNAVAILABLE_DETAIL: &str = "The upstream service is temporarily unavailable";

/// Body of a successful upstream reply: one buffered payload for static
/// requests, a lazy chunk stream for streaming ones.
pub enum UpstreamBody {
    Full(Bytes),
    Stream(Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub upstream_url: String,
    pub api_key: Option<String>,
    pub timeout: u64,
}

#[derive(Clone)]
pub struct GatewayState {
    pub pipeline: Arc<Pipeline>,
    pub client: reqwest::Client,
    pub config: GatewayConfig,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, pipeline: Pipeline) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()?;
        Ok(GatewayState {
            pipeline: Arc::new(pipeline),
            client,
            config,
        })
    }

    /// One request lifecycle: preprocess, intercept-or-dispatch, relay or
    /// postprocess, respond.
    pub async fn dispatch(&self, payload: Value) -> Result<HttpResponse, actix_web::Error> {
        let ctx = RequestContext::new(io_struct::is_stream(&payload));
        log::info!(
            "[{}] received {} request",
            ctx.request_id,
            if ctx.stream { "stream" } else { "static" }
        );
        log::debug!(
            "[{}] request body:\n{}",
            ctx.request_id,
            serde_json::to_string_pretty(&payload).unwrap_or_default()
        );

        let original_request = payload.clone();
        let processed = self.pipeline.run_preprocess(payload, &ctx);

        if let Some(instruction) =
            io_struct::last_message_content(&processed).and_then(instruction::detect)
        {
            log::info!(
                "[{}] intercepted instruction [{}], skipping upstream dispatch",
                ctx.request_id,
                instruction.command
            );
            return Ok(fabricate(&instruction, &processed));
        }

        let stream = io_struct::is_stream(&processed);
        match self.route_upstream(&processed, stream).await? {
            UpstreamBody::Stream(upstream) => {
                let (tx, rx) = mpsc::unbounded();
                let pipeline = self.pipeline.clone();
                actix_web::rt::spawn(relay::relay_stream(
                    upstream,
                    tx,
                    pipeline,
                    original_request,
                    ctx,
                ));
                Ok(HttpResponse::Ok()
                    .content_type("text/event-stream")
                    .streaming(rx))
            }
            UpstreamBody::Full(body) => {
                let response_data: Value = serde_json::from_slice(&body).map_err(|e| {
                    log::error!("[{}] unparsable upstream response: {}", ctx.request_id, e);
                    actix_web::error::ErrorServiceUnavailable(SERVICE_UNAVAILABLE_DETAIL)
                })?;
                log::info!(
                    "[{}] static response ({} bytes)",
                    ctx.request_id,
                    body.len()
                );
                log::debug!(
                    "[{}] response body:\n{}",
                    ctx.request_id,
                    serde_json::to_string_pretty(&response_data).unwrap_or_default()
                );
                let post = self.pipeline.run_postprocess(
                    json!({
                        "type": "static",
                        "original_request": original_request,
                        "response": response_data,
                    }),
                    &ctx,
                );
                let client_body = post.get("response").cloned().unwrap_or(Value::Null);
                Ok(HttpResponse::Ok().json(client_body))
            }
        }
    }

    async fn route_upstream(
        &self,
        payload: &Value,
        stream: bool,
    ) -> Result<UpstreamBody, actix_web::Error> {
        let mut request = self.client.post(&self.config.upstream_url).json(payload);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await.map_err(|e| {
            log::error!("upstream connection failed: {}", e);
            actix_web::error::ErrorServiceUnavailable(SERVICE_UNAVAILABLE_DETAIL)
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            log::error!("upstream API error: {} - {}", status, body);
            return Err(actix_web::error::ErrorServiceUnavailable(
                SERVICE_UNAVAILABLE_DETAIL,
            ));
        }
        if stream {
            Ok(UpstreamBody::Stream(Box::pin(resp.bytes_stream())))
        } else {
            let bytes = resp.bytes().await.map_err(|e| {
                log::error!("failed to read upstream response: {}", e);
                actix_web::error::ErrorServiceUnavailable(SERVICE_UNAVAILABLE_DETAIL)
            })?;
            Ok(UpstreamBody::Full(bytes))
        }
    }
}

fn fabricate(instruction: &instruction::Instruction, processed: &Value) -> HttpResponse {
    let model = io_struct::model_name(processed);
    if io_struct::is_stream(processed) {
        let events = instruction::stream_events(instruction, model);
        let body = futures::stream::iter(events.into_iter().map(Ok::<_, actix_web::Error>));
        HttpResponse::Ok()
            .content_type("text/event-stream")
            .streaming(body)
    } else {
        HttpResponse::Ok().json(instruction::static_response(instruction, model))
    }
}
