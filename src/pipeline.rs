//! The stage pipeline: an ordered chain of request/response transforms.
//!
//! Preprocessing applies stages in load order, postprocessing in the exact
//! reverse order, so the last stage to see the request is the first to see
//! the response. A failing stage is logged and treated as a no-op; it can
//! never abort the chain or the enclosing request.

use std::time::Instant;

use serde_json::Value;

/// Per-request context handed to every stage invocation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub stream: bool,
}

impl RequestContext {
    pub fn new(stream: bool) -> Self {
        RequestContext {
            request_id: format!("req-{:016x}", rand::random::<u64>()),
            stream,
        }
    }
}

/// One named unit of the pipeline. Implementations are built once at
/// startup and shared read-only across concurrent requests.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;
    fn preprocess(&self, payload: Value, ctx: &RequestContext) -> anyhow::Result<Value>;
    fn postprocess(&self, payload: Value, ctx: &RequestContext) -> anyhow::Result<Value>;
}

#[derive(Clone, Copy)]
enum Phase {
    Preprocess,
    Postprocess,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Preprocess => "preprocess",
            Phase::Postprocess => "postprocess",
        }
    }
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Pipeline { stages }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn run_preprocess(&self, mut payload: Value, ctx: &RequestContext) -> Value {
        log::info!(
            "[{}] preprocess chain [{} stages]",
            ctx.request_id,
            self.stages.len()
        );
        for stage in &self.stages {
            payload = self.run_stage(stage.as_ref(), Phase::Preprocess, payload, ctx);
        }
        payload
    }

    pub fn run_postprocess(&self, mut payload: Value, ctx: &RequestContext) -> Value {
        log::info!(
            "[{}] postprocess chain [{} stages]",
            ctx.request_id,
            self.stages.len()
        );
        for stage in self.stages.iter().rev() {
            payload = self.run_stage(stage.as_ref(), Phase::Postprocess, payload, ctx);
        }
        payload
    }

    fn run_stage(
        &self,
        stage: &dyn Stage,
        phase: Phase,
        payload: Value,
        ctx: &RequestContext,
    ) -> Value {
        let start = Instant::now();
        // keep the pre-attempt state so a failing stage becomes a no-op
        let kept = payload.clone();
        let outcome = match phase {
            Phase::Preprocess => stage.preprocess(payload, ctx),
            Phase::Postprocess => stage.postprocess(payload, ctx),
        };
        match outcome {
            Ok(next) => {
                log::info!(
                    "[{}] stage [{}] {} done ({:.2}ms)",
                    ctx.request_id,
                    stage.name(),
                    phase.label(),
                    start.elapsed().as_secs_f64() * 1000.0
                );
                next
            }
            Err(e) => {
                log::error!(
                    "[{}] stage [{}] {} failed: {:#}",
                    ctx.request_id,
                    stage.name(),
                    phase.label(),
                    e
                );
                kept
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    struct RecordingStage {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
        fail_preprocess: bool,
    }

    impl RecordingStage {
        fn boxed(
            name: &str,
            calls: Arc<Mutex<Vec<String>>>,
            fail_preprocess: bool,
        ) -> Box<dyn Stage> {
            Box::new(RecordingStage {
                name: name.to_string(),
                calls,
                fail_preprocess,
            })
        }
    }

    impl Stage for RecordingStage {
        fn name(&self) -> &str {
            &self.name
        }

        fn preprocess(&self, mut payload: Value, _ctx: &RequestContext) -> anyhow::Result<Value> {
            self.calls.lock().unwrap().push(format!("{}:pre", self.name));
            if self.fail_preprocess {
                anyhow::bail!("stage exploded");
            }
            payload["trace"]
                .as_array_mut()
                .unwrap()
                .push(json!(self.name));
            Ok(payload)
        }

        fn postprocess(&self, payload: Value, _ctx: &RequestContext) -> anyhow::Result<Value> {
            self.calls.lock().unwrap().push(format!("{}:post", self.name));
            Ok(payload)
        }
    }

    #[test]
    fn test_postprocess_order_is_reverse_of_preprocess_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            RecordingStage::boxed("a", calls.clone(), false),
            RecordingStage::boxed("b", calls.clone(), false),
            RecordingStage::boxed("c", calls.clone(), false),
        ]);
        let ctx = RequestContext::new(false);

        pipeline.run_preprocess(json!({"trace": []}), &ctx);
        pipeline.run_postprocess(json!({"trace": []}), &ctx);

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec!["a:pre", "b:pre", "c:pre", "c:post", "b:post", "a:post"]
        );
    }

    #[test]
    fn test_failing_stage_is_a_no_op_and_chain_continues() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            RecordingStage::boxed("a", calls.clone(), false),
            RecordingStage::boxed("b", calls.clone(), true),
            RecordingStage::boxed("c", calls.clone(), false),
        ]);
        let ctx = RequestContext::new(false);

        let out = pipeline.run_preprocess(json!({"trace": []}), &ctx);

        // b was attempted but its effect discarded; a and c both applied
        assert_eq!(out["trace"], json!(["a", "c"]));
        assert_eq!(*calls.lock().unwrap(), vec!["a:pre", "b:pre", "c:pre"]);
    }

    #[test]
    fn test_empty_pipeline_passes_payload_through() {
        let pipeline = Pipeline::new(Vec::new());
        let ctx = RequestContext::new(false);
        let payload = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(pipeline.run_preprocess(payload.clone(), &ctx), payload);
        assert_eq!(pipeline.run_postprocess(payload.clone(), &ctx), payload);
    }
}
