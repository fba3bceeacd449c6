use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::backend::{ChunkStream, InferenceBackend, Opened, RawChunk};
use crate::dialect::{openai, parse_chunk, Dialect};
use crate::error::InferenceError;
use crate::events::StreamEvent;
use crate::request::{build_body, BodyOptions};
use crate::sse::SseReassembler;
use crate::types::{InferenceRequest, Target, TargetSpec, Usage, UsageAccumulator};

/// Per-worker timing knobs, copied out of `FanOutConfig`.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub read_timeout: Duration,
    pub partial_delay: Duration,
    pub anthropic_version: String,
}

/// What a successful run produced.
#[derive(Debug)]
struct Outcome {
    text: String,
    usage: Option<Usage>,
    streamed: bool,
}

/// Drives one target from request construction to its terminal event.
/// Owns its connection and usage counters; shares only the event channel.
pub(crate) struct TargetWorker {
    target: Target,
    backend: Arc<dyn InferenceBackend>,
    events: UnboundedSender<StreamEvent>,
    settings: WorkerSettings,
}

impl TargetWorker {
    pub fn new(
        target: Target,
        backend: Arc<dyn InferenceBackend>,
        events: UnboundedSender<StreamEvent>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            target,
            backend,
            events,
            settings,
        }
    }

    /// Always sends exactly one terminal event, whatever happens.
    pub async fn run(self, request: Arc<InferenceRequest>) {
        let started = Instant::now();
        let terminal = match self.execute(&request).await {
            Ok(outcome) => {
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                info!(
                    target_id = %self.target.id,
                    duration_ms,
                    chars = outcome.text.len(),
                    streamed = outcome.streamed,
                    "target complete"
                );
                StreamEvent::Complete {
                    target_id: self.target.id.clone(),
                    full_text: outcome.text,
                    usage: outcome.usage,
                    duration_ms,
                    streamed: outcome.streamed,
                }
            }
            Err(e) => {
                warn!(target_id = %self.target.id, error = %e, "target failed");
                StreamEvent::Error {
                    target_id: self.target.id.clone(),
                    message: self.describe(&e),
                }
            }
        };
        let _ = self.events.send(terminal);
    }

    /// Allows exactly one retry, and only for a `max_tokens` that does not
    /// fit the context window.
    async fn execute(&self, request: &InferenceRequest) -> Result<Outcome, InferenceError> {
        match self.attempt(request, request.max_tokens).await {
            Err(e) => {
                let Some(overflow) = e.context_overflow() else {
                    return Err(e);
                };
                let allowed = overflow.allowed_max_tokens().ok_or(InferenceError::ContextExhausted {
                    limit: overflow.limit,
                    input: overflow.input,
                })?;
                info!(
                    target_id = %self.target.id,
                    requested = request.max_tokens,
                    allowed,
                    "max_tokens exceeds context window, retrying once"
                );
                self.attempt(request, allowed).await
            }
            ok => ok,
        }
    }

    async fn attempt(&self, request: &InferenceRequest, max_tokens: u32) -> Result<Outcome, InferenceError> {
        let spec = &self.target.spec;

        if let TargetSpec::SageMaker {
            stream_supported: false,
            ..
        } = spec
        {
            return self.invoke_whole(request, max_tokens).await;
        }

        let body = build_body(&self.target, request, self.body_options(max_tokens, true));
        debug!(target_id = %self.target.id, max_tokens, "opening stream");

        let opened = match self.bounded(self.backend.open_stream(spec, &body)).await {
            Ok(opened) => opened,
            Err(InferenceError::StreamingUnsupported(reason)) if spec.is_sse() => {
                info!(target_id = %self.target.id, %reason, "streaming refused, falling back");
                return self.invoke_whole(request, max_tokens).await;
            }
            Err(e) => return Err(e),
        };

        match opened {
            Opened::Whole(response) => {
                info!(target_id = %self.target.id, "backend answered without streaming");
                Ok(whole_outcome(&response))
            }
            Opened::Stream(stream) => self.consume(stream, spec.dialect()).await,
        }
    }

    async fn invoke_whole(&self, request: &InferenceRequest, max_tokens: u32) -> Result<Outcome, InferenceError> {
        let body = build_body(&self.target, request, self.body_options(max_tokens, false));
        let response = self.bounded(self.backend.invoke(&self.target.spec, &body)).await?;
        Ok(whole_outcome(&response))
    }

    /// Connecting and whole-response calls get the same limit as a single read.
    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, InferenceError>>,
    ) -> Result<T, InferenceError> {
        tokio::time::timeout(self.settings.read_timeout, call)
            .await
            .map_err(|_| InferenceError::Timeout(self.settings.read_timeout))?
    }

    async fn consume(&self, mut stream: ChunkStream, dialect: Dialect) -> Result<Outcome, InferenceError> {
        let mut state = StreamState::default();
        let mut sse = SseReassembler::new();

        loop {
            let next = tokio::time::timeout(self.settings.read_timeout, stream.next())
                .await
                .map_err(|_| InferenceError::Timeout(self.settings.read_timeout))?;
            let Some(chunk) = next else { break };
            match chunk? {
                RawChunk::Sse(bytes) => {
                    for payload in sse.add_bytes(&bytes) {
                        self.apply(&mut state, dialect, payload.as_bytes()).await;
                    }
                }
                RawChunk::Event(bytes) => self.apply(&mut state, dialect, &bytes).await,
            }
        }

        for payload in sse.flush() {
            self.apply(&mut state, dialect, payload.as_bytes()).await;
        }

        if !state.finished {
            debug!(target_id = %self.target.id, "stream ended without a final marker");
        }

        Ok(Outcome {
            text: state.text,
            usage: state.usage.finalize(),
            streamed: true,
        })
    }

    /// Parse one payload and emit a partial for any new text. A payload that
    /// is not JSON is skipped; the rest of the stream is still good.
    async fn apply(&self, state: &mut StreamState, dialect: Dialect, payload: &[u8]) {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        let chunk: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(
                    target_id = %self.target.id,
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "skipping malformed chunk"
                );
                return;
            }
        };

        let delta = parse_chunk(dialect, &chunk);
        state.usage.merge(delta.usage);
        state.finished |= delta.is_final;
        if delta.text.is_empty() {
            return;
        }

        state.text.push_str(&delta.text);
        let _ = self.events.send(StreamEvent::Partial {
            target_id: self.target.id.clone(),
            text_delta: delta.text,
            accumulated_text: state.text.clone(),
        });

        // Let the consumer flush this token before the next chunk is read.
        if self.settings.partial_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.settings.partial_delay).await;
        }
    }

    fn body_options(&self, max_tokens: u32, stream: bool) -> BodyOptions<'_> {
        BodyOptions {
            max_tokens,
            stream,
            anthropic_version: &self.settings.anthropic_version,
        }
    }

    /// Turn an error into the message the caller sees.
    fn describe(&self, err: &InferenceError) -> String {
        if self.target.registry_backed && err.looks_like_startup() {
            return format!(
                "Model {} is still starting up, please retry in a few moments",
                self.target.id
            );
        }
        match err {
            InferenceError::Request(msg) => format!("Connection to {} failed: {msg}", self.target.id),
            other => other.to_string(),
        }
    }
}

#[derive(Default)]
struct StreamState {
    text: String,
    usage: UsageAccumulator,
    finished: bool,
}

fn whole_outcome(response: &serde_json::Value) -> Outcome {
    let (text, usage) = openai::parse_completion(response);
    let mut acc = UsageAccumulator::default();
    acc.merge(usage);
    Outcome {
        text,
        usage: acc.finalize(),
        streamed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BedrockDialect, TargetRef};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use tokio::sync::{mpsc, Mutex};

    type Script = Result<Opened, InferenceError>;

    /// Scripted backend: pops one response per call and records every body.
    struct MockBackend {
        opens: Mutex<VecDeque<Script>>,
        invokes: Mutex<VecDeque<Result<Value, InferenceError>>>,
        seen: Mutex<Vec<Value>>,
    }

    impl MockBackend {
        fn new(opens: Vec<Script>) -> Self {
            Self {
                opens: Mutex::new(opens.into()),
                invokes: Mutex::new(VecDeque::new()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn with_invokes(self, invokes: Vec<Result<Value, InferenceError>>) -> Self {
            Self {
                invokes: Mutex::new(invokes.into()),
                ..self
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for MockBackend {
        async fn open_stream(&self, _: &TargetSpec, body: &Value) -> Result<Opened, InferenceError> {
            self.seen.lock().await.push(body.clone());
            self.opens
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(InferenceError::Request("no more mock streams".into())))
        }

        async fn invoke(&self, _: &TargetSpec, body: &Value) -> Result<Value, InferenceError> {
            self.seen.lock().await.push(body.clone());
            self.invokes
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(InferenceError::Request("no more mock responses".into())))
        }
    }

    fn events(chunks: Vec<RawChunk>) -> Script {
        Ok(Opened::Stream(
            futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
        ))
    }

    fn sse(text: &str) -> RawChunk {
        RawChunk::Sse(Bytes::from(text.to_string()))
    }

    fn event(value: Value) -> RawChunk {
        RawChunk::Event(Bytes::from(value.to_string()))
    }

    fn http_target(registry_backed: bool) -> Target {
        Target {
            id: "ec2-qwen".into(),
            spec: TargetSpec::HttpCompatible {
                base_url: "http://10.0.0.9:8000".into(),
                model_name: "Qwen/Qwen2-7B".into(),
            },
            supports_multimodal: true,
            registry_backed,
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            read_timeout: Duration::from_secs(5),
            partial_delay: Duration::ZERO,
            anthropic_version: "bedrock-2023-05-31".into(),
        }
    }

    async fn run(target: Target, backend: Arc<MockBackend>, max_tokens: u32) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = Arc::new(
            InferenceRequest::new("hi", max_tokens).with_target(TargetRef::model(target.id.clone())),
        );
        TargetWorker::new(target, backend, tx, settings()).run(request).await;
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn texts(events: &[StreamEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Partial { text_delta, .. } => Some(text_delta.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn bedrock_claude_stream() {
        let backend = Arc::new(MockBackend::new(vec![events(vec![
            event(json!({"type": "message_start", "message": {"usage": {"input_tokens": 5}}})),
            event(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hello"}})),
            event(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": " there"}})),
            event(json!({"type": "message_delta", "usage": {"output_tokens": 2}})),
        ])]));
        let target = Target {
            id: "t1".into(),
            spec: TargetSpec::Bedrock {
                model_id: "anthropic.claude-3-haiku".into(),
                dialect: BedrockDialect::Claude,
            },
            supports_multimodal: true,
            registry_backed: false,
        };

        let out = run(target, backend, 100).await;
        assert_eq!(texts(&out), vec!["Hello", " there"]);
        match out.last().unwrap() {
            StreamEvent::Complete {
                full_text,
                usage,
                streamed,
                ..
            } => {
                assert_eq!(full_text, "Hello there");
                assert_eq!(
                    usage.clone().unwrap(),
                    Usage {
                        input_tokens: 5,
                        output_tokens: 2,
                        total_tokens: 7
                    }
                );
                assert!(*streamed);
            }
            other => panic!("expected complete, got {other:?}"),
        }
        match &out[1] {
            StreamEvent::Partial { accumulated_text, .. } => assert_eq!(accumulated_text, "Hello there"),
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sse_stream_split_mid_frame_with_malformed_line() {
        let backend = Arc::new(MockBackend::new(vec![events(vec![
            sse("data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\ndata: {\"choi"),
            sse("ces\":[{\"delta\":{\"content\":\"B\"}}]}\n\ndata: {not json}\n\n"),
            sse("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n"),
            sse("data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\ndata: [DONE]"),
        ])]));

        let out = run(http_target(false), backend.clone(), 64).await;
        assert_eq!(texts(&out), vec!["A", "B"]);
        match out.last().unwrap() {
            StreamEvent::Complete { full_text, usage, .. } => {
                assert_eq!(full_text, "AB");
                assert_eq!(usage.as_ref().unwrap().total_tokens, 5);
            }
            other => panic!("expected complete, got {other:?}"),
        }
        let body = &backend.seen.lock().await[0];
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[tokio::test]
    async fn json_response_falls_back_without_partials() {
        let backend = Arc::new(MockBackend::new(vec![Ok(Opened::Whole(json!({
            "choices": [{"message": {"content": "all at once"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 3}
        })))]));

        let out = run(http_target(false), backend, 64).await;
        assert_eq!(out.len(), 1);
        match &out[0] {
            StreamEvent::Complete {
                full_text,
                streamed,
                usage,
                ..
            } => {
                assert_eq!(full_text, "all at once");
                assert!(!*streamed);
                assert_eq!(usage.as_ref().unwrap().total_tokens, 6);
            }
            other => panic!("expected complete, got {other:?}"),
        }
        assert_eq!(out[0].to_json()["streaming"], false);
    }

    #[tokio::test]
    async fn streaming_refusal_uses_non_streaming_call() {
        let backend = Arc::new(
            MockBackend::new(vec![Err(InferenceError::StreamingUnsupported("no".into()))])
                .with_invokes(vec![Ok(json!([{"generated_text": "tgi says hi"}]))]),
        );
        let target = Target {
            id: "ep".into(),
            spec: TargetSpec::SageMaker {
                endpoint_name: "ep".into(),
                model_name: "m".into(),
                stream_supported: true,
            },
            supports_multimodal: false,
            registry_backed: false,
        };

        let out = run(target, backend.clone(), 64).await;
        assert!(matches!(&out[..], [StreamEvent::Complete { full_text, streamed: false, .. }] if full_text == "tgi says hi"));
        let seen = backend.seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1]["stream"], false);
    }

    #[tokio::test]
    async fn context_overflow_retries_once_with_corrected_max_tokens() {
        let overflow = || InferenceError::ApiError {
            status: 400,
            body: "maximum context length is 2048 tokens and your request has 1800 input tokens".into(),
        };
        let backend = Arc::new(MockBackend::new(vec![
            Err(overflow()),
            events(vec![sse("data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n")]),
        ]));

        let out = run(http_target(false), backend.clone(), 500).await;
        assert!(matches!(out.last().unwrap(), StreamEvent::Complete { full_text, .. } if full_text == "ok"));
        let seen = backend.seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["max_tokens"], 500);
        assert_eq!(seen[1]["max_tokens"], 247);
    }

    #[tokio::test]
    async fn context_overflow_is_retried_only_once() {
        let overflow = || InferenceError::ApiError {
            status: 400,
            body: "maximum context length is 2048 tokens and your request has 1800 input tokens".into(),
        };
        let backend = Arc::new(MockBackend::new(vec![Err(overflow()), Err(overflow()), Err(overflow())]));

        let out = run(http_target(false), backend.clone(), 500).await;
        assert!(matches!(&out[..], [StreamEvent::Error { .. }]));
        assert_eq!(backend.seen.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn registry_backed_404_reads_as_startup() {
        let backend = Arc::new(MockBackend::new(vec![Err(InferenceError::ApiError {
            status: 404,
            body: "Not Found".into(),
        })]));
        let out = run(http_target(true), backend, 64).await;
        match &out[..] {
            [StreamEvent::Error { message, .. }] => assert!(message.contains("starting up")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn manual_404_is_reported_verbatim() {
        let backend = Arc::new(MockBackend::new(vec![Err(InferenceError::ApiError {
            status: 404,
            body: "Not Found".into(),
        })]));
        let out = run(http_target(false), backend, 64).await;
        match &out[..] {
            [StreamEvent::Error { message, .. }] => assert!(message.contains("404")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_in_error() {
        let stream = futures::stream::iter(vec![
            Ok(sse("data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n")),
            Err(InferenceError::Request("connection reset".into())),
        ])
        .boxed();
        let backend = Arc::new(MockBackend::new(vec![Ok(Opened::Stream(stream))]));
        let out = run(http_target(false), backend, 64).await;
        assert_eq!(texts(&out), vec!["par"]);
        assert!(matches!(out.last().unwrap(), StreamEvent::Error { message, .. } if message.contains("connection reset")));
    }

    #[tokio::test]
    async fn non_streaming_endpoint_skips_open_stream() {
        let backend = Arc::new(
            MockBackend::new(Vec::new())
                .with_invokes(vec![Ok(json!({"choices": [{"message": {"content": "whole"}}]}))]),
        );
        let target = Target {
            id: "ep".into(),
            spec: TargetSpec::SageMaker {
                endpoint_name: "ep".into(),
                model_name: "m".into(),
                stream_supported: false,
            },
            supports_multimodal: false,
            registry_backed: false,
        };

        let out = run(target, backend.clone(), 64).await;
        assert!(matches!(&out[..], [StreamEvent::Complete { full_text, streamed: false, .. }] if full_text == "whole"));
        let seen = backend.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["stream"], false);
        assert!(seen[0].get("stream_options").is_none());
    }

    /// Accepts the connection and never answers.
    struct HangingBackend;

    #[async_trait]
    impl InferenceBackend for HangingBackend {
        async fn open_stream(&self, _: &TargetSpec, _: &Value) -> Result<Opened, InferenceError> {
            futures::future::pending().await
        }

        async fn invoke(&self, _: &TargetSpec, _: &Value) -> Result<Value, InferenceError> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connect_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = Arc::new(InferenceRequest::new("hi", 16));
        TargetWorker::new(http_target(false), Arc::new(HangingBackend), tx, settings())
            .run(request)
            .await;
        match rx.try_recv() {
            Ok(StreamEvent::Error { message, .. }) => assert!(message.contains("no data")),
            other => panic!("expected timeout error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_whole_response_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = Target {
            id: "ep".into(),
            spec: TargetSpec::SageMaker {
                endpoint_name: "ep".into(),
                model_name: "m".into(),
                stream_supported: false,
            },
            supports_multimodal: false,
            registry_backed: false,
        };
        TargetWorker::new(target, Arc::new(HangingBackend), tx, settings())
            .run(Arc::new(InferenceRequest::new("hi", 16)))
            .await;
        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Error { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_backend_times_out() {
        let stream = futures::stream::pending::<Result<RawChunk, InferenceError>>().boxed();
        let backend = Arc::new(MockBackend::new(vec![Ok(Opened::Stream(stream))]));
        let out = run(http_target(false), backend, 64).await;
        assert!(matches!(&out[..], [StreamEvent::Error { .. }]));
    }
}
