pub mod http;
#[cfg(feature = "aws")]
pub mod bedrock;
#[cfg(feature = "aws")]
pub mod sagemaker;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::InferenceError;
use crate::types::TargetSpec;

/// One raw read from a provider stream.
#[derive(Debug, Clone)]
pub enum RawChunk {
    /// Arbitrary slice of an SSE byte stream; needs reassembly.
    Sse(Bytes),
    /// One complete JSON event (Bedrock payload parts).
    Event(Bytes),
}

pub type ChunkStream = BoxStream<'static, Result<RawChunk, InferenceError>>;

/// Result of opening a streaming call.
pub enum Opened {
    Stream(ChunkStream),
    /// The server ignored the streaming request and answered in one piece.
    Whole(Value),
}

/// Outbound transport for one family of targets. Opens exactly one
/// connection per call; no retries, no state.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Start a streaming call. Returns `StreamingUnsupported` when the
    /// backend refuses to stream, so the caller can fall back to `invoke`.
    async fn open_stream(&self, target: &TargetSpec, body: &Value) -> Result<Opened, InferenceError>;

    /// Single non-streaming call returning the decoded response body.
    async fn invoke(&self, target: &TargetSpec, body: &Value) -> Result<Value, InferenceError>;
}

#[async_trait]
impl InferenceBackend for Box<dyn InferenceBackend> {
    async fn open_stream(&self, target: &TargetSpec, body: &Value) -> Result<Opened, InferenceError> {
        (**self).open_stream(target, body).await
    }

    async fn invoke(&self, target: &TargetSpec, body: &Value) -> Result<Value, InferenceError> {
        (**self).invoke(target, body).await
    }
}

/// Stand-in for a transport this build or deployment does not have.
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl InferenceBackend for UnavailableBackend {
    async fn open_stream(&self, _: &TargetSpec, _: &Value) -> Result<Opened, InferenceError> {
        Err(InferenceError::Unavailable(self.reason.clone()))
    }

    async fn invoke(&self, _: &TargetSpec, _: &Value) -> Result<Value, InferenceError> {
        Err(InferenceError::Unavailable(self.reason.clone()))
    }
}

/// One transport per target family.
#[derive(Clone)]
pub struct Backends {
    pub bedrock: Arc<dyn InferenceBackend>,
    pub http: Arc<dyn InferenceBackend>,
    pub sagemaker: Arc<dyn InferenceBackend>,
}

impl Backends {
    /// Route every target family to the same backend.
    pub fn uniform(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            bedrock: backend.clone(),
            http: backend.clone(),
            sagemaker: backend,
        }
    }

    /// HTTP only; AWS targets fail with a clear message.
    pub fn http_only(http: http::HttpBackend) -> Self {
        Self {
            bedrock: Arc::new(UnavailableBackend::new("no Bedrock client configured")),
            http: Arc::new(http),
            sagemaker: Arc::new(UnavailableBackend::new("no SageMaker client configured")),
        }
    }

    /// Real transports, AWS clients built from the default credential chain.
    #[cfg(feature = "aws")]
    pub async fn from_env(http: http::HttpBackend) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            bedrock: Arc::new(bedrock::BedrockBackend::new(&config)),
            http: Arc::new(http),
            sagemaker: Arc::new(sagemaker::SageMakerBackend::new(&config)),
        }
    }

    pub fn for_target(&self, target: &TargetSpec) -> Arc<dyn InferenceBackend> {
        match target {
            TargetSpec::Bedrock { .. } => self.bedrock.clone(),
            TargetSpec::HttpCompatible { .. } => self.http.clone(),
            TargetSpec::SageMaker { .. } => self.sagemaker.clone(),
        }
    }
}
