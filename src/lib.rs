pub mod backend;
pub mod dialect;
pub mod error;
pub mod events;
pub mod fanout;
pub mod media;
pub mod registry;
pub mod request;
pub mod sse;
pub mod types;
mod worker;

use std::time::Duration;

pub use backend::{Backends, InferenceBackend, Opened, RawChunk};
pub use backend::http::HttpBackend;
#[cfg(feature = "aws")]
pub use backend::{bedrock::BedrockBackend, sagemaker::SageMakerBackend};
pub use error::InferenceError;
pub use events::{sse_frames, StreamEvent};
pub use fanout::{FanOut, Resolution};
pub use registry::{
    DeploymentRegistry, DeploymentStatus, ModelCapability, ModelCatalog, Serving, StaticCatalog,
    StaticDeployments,
};
pub use sse::SseReassembler;
pub use tokio_util::sync::CancellationToken;
pub use types::{
    BedrockDialect, InferenceRequest, Target, TargetRef, TargetSpec, Usage, UsageAccumulator,
    UsageFragment,
};

/// Fan-out configuration.
#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// How long the merge loop waits for any event before emitting a heartbeat.
    pub heartbeat_interval: Duration,
    /// Per-read timeout on every backend stream.
    pub read_timeout: Duration,
    /// Upper bound on waiting for workers after the last terminal event.
    pub join_timeout: Duration,
    /// Pause after each partial token. Zero yields to the scheduler instead.
    pub partial_delay: Duration,
    /// `anthropic_version` sent to Bedrock Claude models.
    pub anthropic_version: String,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            read_timeout: Duration::from_secs(120),
            join_timeout: Duration::from_secs(5),
            partial_delay: Duration::ZERO,
            anthropic_version: "bedrock-2023-05-31".into(),
        }
    }
}
