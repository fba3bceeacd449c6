use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::error::InferenceError;

/// One fan-out request. Built once per inbound call and shared read-only
/// with every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    /// Base64 image payloads, attached to provider requests in this order.
    #[serde(default)]
    pub images: Vec<String>,
    pub targets: Vec<TargetRef>,
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            images: Vec::new(),
            targets: Vec::new(),
            max_tokens,
            temperature: 0.0,
        }
    }

    pub fn with_image(mut self, base64: impl Into<String>) -> Self {
        self.images.push(base64.into());
        self
    }

    pub fn with_target(mut self, target: TargetRef) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.max(0.0);
        self
    }

    /// Clamp `temperature` into range and reject a zero `max_tokens`.
    /// Deserialized requests skip the builders, so this runs before any
    /// worker starts.
    pub fn check(&mut self) -> Result<(), InferenceError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            self.temperature = 0.0;
        }
        if self.max_tokens == 0 {
            return Err(InferenceError::InvalidRequest(
                "max_tokens must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// How a caller names a target before it is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetRef {
    /// A model key known to the catalog.
    Model(String),
    /// Ad-hoc OpenAI-compatible server.
    Manual {
        api_url: String,
        model_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    SageMaker {
        endpoint_name: String,
        model_name: String,
        #[serde(default = "default_true")]
        stream_supported: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

impl TargetRef {
    pub fn model(key: impl Into<String>) -> Self {
        TargetRef::Model(key.into())
    }

    pub fn manual(api_url: impl Into<String>, model_name: impl Into<String>) -> Self {
        TargetRef::Manual {
            api_url: api_url.into(),
            model_name: model_name.into(),
            id: None,
        }
    }

    pub fn sagemaker(endpoint_name: impl Into<String>, model_name: impl Into<String>) -> Self {
        TargetRef::SageMaker {
            endpoint_name: endpoint_name.into(),
            model_name: model_name.into(),
            stream_supported: true,
            id: None,
        }
    }

    /// The id events for this target are keyed by.
    pub fn id(&self) -> &str {
        match self {
            TargetRef::Model(key) => key,
            TargetRef::Manual { id, model_name, .. } => id.as_deref().unwrap_or(model_name),
            TargetRef::SageMaker {
                id, endpoint_name, ..
            } => id.as_deref().unwrap_or(endpoint_name),
        }
    }

    /// Id used when [`TargetRef::id`] is already taken by a different
    /// target, e.g. two servers running the same model. An explicit id is
    /// never rewritten.
    pub fn qualified_id(&self) -> String {
        match self {
            TargetRef::Model(key) => key.clone(),
            TargetRef::Manual { id: Some(id), .. } | TargetRef::SageMaker { id: Some(id), .. } => {
                id.clone()
            }
            TargetRef::Manual {
                api_url, model_name, ..
            } => format!("{model_name}@{api_url}"),
            TargetRef::SageMaker {
                endpoint_name,
                model_name,
                ..
            } => format!("{endpoint_name}/{model_name}"),
        }
    }
}

/// Which Bedrock envelope a model speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BedrockDialect {
    Claude,
    Nova,
}

/// A resolved inference destination. The variant alone decides which
/// request builder and chunk parser apply.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSpec {
    Bedrock {
        model_id: String,
        dialect: BedrockDialect,
    },
    /// EC2-hosted vLLM-style servers and manual API targets.
    HttpCompatible { base_url: String, model_name: String },
    SageMaker {
        endpoint_name: String,
        model_name: String,
        stream_supported: bool,
    },
}

impl TargetSpec {
    pub fn dialect(&self) -> Dialect {
        match self {
            TargetSpec::Bedrock {
                dialect: BedrockDialect::Claude,
                ..
            } => Dialect::AnthropicMessages,
            TargetSpec::Bedrock {
                dialect: BedrockDialect::Nova,
                ..
            } => Dialect::Nova,
            TargetSpec::HttpCompatible { .. } | TargetSpec::SageMaker { .. } => Dialect::OpenAiChat,
        }
    }

    /// Whether the raw stream is SSE-framed (as opposed to one JSON event per chunk).
    pub fn is_sse(&self) -> bool {
        !matches!(self, TargetSpec::Bedrock { .. })
    }
}

/// A target ready to be handed to a worker.
#[derive(Debug, Clone)]
pub struct Target {
    pub id: String,
    pub spec: TargetSpec,
    pub supports_multimodal: bool,
    /// Resolved through the deployment registry, so upstream 404s mean
    /// the server is still starting.
    pub registry_backed: bool,
}

/// Final token usage for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Whatever usage numbers a single chunk carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageFragment {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl UsageFragment {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none() && self.total_tokens.is_none()
    }
}

/// Merges usage reported piecemeal across a stream (input count at start,
/// output count at the end) into one record.
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    seen: UsageFragment,
}

impl UsageAccumulator {
    /// Later reports win for each field they carry.
    pub fn merge(&mut self, fragment: UsageFragment) {
        if fragment.input_tokens.is_some() {
            self.seen.input_tokens = fragment.input_tokens;
        }
        if fragment.output_tokens.is_some() {
            self.seen.output_tokens = fragment.output_tokens;
        }
        if fragment.total_tokens.is_some() {
            self.seen.total_tokens = fragment.total_tokens;
        }
    }

    /// `None` if the provider never reported usage. `total_tokens` is
    /// derived only when the provider did not supply it.
    pub fn finalize(&self) -> Option<Usage> {
        if self.seen.is_empty() {
            return None;
        }
        let input_tokens = self.seen.input_tokens.unwrap_or(0);
        let output_tokens = self.seen.output_tokens.unwrap_or(0);
        Some(Usage {
            input_tokens,
            output_tokens,
            total_tokens: self
                .seen
                .total_tokens
                .unwrap_or(input_tokens + output_tokens),
        })
    }
}
