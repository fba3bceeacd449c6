use serde_json::Value;
use tracing::warn;

use crate::dialect::{anthropic, nova, openai};
use crate::types::{BedrockDialect, InferenceRequest, Target, TargetSpec};

/// Knobs that vary between attempts for the same target.
#[derive(Debug, Clone, Copy)]
pub struct BodyOptions<'a> {
    pub max_tokens: u32,
    pub stream: bool,
    pub anthropic_version: &'a str,
}

/// Provider-specific request body for `target`.
pub fn build_body(target: &Target, request: &InferenceRequest, opts: BodyOptions<'_>) -> Value {
    let images: &[String] = if target.supports_multimodal {
        &request.images
    } else {
        if !request.images.is_empty() {
            warn!(
                target_id = %target.id,
                dropped = request.images.len(),
                "model is text-only, dropping image attachments"
            );
        }
        &[]
    };
    let prompt = request.prompt.as_str();
    let temperature = request.temperature;

    match &target.spec {
        TargetSpec::Bedrock {
            dialect: BedrockDialect::Claude,
            ..
        } => anthropic::build_body(
            opts.anthropic_version,
            prompt,
            images,
            opts.max_tokens,
            temperature,
        ),
        TargetSpec::Bedrock {
            dialect: BedrockDialect::Nova,
            ..
        } => nova::build_body(prompt, images, opts.max_tokens, temperature),
        TargetSpec::HttpCompatible { model_name, .. } | TargetSpec::SageMaker { model_name, .. } => {
            openai::build_body(
                model_name,
                prompt,
                images,
                opts.max_tokens,
                temperature,
                opts.stream,
            )
        }
    }
}
