use serde_json::{json, Value};

use super::{u64_at, ChunkDelta};
use crate::media::{strip_data_url, ImageFormat};
use crate::types::UsageFragment;

/// Chat-completions body for vLLM-style servers, SageMaker containers and
/// manual API targets.
///
/// Text-only requests send `content` as a plain string: several servers
/// reject a list holding a single text part.
pub fn build_body(
    model_name: &str,
    prompt: &str,
    images: &[String],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
) -> Value {
    let content = if images.is_empty() {
        Value::String(prompt.to_string())
    } else {
        let mut parts: Vec<Value> = images
            .iter()
            .map(|image| {
                let mime = ImageFormat::sniff_base64(image).mime_type();
                json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{mime};base64,{}", strip_data_url(image)) },
                })
            })
            .collect();
        parts.push(json!({ "type": "text", "text": prompt }));
        Value::Array(parts)
    };

    let mut body = json!({
        "model": model_name,
        "messages": [{ "role": "user", "content": content }],
        "max_tokens": max_tokens,
        "temperature": temperature,
        "stream": stream,
    });
    if stream {
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

pub fn parse_chunk(chunk: &Value) -> ChunkDelta {
    let choice = chunk.pointer("/choices/0");
    let text = choice
        .and_then(|c| c.pointer("/delta/content"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let finished = matches!(
        choice.and_then(|c| c.get("finish_reason")).and_then(Value::as_str),
        Some("stop") | Some("length")
    );
    let usage = parse_usage(chunk);

    ChunkDelta {
        text: text.to_string(),
        is_final: finished || !usage.is_empty(),
        usage,
    }
}

/// Top-level `usage`, only present on the terminal chunk when
/// `stream_options.include_usage` was requested.
pub fn parse_usage(value: &Value) -> UsageFragment {
    match value.get("usage") {
        Some(usage) if usage.is_object() => UsageFragment {
            input_tokens: u64_at(usage, "prompt_tokens"),
            output_tokens: u64_at(usage, "completion_tokens"),
            total_tokens: u64_at(usage, "total_tokens"),
        },
        _ => UsageFragment::default(),
    }
}

/// Text and usage from a non-streaming response. Accepts chat-completions,
/// legacy completions, and TGI `generated_text` shapes.
pub fn parse_completion(response: &Value) -> (String, UsageFragment) {
    let text = response
        .pointer("/choices/0/message/content")
        .or_else(|| response.pointer("/choices/0/text"))
        .or_else(|| response.get("generated_text"))
        .or_else(|| response.pointer("/0/generated_text"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    (text, parse_usage(response))
}
