use serde_json::{json, Value};

use super::{u64_at, ChunkDelta};
use crate::media::{strip_data_url, ImageFormat};
use crate::types::UsageFragment;

/// Bedrock's `InvokeModel` body for Claude: one user turn, images first.
pub fn build_body(
    anthropic_version: &str,
    prompt: &str,
    images: &[String],
    max_tokens: u32,
    temperature: f32,
) -> Value {
    let mut content: Vec<Value> = images
        .iter()
        .map(|image| {
            json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": ImageFormat::sniff_base64(image).mime_type(),
                    "data": strip_data_url(image),
                }
            })
        })
        .collect();
    content.push(json!({ "type": "text", "text": prompt }));

    json!({
        "anthropic_version": anthropic_version,
        "max_tokens": max_tokens,
        "temperature": temperature,
        "messages": [{ "role": "user", "content": content }],
    })
}

/// One decoded event from an Anthropic Messages stream.
pub fn parse_chunk(chunk: &Value) -> ChunkDelta {
    match chunk.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            let usage = &chunk["message"]["usage"];
            ChunkDelta {
                usage: UsageFragment {
                    input_tokens: u64_at(usage, "input_tokens"),
                    ..Default::default()
                },
                ..Default::default()
            }
        }
        Some("content_block_delta") => {
            let delta = &chunk["delta"];
            if delta["type"] == "text_delta" {
                ChunkDelta::text(delta["text"].as_str().unwrap_or(""))
            } else {
                ChunkDelta::default()
            }
        }
        Some("message_delta") => ChunkDelta {
            is_final: true,
            usage: UsageFragment {
                output_tokens: u64_at(&chunk["usage"], "output_tokens"),
                ..Default::default()
            },
            ..Default::default()
        },
        Some("message_stop") => ChunkDelta {
            is_final: true,
            ..Default::default()
        },
        _ => ChunkDelta::default(),
    }
}
