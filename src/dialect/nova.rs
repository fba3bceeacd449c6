use serde_json::{json, Value};

use super::{u64_at, ChunkDelta};
use crate::media::{strip_data_url, ImageFormat};
use crate::types::UsageFragment;

pub fn build_body(prompt: &str, images: &[String], max_tokens: u32, temperature: f32) -> Value {
    let mut content: Vec<Value> = images
        .iter()
        .map(|image| {
            json!({
                "image": {
                    "format": ImageFormat::sniff_base64(image).short_name(),
                    "source": { "bytes": strip_data_url(image) },
                }
            })
        })
        .collect();
    content.push(json!({ "text": prompt }));

    json!({
        "schemaVersion": "messages-v1",
        "messages": [{ "role": "user", "content": content }],
        "inferenceConfig": {
            "maxTokens": max_tokens,
            "temperature": temperature,
        },
    })
}

/// Nova streams one JSON object per event, keyed by event kind.
pub fn parse_chunk(chunk: &Value) -> ChunkDelta {
    if let Some(text) = chunk
        .pointer("/contentBlockDelta/delta/text")
        .and_then(Value::as_str)
    {
        return ChunkDelta::text(text);
    }

    if let Some(metadata) = chunk.get("metadata") {
        let usage = &metadata["usage"];
        return ChunkDelta {
            is_final: true,
            usage: UsageFragment {
                input_tokens: u64_at(usage, "inputTokens"),
                output_tokens: u64_at(usage, "outputTokens"),
                total_tokens: u64_at(usage, "totalTokens"),
            },
            ..Default::default()
        };
    }

    if chunk.get("messageStop").is_some() {
        return ChunkDelta {
            is_final: true,
            ..Default::default()
        };
    }

    ChunkDelta::default()
}
