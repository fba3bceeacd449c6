//! Provider wire dialects.
//!
//! Each dialect module knows two things about its provider family: how to
//! shape a request body, and how to read one streaming chunk. Chunk parsers
//! are pure and never fail; anything unrecognised is an empty delta.

pub mod anthropic;
pub mod nova;
pub mod openai;

use serde_json::Value;

use crate::types::UsageFragment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Anthropic Messages streaming envelope, as served by Bedrock.
    AnthropicMessages,
    /// Amazon Nova streaming envelope, as served by Bedrock.
    Nova,
    /// OpenAI chat-completions SSE (EC2, SageMaker and manual targets).
    OpenAiChat,
}

/// What a single chunk contributed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkDelta {
    pub text: String,
    pub is_final: bool,
    pub usage: UsageFragment,
}

impl ChunkDelta {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

pub fn parse_chunk(dialect: Dialect, chunk: &Value) -> ChunkDelta {
    match dialect {
        Dialect::AnthropicMessages => anthropic::parse_chunk(chunk),
        Dialect::Nova => nova::parse_chunk(chunk),
        Dialect::OpenAiChat => openai::parse_chunk(chunk),
    }
}

pub(crate) fn u64_at(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_shapes_are_empty_for_every_dialect() {
        let odd = [json!({"something": "else"}), json!([1, 2, 3]), json!(null), json!("str")];
        for dialect in [Dialect::AnthropicMessages, Dialect::Nova, Dialect::OpenAiChat] {
            for chunk in &odd {
                assert_eq!(parse_chunk(dialect, chunk), ChunkDelta::default(), "{dialect:?} {chunk}");
            }
        }
    }

    #[test]
    fn terminal_usage_chunks_are_final() {
        let cases = [
            (
                Dialect::AnthropicMessages,
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 9}}),
            ),
            (
                Dialect::Nova,
                json!({"metadata": {"usage": {"inputTokens": 3, "outputTokens": 9, "totalTokens": 12}}}),
            ),
            (
                Dialect::OpenAiChat,
                json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 9, "total_tokens": 12}}),
            ),
        ];
        for (dialect, chunk) in cases {
            let delta = parse_chunk(dialect, &chunk);
            assert!(delta.is_final, "{dialect:?}");
            assert_eq!(delta.usage.output_tokens, Some(9), "{dialect:?}");
        }
    }
}
