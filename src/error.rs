use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("streaming not supported: {0}")]
    StreamingUnsupported(String),
    #[error("no data from backend for {0:?}")]
    Timeout(Duration),
    #[error("context window of {limit} tokens leaves no room for output after {input} input tokens")]
    ContextExhausted { limit: u32, input: u32 },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

static MAX_CONTEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"maximum context length is (\d+) tokens").expect("valid regex"));
static INPUT_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) input tokens").expect("valid regex"));

/// Numeric limits pulled out of a "max_tokens too large" rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOverflow {
    pub limit: u32,
    pub input: u32,
}

impl ContextOverflow {
    /// Largest `max_tokens` the backend will accept, or `None` when the
    /// prompt alone fills the window.
    pub fn allowed_max_tokens(&self) -> Option<u32> {
        self.limit
            .checked_sub(self.input)
            .and_then(|room| room.checked_sub(1))
            .filter(|allowed| *allowed > 0)
    }
}

impl InferenceError {
    /// Recognises the OpenAI-compatible 400 that reports
    /// `maximum context length is X tokens ... Y input tokens`.
    pub fn context_overflow(&self) -> Option<ContextOverflow> {
        let body = match self {
            InferenceError::ApiError { status: 400, body } => body,
            _ => return None,
        };
        let limit = MAX_CONTEXT.captures(body)?.get(1)?.as_str().parse().ok()?;
        let input = INPUT_TOKENS.captures(body)?.get(1)?.as_str().parse().ok()?;
        Some(ContextOverflow { limit, input })
    }

    /// True for the responses a freshly deployed server gives while it is
    /// still loading weights.
    pub fn looks_like_startup(&self) -> bool {
        match self {
            InferenceError::ApiError { status, body } => {
                let body = body.to_lowercase();
                *status == 404
                    || *status == 503
                    || body.contains("not found")
                    || body.contains("service unavailable")
            }
            InferenceError::Request(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("not found") || msg.contains("service unavailable")
            }
            _ => false,
        }
    }
}
