use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde_json::Value;
use tracing::debug;

use super::{InferenceBackend, Opened, RawChunk};
use crate::error::InferenceError;
use crate::types::TargetSpec;

/// OpenAI-compatible chat-completions client. Covers EC2-hosted vLLM /
/// SGLang servers and manually registered APIs.
pub struct HttpBackend {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
        }
    }

    /// Set an API key, sent as a bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn post(&self, target: &TargetSpec, body: &Value) -> Result<reqwest::Response, InferenceError> {
        let base_url = match target {
            TargetSpec::HttpCompatible { base_url, .. } => base_url,
            other => {
                return Err(InferenceError::Unavailable(format!(
                    "HTTP backend cannot serve {other:?}"
                )))
            }
        };
        let url = completions_url(base_url);
        debug!(%url, stream = body["stream"].as_bool().unwrap_or(false), "chat completions request");

        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json");
        if let Some(ref key) = self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let resp = req
            .json(body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let status = status.as_u16();
            let text = resp
                .text()
                .await
                .map_err(|e| InferenceError::Request(e.to_string()))?;
            return Err(classify_rejection(status, text));
        }
        Ok(resp)
    }
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts a bare host, a `/v1` base, or the full completions URL.
pub fn completions_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

/// A 400 complaining about `stream` means the server cannot stream at all;
/// everything else is a plain API error.
fn classify_rejection(status: u16, body: String) -> InferenceError {
    let lower = body.to_lowercase();
    if status == 400 && lower.contains("stream") && !lower.contains("context length") {
        InferenceError::StreamingUnsupported(body)
    } else {
        InferenceError::ApiError { status, body }
    }
}

async fn decode_json(resp: reqwest::Response) -> Result<Value, InferenceError> {
    let text = resp
        .text()
        .await
        .map_err(|e| InferenceError::Request(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn open_stream(&self, target: &TargetSpec, body: &Value) -> Result<Opened, InferenceError> {
        let resp = self.post(target, body).await?;

        let is_event_stream = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));
        if !is_event_stream {
            return decode_json(resp).await.map(Opened::Whole);
        }

        let stream = resp
            .bytes_stream()
            .map_ok(RawChunk::Sse)
            .map_err(|e| InferenceError::Request(e.to_string()))
            .boxed();
        Ok(Opened::Stream(stream))
    }

    async fn invoke(&self, target: &TargetSpec, body: &Value) -> Result<Value, InferenceError> {
        let resp = self.post(target, body).await?;
        decode_json(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_url_variants() {
        assert_eq!(completions_url("http://10.0.0.1:8000"), "http://10.0.0.1:8000/v1/chat/completions");
        assert_eq!(completions_url("http://10.0.0.1:8000/"), "http://10.0.0.1:8000/v1/chat/completions");
        assert_eq!(completions_url("https://api.example.com/v1"), "https://api.example.com/v1/chat/completions");
        assert_eq!(
            completions_url("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn stream_rejection_is_distinguished() {
        assert!(matches!(
            classify_rejection(400, "stream=true is not supported by this endpoint".into()),
            InferenceError::StreamingUnsupported(_)
        ));
        assert!(matches!(
            classify_rejection(400, "maximum context length is 2048 tokens; stream aborted".into()),
            InferenceError::ApiError { status: 400, .. }
        ));
        assert!(matches!(
            classify_rejection(503, "upstream stream failed".into()),
            InferenceError::ApiError { status: 503, .. }
        ));
    }
}
