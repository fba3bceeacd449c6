use async_trait::async_trait;
use aws_sdk_bedrockruntime::config::http::HttpResponse;
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, SdkError};
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use super::{InferenceBackend, Opened, RawChunk};
use crate::error::InferenceError;
use crate::types::TargetSpec;

/// Bedrock runtime client. Both Claude and Nova go through
/// `InvokeModelWithResponseStream`; only the JSON inside differs.
pub struct BedrockBackend {
    client: aws_sdk_bedrockruntime::Client,
}

impl BedrockBackend {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_bedrockruntime::Client::new(config),
        }
    }

    pub fn with_client(client: aws_sdk_bedrockruntime::Client) -> Self {
        Self { client }
    }
}

fn model_id(target: &TargetSpec) -> Result<&str, InferenceError> {
    match target {
        TargetSpec::Bedrock { model_id, .. } => Ok(model_id),
        other => Err(InferenceError::Unavailable(format!(
            "Bedrock backend cannot serve {other:?}"
        ))),
    }
}

fn encode(body: &Value) -> Result<Blob, InferenceError> {
    serde_json::to_vec(body)
        .map(Blob::new)
        .map_err(|e| InferenceError::Parse(e.to_string()))
}

/// Keep the HTTP status when the SDK got as far as a response.
pub(super) fn sdk_error<E>(err: SdkError<E, HttpResponse>) -> InferenceError
where
    E: std::error::Error + 'static,
{
    let status = err.raw_response().map(|resp| resp.status().as_u16());
    let body = DisplayErrorContext(&err).to_string();
    match status {
        Some(status) => InferenceError::ApiError { status, body },
        None => InferenceError::Request(body),
    }
}

pub(super) fn stream_error<E, R>(err: SdkError<E, R>) -> InferenceError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    InferenceError::Request(DisplayErrorContext(&err).to_string())
}

#[async_trait]
impl InferenceBackend for BedrockBackend {
    async fn open_stream(&self, target: &TargetSpec, body: &Value) -> Result<Opened, InferenceError> {
        let model_id = model_id(target)?;
        debug!(model_id, "bedrock streaming invoke");

        let output = self
            .client
            .invoke_model_with_response_stream()
            .model_id(model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(encode(body)?)
            .send()
            .await
            .map_err(sdk_error)?;

        let stream = futures::stream::unfold(output.body, |mut events| async move {
            loop {
                match events.recv().await {
                    Ok(Some(ResponseStream::Chunk(part))) => {
                        let bytes = part.bytes.map(Blob::into_inner).unwrap_or_default();
                        return Some((Ok(RawChunk::Event(Bytes::from(bytes))), events));
                    }
                    // Unknown event kinds carry no model output.
                    Ok(Some(_)) => continue,
                    Ok(None) => return None,
                    Err(e) => return Some((Err(stream_error(e)), events)),
                }
            }
        })
        .boxed();

        Ok(Opened::Stream(stream))
    }

    async fn invoke(&self, target: &TargetSpec, body: &Value) -> Result<Value, InferenceError> {
        let model_id = model_id(target)?;
        let output = self
            .client
            .invoke_model()
            .model_id(model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(encode(body)?)
            .send()
            .await
            .map_err(sdk_error)?;

        serde_json::from_slice(output.body.as_ref()).map_err(|e| InferenceError::Parse(e.to_string()))
    }
}
