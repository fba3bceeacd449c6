use async_trait::async_trait;
use aws_sdk_sagemakerruntime::error::DisplayErrorContext;
use aws_sdk_sagemakerruntime::primitives::Blob;
use aws_sdk_sagemakerruntime::types::ResponseStream;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use super::bedrock::{sdk_error, stream_error};
use super::{InferenceBackend, Opened, RawChunk};
use crate::error::InferenceError;
use crate::types::TargetSpec;

/// SageMaker real-time endpoints running an OpenAI-compatible container.
/// Streaming payload parts are raw SSE bytes.
pub struct SageMakerBackend {
    client: aws_sdk_sagemakerruntime::Client,
}

impl SageMakerBackend {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_sagemakerruntime::Client::new(config),
        }
    }

    pub fn with_client(client: aws_sdk_sagemakerruntime::Client) -> Self {
        Self { client }
    }
}

fn endpoint_name(target: &TargetSpec) -> Result<&str, InferenceError> {
    match target {
        TargetSpec::SageMaker { endpoint_name, .. } => Ok(endpoint_name),
        other => Err(InferenceError::Unavailable(format!(
            "SageMaker backend cannot serve {other:?}"
        ))),
    }
}

fn encode(body: &Value) -> Result<Blob, InferenceError> {
    serde_json::to_vec(body)
        .map(Blob::new)
        .map_err(|e| InferenceError::Parse(e.to_string()))
}

#[async_trait]
impl InferenceBackend for SageMakerBackend {
    async fn open_stream(&self, target: &TargetSpec, body: &Value) -> Result<Opened, InferenceError> {
        let endpoint = endpoint_name(target)?;
        debug!(endpoint, "sagemaker streaming invoke");

        let result = self
            .client
            .invoke_endpoint_with_response_stream()
            .endpoint_name(endpoint)
            .content_type("application/json")
            .body(encode(body)?)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                // Endpoints whose container cannot stream reject the call
                // with a validation error naming streaming.
                let refused = err
                    .as_service_error()
                    .is_some_and(|e| e.is_validation_error());
                let message = DisplayErrorContext(&err).to_string();
                if refused && message.to_lowercase().contains("stream") {
                    return Err(InferenceError::StreamingUnsupported(message));
                }
                return Err(sdk_error(err));
            }
        };

        let stream = futures::stream::unfold(output.body, |mut events| async move {
            loop {
                match events.recv().await {
                    Ok(Some(ResponseStream::PayloadPart(part))) => {
                        let bytes = part.bytes.map(Blob::into_inner).unwrap_or_default();
                        return Some((Ok(RawChunk::Sse(Bytes::from(bytes))), events));
                    }
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
        let endpoint = endpoint_name(target)?;
        debug!(endpoint, "sagemaker invoke");

        let output = self
            .client
            .invoke_endpoint()
            .endpoint_name(endpoint)
            .content_type("application/json")
            .accept("application/json")
            .body(encode(body)?)
            .send()
            .await
            .map_err(sdk_error)?;

        let bytes = output.body.map(Blob::into_inner).unwrap_or_default();
        serde_json::from_slice(&bytes).map_err(|e| InferenceError::Parse(e.to_string()))
    }
}
