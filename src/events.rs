use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::types::Usage;

/// Everything the fan-out emits to its caller.
///
/// Per target: zero or more `Partial`, then exactly one of `Complete`,
/// `Error` or `NotDeployed`. `AllDone` closes the whole fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Partial {
        target_id: String,
        text_delta: String,
        accumulated_text: String,
    },
    Complete {
        target_id: String,
        full_text: String,
        usage: Option<Usage>,
        duration_ms: f64,
        /// False when the backend answered without streaming.
        streamed: bool,
    },
    Error {
        target_id: String,
        message: String,
    },
    NotDeployed {
        target_id: String,
        message: String,
    },
    Heartbeat {
        completed_count: usize,
        total_count: usize,
    },
    AllDone,
}

impl StreamEvent {
    /// Target id of a terminal event.
    pub fn terminal_target(&self) -> Option<&str> {
        match self {
            StreamEvent::Complete { target_id, .. }
            | StreamEvent::Error { target_id, .. }
            | StreamEvent::NotDeployed { target_id, .. } => Some(target_id),
            _ => None,
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Partial { target_id, .. } => Some(target_id),
            other => other.terminal_target(),
        }
    }

    /// JSON payload in the shape the dashboard client consumes.
    pub fn to_json(&self) -> Value {
        match self {
            StreamEvent::Partial {
                target_id,
                text_delta,
                accumulated_text,
            } => json!({
                "model": target_id,
                "type": "partial",
                "content": text_delta,
                "accumulated_content": accumulated_text,
            }),
            StreamEvent::Complete {
                target_id,
                full_text,
                usage,
                duration_ms,
                streamed,
            } => {
                let mut payload = json!({
                    "model": target_id,
                    "type": "complete",
                    "status": "success",
                    "result": {
                        "content": full_text,
                        "usage": usage,
                    },
                    "duration_ms": duration_ms,
                });
                if !streamed {
                    payload["streaming"] = Value::Bool(false);
                }
                payload
            }
            StreamEvent::Error { target_id, message } => json!({
                "model": target_id,
                "status": "error",
                "message": message,
            }),
            StreamEvent::NotDeployed { target_id, message } => json!({
                "model": target_id,
                "status": "not_deployed",
                "message": message,
            }),
            StreamEvent::Heartbeat {
                completed_count,
                total_count,
            } => json!({
                "type": "heartbeat",
                "completed": completed_count,
                "total": total_count,
            }),
            StreamEvent::AllDone => json!({ "type": "complete" }),
        }
    }

    /// One SSE frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

/// Serialize an event stream into SSE frames for the HTTP layer.
pub fn sse_frames<S>(events: S) -> impl Stream<Item = String>
where
    S: Stream<Item = StreamEvent>,
{
    events.map(|event| event.to_sse_frame())
}
