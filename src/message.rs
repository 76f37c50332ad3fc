use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rabbitmq::errors::{RabbitMQError, Result};

/// Queue used when a caller doesn't name one.
pub const DEFAULT_QUEUE: &str = "default";

/// How much of a payload ends up in log lines.
pub const PREVIEW_LEN: usize = 100;

/// Wire payload: a JSON object with exactly `task` and `params`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TaskMessage {
    pub task: String,
    pub params: Value,
}

impl TaskMessage {
    pub fn new(task: impl Into<String>, params: Value) -> Self {
        TaskMessage {
            task: task.into(),
            params,
        }
    }

    /// Builds a message from any serializable parameter value.
    pub fn with_params<P: Serialize + ?Sized>(task: impl Into<String>, params: &P) -> Result<Self> {
        Ok(Self::new(task, serde_json::to_value(params)?))
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| RabbitMQError::DeserializationError(e.to_string()))
    }
}

/// First `PREVIEW_LEN` bytes of a payload, lossily decoded for logging.
pub fn payload_preview(payload: &[u8]) -> String {
    let end = payload.len().min(PREVIEW_LEN);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}
