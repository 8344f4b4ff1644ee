// Messages exchanged between the stream endpoint and the chunk controller.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Announces a file that should become streamable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterVideoSession {
    pub file_id: String,
    pub bucket_id: String,
    pub file_size: u64,
}

/// Asks the controller for the inclusive plaintext window `[start, end]` of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub request_id: String,
    pub file_id: String,
    pub bucket_id: String,
    pub start: u64,
    pub end: u64,
    pub file_size: u64,
}

impl ChunkRequest {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Controller reply: either the window's bytes or an error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkResponse {
    pub fn data(request_id: impl Into<String>, data: Bytes) -> Self {
        Self {
            request_id: request_id.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            data: None,
            error: Some(error.into()),
        }
    }

    /// Collapse into the outcome the waiting request sees. An error wins over data.
    pub fn into_result(self) -> Result<Bytes, String> {
        match (self.error, self.data) {
            (Some(e), _) => Err(e),
            (None, Some(data)) => Ok(data),
            (None, None) => Err("empty chunk response".to_string()),
        }
    }
}

/// Envelope for crossing a process boundary as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeMessage {
    RegisterVideoSession(RegisterVideoSession),
    ChunkRequest(ChunkRequest),
    ChunkResponse(ChunkResponse),
}
