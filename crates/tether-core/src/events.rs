use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConversationId, MessageId};

/// Identifiers for the assistant response being streamed. Delivered at most
/// once per stream session, first instance wins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

/// Body of a streaming chat request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamRequest {
    pub conversation_id: ConversationId,
    pub content: String,
}

impl StreamRequest {
    pub fn new(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            content: content.into(),
        }
    }
}

/// Wire shape of a socket frame: `{"type": ..., "data": ...}`.
/// Frames with no `data` field carry `Value::Null`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}
