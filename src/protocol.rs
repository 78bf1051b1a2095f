#![forbid(unsafe_code)]

// Streaming protocol - inbound message types from the ASR server.
// Outbound traffic is raw binary audio chunks with no envelope.

use serde::{Deserialize, Serialize};

/// Server-to-client messages, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Completed recognition for an utterance
    Final {
        #[serde(default)]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    /// Server-side failure while processing audio
    Error {
        #[serde(default)]
        message: String,
    },
    /// Handshake sent right after the socket opens
    Connection {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Any other tag (partial results, stats, ...)
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Lenient decode: malformed JSON or a missing `type` yields `None`.
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Final result carrying non-empty text
    pub fn recognized_text(&self) -> Option<&str> {
        match self {
            ServerMessage::Final { text, .. } if !text.is_empty() => Some(text),
            _ => None,
        }
    }
}
