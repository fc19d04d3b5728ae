use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::AsRefStr;

/// An event received from a client.
///
/// The `type` tag carries the event name; payload fields sit alongside it.
#[derive(Debug, Serialize, Deserialize, Clone, AsRefStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InboundPayload {
    JoinSession(JoinSessionPayload),
    LeaveSession(LeaveSessionPayload),
    CodeUpdate(CodeUpdatePayload),
    ChatMessage(ChatMessagePayload),
    Typing(TypingPayload),
}

impl std::fmt::Display for InboundPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionPayload {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSessionPayload {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CodeUpdatePayload {
    #[serde(default)]
    pub session_id: Option<String>,
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Accepts any JSON value; coerced to a boolean on relay.
    #[serde(default)]
    pub is_typing: Value,
}

/// An event sent to clients.
#[derive(Debug, Serialize, Deserialize, Clone, AsRefStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutboundPayload {
    SessionJoined(SessionJoinedPayload),
    SessionLeft(SessionLeftPayload),
    CodeUpdate(CodeUpdateBroadcastPayload),
    ChatMessage(ChatMessageBroadcastPayload),
    Typing(TypingBroadcastPayload),
}

impl std::fmt::Display for OutboundPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionJoinedPayload {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionLeftPayload {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CodeUpdateBroadcastPayload {
    pub session_id: String,
    pub code: String,
    /// Serialized as an explicit `null` when absent.
    pub language: Option<String>,
    pub from: String,
    pub at: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageBroadcastPayload {
    pub session_id: String,
    pub from: String,
    pub message: String,
    pub at: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TypingBroadcastPayload {
    pub session_id: String,
    pub from: String,
    pub is_typing: bool,
}
