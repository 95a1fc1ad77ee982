//! Live remote connections and the messages pushed to them.

use crate::{ConnectionId, IdentityId, RunId, Timestamp};
use serde::{Deserialize, Serialize};

/// A live, addressable endpoint for remote tool execution.
///
/// Ephemeral: exists only while the peer is connected and is never the owner
/// of durable data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: ConnectionId,
    /// Client-chosen stable key; registering twice with it is a reconnect.
    pub connection_key: String,
    pub owner: IdentityId,
    pub capabilities: Vec<String>,
    pub connected_at: Timestamp,
    pub last_seen: Timestamp,
}

impl Connection {
    pub fn has_capability(&self, tool_name: &str) -> bool {
        self.capabilities.iter().any(|c| c == tool_name || c == "*")
    }
}

/// Messages pushed from the runtime to a remote peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushMessage {
    #[serde(rename = "tool.call.request")]
    ToolCallRequest {
        #[serde(rename = "runId")]
        run_id: RunId,
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        args: serde_json::Value,
    },
}
