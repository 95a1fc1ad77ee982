//! Events: the immutable entries of a scope's log.
//!
//! Every event carries its scope and its seq within that scope. The payload is
//! a tagged enum so the wire `type` and the data can never disagree.

use crate::{
    ConnectionId, ExecutionTarget, IdentityId, ResultSource, RunId, RunStatus, ScopeId, Seq,
    Timestamp,
};
use serde::{Deserialize, Serialize};

/// A persisted event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub scope: ScopeId,
    pub seq: Seq,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    // ========================================================================
    // MESSAGES (SmartSpace timeline)
    // ========================================================================
    #[serde(rename = "message.user")]
    UserMessage { sender: IdentityId, content: String },

    #[serde(rename = "message.assistant")]
    AssistantMessage {
        sender: IdentityId,
        run_id: RunId,
        content: String,
    },

    #[serde(rename = "message.system")]
    SystemMessage { sender: IdentityId, content: String },

    // ========================================================================
    // RUN LIFECYCLE
    // ========================================================================
    #[serde(rename = "run.queued")]
    RunQueued {
        run_id: RunId,
        agent_id: IdentityId,
        triggered_by: IdentityId,
        trigger_depth: u32,
    },

    #[serde(rename = "run.running")]
    RunRunning { run_id: RunId },

    #[serde(rename = "run.waiting_tool")]
    RunWaitingTool {
        run_id: RunId,
        pending_calls: Vec<String>,
    },

    #[serde(rename = "run.completed")]
    RunCompleted { run_id: RunId },

    #[serde(rename = "run.failed")]
    RunFailed { run_id: RunId, error: String },

    #[serde(rename = "run.canceled")]
    RunCanceled { run_id: RunId },

    /// One reasoning iteration finished.
    #[serde(rename = "run.step")]
    RunStep {
        run_id: RunId,
        step: u32,
        tool_calls: u32,
    },

    // ========================================================================
    // TOOLS
    // ========================================================================
    #[serde(rename = "tool.call.requested")]
    ToolCallRequested {
        run_id: RunId,
        call_id: String,
        tool_name: String,
        args: serde_json::Value,
        target: ExecutionTarget,
    },

    #[serde(rename = "tool.call.dispatched")]
    ToolCallDispatched {
        run_id: RunId,
        call_id: String,
        connection_id: ConnectionId,
    },

    #[serde(rename = "tool.result")]
    ToolResultRecorded {
        run_id: RunId,
        call_id: String,
        result: serde_json::Value,
        is_error: bool,
        source: ResultSource,
        /// A later submission replaced an earlier result for the same call.
        updated: bool,
    },

    #[serde(rename = "tool.call.failed")]
    ToolCallFailed {
        run_id: RunId,
        call_id: String,
        reason: String,
    },

    #[serde(rename = "tool.call.expired")]
    ToolCallExpired { run_id: RunId, call_id: String },

    // ========================================================================
    // EXTENSION
    // ========================================================================
    #[serde(rename = "custom")]
    Custom {
        name: String,
        data: serde_json::Value,
    },
}

impl EventPayload {
    /// Get the wire name of this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "message.user",
            Self::AssistantMessage { .. } => "message.assistant",
            Self::SystemMessage { .. } => "message.system",
            Self::RunQueued { .. } => "run.queued",
            Self::RunRunning { .. } => "run.running",
            Self::RunWaitingTool { .. } => "run.waiting_tool",
            Self::RunCompleted { .. } => "run.completed",
            Self::RunFailed { .. } => "run.failed",
            Self::RunCanceled { .. } => "run.canceled",
            Self::RunStep { .. } => "run.step",
            Self::ToolCallRequested { .. } => "tool.call.requested",
            Self::ToolCallDispatched { .. } => "tool.call.dispatched",
            Self::ToolResultRecorded { .. } => "tool.result",
            Self::ToolCallFailed { .. } => "tool.call.failed",
            Self::ToolCallExpired { .. } => "tool.call.expired",
            Self::Custom { .. } => "custom",
        }
    }

    /// Space-timeline messages wake agents; everything else does not.
    pub fn is_message(&self) -> bool {
        matches!(
            self,
            Self::UserMessage { .. } | Self::AssistantMessage { .. } | Self::SystemMessage { .. }
        )
    }

    /// The lifecycle event announcing `status` for a run.
    ///
    /// `Queued` is built by the caller because it carries creation provenance.
    pub fn lifecycle(
        run_id: RunId,
        status: RunStatus,
        pending_calls: Vec<String>,
        error: Option<String>,
    ) -> Option<Self> {
        match status {
            RunStatus::Queued => None,
            RunStatus::Running => Some(Self::RunRunning { run_id }),
            RunStatus::WaitingTool => Some(Self::RunWaitingTool {
                run_id,
                pending_calls,
            }),
            RunStatus::Completed => Some(Self::RunCompleted { run_id }),
            RunStatus::Failed => Some(Self::RunFailed {
                run_id,
                error: error.unwrap_or_else(|| "unknown error".to_string()),
            }),
            RunStatus::Canceled => Some(Self::RunCanceled { run_id }),
        }
    }

    /// Run this payload belongs to, if any.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Self::AssistantMessage { run_id, .. }
            | Self::RunQueued { run_id, .. }
            | Self::RunRunning { run_id }
            | Self::RunWaitingTool { run_id, .. }
            | Self::RunCompleted { run_id }
            | Self::RunFailed { run_id, .. }
            | Self::RunCanceled { run_id }
            | Self::RunStep { run_id, .. }
            | Self::ToolCallRequested { run_id, .. }
            | Self::ToolCallDispatched { run_id, .. }
            | Self::ToolResultRecorded { run_id, .. }
            | Self::ToolCallFailed { run_id, .. }
            | Self::ToolCallExpired { run_id, .. } => Some(*run_id),
            Self::UserMessage { .. } | Self::SystemMessage { .. } | Self::Custom { .. } => None,
        }
    }
}
