//! Tool calls and tool results.

use crate::{ConnectionId, RunId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a tool invocation executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    /// In-process, result returned directly.
    Local,
    /// Pushed to a connected remote client; result arrives later.
    RemoteConnection,
    /// Outbound call to an external service with a bounded timeout.
    ExternalService,
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::RemoteConnection => "remote_connection",
            Self::ExternalService => "external_service",
        })
    }
}

/// Status of a tool call: requested -> dispatched -> completed | failed | expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Requested,
    Dispatched,
    Completed,
    Failed,
    Expired,
}

impl ToolCallStatus {
    /// A call is resolved once it can no longer produce a fresh resumption.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

/// One invocation requested by a run. Unique per `(run_id, call_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub run_id: RunId,
    /// Ordering within the run.
    pub seq: u32,
    /// Caller-supplied correlation id.
    pub call_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub execution_target: ExecutionTarget,
    pub target_connection: Option<ConnectionId>,
    /// Stable key of the connection the call was pushed to; survives reconnects.
    pub target_connection_key: Option<String>,
    pub status: ToolCallStatus,
    pub created_at: Timestamp,
    pub dispatched_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    pub resolved_at: Option<Timestamp>,
    pub error: Option<String>,
}

impl ToolCall {
    pub fn new(
        run_id: RunId,
        seq: u32,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
        execution_target: ExecutionTarget,
    ) -> Self {
        Self {
            run_id,
            seq,
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            args,
            execution_target,
            target_connection: None,
            target_connection_key: None,
            status: ToolCallStatus::Requested,
            created_at: Utc::now(),
            dispatched_at: None,
            expires_at: None,
            resolved_at: None,
            error: None,
        }
    }

    /// Whether a dispatched call has outlived its expiry bound.
    pub fn is_overdue(&self, now: Timestamp) -> bool {
        self.status == ToolCallStatus::Dispatched
            && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Who produced a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Local,
    Connection,
    ExternalService,
    /// Submitted by some other backend process or operator.
    Backend,
    /// Synthesized by the runtime (validation failure, expiry).
    Runtime,
}

/// The result of a tool call. At most one per `(run_id, call_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub run_id: RunId,
    pub call_id: String,
    pub result: serde_json::Value,
    pub is_error: bool,
    pub source: ResultSource,
    pub producing_connection: Option<ConnectionId>,
    pub submitted_at: Timestamp,
}

impl ToolResult {
    pub fn success(
        run_id: RunId,
        call_id: impl Into<String>,
        result: serde_json::Value,
        source: ResultSource,
    ) -> Self {
        Self {
            run_id,
            call_id: call_id.into(),
            result,
            is_error: false,
            source,
            producing_connection: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn error(
        run_id: RunId,
        call_id: impl Into<String>,
        message: impl Into<String>,
        source: ResultSource,
    ) -> Self {
        Self {
            run_id,
            call_id: call_id.into(),
            result: serde_json::json!({ "error": message.into() }),
            is_error: true,
            source,
            producing_connection: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn from_connection(mut self, connection_id: ConnectionId) -> Self {
        self.producing_connection = Some(connection_id);
        self
    }
}

/// Whether an idempotent upsert created or replaced a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}
