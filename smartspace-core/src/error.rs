//! Error types for SmartSpace operations

use crate::{RunId, RunStatus, ScopeId, Seq};
use thiserror::Error;

/// Storage layer errors (durable event store and entity storage).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Insert failed for {entity}: {reason}")]
    InsertFailed { entity: &'static str, reason: String },

    #[error("Sequence conflict in {scope} at seq {seq}")]
    SequenceConflict { scope: ScopeId, seq: Seq },

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors, raised before anything is dispatched or persisted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Tool {tool_name} is not available to this agent")]
    ToolNotAllowed { tool_name: String },

    #[error("Invalid arguments for tool {tool_name}: {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    #[error("Duplicate tool call {call_id} in run {run_id}")]
    DuplicateCall { run_id: RunId, call_id: String },

    #[error("Identity {identity} is not a member of {scope}")]
    NotAMember { identity: String, scope: ScopeId },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Model-inference collaborator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("No model provider configured")]
    ProviderNotConfigured,

    #[error("Request to {provider} failed: {message}")]
    RequestFailed { provider: String, message: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Generation aborted")]
    Aborted,
}

/// Tool dispatch errors. Terminal for the specific tool call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No reachable connection for tool {tool_name}")]
    NoConnection { tool_name: String },

    #[error("Tool {tool_name} timed out after {after_ms}ms")]
    Timeout { tool_name: String, after_ms: u64 },

    #[error("External service for {tool_name} returned status {status}")]
    ExternalStatus { tool_name: String, status: u16 },

    #[error("Transport error for {tool_name}: {reason}")]
    Transport { tool_name: String, reason: String },

    #[error("Tool {tool_name} failed: {reason}")]
    ToolFailed { tool_name: String, reason: String },

    #[error("Tool call {call_id} expired without a result")]
    Expired { call_id: String },
}

/// Run lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("Run not found: {run_id}")]
    NotFound { run_id: RunId },

    #[error("Invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Step budget of {max_steps} exhausted")]
    StepBudgetExhausted { max_steps: u32 },
}

/// Stream gateway errors. Only ever terminate the affected subscriber.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("Invalid resume cursor: {reason}")]
    InvalidCursor { reason: String },

    #[error("Cursor for {cursor_scope} used to subscribe to {scope}")]
    ScopeMismatch {
        scope: ScopeId,
        cursor_scope: ScopeId,
    },

    #[error("Cursor seq {seq} is ahead of the head of {scope} ({head})")]
    CursorAhead { scope: ScopeId, seq: Seq, head: Seq },

    #[error("Gap in {scope}: expected seq {expected}, history ends at {found}")]
    Gap {
        scope: ScopeId,
        expected: Seq,
        found: Seq,
    },
}

/// Master error type for all SmartSpace errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpaceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

impl SpaceError {
    /// Infrastructure errors worth retrying with backoff at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SpaceError::Storage(StorageError::Unavailable { .. })
                | SpaceError::Storage(StorageError::TransactionFailed { .. })
        )
    }

    /// Duplicate-seq conflicts are retried with a freshly computed seq.
    pub fn is_sequence_conflict(&self) -> bool {
        matches!(self, SpaceError::Storage(StorageError::SequenceConflict { .. }))
    }
}

/// Result type alias for SmartSpace operations.
pub type SpaceResult<T> = Result<T, SpaceError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityIdType, SpaceId};

    #[test]
    fn test_storage_error_display_conflict() {
        let scope = ScopeId::Space(SpaceId::now_v7());
        let err = StorageError::SequenceConflict { scope, seq: 7 };
        let msg = format!("{}", err);
        assert!(msg.contains("Sequence conflict"));
        assert!(msg.contains("seq 7"));
        assert!(msg.contains("space:"));
    }

    #[test]
    fn test_transient_classification() {
        let unavailable: SpaceError = StorageError::Unavailable {
            reason: "down".to_string(),
        }
        .into();
        assert!(unavailable.is_transient());

        let missing: SpaceError = StorageError::NotFound {
            entity: "Run",
            id: "x".to_string(),
        }
        .into();
        assert!(!missing.is_transient());

        let conflict: SpaceError = StorageError::SequenceConflict {
            scope: ScopeId::Run(RunId::now_v7()),
            seq: 1,
        }
        .into();
        assert!(conflict.is_sequence_conflict());
        assert!(!conflict.is_transient());
    }

    #[test]
    fn test_dispatch_error_display_timeout() {
        let err = DispatchError::Timeout {
            tool_name: "lookup".to_string(),
            after_ms: 1500,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("lookup"));
        assert!(msg.contains("1500"));
    }

    #[test]
    fn test_run_error_display_transition() {
        let err = RunError::InvalidTransition {
            run_id: RunId::now_v7(),
            from: RunStatus::Completed,
            to: RunStatus::Running,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("completed -> running"));
    }
}
