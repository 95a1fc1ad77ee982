//! Run entity and lifecycle states.

use crate::{IdentityId, RunId, ScopeId, SpaceId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a run. `Completed`, `Failed` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingTool,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Statuses a run may be canceled from.
    pub const CANCELABLE: [RunStatus; 3] = [Self::Queued, Self::Running, Self::WaitingTool];

    /// Whether `self -> next` is a legal lifecycle edge.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Queued, Running) => true,
            (Running, WaitingTool) | (WaitingTool, Running) => true,
            (Running, Completed) => true,
            (Running, Failed) | (WaitingTool, Failed) => true,
            // A queued run that cannot even start (agent missing, crash recovery) fails too.
            (Queued, Failed) => true,
            (from, Canceled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Wire name, also used as the suffix of lifecycle event types.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingTool => "waiting_tool",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance recorded at creation time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Position in an agent-to-agent cascade (1 for a run woken by a human).
    pub trigger_depth: u32,
    /// Seq of the space event that caused the run, if any.
    pub trigger_seq: Option<u64>,
    /// Scope of the parent run when the cascade crossed scopes.
    pub origin_scope: Option<ScopeId>,
    /// Free-form caller data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// One execution of one agent inside one SmartSpace.
///
/// Everything except `status`, `completed_at`, `error` and `updated_at` is
/// fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub space_id: SpaceId,
    pub agent_id: IdentityId,
    pub triggered_by: IdentityId,
    pub parent_run_id: Option<RunId>,
    pub status: RunStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub error: Option<String>,
    pub metadata: RunMetadata,
}

impl Run {
    /// Create a new run in `queued`.
    pub fn new(space_id: SpaceId, agent_id: IdentityId, triggered_by: IdentityId) -> Self {
        let now = Utc::now();
        Self {
            run_id: crate::EntityIdType::now_v7(),
            space_id,
            agent_id,
            triggered_by,
            parent_run_id: None,
            status: RunStatus::Queued,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            metadata: RunMetadata::default(),
        }
    }

    pub fn with_parent(mut self, parent_run_id: RunId) -> Self {
        self.parent_run_id = Some(parent_run_id);
        self
    }

    pub fn with_metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// The run's own sequencing scope.
    pub fn scope(&self) -> ScopeId {
        ScopeId::Run(self.run_id)
    }

    /// The owning SmartSpace's scope.
    pub fn space_scope(&self) -> ScopeId {
        ScopeId::Space(self.space_id)
    }

    /// Apply a status change in place. Terminal statuses stamp `completed_at`.
    pub fn apply_status(&mut self, status: RunStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
        if error.is_some() {
            self.error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityIdType;

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::WaitingTool.is_terminal());
    }

    #[test]
    fn test_lifecycle_edges() {
        use RunStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(WaitingTool));
        assert!(WaitingTool.can_transition_to(Running));
        assert!(WaitingTool.can_transition_to(Failed));
        assert!(WaitingTool.can_transition_to(Canceled));
        assert!(!WaitingTool.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Canceled));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn test_apply_terminal_status_stamps_completion() {
        let mut run = Run::new(SpaceId::now_v7(), IdentityId::now_v7(), IdentityId::now_v7());
        assert_eq!(run.status, RunStatus::Queued);
        run.apply_status(RunStatus::Running, None);
        assert!(run.completed_at.is_none());
        run.apply_status(RunStatus::Failed, Some("boom".to_string()));
        assert!(run.completed_at.is_some());
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::WaitingTool).unwrap();
        assert_eq!(json, "\"waiting_tool\"");
    }
}
