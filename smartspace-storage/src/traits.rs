//! Async storage trait for SmartSpace entities.
//!
//! Mutations of runs and tool calls are compare-and-set: a transition names
//! the statuses it may start from and is refused otherwise. This is what
//! keeps duplicate result submissions from resuming a run twice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smartspace_core::{
    ConnectionId, Identity, IdentityId, Membership, Run, RunId, RunStatus, SmartSpace, SpaceId,
    SpaceResult, Timestamp, ToolCall, ToolCallStatus, ToolResult, UpsertOutcome,
};

/// Outcome of a compare-and-set status change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<T> {
    /// The entity was in an allowed status and now holds the new one.
    Applied(T),
    /// The entity was not in an allowed status; it is returned unchanged.
    Rejected(T),
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Transition::Applied(t) | Transition::Rejected(t) => t,
        }
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Transition::Applied(t) => Some(t),
            Transition::Rejected(_) => None,
        }
    }
}

/// Where a remote call was pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTarget {
    pub connection_id: ConnectionId,
    pub connection_key: String,
}

/// Storage for runs, tool calls, tool results and the space directory.
#[async_trait]
pub trait EntityStorage: Send + Sync {
    // ========================================================================
    // RUN OPERATIONS
    // ========================================================================

    /// Insert a new run.
    async fn run_insert(&self, run: &Run) -> SpaceResult<()>;

    /// Get a run by ID.
    async fn run_get(&self, run_id: RunId) -> SpaceResult<Option<Run>>;

    /// Move a run to `to` if its current status is one of `from`.
    async fn run_transition(
        &self,
        run_id: RunId,
        from: &[RunStatus],
        to: RunStatus,
        error: Option<String>,
    ) -> SpaceResult<Transition<Run>>;

    /// List runs in a status.
    async fn run_list_by_status(&self, status: RunStatus) -> SpaceResult<Vec<Run>>;

    /// List a space's runs, oldest first.
    async fn run_list_by_space(&self, space_id: SpaceId) -> SpaceResult<Vec<Run>>;

    // ========================================================================
    // TOOL CALL OPERATIONS
    // ========================================================================

    /// Insert a tool call. A second insert for the same `(run_id, call_id)`
    /// fails with `ValidationError::DuplicateCall`.
    async fn tool_call_insert(&self, call: &ToolCall) -> SpaceResult<()>;

    async fn tool_call_get(&self, run_id: RunId, call_id: &str) -> SpaceResult<Option<ToolCall>>;

    /// A run's tool calls ordered by their seq.
    async fn tool_call_list_by_run(&self, run_id: RunId) -> SpaceResult<Vec<ToolCall>>;

    /// Mark a `requested` or `dispatched` call as dispatched to `target`.
    /// `expires_at` replaces the expiry bound when given.
    async fn tool_call_dispatch(
        &self,
        run_id: RunId,
        call_id: &str,
        target: Option<CallTarget>,
        expires_at: Option<Timestamp>,
    ) -> SpaceResult<Transition<ToolCall>>;

    /// Move a call to a resolved status if its current status is one of `from`.
    async fn tool_call_resolve(
        &self,
        run_id: RunId,
        call_id: &str,
        from: &[ToolCallStatus],
        to: ToolCallStatus,
        error: Option<String>,
    ) -> SpaceResult<Transition<ToolCall>>;

    /// Every call currently `dispatched`, across runs.
    async fn tool_call_list_dispatched(&self) -> SpaceResult<Vec<ToolCall>>;

    // ========================================================================
    // TOOL RESULT OPERATIONS
    // ========================================================================

    /// Insert or replace the result for `(run_id, call_id)`.
    async fn tool_result_upsert(&self, result: &ToolResult) -> SpaceResult<UpsertOutcome>;

    async fn tool_result_get(&self, run_id: RunId, call_id: &str)
        -> SpaceResult<Option<ToolResult>>;

    async fn tool_result_list_by_run(&self, run_id: RunId) -> SpaceResult<Vec<ToolResult>>;

    // ========================================================================
    // DIRECTORY OPERATIONS
    // ========================================================================

    async fn space_insert(&self, space: &SmartSpace) -> SpaceResult<()>;

    async fn space_get(&self, space_id: SpaceId) -> SpaceResult<Option<SmartSpace>>;

    /// Insert or replace an identity.
    async fn identity_upsert(&self, identity: &Identity) -> SpaceResult<()>;

    async fn identity_get(&self, identity_id: IdentityId) -> SpaceResult<Option<Identity>>;

    /// Insert or replace a membership.
    async fn membership_upsert(&self, membership: &Membership) -> SpaceResult<()>;

    async fn membership_get(
        &self,
        space_id: SpaceId,
        identity_id: IdentityId,
    ) -> SpaceResult<Option<Membership>>;

    async fn membership_list_by_space(&self, space_id: SpaceId) -> SpaceResult<Vec<Membership>>;

    /// Returns whether a membership was removed.
    async fn membership_remove(&self, space_id: SpaceId, identity_id: IdentityId)
        -> SpaceResult<bool>;
}

/// Apply a dispatch to a call in place. Shared by the backends.
pub(crate) fn apply_dispatch(
    call: &mut ToolCall,
    target: Option<CallTarget>,
    expires_at: Option<Timestamp>,
) -> bool {
    if !matches!(
        call.status,
        ToolCallStatus::Requested | ToolCallStatus::Dispatched
    ) {
        return false;
    }
    call.status = ToolCallStatus::Dispatched;
    call.dispatched_at = Some(chrono::Utc::now());
    if let Some(target) = target {
        call.target_connection = Some(target.connection_id);
        call.target_connection_key = Some(target.connection_key);
    }
    if expires_at.is_some() {
        call.expires_at = expires_at;
    }
    true
}

/// Apply a resolution to a call in place. Shared by the backends.
pub(crate) fn apply_resolve(
    call: &mut ToolCall,
    from: &[ToolCallStatus],
    to: ToolCallStatus,
    error: Option<String>,
) -> bool {
    if !from.contains(&call.status) {
        return false;
    }
    call.status = to;
    if to.is_resolved() {
        call.resolved_at = Some(chrono::Utc::now());
    }
    if error.is_some() {
        call.error = error;
    }
    true
}

/// Apply a run status change in place if allowed. Shared by the backends.
pub(crate) fn apply_run_transition(
    run: &mut Run,
    from: &[RunStatus],
    to: RunStatus,
    error: Option<String>,
) -> bool {
    if !from.contains(&run.status) || !run.status.can_transition_to(to) {
        return false;
    }
    run.apply_status(to, error);
    true
}
