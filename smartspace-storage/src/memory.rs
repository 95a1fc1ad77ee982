//! In-memory entity storage for tests and single-process development.

use crate::traits::{apply_dispatch, apply_resolve, apply_run_transition};
use crate::{CallTarget, EntityStorage, Transition};
use async_trait::async_trait;
use smartspace_core::{
    EntityIdType, Identity, IdentityId, Membership, Run, RunId, RunStatus, SmartSpace, SpaceId,
    SpaceResult, StorageError, Timestamp, ToolCall, ToolCallStatus, ToolResult, UpsertOutcome,
    ValidationError,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

type CallKey = (RunId, String);

/// In-memory storage backed by `RwLock`ed maps.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    runs: Arc<RwLock<HashMap<RunId, Run>>>,
    tool_calls: Arc<RwLock<HashMap<CallKey, ToolCall>>>,
    tool_results: Arc<RwLock<HashMap<CallKey, ToolResult>>>,
    spaces: Arc<RwLock<HashMap<SpaceId, SmartSpace>>>,
    identities: Arc<RwLock<HashMap<IdentityId, Identity>>>,
    memberships: Arc<RwLock<HashMap<(SpaceId, IdentityId), Membership>>>,
}

fn read<T>(lock: &RwLock<T>) -> SpaceResult<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| StorageError::LockPoisoned.into())
}

fn write<T>(lock: &RwLock<T>) -> SpaceResult<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| StorageError::LockPoisoned.into())
}

fn not_found(entity: &'static str, id: impl ToString) -> StorageError {
    StorageError::NotFound {
        entity,
        id: id.to_string(),
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> SpaceResult<usize> {
        Ok(read(&self.runs)?.len())
    }

    pub fn tool_result_count(&self) -> SpaceResult<usize> {
        Ok(read(&self.tool_results)?.len())
    }
}

#[async_trait]
impl EntityStorage for InMemoryStorage {
    // === Run Operations ===

    async fn run_insert(&self, run: &Run) -> SpaceResult<()> {
        let mut runs = write(&self.runs)?;
        if runs.contains_key(&run.run_id) {
            return Err(StorageError::InsertFailed {
                entity: RunId::ENTITY_NAME,
                reason: "already exists".to_string(),
            }
            .into());
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn run_get(&self, run_id: RunId) -> SpaceResult<Option<Run>> {
        Ok(read(&self.runs)?.get(&run_id).cloned())
    }

    async fn run_transition(
        &self,
        run_id: RunId,
        from: &[RunStatus],
        to: RunStatus,
        error: Option<String>,
    ) -> SpaceResult<Transition<Run>> {
        let mut runs = write(&self.runs)?;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| not_found(RunId::ENTITY_NAME, run_id))?;
        if apply_run_transition(run, from, to, error) {
            Ok(Transition::Applied(run.clone()))
        } else {
            Ok(Transition::Rejected(run.clone()))
        }
    }

    async fn run_list_by_status(&self, status: RunStatus) -> SpaceResult<Vec<Run>> {
        let runs = read(&self.runs)?;
        let mut out: Vec<Run> = runs.values().filter(|r| r.status == status).cloned().collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn run_list_by_space(&self, space_id: SpaceId) -> SpaceResult<Vec<Run>> {
        let runs = read(&self.runs)?;
        let mut out: Vec<Run> = runs
            .values()
            .filter(|r| r.space_id == space_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    // === Tool Call Operations ===

    async fn tool_call_insert(&self, call: &ToolCall) -> SpaceResult<()> {
        let mut calls = write(&self.tool_calls)?;
        let key = (call.run_id, call.call_id.clone());
        if calls.contains_key(&key) {
            return Err(ValidationError::DuplicateCall {
                run_id: call.run_id,
                call_id: call.call_id.clone(),
            }
            .into());
        }
        calls.insert(key, call.clone());
        Ok(())
    }

    async fn tool_call_get(&self, run_id: RunId, call_id: &str) -> SpaceResult<Option<ToolCall>> {
        Ok(read(&self.tool_calls)?
            .get(&(run_id, call_id.to_string()))
            .cloned())
    }

    async fn tool_call_list_by_run(&self, run_id: RunId) -> SpaceResult<Vec<ToolCall>> {
        let calls = read(&self.tool_calls)?;
        let mut out: Vec<ToolCall> = calls
            .values()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.seq);
        Ok(out)
    }

    async fn tool_call_dispatch(
        &self,
        run_id: RunId,
        call_id: &str,
        target: Option<CallTarget>,
        expires_at: Option<Timestamp>,
    ) -> SpaceResult<Transition<ToolCall>> {
        let mut calls = write(&self.tool_calls)?;
        let call = calls
            .get_mut(&(run_id, call_id.to_string()))
            .ok_or_else(|| not_found("ToolCall", call_id))?;
        if apply_dispatch(call, target, expires_at) {
            Ok(Transition::Applied(call.clone()))
        } else {
            Ok(Transition::Rejected(call.clone()))
        }
    }

    async fn tool_call_resolve(
        &self,
        run_id: RunId,
        call_id: &str,
        from: &[ToolCallStatus],
        to: ToolCallStatus,
        error: Option<String>,
    ) -> SpaceResult<Transition<ToolCall>> {
        let mut calls = write(&self.tool_calls)?;
        let call = calls
            .get_mut(&(run_id, call_id.to_string()))
            .ok_or_else(|| not_found("ToolCall", call_id))?;
        if apply_resolve(call, from, to, error) {
            Ok(Transition::Applied(call.clone()))
        } else {
            Ok(Transition::Rejected(call.clone()))
        }
    }

    async fn tool_call_list_dispatched(&self) -> SpaceResult<Vec<ToolCall>> {
        let calls = read(&self.tool_calls)?;
        let mut out: Vec<ToolCall> = calls
            .values()
            .filter(|c| c.status == ToolCallStatus::Dispatched)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    // === Tool Result Operations ===

    async fn tool_result_upsert(&self, result: &ToolResult) -> SpaceResult<UpsertOutcome> {
        let mut results = write(&self.tool_results)?;
        let previous = results.insert((result.run_id, result.call_id.clone()), result.clone());
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn tool_result_get(
        &self,
        run_id: RunId,
        call_id: &str,
    ) -> SpaceResult<Option<ToolResult>> {
        Ok(read(&self.tool_results)?
            .get(&(run_id, call_id.to_string()))
            .cloned())
    }

    async fn tool_result_list_by_run(&self, run_id: RunId) -> SpaceResult<Vec<ToolResult>> {
        let results = read(&self.tool_results)?;
        let mut out: Vec<ToolResult> = results
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.submitted_at);
        Ok(out)
    }

    // === Directory Operations ===

    async fn space_insert(&self, space: &SmartSpace) -> SpaceResult<()> {
        let mut spaces = write(&self.spaces)?;
        if spaces.contains_key(&space.space_id) {
            return Err(StorageError::InsertFailed {
                entity: SpaceId::ENTITY_NAME,
                reason: "already exists".to_string(),
            }
            .into());
        }
        spaces.insert(space.space_id, space.clone());
        Ok(())
    }

    async fn space_get(&self, space_id: SpaceId) -> SpaceResult<Option<SmartSpace>> {
        Ok(read(&self.spaces)?.get(&space_id).cloned())
    }

    async fn identity_upsert(&self, identity: &Identity) -> SpaceResult<()> {
        write(&self.identities)?.insert(identity.identity_id, identity.clone());
        Ok(())
    }

    async fn identity_get(&self, identity_id: IdentityId) -> SpaceResult<Option<Identity>> {
        Ok(read(&self.identities)?.get(&identity_id).cloned())
    }

    async fn membership_upsert(&self, membership: &Membership) -> SpaceResult<()> {
        write(&self.memberships)?.insert(
            (membership.space_id, membership.identity_id),
            membership.clone(),
        );
        Ok(())
    }

    async fn membership_get(
        &self,
        space_id: SpaceId,
        identity_id: IdentityId,
    ) -> SpaceResult<Option<Membership>> {
        Ok(read(&self.memberships)?
            .get(&(space_id, identity_id))
            .cloned())
    }

    async fn membership_list_by_space(&self, space_id: SpaceId) -> SpaceResult<Vec<Membership>> {
        let memberships = read(&self.memberships)?;
        let mut out: Vec<Membership> = memberships
            .values()
            .filter(|m| m.space_id == space_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.joined_at);
        Ok(out)
    }

    async fn membership_remove(
        &self,
        space_id: SpaceId,
        identity_id: IdentityId,
    ) -> SpaceResult<bool> {
        Ok(write(&self.memberships)?
            .remove(&(space_id, identity_id))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartspace_core::{ExecutionTarget, ResultSource, SpaceError};

    fn make_run() -> Run {
        Run::new(SpaceId::now_v7(), IdentityId::now_v7(), IdentityId::now_v7())
    }

    fn make_call(run_id: RunId, call_id: &str) -> ToolCall {
        ToolCall::new(
            run_id,
            1,
            call_id,
            "camera.snap",
            serde_json::json!({}),
            ExecutionTarget::RemoteConnection,
        )
    }

    #[tokio::test]
    async fn test_run_transition_is_compare_and_set() {
        let storage = InMemoryStorage::new();
        let run = make_run();
        storage.run_insert(&run).await.unwrap();

        let started = storage
            .run_transition(run.run_id, &[RunStatus::Queued], RunStatus::Running, None)
            .await
            .unwrap();
        assert!(started.is_applied());

        let again = storage
            .run_transition(run.run_id, &[RunStatus::Queued], RunStatus::Running, None)
            .await
            .unwrap();
        assert!(!again.is_applied());
        assert_eq!(again.into_inner().status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_illegal_edge_is_rejected_even_if_listed() {
        let storage = InMemoryStorage::new();
        let run = make_run();
        storage.run_insert(&run).await.unwrap();
        let result = storage
            .run_transition(run.run_id, &[RunStatus::Queued], RunStatus::Completed, None)
            .await
            .unwrap();
        assert!(!result.is_applied());
    }

    #[tokio::test]
    async fn test_missing_run_transition_is_not_found() {
        let storage = InMemoryStorage::new();
        let err = storage
            .run_transition(RunId::now_v7(), &[RunStatus::Queued], RunStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SpaceError::Storage(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_tool_call_rejected() {
        let storage = InMemoryStorage::new();
        let run_id = RunId::now_v7();
        storage.tool_call_insert(&make_call(run_id, "c1")).await.unwrap();
        let err = storage
            .tool_call_insert(&make_call(run_id, "c1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SpaceError::Validation(ValidationError::DuplicateCall { .. })
        ));
    }

    #[tokio::test]
    async fn test_tool_result_upsert_is_idempotent() {
        let storage = InMemoryStorage::new();
        let run_id = RunId::now_v7();
        let first = ToolResult::success(run_id, "c1", serde_json::json!(1), ResultSource::Backend);
        let second = ToolResult::success(run_id, "c1", serde_json::json!(2), ResultSource::Backend);

        assert_eq!(
            storage.tool_result_upsert(&first).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            storage.tool_result_upsert(&second).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(storage.tool_result_count().unwrap(), 1);
        let stored = storage.tool_result_get(run_id, "c1").await.unwrap().unwrap();
        assert_eq!(stored.result, serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_dispatch_then_resolve_once() {
        let storage = InMemoryStorage::new();
        let run_id = RunId::now_v7();
        storage.tool_call_insert(&make_call(run_id, "c1")).await.unwrap();

        let target = CallTarget {
            connection_id: smartspace_core::ConnectionId::now_v7(),
            connection_key: "phone".to_string(),
        };
        let dispatched = storage
            .tool_call_dispatch(run_id, "c1", Some(target), None)
            .await
            .unwrap();
        assert!(dispatched.is_applied());
        assert_eq!(storage.tool_call_list_dispatched().await.unwrap().len(), 1);

        let done = storage
            .tool_call_resolve(
                run_id,
                "c1",
                &[ToolCallStatus::Dispatched],
                ToolCallStatus::Completed,
                None,
            )
            .await
            .unwrap();
        assert!(done.is_applied());

        let twice = storage
            .tool_call_resolve(
                run_id,
                "c1",
                &[ToolCallStatus::Dispatched],
                ToolCallStatus::Completed,
                None,
            )
            .await
            .unwrap();
        assert!(!twice.is_applied());
        assert!(storage.tool_call_list_dispatched().await.unwrap().is_empty());
    }
}
