//! LMDB-backed durable storage.
//!
//! One environment holds every named database. Event keys are the 17-byte
//! scope prefix followed by the big-endian seq, so a scope's events are
//! contiguous and ordered and its head is the last key under the prefix.
//!
//! # Sequencing
//!
//! LMDB admits one write transaction at a time. `append` reads the head and
//! writes `head + 1` inside a single write transaction, which makes the
//! sequencer atomic across threads without any extra lock. An aborted
//! transaction writes nothing, so failures never burn a seq.

use std::ops::Bound;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use smartspace_core::{
    EntityIdType, Event, EventPayload, Identity, IdentityId, Membership, Run, RunId, RunStatus,
    ScopeId, Seq, SmartSpace, SpaceError, SpaceId, SpaceResult, StorageConfig, StorageError,
    Timestamp, ToolCall, ToolCallStatus, ToolResult, UpsertOutcome, ValidationError,
    SCOPE_KEY_LEN,
};
use smartspace_events::EventStore;
use tracing::{debug, info};

use crate::traits::{apply_dispatch, apply_resolve, apply_run_transition};
use crate::{CallTarget, EntityStorage, Transition};

/// Error type for LMDB operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a named database.
    #[error("Failed to open database {name}: {reason}")]
    DbOpen { name: &'static str, reason: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A stored key did not have the expected layout.
    #[error("Corrupt key in {0}")]
    CorruptKey(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbError> for SpaceError {
    fn from(e: LmdbError) -> Self {
        let storage = match e {
            LmdbError::Serialization(reason) | LmdbError::Deserialization(reason) => {
                StorageError::Serialization { reason }
            }
            LmdbError::EnvOpen(reason) => StorageError::Unavailable { reason },
            other => StorageError::TransactionFailed {
                reason: other.to_string(),
            },
        };
        SpaceError::Storage(storage)
    }
}

fn txn_err(e: heed::Error) -> LmdbError {
    LmdbError::Transaction(e.to_string())
}

const DB_EVENTS: &str = "events";
const DB_RUNS: &str = "runs";
const DB_TOOL_CALLS: &str = "tool_calls";
const DB_TOOL_RESULTS: &str = "tool_results";
const DB_SPACES: &str = "spaces";
const DB_IDENTITIES: &str = "identities";
const DB_MEMBERSHIPS: &str = "memberships";
const MAX_DBS: u32 = 8;

fn event_key(scope: ScopeId, seq: Seq) -> Vec<u8> {
    let mut key = Vec::with_capacity(SCOPE_KEY_LEN + 8);
    key.extend_from_slice(&scope.key_prefix());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn seq_from_key(key: &[u8]) -> Result<Seq, LmdbError> {
    let bytes: [u8; 8] = key
        .get(SCOPE_KEY_LEN..SCOPE_KEY_LEN + 8)
        .and_then(|b| b.try_into().ok())
        .ok_or(LmdbError::CorruptKey(DB_EVENTS))?;
    Ok(Seq::from_be_bytes(bytes))
}

fn id_key<T: EntityIdType>(id: T) -> [u8; 16] {
    *id.as_uuid().as_bytes()
}

fn call_key(run_id: RunId, call_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + call_id.len());
    key.extend_from_slice(&id_key(run_id));
    key.extend_from_slice(call_id.as_bytes());
    key
}

fn membership_key(space_id: SpaceId, identity_id: IdentityId) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(&id_key(space_id));
    key[16..].copy_from_slice(&id_key(identity_id));
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LmdbError> {
    serde_json::to_vec(value).map_err(|e| LmdbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LmdbError> {
    serde_json::from_slice(bytes).map_err(|e| LmdbError::Deserialization(e.to_string()))
}

/// Durable storage for events and entities in a single LMDB environment.
#[derive(Clone)]
pub struct LmdbStorage {
    env: Env,
    events: Database<Bytes, Bytes>,
    runs: Database<Bytes, Bytes>,
    tool_calls: Database<Bytes, Bytes>,
    tool_results: Database<Bytes, Bytes>,
    spaces: Database<Bytes, Bytes>,
    identities: Database<Bytes, Bytes>,
    memberships: Database<Bytes, Bytes>,
}

impl LmdbStorage {
    /// Open or create the environment at `config.path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the environment
    /// cannot be opened, or a named database cannot be created.
    pub fn open(config: &StorageConfig) -> Result<Self, LmdbError> {
        std::fs::create_dir_all(&config.path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.map_size_mb * 1024 * 1024)
                .max_dbs(MAX_DBS)
                .open(&config.path)
        }
        .map_err(|e| LmdbError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let mut create = |name: &'static str| -> Result<Database<Bytes, Bytes>, LmdbError> {
            env.create_database(&mut wtxn, Some(name))
                .map_err(|e| LmdbError::DbOpen {
                    name,
                    reason: e.to_string(),
                })
        };
        let events = create(DB_EVENTS)?;
        let runs = create(DB_RUNS)?;
        let tool_calls = create(DB_TOOL_CALLS)?;
        let tool_results = create(DB_TOOL_RESULTS)?;
        let spaces = create(DB_SPACES)?;
        let identities = create(DB_IDENTITIES)?;
        let memberships = create(DB_MEMBERSHIPS)?;
        wtxn.commit().map_err(txn_err)?;

        info!(path = %config.path.display(), map_size_mb = config.map_size_mb, "LMDB storage opened");

        Ok(Self {
            env,
            events,
            runs,
            tool_calls,
            tool_results,
            spaces,
            identities,
            memberships,
        })
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        db: Database<Bytes, Bytes>,
        key: &[u8],
    ) -> Result<Option<T>, LmdbError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match db.get(&rtxn, key).map_err(txn_err)? {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(
        &self,
        db: Database<Bytes, Bytes>,
        key: &[u8],
        value: &T,
    ) -> Result<(), LmdbError> {
        let bytes = encode(value)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        db.put(&mut wtxn, key, &bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)
    }

    /// Insert `value` under `key` unless the key is already taken.
    fn insert_json<T: Serialize>(
        &self,
        db: Database<Bytes, Bytes>,
        key: &[u8],
        value: &T,
    ) -> Result<bool, LmdbError> {
        let bytes = encode(value)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        if db.get(&wtxn, key).map_err(txn_err)?.is_some() {
            return Ok(false);
        }
        db.put(&mut wtxn, key, &bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    fn scan<T: DeserializeOwned>(
        txn: &RoTxn,
        db: Database<Bytes, Bytes>,
        prefix: Option<&[u8]>,
    ) -> Result<Vec<T>, LmdbError> {
        let mut out = Vec::new();
        match prefix {
            Some(prefix) => {
                for entry in db.prefix_iter(txn, prefix).map_err(txn_err)? {
                    let (_, bytes) = entry.map_err(txn_err)?;
                    out.push(decode(bytes)?);
                }
            }
            None => {
                for entry in db.iter(txn).map_err(txn_err)? {
                    let (_, bytes) = entry.map_err(txn_err)?;
                    out.push(decode(bytes)?);
                }
            }
        }
        Ok(out)
    }

    fn list<T: DeserializeOwned>(
        &self,
        db: Database<Bytes, Bytes>,
        prefix: Option<&[u8]>,
    ) -> Result<Vec<T>, LmdbError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Self::scan(&rtxn, db, prefix)
    }

    /// Read, mutate and write back one record inside a single write
    /// transaction. Nothing is written when `apply` returns false.
    fn update<T, F>(
        &self,
        db: Database<Bytes, Bytes>,
        key: &[u8],
        not_found: impl FnOnce() -> StorageError,
        apply: F,
    ) -> SpaceResult<Transition<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut value: T = match db.get(&wtxn, key).map_err(txn_err)? {
            Some(bytes) => decode(bytes)?,
            None => return Err(not_found().into()),
        };
        if !apply(&mut value) {
            return Ok(Transition::Rejected(value));
        }
        Self::write_back(&mut wtxn, db, key, &value)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(Transition::Applied(value))
    }

    fn write_back<T: Serialize>(
        wtxn: &mut RwTxn,
        db: Database<Bytes, Bytes>,
        key: &[u8],
        value: &T,
    ) -> Result<(), LmdbError> {
        let bytes = encode(value)?;
        db.put(wtxn, key, &bytes).map_err(txn_err)
    }

    fn head_in(&self, txn: &RoTxn, scope: ScopeId) -> Result<Seq, LmdbError> {
        let prefix = scope.key_prefix();
        let mut iter = self
            .events
            .rev_prefix_iter(txn, &prefix[..])
            .map_err(txn_err)?;
        match iter.next() {
            Some(entry) => {
                let (key, _) = entry.map_err(txn_err)?;
                seq_from_key(key)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl EventStore for LmdbStorage {
    async fn append(&self, scope: ScopeId, payload: EventPayload) -> SpaceResult<Event> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let seq = self.head_in(&wtxn, scope)? + 1;
        let key = event_key(scope, seq);
        if self.events.get(&wtxn, &key).map_err(txn_err)?.is_some() {
            return Err(StorageError::SequenceConflict { scope, seq }.into());
        }

        let event = Event {
            scope,
            seq,
            timestamp: Utc::now(),
            payload,
        };
        let bytes = encode(&event)?;
        self.events.put(&mut wtxn, &key, &bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(event)
    }

    async fn read_from(&self, scope: ScopeId, after: Seq, limit: usize) -> SpaceResult<Vec<Event>> {
        if limit == 0 || after == Seq::MAX {
            return Ok(Vec::new());
        }
        let start = event_key(scope, after + 1);
        let end = event_key(scope, Seq::MAX);
        let range = (
            Bound::Included(start.as_slice()),
            Bound::Included(end.as_slice()),
        );

        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut events = Vec::new();
        for entry in self.events.range(&rtxn, &range).map_err(txn_err)?.take(limit) {
            let (_, bytes) = entry.map_err(txn_err)?;
            events.push(decode::<Event>(bytes)?);
        }
        Ok(events)
    }

    async fn head(&self, scope: ScopeId) -> SpaceResult<Seq> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Ok(self.head_in(&rtxn, scope)?)
    }
}

#[async_trait]
impl EntityStorage for LmdbStorage {
    // === Run Operations ===

    async fn run_insert(&self, run: &Run) -> SpaceResult<()> {
        if !self.insert_json(self.runs, &id_key(run.run_id), run)? {
            return Err(StorageError::InsertFailed {
                entity: RunId::ENTITY_NAME,
                reason: "already exists".to_string(),
            }
            .into());
        }
        debug!(run_id = %run.run_id, "Run stored");
        Ok(())
    }

    async fn run_get(&self, run_id: RunId) -> SpaceResult<Option<Run>> {
        Ok(self.get_json(self.runs, &id_key(run_id))?)
    }

    async fn run_transition(
        &self,
        run_id: RunId,
        from: &[RunStatus],
        to: RunStatus,
        error: Option<String>,
    ) -> SpaceResult<Transition<Run>> {
        self.update(
            self.runs,
            &id_key(run_id),
            || StorageError::NotFound {
                entity: RunId::ENTITY_NAME,
                id: run_id.to_string(),
            },
            |run: &mut Run| apply_run_transition(run, from, to, error),
        )
    }

    async fn run_list_by_status(&self, status: RunStatus) -> SpaceResult<Vec<Run>> {
        let mut runs: Vec<Run> = self.list(self.runs, None)?;
        runs.retain(|r| r.status == status);
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn run_list_by_space(&self, space_id: SpaceId) -> SpaceResult<Vec<Run>> {
        let mut runs: Vec<Run> = self.list(self.runs, None)?;
        runs.retain(|r| r.space_id == space_id);
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    // === Tool Call Operations ===

    async fn tool_call_insert(&self, call: &ToolCall) -> SpaceResult<()> {
        if !self.insert_json(self.tool_calls, &call_key(call.run_id, &call.call_id), call)? {
            return Err(ValidationError::DuplicateCall {
                run_id: call.run_id,
                call_id: call.call_id.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn tool_call_get(&self, run_id: RunId, call_id: &str) -> SpaceResult<Option<ToolCall>> {
        Ok(self.get_json(self.tool_calls, &call_key(run_id, call_id))?)
    }

    async fn tool_call_list_by_run(&self, run_id: RunId) -> SpaceResult<Vec<ToolCall>> {
        let mut calls: Vec<ToolCall> = self.list(self.tool_calls, Some(&id_key(run_id)))?;
        calls.sort_by_key(|c| c.seq);
        Ok(calls)
    }

    async fn tool_call_dispatch(
        &self,
        run_id: RunId,
        call_id: &str,
        target: Option<CallTarget>,
        expires_at: Option<Timestamp>,
    ) -> SpaceResult<Transition<ToolCall>> {
        self.update(
            self.tool_calls,
            &call_key(run_id, call_id),
            || StorageError::NotFound {
                entity: "ToolCall",
                id: call_id.to_string(),
            },
            |call: &mut ToolCall| apply_dispatch(call, target, expires_at),
        )
    }

    async fn tool_call_resolve(
        &self,
        run_id: RunId,
        call_id: &str,
        from: &[ToolCallStatus],
        to: ToolCallStatus,
        error: Option<String>,
    ) -> SpaceResult<Transition<ToolCall>> {
        self.update(
            self.tool_calls,
            &call_key(run_id, call_id),
            || StorageError::NotFound {
                entity: "ToolCall",
                id: call_id.to_string(),
            },
            |call: &mut ToolCall| apply_resolve(call, from, to, error),
        )
    }

    async fn tool_call_list_dispatched(&self) -> SpaceResult<Vec<ToolCall>> {
        let mut calls: Vec<ToolCall> = self.list(self.tool_calls, None)?;
        calls.retain(|c| c.status == ToolCallStatus::Dispatched);
        calls.sort_by_key(|c| c.created_at);
        Ok(calls)
    }

    // === Tool Result Operations ===

    async fn tool_result_upsert(&self, result: &ToolResult) -> SpaceResult<UpsertOutcome> {
        let key = call_key(result.run_id, &result.call_id);
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let existed = self.tool_results.get(&wtxn, &key).map_err(txn_err)?.is_some();
        Self::write_back(&mut wtxn, self.tool_results, &key, result)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn tool_result_get(
        &self,
        run_id: RunId,
        call_id: &str,
    ) -> SpaceResult<Option<ToolResult>> {
        Ok(self.get_json(self.tool_results, &call_key(run_id, call_id))?)
    }

    async fn tool_result_list_by_run(&self, run_id: RunId) -> SpaceResult<Vec<ToolResult>> {
        let mut results: Vec<ToolResult> = self.list(self.tool_results, Some(&id_key(run_id)))?;
        results.sort_by_key(|r| r.submitted_at);
        Ok(results)
    }

    // === Directory Operations ===

    async fn space_insert(&self, space: &SmartSpace) -> SpaceResult<()> {
        if !self.insert_json(self.spaces, &id_key(space.space_id), space)? {
            return Err(StorageError::InsertFailed {
                entity: SpaceId::ENTITY_NAME,
                reason: "already exists".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn space_get(&self, space_id: SpaceId) -> SpaceResult<Option<SmartSpace>> {
        Ok(self.get_json(self.spaces, &id_key(space_id))?)
    }

    async fn identity_upsert(&self, identity: &Identity) -> SpaceResult<()> {
        Ok(self.put_json(self.identities, &id_key(identity.identity_id), identity)?)
    }

    async fn identity_get(&self, identity_id: IdentityId) -> SpaceResult<Option<Identity>> {
        Ok(self.get_json(self.identities, &id_key(identity_id))?)
    }

    async fn membership_upsert(&self, membership: &Membership) -> SpaceResult<()> {
        let key = membership_key(membership.space_id, membership.identity_id);
        Ok(self.put_json(self.memberships, &key, membership)?)
    }

    async fn membership_get(
        &self,
        space_id: SpaceId,
        identity_id: IdentityId,
    ) -> SpaceResult<Option<Membership>> {
        Ok(self.get_json(self.memberships, &membership_key(space_id, identity_id))?)
    }

    async fn membership_list_by_space(&self, space_id: SpaceId) -> SpaceResult<Vec<Membership>> {
        let mut memberships: Vec<Membership> =
            self.list(self.memberships, Some(&id_key(space_id)))?;
        memberships.sort_by_key(|m| m.joined_at);
        Ok(memberships)
    }

    async fn membership_remove(
        &self,
        space_id: SpaceId,
        identity_id: IdentityId,
    ) -> SpaceResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let removed = self
            .memberships
            .delete(&mut wtxn, &membership_key(space_id, identity_id))
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartspace_core::{AgentProfile, ExecutionTarget, ResultSource, Role};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, LmdbStorage) {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().to_path_buf(),
            map_size_mb: 64,
        };
        let storage = LmdbStorage::open(&config).unwrap();
        (dir, storage)
    }

    fn message(content: &str) -> EventPayload {
        EventPayload::UserMessage {
            sender: IdentityId::now_v7(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_consecutive_seqs_per_scope() {
        let (_dir, storage) = open_temp();
        let a = ScopeId::Space(SpaceId::now_v7());
        let b = ScopeId::Run(RunId::now_v7());

        assert_eq!(storage.append(a, message("1")).await.unwrap().seq, 1);
        assert_eq!(storage.append(a, message("2")).await.unwrap().seq, 2);
        assert_eq!(storage.append(b, message("x")).await.unwrap().seq, 1);
        assert_eq!(storage.head(a).await.unwrap(), 2);
        assert_eq!(storage.head(b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_from_pages_in_order() {
        let (_dir, storage) = open_temp();
        let scope = ScopeId::Space(SpaceId::now_v7());
        for i in 0..10 {
            storage.append(scope, message(&i.to_string())).await.unwrap();
        }

        let page = storage.read_from(scope, 3, 4).await.unwrap();
        let seqs: Vec<Seq> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6, 7]);

        let rest = storage.read_from(scope, 7, 100).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(storage.read_from(scope, 10, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scopes_do_not_bleed_into_each_other() {
        let (_dir, storage) = open_temp();
        let space = ScopeId::Space(SpaceId::now_v7());
        let run = ScopeId::Run(RunId::new(space.as_space().unwrap().as_uuid()));
        storage.append(space, message("space")).await.unwrap();
        storage.append(run, message("run")).await.unwrap();

        let events = storage.read_from(space, 0, 100).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].scope, space);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_gapless() {
        let (_dir, storage) = open_temp();
        let storage = Arc::new(storage);
        let scope = ScopeId::Space(SpaceId::now_v7());

        let mut handles = Vec::new();
        for writer in 0..8 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    storage
                        .append(scope, message(&format!("{}-{}", writer, i)))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let events = storage.read_from(scope, 0, 1000).await.unwrap();
        let seqs: Vec<Seq> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=200).collect::<Vec<Seq>>());
    }

    #[tokio::test]
    async fn test_reopen_preserves_history_and_head() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().to_path_buf(),
            map_size_mb: 64,
        };
        let scope = ScopeId::Space(SpaceId::now_v7());
        let run = Run::new(SpaceId::now_v7(), IdentityId::now_v7(), IdentityId::now_v7());
        {
            let storage = LmdbStorage::open(&config).unwrap();
            storage.append(scope, message("before")).await.unwrap();
            storage.run_insert(&run).await.unwrap();
        }

        let storage = LmdbStorage::open(&config).unwrap();
        assert_eq!(storage.head(scope).await.unwrap(), 1);
        assert_eq!(storage.append(scope, message("after")).await.unwrap().seq, 2);
        assert_eq!(storage.run_get(run.run_id).await.unwrap(), Some(run));
    }

    #[tokio::test]
    async fn test_run_transition_round_trips_through_disk() {
        let (_dir, storage) = open_temp();
        let run = Run::new(SpaceId::now_v7(), IdentityId::now_v7(), IdentityId::now_v7());
        storage.run_insert(&run).await.unwrap();

        let applied = storage
            .run_transition(run.run_id, &[RunStatus::Queued], RunStatus::Running, None)
            .await
            .unwrap();
        assert!(applied.is_applied());

        let rejected = storage
            .run_transition(run.run_id, &[RunStatus::Queued], RunStatus::Running, None)
            .await
            .unwrap();
        assert!(!rejected.is_applied());

        let queued = storage.run_list_by_status(RunStatus::Queued).await.unwrap();
        assert!(queued.is_empty());
        let running = storage.run_list_by_status(RunStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_calls_listed_by_run_in_seq_order() {
        let (_dir, storage) = open_temp();
        let run_id = RunId::now_v7();
        let other = RunId::now_v7();
        for (seq, id) in [(2, "b"), (1, "a"), (3, "c")] {
            let call = ToolCall::new(run_id, seq, id, "t", serde_json::json!({}), ExecutionTarget::Local);
            storage.tool_call_insert(&call).await.unwrap();
        }
        let foreign = ToolCall::new(other, 1, "a", "t", serde_json::json!({}), ExecutionTarget::Local);
        storage.tool_call_insert(&foreign).await.unwrap();

        let calls = storage.tool_call_list_by_run(run_id).await.unwrap();
        let ids: Vec<&str> = calls.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let duplicate = storage.tool_call_insert(&foreign).await.unwrap_err();
        assert!(matches!(
            duplicate,
            SpaceError::Validation(ValidationError::DuplicateCall { .. })
        ));
    }

    #[tokio::test]
    async fn test_tool_result_upsert_reports_outcome() {
        let (_dir, storage) = open_temp();
        let run_id = RunId::now_v7();
        let result = ToolResult::success(run_id, "c1", serde_json::json!("ok"), ResultSource::Backend);
        assert_eq!(
            storage.tool_result_upsert(&result).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            storage.tool_result_upsert(&result).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(storage.tool_result_list_by_run(run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_membership_directory() {
        let (_dir, storage) = open_temp();
        let space = SmartSpace::new("kitchen");
        storage.space_insert(&space).await.unwrap();
        let human = Identity::human("ana");
        let agent = Identity::agent("chef", AgentProfile::new("You cook."));
        storage.identity_upsert(&human).await.unwrap();
        storage.identity_upsert(&agent).await.unwrap();
        storage
            .membership_upsert(&Membership::new(space.space_id, &human, Role::Owner))
            .await
            .unwrap();
        storage
            .membership_upsert(&Membership::new(space.space_id, &agent, Role::Member))
            .await
            .unwrap();

        assert_eq!(storage.membership_list_by_space(space.space_id).await.unwrap().len(), 2);
        assert!(storage
            .membership_remove(space.space_id, human.identity_id)
            .await
            .unwrap());
        assert!(!storage
            .membership_remove(space.space_id, human.identity_id)
            .await
            .unwrap());
        assert_eq!(storage.identity_get(agent.identity_id).await.unwrap(), Some(agent));
    }

    proptest::proptest! {
        #[test]
        fn prop_event_keys_sort_by_seq(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
            let scope = ScopeId::Space(SpaceId::now_v7());
            proptest::prop_assert_eq!(event_key(scope, a).cmp(&event_key(scope, b)), a.cmp(&b));
        }
    }
}
