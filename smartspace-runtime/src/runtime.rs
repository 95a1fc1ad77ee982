//! The runtime facade.
//!
//! [`Runtime`] wires the event log, entity storage, model registry, tool
//! dispatcher, connection registry and trigger coordinator together and
//! exposes the inbound operations: creating, canceling and inspecting runs,
//! submitting tool results, posting space messages, subscribing to scopes,
//! managing remote connections and the space directory.

use crate::connections::ConnectionRegistry;
use crate::dispatcher::ToolDispatcher;
use crate::executor::{StartMode, SubmitOutcome};
use crate::jobs::MaintenanceMetrics;
use crate::lifecycle::LifecycleEmitter;
use crate::tools::ToolRegistry;
use crate::trigger::{RunLauncher, RunRequest, Trigger, TriggerCoordinator};
use async_trait::async_trait;
use dashmap::DashMap;
use smartspace_core::{
    Connection, ConnectionId, Event, EventPayload, ExecutionTarget, Identity, IdentityId,
    IdentityKind, Membership, ResultSource, ResumeCursor, Role, Run, RunId, RunMetadata,
    RunStatus, RuntimeConfig, ScopeId, Seq, SmartSpace, SpaceId, SpaceResult, StorageConfig,
    StorageError, ToolCall, ToolResult, ValidationError,
};
use smartspace_events::{
    EventLog, EventStore, FanoutBroker, InMemoryEventStore, ReplayFrom, StreamGateway, Subscription,
};
use smartspace_llm::{AbortHandle, ModelRegistry};
use smartspace_storage::{CallTarget, EntityStorage, InMemoryStorage, LmdbStorage, Transition};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared state behind every [`Runtime`] clone and every run task.
pub(crate) struct Core {
    pub(crate) config: RuntimeConfig,
    pub(crate) log: EventLog,
    pub(crate) gateway: StreamGateway,
    pub(crate) storage: Arc<dyn EntityStorage>,
    pub(crate) models: ModelRegistry,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) dispatcher: ToolDispatcher,
    pub(crate) lifecycle: LifecycleEmitter,
    pub(crate) triggers: TriggerCoordinator,
    /// Abort handles of run tasks, tagged with a generation so a finishing
    /// task never removes the handle of its successor.
    pub(crate) active: DashMap<RunId, (u64, AbortHandle)>,
    pub(crate) generation: AtomicU64,
    pub(crate) metrics: Arc<MaintenanceMetrics>,
}

/// Result of [`Runtime::post_message`].
#[derive(Debug, Clone)]
pub struct PostOutcome {
    pub event: Event,
    /// Runs the message woke.
    pub triggered: Vec<RunId>,
}

/// Result of [`Runtime::register_connection`].
#[derive(Debug)]
pub struct ConnectionSession {
    pub connection_id: ConnectionId,
    /// Tool call requests pushed to this connection.
    pub receiver: mpsc::Receiver<smartspace_core::PushMessage>,
    pub reconnected: bool,
    /// Unresolved calls pushed again on registration.
    pub repushed: usize,
}

/// Result of [`Runtime::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Queued runs started.
    pub started: usize,
    /// Running runs continued and waiting runs whose calls had all resolved.
    pub resumed: usize,
    /// Waiting runs left parked for outstanding results.
    pub parked: usize,
}

/// Handle to a running SmartSpace runtime. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) core: Arc<Core>,
}

impl Runtime {
    /// Build a runtime over the given stores.
    pub fn new(
        config: RuntimeConfig,
        events: Arc<dyn EventStore>,
        storage: Arc<dyn EntityStorage>,
        models: ModelRegistry,
        tools: ToolRegistry,
    ) -> SpaceResult<Self> {
        config.validate()?;

        let broker = Arc::new(FanoutBroker::from_config(&config));
        let log = EventLog::new(events, broker, config.retry.clone());
        let gateway = StreamGateway::new(&log, &config);
        let tools = Arc::new(tools);
        let connections = Arc::new(ConnectionRegistry::new(config.push_buffer));
        let dispatcher = ToolDispatcher::new(Arc::clone(&tools), Arc::clone(&connections), &config)?;
        let lifecycle = LifecycleEmitter::new(log.clone(), config.lifecycle_mirror);
        let triggers = TriggerCoordinator::new(Arc::clone(&storage), config.max_trigger_depth);

        info!(
            max_steps = config.max_steps,
            max_trigger_depth = config.max_trigger_depth,
            lifecycle_mirror = ?config.lifecycle_mirror,
            tools = tools.len(),
            "SmartSpace runtime initialized"
        );

        Ok(Self {
            core: Arc::new(Core {
                config,
                log,
                gateway,
                storage,
                models,
                tools,
                connections,
                dispatcher,
                lifecycle,
                triggers,
                active: DashMap::new(),
                generation: AtomicU64::new(0),
                metrics: Arc::new(MaintenanceMetrics::default()),
            }),
        })
    }

    /// A runtime whose events and entities live only in memory.
    pub fn in_memory(
        config: RuntimeConfig,
        models: ModelRegistry,
        tools: ToolRegistry,
    ) -> SpaceResult<Self> {
        Self::new(
            config,
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryStorage::new()),
            models,
            tools,
        )
    }

    /// A runtime backed by one LMDB environment for events and entities.
    pub fn open_lmdb(
        config: RuntimeConfig,
        storage_config: &StorageConfig,
        models: ModelRegistry,
        tools: ToolRegistry,
    ) -> SpaceResult<Self> {
        storage_config.validate()?;
        let store = Arc::new(LmdbStorage::open(storage_config)?);
        let events: Arc<dyn EventStore> = store.clone();
        Self::new(config, events, store, models, tools)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.core.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.core.tools
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.core.connections
    }

    pub fn event_log(&self) -> &EventLog {
        &self.core.log
    }

    /// Runs with a live task in this process.
    pub fn active_runs(&self) -> usize {
        self.core.active.len()
    }

    // ========================================================================
    // DIRECTORY
    // ========================================================================

    pub async fn create_space(&self, name: impl Into<String>) -> SpaceResult<SmartSpace> {
        let space = SmartSpace::new(name);
        self.core.storage.space_insert(&space).await?;
        info!(space_id = %space.space_id, name = %space.name, "Space created");
        Ok(space)
    }

    pub async fn upsert_identity(&self, identity: &Identity) -> SpaceResult<()> {
        self.core.storage.identity_upsert(identity).await
    }

    /// Add `identity` to a space, storing the identity as well.
    pub async fn add_member(
        &self,
        space_id: SpaceId,
        identity: &Identity,
        role: Role,
    ) -> SpaceResult<Membership> {
        self.require_space(space_id).await?;
        self.core.storage.identity_upsert(identity).await?;
        let membership = Membership::new(space_id, identity, role);
        self.core.storage.membership_upsert(&membership).await?;
        debug!(space_id = %space_id, identity_id = %identity.identity_id, ?role, "Member added");
        Ok(membership)
    }

    pub async fn remove_member(&self, space_id: SpaceId, identity_id: IdentityId) -> SpaceResult<bool> {
        self.core.storage.membership_remove(space_id, identity_id).await
    }

    pub async fn members(&self, space_id: SpaceId) -> SpaceResult<Vec<Membership>> {
        self.core.storage.membership_list_by_space(space_id).await
    }

    async fn require_space(&self, space_id: SpaceId) -> SpaceResult<SmartSpace> {
        self.core
            .storage
            .space_get(space_id)
            .await?
            .ok_or_else(|| {
                StorageError::NotFound {
                    entity: "SmartSpace",
                    id: space_id.to_string(),
                }
                .into()
            })
    }

    // ========================================================================
    // INBOUND OPERATIONS
    // ========================================================================

    /// Append a message to a space and wake its agents.
    ///
    /// The sender must be a member with write access. System identities post
    /// `message.system`, everyone else `message.user`.
    pub async fn post_message(
        &self,
        space_id: SpaceId,
        sender: IdentityId,
        content: impl Into<String>,
    ) -> SpaceResult<PostOutcome> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "content".to_string(),
            }
            .into());
        }
        let membership = self.core.storage.membership_get(space_id, sender).await?;
        let membership = match membership {
            Some(m) if m.role != Role::Observer => m,
            _ => {
                return Err(ValidationError::NotAMember {
                    identity: sender.to_string(),
                    scope: ScopeId::Space(space_id),
                }
                .into())
            }
        };

        let payload = if membership.identity_kind == IdentityKind::System {
            EventPayload::SystemMessage { sender, content }
        } else {
            EventPayload::UserMessage { sender, content }
        };
        let event = self.core.log.append(ScopeId::Space(space_id), payload).await?;
        debug!(space_id = %space_id, sender = %sender, seq = event.seq, "Message posted");

        let launcher: &dyn RunLauncher = &self.core;
        let triggered = self
            .core
            .triggers
            .trigger_agents(
                launcher,
                Trigger {
                    space_id,
                    sender,
                    depth: 0,
                    seq: Some(event.seq),
                    parent_run_id: None,
                },
            )
            .await;
        Ok(PostOutcome { event, triggered })
    }

    /// Create a run for `agent_id` in a space and start it.
    pub async fn create_run(
        &self,
        space_id: SpaceId,
        agent_id: IdentityId,
        triggered_by: IdentityId,
        parent_run_id: Option<RunId>,
    ) -> SpaceResult<Run> {
        let depth = match parent_run_id {
            Some(parent) => self.core.load_run(parent).await?.metadata.trigger_depth + 1,
            None => 1,
        };
        let request = RunRequest {
            space_id,
            agent_id,
            triggered_by,
            parent_run_id,
            metadata: RunMetadata {
                trigger_depth: depth,
                trigger_seq: None,
                origin_scope: parent_run_id.map(ScopeId::Run),
                extra: None,
            },
        };
        self.core.start_run(request).await
    }

    /// Create and start a run from a fully specified request.
    pub async fn start_run(&self, request: RunRequest) -> SpaceResult<Run> {
        self.core.start_run(request).await
    }

    /// Cancel a run. Canceling a finished run returns it unchanged.
    pub async fn cancel_run(&self, run_id: RunId) -> SpaceResult<Run> {
        self.core.cancel_run(run_id).await
    }

    /// Record a tool result. A repeated submission replaces the stored
    /// result and never resumes the run twice.
    pub async fn submit_tool_result(
        &self,
        run_id: RunId,
        call_id: &str,
        result: serde_json::Value,
        source: ResultSource,
        connection_key: Option<&str>,
    ) -> SpaceResult<SubmitOutcome> {
        self.core
            .submit_tool_result(run_id, call_id, result, false, source, connection_key)
            .await
    }

    /// Record that a tool ran and failed.
    pub async fn submit_tool_error(
        &self,
        run_id: RunId,
        call_id: &str,
        message: impl Into<String>,
        source: ResultSource,
        connection_key: Option<&str>,
    ) -> SpaceResult<SubmitOutcome> {
        let result = serde_json::json!({ "error": message.into() });
        self.core
            .submit_tool_result(run_id, call_id, result, true, source, connection_key)
            .await
    }

    // ========================================================================
    // READ PATHS
    // ========================================================================

    pub async fn get_run(&self, run_id: RunId) -> SpaceResult<Run> {
        self.core.load_run(run_id).await
    }

    pub async fn list_runs(&self, space_id: SpaceId) -> SpaceResult<Vec<Run>> {
        self.core.storage.run_list_by_space(space_id).await
    }

    pub async fn list_tool_calls(&self, run_id: RunId) -> SpaceResult<Vec<ToolCall>> {
        self.core.storage.tool_call_list_by_run(run_id).await
    }

    pub async fn tool_result(&self, run_id: RunId, call_id: &str) -> SpaceResult<Option<ToolResult>> {
        self.core.storage.tool_result_get(run_id, call_id).await
    }

    /// Durable events of `scope` with seq greater than `after`.
    pub async fn read_history(&self, scope: ScopeId, after: Seq, limit: usize) -> SpaceResult<Vec<Event>> {
        self.core.log.read_from(scope, after, limit).await
    }

    /// [`Runtime::read_history`] for a member of the scope's space.
    pub async fn read_history_as(
        &self,
        reader: IdentityId,
        scope: ScopeId,
        after: Seq,
        limit: usize,
    ) -> SpaceResult<Vec<Event>> {
        self.authorize_read(reader, scope).await?;
        self.read_history(scope, after, limit).await
    }

    /// Replay from `cursor` (or from now when absent) and then tail live.
    pub async fn subscribe(&self, scope: ScopeId, cursor: Option<&ResumeCursor>) -> SpaceResult<Subscription> {
        self.core.gateway.subscribe_with_cursor(scope, cursor).await
    }

    pub async fn subscribe_from(&self, scope: ScopeId, from: ReplayFrom) -> SpaceResult<Subscription> {
        self.core.gateway.subscribe(scope, from).await
    }

    /// [`Runtime::subscribe`] for a member of the scope's space.
    pub async fn subscribe_as(
        &self,
        reader: IdentityId,
        scope: ScopeId,
        cursor: Option<&ResumeCursor>,
    ) -> SpaceResult<Subscription> {
        self.authorize_read(reader, scope).await?;
        self.subscribe(scope, cursor).await
    }

    async fn authorize_read(&self, reader: IdentityId, scope: ScopeId) -> SpaceResult<()> {
        let space_id = match scope {
            ScopeId::Space(space_id) => space_id,
            ScopeId::Run(run_id) => self.core.load_run(run_id).await?.space_id,
        };
        match self.core.storage.membership_get(space_id, reader).await? {
            Some(_) => Ok(()),
            None => Err(ValidationError::NotAMember {
                identity: reader.to_string(),
                scope,
            }
            .into()),
        }
    }

    // ========================================================================
    // CONNECTIONS
    // ========================================================================

    /// Register a remote connection and push it any unresolved calls it
    /// should be serving.
    pub async fn register_connection(
        &self,
        owner: IdentityId,
        connection_key: &str,
        capabilities: Vec<String>,
    ) -> SpaceResult<ConnectionSession> {
        if connection_key.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "connection_key".to_string(),
            }
            .into());
        }
        let registration = self
            .core
            .connections
            .register(owner, connection_key, capabilities);
        let repushed = self.core.repush_to(registration.connection_id).await?;
        Ok(ConnectionSession {
            connection_id: registration.connection_id,
            receiver: registration.receiver,
            reconnected: registration.reconnected,
            repushed,
        })
    }

    /// Remove a connection and re-dispatch its unresolved calls. Returns how
    /// many calls found a new connection.
    pub async fn deregister_connection(&self, connection_id: ConnectionId) -> SpaceResult<usize> {
        match self.core.connections.deregister(connection_id) {
            Some(connection) => self.core.redispatch_from(&connection).await,
            None => Ok(0),
        }
    }

    /// Record a liveness ping.
    pub fn ping(&self, connection_id: ConnectionId) -> bool {
        self.core.connections.touch(connection_id)
    }

    pub fn list_connections(&self, owner: IdentityId) -> Vec<Connection> {
        self.core.connections.list_by_identity(owner)
    }

    // ========================================================================
    // RECOVERY
    // ========================================================================

    /// Pick up runs left unfinished by a previous process.
    pub async fn recover(&self) -> SpaceResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for run in self.core.storage.run_list_by_status(RunStatus::Queued).await? {
            if self.core.active.contains_key(&run.run_id) {
                continue;
            }
            self.core.spawn_run(run.run_id, StartMode::Start);
            report.started += 1;
        }
        for run in self.core.storage.run_list_by_status(RunStatus::Running).await? {
            if self.core.active.contains_key(&run.run_id) {
                continue;
            }
            self.core.spawn_run(run.run_id, StartMode::Continue);
            report.resumed += 1;
        }
        for run in self.core.storage.run_list_by_status(RunStatus::WaitingTool).await? {
            if self.core.maybe_resume(run.run_id).await? {
                report.resumed += 1;
            } else {
                report.parked += 1;
            }
        }

        info!(
            started = report.started,
            resumed = report.resumed,
            parked = report.parked,
            "Run recovery finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl RunLauncher for Arc<Core> {
    async fn launch(&self, request: RunRequest) -> SpaceResult<Run> {
        self.start_run(request).await
    }
}

impl Core {
    /// Push `connection_id` every dispatched call it should serve: calls
    /// already keyed to it, and orphans whose connection is gone.
    pub(crate) async fn repush_to(&self, connection_id: ConnectionId) -> SpaceResult<usize> {
        let Some(connection) = self.connections.get(connection_id) else {
            return Ok(0);
        };
        let mut repushed = 0;

        for call in self.storage.tool_call_list_dispatched().await? {
            let keyed_here = call.target_connection_key.as_deref() == Some(connection.connection_key.as_str());
            let adoptable = !keyed_here
                && call
                    .target_connection
                    .map(|id| !self.connections.is_live(id))
                    .unwrap_or(true)
                && connection.has_capability(&call.tool_name)
                && self.pinned_key(&call).map_or(true, |k| k == connection.connection_key);
            if !keyed_here && !adoptable {
                continue;
            }

            let call = if call.target_connection != Some(connection_id) {
                match self.retarget(&call, &connection).await? {
                    Some(call) => call,
                    None => continue,
                }
            } else {
                call
            };
            if self.dispatcher.push(connection_id, &call) {
                repushed += 1;
            }
        }

        if repushed > 0 {
            info!(connection_id = %connection_id, repushed, "Unresolved calls pushed again");
        }
        Ok(repushed)
    }

    /// Re-dispatch calls left behind by a departed connection.
    pub(crate) async fn redispatch_from(&self, gone: &Connection) -> SpaceResult<usize> {
        let mut moved = 0;
        for call in self.storage.tool_call_list_dispatched().await? {
            if call.target_connection != Some(gone.connection_id) {
                continue;
            }
            if self.pinned_key(&call).is_some() {
                debug!(run_id = %call.run_id, call_id = %call.call_id, "Pinned call waits for its connection");
                continue;
            }
            let Some(alternate) = self.dispatcher.select_connection(
                &call.tool_name,
                None,
                Some(gone.owner),
                Some(gone.connection_id),
            ) else {
                warn!(
                    run_id = %call.run_id,
                    call_id = %call.call_id,
                    tool_name = %call.tool_name,
                    "No alternate connection, call stays pending until expiry"
                );
                continue;
            };
            if let Some(call) = self.retarget(&call, &alternate).await? {
                self.dispatcher.push(alternate.connection_id, &call);
                moved += 1;
            }
        }
        if moved > 0 {
            info!(connection_id = %gone.connection_id, moved, "Calls re-dispatched");
        }
        Ok(moved)
    }

    /// Point a dispatched call at `connection`, keeping its expiry bound.
    async fn retarget(&self, call: &ToolCall, connection: &Connection) -> SpaceResult<Option<ToolCall>> {
        let target = CallTarget {
            connection_id: connection.connection_id,
            connection_key: connection.connection_key.clone(),
        };
        match self
            .storage
            .tool_call_dispatch(call.run_id, &call.call_id, Some(target), None)
            .await?
        {
            Transition::Applied(updated) => {
                self.log
                    .append(
                        ScopeId::Run(updated.run_id),
                        EventPayload::ToolCallDispatched {
                            run_id: updated.run_id,
                            call_id: updated.call_id.clone(),
                            connection_id: connection.connection_id,
                        },
                    )
                    .await?;
                Ok(Some(updated))
            }
            Transition::Rejected(_) => Ok(None),
        }
    }

    fn pinned_key(&self, call: &ToolCall) -> Option<String> {
        self.tools
            .get(&call.tool_name)
            .filter(|spec| spec.target == ExecutionTarget::RemoteConnection)
            .and_then(|spec| spec.connection_key.clone())
    }
}
