//! Run state machine.
//!
//! Each run is driven by one task at a time. The task owns the reasoning
//! loop until the run completes, fails, or parks in `waiting_tool`. Every
//! status change is a compare-and-set in storage, so a task that lost a race
//! (to a cancel, an expiry or a duplicate result) sees its transition
//! rejected and stops.

use crate::context::{build_messages, RunTranscript};
use crate::dispatcher::Dispatched;
use crate::lifecycle::LifecycleEmitter;
use crate::runtime::Core;
use crate::tools::ToolInvocation;
use crate::trigger::{RunLauncher, RunRequest, Trigger};
use chrono::Utc;
use smartspace_core::{
    AgentProfile, DispatchError, Event, EventPayload, IdentityId, LlmError, ResultSource, Run,
    RunError, RunId, RunStatus, ScopeId, SpaceError, SpaceResult, StorageError, Timestamp,
    ToolCall, ToolCallStatus, ToolFailurePolicy, ToolResult, UpsertOutcome, ValidationError,
};
use smartspace_llm::{
    abort_pair, generate_with_abort, AbortSignal, GenerateRequest, ModelOutcome, ToolCallRequest,
};
use smartspace_storage::{CallTarget, Transition};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a run task enters the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartMode {
    /// Move `queued -> running` first.
    Start,
    /// The run is already `running` (resumed or recovered).
    Continue,
}

enum StepOutcome {
    /// Every call of the step resolved; ask the model again.
    Continue,
    /// The run parked, failed or was canceled.
    Stopped,
}

enum CallState {
    Done,
    Failed(String),
    Pending(String),
}

/// Result of [`crate::Runtime::submit_tool_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub outcome: UpsertOutcome,
    /// This submission moved the run out of `waiting_tool`.
    pub resumed: bool,
}

impl Core {
    // ========================================================================
    // TASKS
    // ========================================================================

    /// Start a task driving `run_id`. Returns immediately.
    pub(crate) fn spawn_run(self: &Arc<Self>, run_id: RunId, mode: StartMode) {
        let (handle, signal) = abort_pair();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.active.insert(run_id, (generation, handle));

        let core = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = core.drive(run_id, mode, &signal).await {
                if signal.is_aborted() {
                    debug!(run_id = %run_id, error = %e, "Run task ended after abort");
                } else if let Err(fail_err) = core
                    .fail_run(run_id, &RunStatus::CANCELABLE, e.to_string())
                    .await
                {
                    warn!(run_id = %run_id, error = %fail_err, "Failed to record run failure");
                }
            }
            core.active.remove_if(&run_id, |_, (g, _)| *g == generation);
        });
    }

    async fn drive(self: &Arc<Self>, run_id: RunId, mode: StartMode, abort: &AbortSignal) -> SpaceResult<()> {
        let run = match mode {
            StartMode::Start => {
                match self
                    .storage
                    .run_transition(run_id, &[RunStatus::Queued], RunStatus::Running, None)
                    .await?
                {
                    Transition::Applied(run) => {
                        self.lifecycle.transition(&run, Vec::new()).await?;
                        info!(run_id = %run_id, agent_id = %run.agent_id, "Run started");
                        run
                    }
                    Transition::Rejected(run) => {
                        debug!(run_id = %run_id, status = %run.status, "Run no longer queued");
                        return Ok(());
                    }
                }
            }
            StartMode::Continue => {
                let run = self.load_run(run_id).await?;
                if run.status != RunStatus::Running {
                    debug!(run_id = %run_id, status = %run.status, "Run not running, nothing to continue");
                    return Ok(());
                }
                run
            }
        };
        self.execute(run, abort).await
    }

    // ========================================================================
    // REASONING LOOP
    // ========================================================================

    async fn execute(self: &Arc<Self>, run: Run, abort: &AbortSignal) -> SpaceResult<()> {
        let profile = self.agent_profile(run.agent_id).await?;
        let max_steps = profile.max_steps.unwrap_or(self.config.max_steps);
        let provider = self.models.resolve(&profile)?;
        let tools = self.tools.definitions_for(&profile);
        let timeline = self.load_timeline(&run).await?;
        let names = self.display_names(&timeline).await;

        loop {
            if abort.is_aborted() {
                return Ok(());
            }

            let transcript = self.load_transcript(run.run_id).await?;
            if transcript.steps >= max_steps {
                self.fail_run(
                    run.run_id,
                    &[RunStatus::Running],
                    RunError::StepBudgetExhausted { max_steps }.to_string(),
                )
                .await?;
                return Ok(());
            }
            let step = transcript.steps + 1;

            let request = GenerateRequest {
                run_id: run.run_id,
                agent_id: run.agent_id,
                profile: profile.clone(),
                messages: build_messages(&profile, run.agent_id, &timeline, &names, &transcript),
                tools: tools.clone(),
            };
            debug!(run_id = %run.run_id, step, messages = request.messages.len(), "Calling model");

            let outcome = match generate_with_abort(provider.as_ref(), &request, abort).await {
                Ok(outcome) => outcome,
                Err(SpaceError::Llm(LlmError::Aborted)) => return Ok(()),
                Err(e) => return Err(e),
            };

            match outcome {
                ModelOutcome::Final(content) => {
                    return self.complete(&run, step, content, abort).await;
                }
                ModelOutcome::ToolCalls(requests) if requests.is_empty() => {
                    return Err(LlmError::InvalidResponse {
                        provider: provider.provider_id().to_string(),
                        reason: "empty tool call batch".to_string(),
                    }
                    .into());
                }
                ModelOutcome::ToolCalls(requests) => {
                    if abort.is_aborted() {
                        return Ok(());
                    }
                    match self
                        .run_tool_step(&run, &profile, step, &transcript, requests)
                        .await?
                    {
                        StepOutcome::Continue => continue,
                        StepOutcome::Stopped => return Ok(()),
                    }
                }
            }
        }
    }

    async fn complete(
        self: &Arc<Self>,
        run: &Run,
        step: u32,
        content: String,
        abort: &AbortSignal,
    ) -> SpaceResult<()> {
        if abort.is_aborted() {
            return Ok(());
        }
        // Completion is claimed before the answer is posted; a cancel from
        // here on is a no-op.
        let done = match self
            .storage
            .run_transition(run.run_id, &[RunStatus::Running], RunStatus::Completed, None)
            .await?
        {
            Transition::Applied(done) => done,
            Transition::Rejected(current) => {
                debug!(run_id = %run.run_id, status = %current.status, "Run left running before completion");
                return Ok(());
            }
        };
        let message = self
            .log
            .append(
                run.space_scope(),
                EventPayload::AssistantMessage {
                    sender: run.agent_id,
                    run_id: run.run_id,
                    content,
                },
            )
            .await?;
        self.log
            .append(
                run.scope(),
                EventPayload::RunStep {
                    run_id: run.run_id,
                    step,
                    tool_calls: 0,
                },
            )
            .await?;

        self.lifecycle.transition(&done, Vec::new()).await?;
        info!(run_id = %run.run_id, steps = step, message_seq = message.seq, "Run completed");

        let launcher: &dyn RunLauncher = self;
        let triggered = self
            .triggers
            .trigger_agents(
                launcher,
                Trigger {
                    space_id: done.space_id,
                    sender: done.agent_id,
                    depth: done.metadata.trigger_depth,
                    seq: Some(message.seq),
                    parent_run_id: Some(done.run_id),
                },
            )
            .await;
        if !triggered.is_empty() {
            debug!(run_id = %run.run_id, triggered = triggered.len(), "Completion woke agents");
        }
        Ok(())
    }

    // ========================================================================
    // TOOL STEPS
    // ========================================================================

    async fn run_tool_step(
        self: &Arc<Self>,
        run: &Run,
        profile: &AgentProfile,
        step: u32,
        transcript: &RunTranscript,
        requests: Vec<ToolCallRequest>,
    ) -> SpaceResult<StepOutcome> {
        let base = transcript.call_count() as u32;
        let count = requests.len() as u32;
        let mut pending = Vec::new();
        let mut first_failure: Option<String> = None;

        // Storage holds every inserted call, even one whose request event
        // never made it to the log.
        let mut taken: HashSet<String> = self
            .storage
            .tool_call_list_by_run(run.run_id)
            .await?
            .into_iter()
            .map(|call| call.call_id)
            .collect();
        taken.extend(transcript.calls().map(|call| call.request.call_id.clone()));

        for (i, mut request) in requests.into_iter().enumerate() {
            if request.call_id.is_empty() {
                request.call_id = fresh_call_id(&taken, step, i);
            }
            let seq = base + i as u32 + 1;
            if !taken.insert(request.call_id.clone()) {
                let duplicate = ValidationError::DuplicateCall {
                    run_id: run.run_id,
                    call_id: request.call_id.clone(),
                };
                request.call_id = fresh_call_id(&taken, step, i);
                taken.insert(request.call_id.clone());
                self.reject_call(run, seq, &request, duplicate.into()).await?;
                continue;
            }
            match self.tools.validate(profile, run.run_id, &request) {
                Err(e) => self.reject_call(run, seq, &request, e).await?,
                Ok(invocation) => match self.dispatch_call(run, seq, invocation).await? {
                    CallState::Done => {}
                    CallState::Failed(reason) => {
                        first_failure.get_or_insert(reason);
                    }
                    CallState::Pending(call_id) => pending.push(call_id),
                },
            }
        }

        self.log
            .append(
                run.scope(),
                EventPayload::RunStep {
                    run_id: run.run_id,
                    step,
                    tool_calls: count,
                },
            )
            .await?;

        if let Some(reason) = first_failure {
            if profile.tool_failure_policy == ToolFailurePolicy::FailRun {
                self.fail_run(run.run_id, &[RunStatus::Running], reason).await?;
                return Ok(StepOutcome::Stopped);
            }
        }

        if pending.is_empty() {
            return Ok(StepOutcome::Continue);
        }

        match self
            .storage
            .run_transition(run.run_id, &[RunStatus::Running], RunStatus::WaitingTool, None)
            .await?
        {
            Transition::Applied(waiting) => {
                info!(run_id = %run.run_id, pending = pending.len(), "Run waiting for tool results");
                self.lifecycle.transition(&waiting, pending).await?;
                // Results may have arrived while the step was still dispatching.
                self.maybe_resume(run.run_id).await?;
            }
            Transition::Rejected(current) => {
                debug!(run_id = %run.run_id, status = %current.status, "Run left running while dispatching");
            }
        }
        Ok(StepOutcome::Stopped)
    }

    /// Record a call that failed validation. The rejection is fed back to
    /// the agent on the next step.
    async fn reject_call(
        &self,
        run: &Run,
        seq: u32,
        request: &ToolCallRequest,
        error: SpaceError,
    ) -> SpaceResult<()> {
        let target = self
            .tools
            .get(&request.tool_name)
            .map(|spec| spec.target)
            .unwrap_or(smartspace_core::ExecutionTarget::Local);
        let reason = error.to_string();
        let mut call = ToolCall::new(
            run.run_id,
            seq,
            request.call_id.clone(),
            request.tool_name.clone(),
            request.args.clone(),
            target,
        );
        call.status = ToolCallStatus::Failed;
        call.resolved_at = Some(Utc::now());
        call.error = Some(reason.clone());
        self.storage.tool_call_insert(&call).await?;

        self.log
            .append(
                run.scope(),
                EventPayload::ToolCallRequested {
                    run_id: run.run_id,
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    args: call.args.clone(),
                    target,
                },
            )
            .await?;
        self.log
            .append(
                run.scope(),
                EventPayload::ToolCallFailed {
                    run_id: run.run_id,
                    call_id: call.call_id.clone(),
                    reason: reason.clone(),
                },
            )
            .await?;
        warn!(
            run_id = %run.run_id,
            call_id = %call.call_id,
            tool_name = %call.tool_name,
            reason = %reason,
            "Tool call rejected"
        );
        Ok(())
    }

    async fn dispatch_call(
        &self,
        run: &Run,
        seq: u32,
        invocation: ToolInvocation,
    ) -> SpaceResult<CallState> {
        let call = ToolCall::new(
            run.run_id,
            seq,
            invocation.call_id(),
            invocation.tool_name(),
            invocation.args().clone(),
            invocation.target(),
        );
        self.storage.tool_call_insert(&call).await?;
        self.log
            .append(
                run.scope(),
                EventPayload::ToolCallRequested {
                    run_id: run.run_id,
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    args: call.args.clone(),
                    target: call.execution_target,
                },
            )
            .await?;

        match self.dispatcher.dispatch(&invocation, Some(run.triggered_by)).await {
            Ok(Dispatched::Completed { result, source }) => {
                self.record_result(ToolResult::success(run.run_id, call.call_id.clone(), result, source))
                    .await?;
                self.storage
                    .tool_call_resolve(
                        run.run_id,
                        &call.call_id,
                        &[ToolCallStatus::Requested],
                        ToolCallStatus::Completed,
                        None,
                    )
                    .await?;
                Ok(CallState::Done)
            }
            Ok(Dispatched::Pending { connection }) => {
                let target = CallTarget {
                    connection_id: connection.connection_id,
                    connection_key: connection.connection_key.clone(),
                };
                let expires_at = self.expiry_from(Utc::now());
                match self
                    .storage
                    .tool_call_dispatch(run.run_id, &call.call_id, Some(target), expires_at)
                    .await?
                {
                    Transition::Applied(dispatched) => {
                        self.log
                            .append(
                                run.scope(),
                                EventPayload::ToolCallDispatched {
                                    run_id: run.run_id,
                                    call_id: dispatched.call_id.clone(),
                                    connection_id: connection.connection_id,
                                },
                            )
                            .await?;
                        self.dispatcher.push(connection.connection_id, &dispatched);
                        info!(
                            run_id = %run.run_id,
                            call_id = %dispatched.call_id,
                            tool_name = %dispatched.tool_name,
                            connection_id = %connection.connection_id,
                            "Tool call dispatched"
                        );
                        Ok(CallState::Pending(dispatched.call_id))
                    }
                    Transition::Rejected(current) => {
                        debug!(run_id = %run.run_id, call_id = %current.call_id, status = ?current.status, "Call resolved before dispatch");
                        Ok(CallState::Done)
                    }
                }
            }
            Err(dispatch_error) => {
                let reason = dispatch_error.to_string();
                warn!(
                    run_id = %run.run_id,
                    call_id = %call.call_id,
                    tool_name = %call.tool_name,
                    error = %reason,
                    "Tool call failed"
                );
                self.storage
                    .tool_call_resolve(
                        run.run_id,
                        &call.call_id,
                        &[ToolCallStatus::Requested],
                        ToolCallStatus::Failed,
                        Some(reason.clone()),
                    )
                    .await?;
                self.log
                    .append(
                        run.scope(),
                        EventPayload::ToolCallFailed {
                            run_id: run.run_id,
                            call_id: call.call_id.clone(),
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                Ok(CallState::Failed(reason))
            }
        }
    }

    /// Upsert a result and announce it on the run scope.
    async fn record_result(&self, result: ToolResult) -> SpaceResult<UpsertOutcome> {
        let outcome = self.storage.tool_result_upsert(&result).await?;
        self.log
            .append(
                ScopeId::Run(result.run_id),
                EventPayload::ToolResultRecorded {
                    run_id: result.run_id,
                    call_id: result.call_id.clone(),
                    result: result.result,
                    is_error: result.is_error,
                    source: result.source,
                    updated: outcome == UpsertOutcome::Updated,
                },
            )
            .await?;
        Ok(outcome)
    }

    pub(crate) fn expiry_from(&self, now: Timestamp) -> Option<Timestamp> {
        chrono::Duration::from_std(self.config.tool_call_expiry)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
    }

    // ========================================================================
    // RESULTS AND RESUMPTION
    // ========================================================================

    pub(crate) async fn submit_tool_result(
        self: &Arc<Self>,
        run_id: RunId,
        call_id: &str,
        result: serde_json::Value,
        is_error: bool,
        source: ResultSource,
        connection_key: Option<&str>,
    ) -> SpaceResult<SubmitOutcome> {
        if self.storage.tool_call_get(run_id, call_id).await?.is_none() {
            return Err(StorageError::NotFound {
                entity: "ToolCall",
                id: format!("{}/{}", run_id, call_id),
            }
            .into());
        }

        let mut record = ToolResult {
            run_id,
            call_id: call_id.to_string(),
            result,
            is_error,
            source,
            producing_connection: None,
            submitted_at: Utc::now(),
        };
        if let Some(connection) = connection_key.and_then(|key| self.connections.get_by_key(key)) {
            record = record.from_connection(connection.connection_id);
        }
        let outcome = self.record_result(record).await?;

        let (to, error) = if is_error {
            (ToolCallStatus::Failed, Some("tool reported an error".to_string()))
        } else {
            (ToolCallStatus::Completed, None)
        };
        let transition = self
            .storage
            .tool_call_resolve(
                run_id,
                call_id,
                &[ToolCallStatus::Requested, ToolCallStatus::Dispatched],
                to,
                error,
            )
            .await?;

        let resumed = match transition {
            Transition::Applied(_) => {
                info!(run_id = %run_id, call_id, is_error, "Tool result accepted");
                let failure = is_error.then(|| format!("tool call {} returned an error", call_id));
                self.on_call_resolved(run_id, failure).await?
            }
            Transition::Rejected(current) => {
                debug!(run_id = %run_id, call_id, status = ?current.status, ?outcome, "Result stored for an already resolved call");
                false
            }
        };
        Ok(SubmitOutcome { outcome, resumed })
    }

    /// React to one call resolving. A failure under `FailRun` fails the run
    /// at once; anything else may let the run resume.
    pub(crate) async fn on_call_resolved(
        self: &Arc<Self>,
        run_id: RunId,
        failure: Option<String>,
    ) -> SpaceResult<bool> {
        if let Some(reason) = failure {
            let run = self.load_run(run_id).await?;
            if self.failure_policy(run.agent_id).await == ToolFailurePolicy::FailRun {
                self.fail_run(run_id, &[RunStatus::Running, RunStatus::WaitingTool], reason)
                    .await?;
                return Ok(false);
            }
        }
        self.maybe_resume(run_id).await
    }

    /// Move a `waiting_tool` run back to `running` once every call has
    /// resolved. Returns whether this call did the move.
    pub(crate) async fn maybe_resume(self: &Arc<Self>, run_id: RunId) -> SpaceResult<bool> {
        let Some(run) = self.storage.run_get(run_id).await? else {
            return Ok(false);
        };
        if run.status != RunStatus::WaitingTool {
            return Ok(false);
        }
        let calls = self.storage.tool_call_list_by_run(run_id).await?;
        if calls.iter().any(|c| !c.status.is_resolved()) {
            return Ok(false);
        }

        if self.failure_policy(run.agent_id).await == ToolFailurePolicy::FailRun {
            let failed = calls.iter().find(|c| {
                c.dispatched_at.is_some()
                    && matches!(c.status, ToolCallStatus::Failed | ToolCallStatus::Expired)
            });
            if let Some(call) = failed {
                let reason = call.error.clone().unwrap_or_else(|| {
                    DispatchError::Expired {
                        call_id: call.call_id.clone(),
                    }
                    .to_string()
                });
                self.fail_run(run_id, &[RunStatus::WaitingTool], reason).await?;
                return Ok(false);
            }
        }

        match self
            .storage
            .run_transition(run_id, &[RunStatus::WaitingTool], RunStatus::Running, None)
            .await?
        {
            Transition::Applied(running) => {
                self.lifecycle.transition(&running, Vec::new()).await?;
                info!(run_id = %run_id, "Run resumed");
                self.spawn_run(run_id, StartMode::Continue);
                Ok(true)
            }
            Transition::Rejected(_) => Ok(false),
        }
    }

    // ========================================================================
    // CREATE, CANCEL, FAIL
    // ========================================================================

    pub(crate) async fn start_run(self: &Arc<Self>, request: RunRequest) -> SpaceResult<Run> {
        if self.storage.space_get(request.space_id).await?.is_none() {
            return Err(StorageError::NotFound {
                entity: "SmartSpace",
                id: request.space_id.to_string(),
            }
            .into());
        }
        self.agent_profile(request.agent_id).await?;
        let member = self
            .storage
            .membership_get(request.space_id, request.agent_id)
            .await?;
        if member.is_none() {
            return Err(ValidationError::NotAMember {
                identity: request.agent_id.to_string(),
                scope: ScopeId::Space(request.space_id),
            }
            .into());
        }

        let mut run = Run::new(request.space_id, request.agent_id, request.triggered_by)
            .with_metadata(request.metadata);
        if let Some(parent) = request.parent_run_id {
            run = run.with_parent(parent);
        }
        self.storage.run_insert(&run).await?;
        self.lifecycle.emit(&run, LifecycleEmitter::queued(&run)).await?;
        info!(
            run_id = %run.run_id,
            space_id = %run.space_id,
            agent_id = %run.agent_id,
            triggered_by = %run.triggered_by,
            trigger_depth = run.metadata.trigger_depth,
            "Run queued"
        );

        self.spawn_run(run.run_id, StartMode::Start);
        Ok(run)
    }

    pub(crate) async fn cancel_run(&self, run_id: RunId) -> SpaceResult<Run> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            debug!(run_id = %run_id, status = %run.status, "Cancel of finished run is a no-op");
            return Ok(run);
        }

        match self
            .storage
            .run_transition(run_id, &RunStatus::CANCELABLE, RunStatus::Canceled, None)
            .await?
        {
            Transition::Applied(canceled) => {
                if let Some((_, (_, handle))) = self.active.remove(&run_id) {
                    handle.abort();
                }
                self.lifecycle.transition(&canceled, Vec::new()).await?;
                info!(run_id = %run_id, "Run canceled");
                Ok(canceled)
            }
            Transition::Rejected(current) => Ok(current),
        }
    }

    /// Fail a run currently in one of `from`. Returns the failed run, or
    /// `None` if it had already moved on.
    pub(crate) async fn fail_run(
        &self,
        run_id: RunId,
        from: &[RunStatus],
        reason: String,
    ) -> SpaceResult<Option<Run>> {
        match self
            .storage
            .run_transition(run_id, from, RunStatus::Failed, Some(reason.clone()))
            .await?
        {
            Transition::Applied(failed) => {
                warn!(run_id = %run_id, error = %reason, "Run failed");
                self.lifecycle.transition(&failed, Vec::new()).await?;
                Ok(Some(failed))
            }
            Transition::Rejected(current) => {
                debug!(run_id = %run_id, status = %current.status, "Run already left failable state");
                Ok(None)
            }
        }
    }

    // ========================================================================
    // LOADERS
    // ========================================================================

    pub(crate) async fn load_run(&self, run_id: RunId) -> SpaceResult<Run> {
        self.storage
            .run_get(run_id)
            .await?
            .ok_or(SpaceError::Run(RunError::NotFound { run_id }))
    }

    async fn agent_profile(&self, agent_id: IdentityId) -> SpaceResult<AgentProfile> {
        let identity = self
            .storage
            .identity_get(agent_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "Identity",
                id: agent_id.to_string(),
            })?;
        identity.agent.ok_or_else(|| {
            ValidationError::InvalidValue {
                field: "agent_id".to_string(),
                reason: format!("identity {} is not an agent", agent_id),
            }
            .into()
        })
    }

    async fn failure_policy(&self, agent_id: IdentityId) -> ToolFailurePolicy {
        self.agent_profile(agent_id)
            .await
            .map(|p| p.tool_failure_policy)
            .unwrap_or_default()
    }

    /// The space messages a run may see: the context window ending at the
    /// message that triggered it, or at the current head.
    async fn load_timeline(&self, run: &Run) -> SpaceResult<Vec<Event>> {
        let scope = run.space_scope();
        let upto = match run.metadata.trigger_seq {
            Some(seq) => seq,
            None => self.log.head(scope).await?,
        };
        let window = self.config.context_window as u64;
        let after = upto.saturating_sub(window);
        let events = self
            .log
            .read_from(scope, after, self.config.context_window)
            .await?;
        Ok(events
            .into_iter()
            .filter(|e| e.seq <= upto && e.payload.is_message())
            .collect())
    }

    async fn display_names(&self, timeline: &[Event]) -> HashMap<IdentityId, String> {
        let mut names = HashMap::new();
        for event in timeline {
            let sender = match &event.payload {
                EventPayload::UserMessage { sender, .. }
                | EventPayload::AssistantMessage { sender, .. }
                | EventPayload::SystemMessage { sender, .. } => *sender,
                _ => continue,
            };
            if names.contains_key(&sender) {
                continue;
            }
            if let Ok(Some(identity)) = self.storage.identity_get(sender).await {
                names.insert(sender, identity.display_name);
            }
        }
        names
    }

    async fn load_transcript(&self, run_id: RunId) -> SpaceResult<RunTranscript> {
        let scope = ScopeId::Run(run_id);
        let page = self.config.replay_page_size;
        let mut events = Vec::new();
        let mut after = 0;
        loop {
            let batch = self.log.read_from(scope, after, page).await?;
            let done = batch.len() < page;
            if let Some(last) = batch.last() {
                after = last.seq;
            }
            events.extend(batch);
            if done {
                break;
            }
        }
        Ok(RunTranscript::from_events(&events))
    }
}

/// `call_<step>_<n>`, suffixed until it clashes with no id in `taken`.
fn fresh_call_id(taken: &HashSet<String>, step: u32, index: usize) -> String {
    let base = format!("call_{}_{}", step, index + 1);
    let mut id = base.clone();
    let mut attempt = 1;
    while taken.contains(&id) {
        attempt += 1;
        id = format!("{}_{}", base, attempt);
    }
    id
}
