//! SmartSpace Test Utilities
//!
//! Shared test infrastructure for the SmartSpace workspace:
//! - Scripted model providers
//! - Proptest generators for entity types
//! - Fixtures for common scenarios
//! - Assertions for SmartSpace error variants

pub use smartspace_core::{
    AgentProfile, EntityIdType, Event, EventPayload, ExecutionTarget, Identity, IdentityId,
    LlmError, ResultSource, RetryConfig, RunId, RunStatus, RuntimeConfig, ScopeId, SpaceError,
    SpaceId, SpaceResult, StorageError, Timestamp, ToolFailurePolicy, ValidationError,
};
pub use smartspace_llm::{
    AbortSignal, GenerateRequest, ModelOutcome, ModelProvider, ModelRegistry, ToolCallRequest,
};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ============================================================================
// MODEL PROVIDERS
// ============================================================================

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(ModelOutcome),
    /// Fail the step with a provider error.
    Fail(String),
    /// Never answer; only an abort ends the call.
    Hang,
}

/// Model provider replaying per-agent scripts.
///
/// Each agent has a queue of [`ScriptStep`]s consumed one per `generate`.
/// An agent with an empty queue gets the fallback reply. Every request is
/// recorded for inspection.
pub struct ScriptedModel {
    scripts: Mutex<HashMap<IdentityId, VecDeque<ScriptStep>>>,
    fallback: ModelOutcome,
    delay: Option<Duration>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: ModelOutcome::Final("done".to_string()),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Reply used once an agent's script runs out.
    pub fn with_fallback(mut self, outcome: ModelOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Sleep this long before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, agent: IdentityId, step: ScriptStep) -> &Self {
        lock(&self.scripts).entry(agent).or_default().push_back(step);
        self
    }

    pub fn reply(&self, agent: IdentityId, content: impl Into<String>) -> &Self {
        self.push(agent, ScriptStep::Reply(ModelOutcome::Final(content.into())))
    }

    pub fn tool_calls(&self, agent: IdentityId, calls: Vec<ToolCallRequest>) -> &Self {
        self.push(agent, ScriptStep::Reply(ModelOutcome::ToolCalls(calls)))
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        lock(&self.requests).clone()
    }

    /// Requests made on behalf of `agent`.
    pub fn requests_for(&self, agent: IdentityId) -> Vec<GenerateRequest> {
        lock(&self.requests)
            .iter()
            .filter(|r| r.agent_id == agent)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Wrap into a registry with this model as the default provider.
    pub fn into_registry(self: Arc<Self>) -> ModelRegistry {
        ModelRegistry::single(self)
    }
}

#[async_trait]
impl ModelProvider for ScriptedModel {
    async fn generate(
        &self,
        request: &GenerateRequest,
        abort: &AbortSignal,
    ) -> SpaceResult<ModelOutcome> {
        lock(&self.requests).push(request.clone());
        let step = lock(&self.scripts)
            .get_mut(&request.agent_id)
            .and_then(VecDeque::pop_front);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match step {
            None => Ok(self.fallback.clone()),
            Some(ScriptStep::Reply(outcome)) => Ok(outcome),
            Some(ScriptStep::Fail(message)) => Err(LlmError::RequestFailed {
                provider: self.provider_id().to_string(),
                message,
            }
            .into()),
            Some(ScriptStep::Hang) => {
                abort.aborted().await;
                Err(LlmError::Aborted.into())
            }
        }
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

/// Answers every request with the content of the last message it was given.
#[derive(Debug, Clone, Default)]
pub struct EchoModel;

#[async_trait]
impl ModelProvider for EchoModel {
    async fn generate(
        &self,
        request: &GenerateRequest,
        _abort: &AbortSignal,
    ) -> SpaceResult<ModelOutcome> {
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ModelOutcome::Final(format!("echo: {}", last)))
    }

    fn provider_id(&self) -> &str {
        "echo"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for SmartSpace types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_space_id() -> impl Strategy<Value = SpaceId> {
        arb_uuid().prop_map(SpaceId::new)
    }

    pub fn arb_run_id() -> impl Strategy<Value = RunId> {
        arb_uuid().prop_map(RunId::new)
    }

    pub fn arb_identity_id() -> impl Strategy<Value = IdentityId> {
        arb_uuid().prop_map(IdentityId::new)
    }

    pub fn arb_scope_id() -> impl Strategy<Value = ScopeId> {
        prop_oneof![
            arb_space_id().prop_map(ScopeId::Space),
            arb_run_id().prop_map(ScopeId::Run),
        ]
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-2030
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }

    pub fn arb_run_status() -> impl Strategy<Value = RunStatus> {
        prop_oneof![
            Just(RunStatus::Queued),
            Just(RunStatus::Running),
            Just(RunStatus::WaitingTool),
            Just(RunStatus::Completed),
            Just(RunStatus::Failed),
            Just(RunStatus::Canceled),
        ]
    }

    pub fn arb_execution_target() -> impl Strategy<Value = ExecutionTarget> {
        prop_oneof![
            Just(ExecutionTarget::Local),
            Just(ExecutionTarget::RemoteConnection),
            Just(ExecutionTarget::ExternalService),
        ]
    }

    pub fn arb_result_source() -> impl Strategy<Value = ResultSource> {
        prop_oneof![
            Just(ResultSource::Local),
            Just(ResultSource::Connection),
            Just(ResultSource::ExternalService),
            Just(ResultSource::Backend),
            Just(ResultSource::Runtime),
        ]
    }

    /// Small JSON values of mixed shape.
    pub fn arb_json() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-z ]{0,24}".prop_map(serde_json::Value::from),
            ("[a-z]{1,8}", any::<i32>()).prop_map(|(k, v)| {
                let mut map = serde_json::Map::new();
                map.insert(k, serde_json::Value::from(v));
                serde_json::Value::Object(map)
            }),
        ]
    }

    pub fn arb_tool_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,10}(\\.[a-z][a-z0-9_]{0,10})?"
    }

    pub fn arb_tool_call_request() -> impl Strategy<Value = ToolCallRequest> {
        ("call_[a-z0-9]{1,8}", arb_tool_name(), arb_json())
            .prop_map(|(call_id, tool_name, args)| ToolCallRequest::new(call_id, tool_name, args))
    }

    /// Message and lifecycle payloads, the bulk of real traffic.
    pub fn arb_event_payload() -> impl Strategy<Value = EventPayload> {
        prop_oneof![
            (arb_identity_id(), "[ -~]{0,64}")
                .prop_map(|(sender, content)| EventPayload::UserMessage { sender, content }),
            (arb_identity_id(), arb_run_id(), "[ -~]{0,64}").prop_map(
                |(sender, run_id, content)| EventPayload::AssistantMessage {
                    sender,
                    run_id,
                    content
                }
            ),
            arb_run_id().prop_map(|run_id| EventPayload::RunRunning { run_id }),
            (arb_run_id(), 1u32..20, 0u32..5).prop_map(|(run_id, step, tool_calls)| {
                EventPayload::RunStep {
                    run_id,
                    step,
                    tool_calls,
                }
            }),
            ("[a-z.]{1,16}", arb_json())
                .prop_map(|(name, data)| EventPayload::Custom { name, data }),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;

    /// Development config with timeouts short enough for tests.
    pub fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            tool_call_expiry: Duration::from_millis(200),
            local_tool_timeout: Duration::from_millis(500),
            external_tool_timeout: Duration::from_millis(500),
            connection_stale_timeout: Duration::from_millis(300),
            sweep_interval: Duration::from_millis(25),
            keepalive_interval: Duration::from_millis(200),
            ..RuntimeConfig::development()
        }
    }

    pub fn human(name: &str) -> Identity {
        Identity::human(name)
    }

    /// Agent with no tools and the default failure policy.
    pub fn agent(name: &str) -> Identity {
        Identity::agent(name, AgentProfile::new(format!("You are {}.", name)))
    }

    pub fn agent_with_tools(name: &str, tools: &[&str]) -> Identity {
        Identity::agent(
            name,
            AgentProfile::new(format!("You are {}.", name))
                .with_tools(tools.iter().map(|t| t.to_string()).collect()),
        )
    }

    /// Agent that keeps going after a failed or expired tool call.
    pub fn tolerant_agent(name: &str, tools: &[&str]) -> Identity {
        let mut identity = agent_with_tools(name, tools);
        if let Some(profile) = identity.agent.take() {
            identity.agent = Some(profile.with_failure_policy(ToolFailurePolicy::Continue));
        }
        identity
    }

    pub fn user_message(sender: IdentityId, content: &str) -> EventPayload {
        EventPayload::UserMessage {
            sender,
            content: content.to_string(),
        }
    }

    pub fn call(call_id: &str, tool_name: &str, args: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest::new(call_id, tool_name, args)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for SmartSpace error variants.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &SpaceResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &SpaceResult<T>, entity: &str) {
        match result {
            Err(SpaceError::Storage(StorageError::NotFound { entity: e, .. })) => {
                assert_eq!(*e, entity, "Wrong entity in NotFound error");
            }
            other => panic!("Expected NotFound error for {}, got: {:?}", entity, other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &SpaceResult<T>) {
        match result {
            Err(SpaceError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_a_member<T: std::fmt::Debug>(result: &SpaceResult<T>) {
        match result {
            Err(SpaceError::Validation(ValidationError::NotAMember { .. })) => {}
            other => panic!("Expected NotAMember error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &SpaceResult<T>) {
        match result {
            Err(SpaceError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Seqs are exactly `1..=events.len()` in order.
    #[track_caller]
    pub fn assert_gapless(events: &[Event]) {
        for (i, event) in events.iter().enumerate() {
            assert_eq!(
                event.seq,
                i as u64 + 1,
                "gap or reorder at position {} in scope {}",
                i,
                event.scope
            );
        }
    }
}
