//! SmartSpace LLM - model-inference provider boundary.
//!
//! The runtime never sees provider-specific formats. It builds a
//! [`GenerateRequest`] from the agent profile, the recent context and the
//! tools the agent may use, and gets back either a final answer or a batch
//! of tool-call requests. Actual provider implementations are user-supplied.

mod abort;

pub use abort::{abort_pair, AbortHandle, AbortSignal};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smartspace_core::{AgentProfile, IdentityId, LlmError, RunId, SpaceError, SpaceResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// CONTEXT TYPES
// ============================================================================

/// Author role of a context message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the conversation handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: ContextRole,
    pub content: String,
    /// Display name of the author, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Correlates a `Tool` message with the call it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Calls requested by an `Assistant` message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ContextMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ContextRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ContextRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ContextRole::Assistant, content)
    }

    /// An assistant turn that asked for tools instead of answering.
    pub fn assistant_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(ContextRole::Assistant, "")
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            ..Self::new(ContextRole::Tool, content)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn new(role: ContextRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool's arguments.
    pub input_schema: serde_json::Value,
}

/// A tool invocation the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            args,
        }
    }
}

/// Everything a provider needs for one reasoning step.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub run_id: RunId,
    pub agent_id: IdentityId,
    pub profile: AgentProfile,
    pub messages: Vec<ContextMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// What one reasoning step produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ModelOutcome {
    /// The run is done; this is the assistant's answer.
    Final(String),
    /// Execute these tools and call again with their results.
    ToolCalls(Vec<ToolCallRequest>),
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// Model-inference collaborator.
///
/// Implementations should watch `abort` where their transport allows it;
/// [`generate_with_abort`] enforces it regardless.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Run one reasoning step.
    async fn generate(
        &self,
        request: &GenerateRequest,
        abort: &AbortSignal,
    ) -> SpaceResult<ModelOutcome>;

    /// Identifier used in logs and errors.
    fn provider_id(&self) -> &str;
}

/// Call `provider`, returning `LlmError::Aborted` as soon as `abort` fires.
pub async fn generate_with_abort(
    provider: &dyn ModelProvider,
    request: &GenerateRequest,
    abort: &AbortSignal,
) -> SpaceResult<ModelOutcome> {
    if abort.is_aborted() {
        return Err(SpaceError::Llm(LlmError::Aborted));
    }
    tokio::select! {
        biased;
        _ = abort.aborted() => {
            debug!(provider = provider.provider_id(), run_id = %request.run_id, "Model call aborted");
            Err(SpaceError::Llm(LlmError::Aborted))
        }
        outcome = provider.generate(request, abort) => outcome,
    }
}

// ============================================================================
// PROVIDER REGISTRY
// ============================================================================

/// Registry of model providers.
///
/// Profiles name a model; unnamed profiles, and names with no registered
/// provider, fall back to the default provider when one is set.
#[derive(Default, Clone)]
pub struct ModelRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    default: Option<Arc<dyn ModelProvider>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose default is `provider`.
    pub fn single(provider: Arc<dyn ModelProvider>) -> Self {
        Self::new().with_default(provider)
    }

    pub fn with_default(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.default = Some(provider);
        self
    }

    /// Register `provider` under a model name. Replaces any previous one.
    pub fn register(&mut self, model: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(model.into(), provider);
    }

    /// Provider for `profile.model`.
    pub fn resolve(&self, profile: &AgentProfile) -> SpaceResult<Arc<dyn ModelProvider>> {
        profile
            .model
            .as_ref()
            .and_then(|model| self.providers.get(model))
            .or(self.default.as_ref())
            .cloned()
            .ok_or(SpaceError::Llm(LlmError::ProviderNotConfigured))
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut models: Vec<&String> = self.providers.keys().collect();
        models.sort();
        f.debug_struct("ModelRegistry")
            .field("models", &models)
            .field("default", &self.default.is_some())
            .finish()
    }
}
