//! Tool registry and argument validation.
//!
//! Models hand back loosely-typed JSON arguments. The registry checks the
//! tool exists, the agent may use it and the arguments satisfy the tool's
//! declared input schema. Only the resulting [`ToolInvocation`] is accepted
//! by the dispatcher.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smartspace_core::{
    AgentProfile, ExecutionTarget, RunId, SpaceError, SpaceResult, ValidationError,
};
use smartspace_llm::{ToolCallRequest, ToolDefinition};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

static TOOL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$").expect("valid tool name pattern"));

/// Declaration of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema the arguments must satisfy.
    pub input_schema: serde_json::Value,
    pub target: ExecutionTarget,
    /// URL an external-service tool is POSTed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Pin a remote tool to the connection registered under this key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        target: ExecutionTarget,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            target,
            endpoint: None,
            connection_key: None,
        }
    }

    pub fn local(name: impl Into<String>, description: impl Into<String>, schema: serde_json::Value) -> Self {
        Self::new(name, description, schema, ExecutionTarget::Local)
    }

    pub fn remote(name: impl Into<String>, description: impl Into<String>, schema: serde_json::Value) -> Self {
        Self::new(name, description, schema, ExecutionTarget::RemoteConnection)
    }

    pub fn external(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::new(name, description, schema, ExecutionTarget::ExternalService)
        }
    }

    pub fn with_connection_key(mut self, key: impl Into<String>) -> Self {
        self.connection_key = Some(key.into());
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// A tool executed in-process.
#[async_trait]
pub trait LocalTool: Send + Sync {
    async fn invoke(&self, invocation: &ToolInvocation) -> SpaceResult<serde_json::Value>;
}

/// Adapter turning an async closure over the arguments into a [`LocalTool`].
pub struct FnTool<F> {
    f: F,
}

/// Wrap `f` as a local tool.
pub fn local_fn<F, Fut>(f: F) -> Arc<dyn LocalTool>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SpaceResult<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnTool { f })
}

#[async_trait]
impl<F, Fut> LocalTool for FnTool<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = SpaceResult<serde_json::Value>> + Send,
{
    async fn invoke(&self, invocation: &ToolInvocation) -> SpaceResult<serde_json::Value> {
        (self.f)(invocation.args.clone()).await
    }
}

/// A tool call that passed validation.
///
/// Constructed only by [`ToolRegistry::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    run_id: RunId,
    call_id: String,
    args: serde_json::Value,
    spec: Arc<ToolSpec>,
}

impl ToolInvocation {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn tool_name(&self) -> &str {
        &self.spec.name
    }

    pub fn args(&self) -> &serde_json::Value {
        &self.args
    }

    pub fn target(&self) -> ExecutionTarget {
        self.spec.target
    }

    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }
}

struct RegisteredTool {
    spec: Arc<ToolSpec>,
    validator: jsonschema::Validator,
    local: Option<Arc<dyn LocalTool>>,
}

/// Every tool known to the runtime.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool executed in-process.
    pub fn register_local(&mut self, spec: ToolSpec, tool: Arc<dyn LocalTool>) -> SpaceResult<()> {
        if spec.target != ExecutionTarget::Local {
            return Err(invalid("target", "a local tool must target local execution"));
        }
        self.insert(spec, Some(tool))
    }

    /// Register a tool executed on a remote connection or an external service.
    pub fn register(&mut self, spec: ToolSpec) -> SpaceResult<()> {
        match spec.target {
            ExecutionTarget::Local => {
                return Err(invalid("target", "local tools need an implementation"));
            }
            ExecutionTarget::ExternalService if spec.endpoint.is_none() => {
                return Err(ValidationError::RequiredFieldMissing {
                    field: "endpoint".to_string(),
                }
                .into());
            }
            _ => {}
        }
        self.insert(spec, None)
    }

    fn insert(&mut self, spec: ToolSpec, local: Option<Arc<dyn LocalTool>>) -> SpaceResult<()> {
        if !TOOL_NAME.is_match(&spec.name) {
            return Err(invalid("name", "must match ^[A-Za-z0-9_.-]{1,64}$"));
        }
        let validator = jsonschema::validator_for(&spec.input_schema)
            .map_err(|e| invalid("input_schema", &e.to_string()))?;
        debug!(tool_name = %spec.name, target = %spec.target, "Tool registered");
        self.tools.insert(
            spec.name.clone(),
            RegisteredTool {
                spec: Arc::new(spec),
                validator,
                local,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|t| t.spec.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub(crate) fn local(&self, name: &str) -> Option<Arc<dyn LocalTool>> {
        self.tools.get(name).and_then(|t| t.local.clone())
    }

    /// Definitions of the registered tools `profile` may use, sorted by name.
    pub fn definitions_for(&self, profile: &AgentProfile) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| profile.allows_tool(&t.spec.name))
            .map(|t| t.spec.definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Check a model-requested call and turn it into an invocation.
    pub fn validate(
        &self,
        profile: &AgentProfile,
        run_id: RunId,
        request: &ToolCallRequest,
    ) -> SpaceResult<ToolInvocation> {
        let tool = self
            .tools
            .get(&request.tool_name)
            .ok_or_else(|| ValidationError::UnknownTool {
                tool_name: request.tool_name.clone(),
            })?;
        if !profile.allows_tool(&request.tool_name) {
            return Err(ValidationError::ToolNotAllowed {
                tool_name: request.tool_name.clone(),
            }
            .into());
        }

        let errors: Vec<String> = tool
            .validator
            .iter_errors(&request.args)
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(ValidationError::InvalidArguments {
                tool_name: request.tool_name.clone(),
                reason: errors.join("; "),
            }
            .into());
        }

        Ok(ToolInvocation {
            run_id,
            call_id: request.call_id.clone(),
            args: request.args.clone(),
            spec: Arc::clone(&tool.spec),
        })
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

fn invalid(field: &str, reason: &str) -> SpaceError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}
