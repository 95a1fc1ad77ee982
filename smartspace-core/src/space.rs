//! SmartSpaces, identities and memberships.

use crate::{IdentityId, SpaceId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A shared conversational context containing humans, agents and systems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartSpace {
    pub space_id: SpaceId,
    pub name: String,
    pub created_at: Timestamp,
}

impl SmartSpace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            space_id: crate::EntityIdType::now_v7(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Kind of identity taking part in a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Human,
    Agent,
    System,
}

/// What happens to a run when one of its tool calls fails or expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailurePolicy {
    /// The run transitions to `failed`.
    #[default]
    FailRun,
    /// The failure is fed back to the agent as an error result.
    Continue,
}

/// Agent-specific configuration carried by agent identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub system_prompt: String,
    /// Tools this agent may call. Empty means every registered tool.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Overrides the runtime-wide step budget.
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub tool_failure_policy: ToolFailurePolicy,
    /// Opaque model selector handed to the model provider.
    #[serde(default)]
    pub model: Option<String>,
}

impl AgentProfile {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
            max_steps: None,
            tool_failure_policy: ToolFailurePolicy::FailRun,
            model: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_failure_policy(mut self, policy: ToolFailurePolicy) -> Self {
        self.tool_failure_policy = policy;
        self
    }

    pub fn allows_tool(&self, tool_name: &str) -> bool {
        self.tools.is_empty() || self.tools.iter().any(|t| t == tool_name)
    }
}

/// A human, agent or system participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: IdentityId,
    pub kind: IdentityKind,
    pub display_name: String,
    pub agent: Option<AgentProfile>,
    pub created_at: Timestamp,
}

impl Identity {
    pub fn human(display_name: impl Into<String>) -> Self {
        Self::with_kind(IdentityKind::Human, display_name, None)
    }

    pub fn agent(display_name: impl Into<String>, profile: AgentProfile) -> Self {
        Self::with_kind(IdentityKind::Agent, display_name, Some(profile))
    }

    pub fn system(display_name: impl Into<String>) -> Self {
        Self::with_kind(IdentityKind::System, display_name, None)
    }

    fn with_kind(
        kind: IdentityKind,
        display_name: impl Into<String>,
        agent: Option<AgentProfile>,
    ) -> Self {
        Self {
            identity_id: crate::EntityIdType::now_v7(),
            kind,
            display_name: display_name.into(),
            agent,
            created_at: Utc::now(),
        }
    }

    pub fn is_agent(&self) -> bool {
        self.kind == IdentityKind::Agent
    }
}

/// Role of an identity within a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Member,
    /// May read, is never woken by the trigger coordinator.
    Observer,
}

/// Binds an identity to a space with a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub space_id: SpaceId,
    pub identity_id: IdentityId,
    pub identity_kind: IdentityKind,
    pub role: Role,
    pub joined_at: Timestamp,
}

impl Membership {
    pub fn new(space_id: SpaceId, identity: &Identity, role: Role) -> Self {
        Self {
            space_id,
            identity_id: identity.identity_id,
            identity_kind: identity.kind,
            role,
            joined_at: Utc::now(),
        }
    }

    /// Whether the trigger coordinator should wake this member.
    pub fn is_triggerable_agent(&self) -> bool {
        self.identity_kind == IdentityKind::Agent && self.role != Role::Observer
    }
}
