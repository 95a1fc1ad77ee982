//! Agent trigger coordinator.
//!
//! A new space message wakes every agent member except its sender. Each
//! woken agent gets a run one trigger level deeper than the message that
//! woke it; at the configured maximum depth nothing is created, which is
//! what stops two agents from answering each other forever.

use async_trait::async_trait;
use smartspace_core::{IdentityId, Run, RunId, RunMetadata, ScopeId, Seq, SpaceId, SpaceResult};
use smartspace_storage::EntityStorage;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything needed to create and start a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub space_id: SpaceId,
    pub agent_id: IdentityId,
    pub triggered_by: IdentityId,
    pub parent_run_id: Option<RunId>,
    pub metadata: RunMetadata,
}

impl RunRequest {
    pub fn new(space_id: SpaceId, agent_id: IdentityId, triggered_by: IdentityId) -> Self {
        Self {
            space_id,
            agent_id,
            triggered_by,
            parent_run_id: None,
            metadata: RunMetadata::default(),
        }
    }
}

/// Creates a run and starts it in the background.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    async fn launch(&self, request: RunRequest) -> SpaceResult<Run>;
}

/// What woke the agents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trigger {
    pub space_id: SpaceId,
    pub sender: IdentityId,
    /// Depth of the message; 0 for a message not produced by a run.
    pub depth: u32,
    /// Seq of the message in the space log.
    pub seq: Option<Seq>,
    /// Run that produced the message, if any.
    pub parent_run_id: Option<RunId>,
}

pub struct TriggerCoordinator {
    storage: Arc<dyn EntityStorage>,
    max_depth: u32,
}

impl TriggerCoordinator {
    pub fn new(storage: Arc<dyn EntityStorage>, max_depth: u32) -> Self {
        Self { storage, max_depth }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Create runs for the agents `trigger` wakes and return their ids.
    ///
    /// Never fails: a directory read error or a failed launch is logged and
    /// the remaining agents are still started.
    pub async fn trigger_agents(&self, launcher: &dyn RunLauncher, trigger: Trigger) -> Vec<RunId> {
        if trigger.depth >= self.max_depth {
            info!(
                space_id = %trigger.space_id,
                sender = %trigger.sender,
                depth = trigger.depth,
                max_depth = self.max_depth,
                "Trigger depth reached, not waking agents"
            );
            return Vec::new();
        }

        let members = match self.storage.membership_list_by_space(trigger.space_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(space_id = %trigger.space_id, error = %e, "Failed to list space members");
                return Vec::new();
            }
        };

        let mut created = Vec::new();
        for member in members
            .iter()
            .filter(|m| m.is_triggerable_agent() && m.identity_id != trigger.sender)
        {
            let request = RunRequest {
                space_id: trigger.space_id,
                agent_id: member.identity_id,
                triggered_by: trigger.sender,
                parent_run_id: trigger.parent_run_id,
                metadata: RunMetadata {
                    trigger_depth: trigger.depth + 1,
                    trigger_seq: trigger.seq,
                    origin_scope: Some(ScopeId::Space(trigger.space_id)),
                    extra: None,
                },
            };
            match launcher.launch(request).await {
                Ok(run) => created.push(run.run_id),
                Err(e) => warn!(
                    space_id = %trigger.space_id,
                    agent_id = %member.identity_id,
                    error = %e,
                    "Failed to start triggered run"
                ),
            }
        }

        debug!(
            space_id = %trigger.space_id,
            depth = trigger.depth,
            runs = created.len(),
            "Agents triggered"
        );
        created
    }
}
