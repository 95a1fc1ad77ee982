//! Tool dispatcher: routes a validated invocation to its execution target.
//!
//! Local and external-service tools finish inside [`ToolDispatcher::dispatch`]
//! within a bounded timeout. Remote tools only get a connection selected here;
//! the caller persists the call as dispatched and then pushes it, so a fast
//! peer can never answer a call that is not yet recorded.

use crate::connections::{ConnectionRegistry, PushError};
use crate::external::ExternalToolClient;
use crate::tools::{ToolInvocation, ToolRegistry};
use smartspace_core::{
    Connection, ConnectionId, DispatchError, ExecutionTarget, IdentityId, PushMessage,
    ResultSource, RuntimeConfig, SpaceResult, ToolCall,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What dispatching an invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// The tool ran to completion.
    Completed {
        result: serde_json::Value,
        source: ResultSource,
    },
    /// A remote connection was selected; the result arrives later.
    Pending { connection: Connection },
}

pub struct ToolDispatcher {
    tools: Arc<ToolRegistry>,
    connections: Arc<ConnectionRegistry>,
    external: ExternalToolClient,
    local_timeout: Duration,
    external_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(
        tools: Arc<ToolRegistry>,
        connections: Arc<ConnectionRegistry>,
        config: &RuntimeConfig,
    ) -> SpaceResult<Self> {
        Ok(Self {
            tools,
            connections,
            external: ExternalToolClient::new()?,
            local_timeout: config.local_tool_timeout,
            external_timeout: config.external_tool_timeout,
        })
    }

    /// Route `invocation` to its target.
    ///
    /// `preferred_owner` breaks ties between capable remote connections.
    pub async fn dispatch(
        &self,
        invocation: &ToolInvocation,
        preferred_owner: Option<IdentityId>,
    ) -> Result<Dispatched, DispatchError> {
        match invocation.target() {
            ExecutionTarget::Local => {
                let result = self.run_local(invocation).await?;
                Ok(Dispatched::Completed {
                    result,
                    source: ResultSource::Local,
                })
            }
            ExecutionTarget::ExternalService => {
                let result = self.external.call(invocation, self.external_timeout).await?;
                Ok(Dispatched::Completed {
                    result,
                    source: ResultSource::ExternalService,
                })
            }
            ExecutionTarget::RemoteConnection => self
                .select_connection(
                    invocation.tool_name(),
                    invocation.spec().connection_key.as_deref(),
                    preferred_owner,
                    None,
                )
                .map(|connection| Dispatched::Pending { connection })
                .ok_or_else(|| DispatchError::NoConnection {
                    tool_name: invocation.tool_name().to_string(),
                }),
        }
    }

    async fn run_local(
        &self,
        invocation: &ToolInvocation,
    ) -> Result<serde_json::Value, DispatchError> {
        let tool_name = invocation.tool_name().to_string();
        let tool = self
            .tools
            .local(&tool_name)
            .ok_or_else(|| DispatchError::ToolFailed {
                tool_name: tool_name.clone(),
                reason: "no local implementation registered".to_string(),
            })?;

        match tokio::time::timeout(self.local_timeout, tool.invoke(invocation)).await {
            Ok(Ok(value)) => {
                debug!(
                    run_id = %invocation.run_id(),
                    call_id = invocation.call_id(),
                    tool_name = %tool_name,
                    "Local tool completed"
                );
                Ok(value)
            }
            Ok(Err(e)) => Err(DispatchError::ToolFailed {
                tool_name,
                reason: e.to_string(),
            }),
            Err(_) => Err(DispatchError::Timeout {
                tool_name,
                after_ms: self.local_timeout.as_millis() as u64,
            }),
        }
    }

    /// Pick the connection a remote call goes to.
    ///
    /// A pinned key selects exactly that connection when it is live.
    /// Otherwise any connection advertising the tool is eligible.
    pub fn select_connection(
        &self,
        tool_name: &str,
        pinned_key: Option<&str>,
        preferred_owner: Option<IdentityId>,
        exclude: Option<ConnectionId>,
    ) -> Option<Connection> {
        match pinned_key {
            Some(key) => self
                .connections
                .get_by_key(key)
                .filter(|c| Some(c.connection_id) != exclude),
            None => self
                .connections
                .find_capable(tool_name, preferred_owner, exclude),
        }
    }

    /// Best-effort push of a dispatched call. Never waits on the peer.
    pub fn push(&self, connection_id: ConnectionId, call: &ToolCall) -> bool {
        let message = PushMessage::ToolCallRequest {
            run_id: call.run_id,
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            args: call.args.clone(),
        };
        match self.connections.push(connection_id, message) {
            Ok(()) => true,
            Err(PushError::UnknownConnection) => {
                warn!(
                    run_id = %call.run_id,
                    call_id = %call.call_id,
                    connection_id = %connection_id,
                    "Dispatch target vanished before push"
                );
                false
            }
            Err(_) => false,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }
}
