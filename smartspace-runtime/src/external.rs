//! Outbound calls for external-service tools.
//!
//! The request body is `{run_id, call_id, tool_name, args}`. A 2xx response's
//! JSON body is the tool result. Timeouts, non-2xx statuses and transport
//! failures are terminal for the call; nothing is retried here.

use crate::tools::ToolInvocation;
use serde::Serialize;
use smartspace_core::{ConfigError, DispatchError, RunId, SpaceError, SpaceResult};
use std::time::Duration;

#[derive(Serialize)]
struct ExternalRequest<'a> {
    run_id: RunId,
    call_id: &'a str,
    tool_name: &'a str,
    args: &'a serde_json::Value,
}

/// HTTP client shared by every external-service tool.
#[derive(Debug, Clone)]
pub struct ExternalToolClient {
    http: reqwest::Client,
}

impl ExternalToolClient {
    pub fn new() -> SpaceResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("smartspace-runtime/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                SpaceError::Config(ConfigError::InvalidValue {
                    field: "http_client".to_string(),
                    value: String::new(),
                    reason: format!("Failed to create HTTP client: {}", e),
                })
            })?;
        Ok(Self { http })
    }

    /// POST the invocation to its endpoint, bounded by `timeout`.
    pub async fn call(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> Result<serde_json::Value, DispatchError> {
        let tool_name = invocation.tool_name().to_string();
        let endpoint = invocation
            .spec()
            .endpoint
            .as_deref()
            .ok_or_else(|| DispatchError::Transport {
                tool_name: tool_name.clone(),
                reason: "no endpoint configured".to_string(),
            })?;

        let body = ExternalRequest {
            run_id: invocation.run_id(),
            call_id: invocation.call_id(),
            tool_name: invocation.tool_name(),
            args: invocation.args(),
        };

        let response = self
            .http
            .post(endpoint)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(&tool_name, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::ExternalStatus {
                tool_name,
                status: status.as_u16(),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| transport_error(&tool_name, timeout, e))
    }
}

fn transport_error(tool_name: &str, timeout: Duration, e: reqwest::Error) -> DispatchError {
    if e.is_timeout() {
        DispatchError::Timeout {
            tool_name: tool_name.to_string(),
            after_ms: timeout.as_millis() as u64,
        }
    } else {
        DispatchError::Transport {
            tool_name: tool_name.to_string(),
            reason: e.to_string(),
        }
    }
}
