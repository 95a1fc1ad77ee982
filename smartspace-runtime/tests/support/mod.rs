//! Shared helpers for runtime integration tests.

#![allow(dead_code)]

use serde_json::json;
use smartspace_core::{
    EntityIdType, Event, EventPayload, Identity, Role, Run, RunId, RunStatus, RuntimeConfig,
    ScopeId, SmartSpace,
};
use smartspace_runtime::{local_fn, Runtime, ToolRegistry, ToolSpec};
use smartspace_test_utils::fixtures;
use smartspace_test_utils::ScriptedModel;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

/// A runtime with one space owned by a human.
pub struct Harness {
    pub runtime: Runtime,
    pub model: Arc<ScriptedModel>,
    pub space: SmartSpace,
    pub human: Identity,
}

impl Harness {
    pub async fn new(tools: ToolRegistry) -> Self {
        Self::with_config(fixtures::test_config(), tools).await
    }

    pub async fn with_config(config: RuntimeConfig, tools: ToolRegistry) -> Self {
        Self::with_model(config, tools, Arc::new(ScriptedModel::new())).await
    }

    pub async fn with_model(
        config: RuntimeConfig,
        tools: ToolRegistry,
        model: Arc<ScriptedModel>,
    ) -> Self {
        let runtime = Runtime::in_memory(config, Arc::clone(&model).into_registry(), tools)
            .expect("runtime");
        let space = runtime.create_space("test-space").await.expect("space");
        let human = fixtures::human("Hana");
        runtime
            .add_member(space.space_id, &human, Role::Owner)
            .await
            .expect("owner");
        Self {
            runtime,
            model,
            space,
            human,
        }
    }

    pub async fn join(&self, identity: &Identity) {
        self.runtime
            .add_member(self.space.space_id, identity, Role::Member)
            .await
            .expect("member");
    }

    pub fn space_scope(&self) -> ScopeId {
        ScopeId::Space(self.space.space_id)
    }

    pub async fn space_events(&self) -> Vec<Event> {
        self.runtime
            .read_history(self.space_scope(), 0, 10_000)
            .await
            .expect("space history")
    }

    pub async fn run_events(&self, run_id: RunId) -> Vec<Event> {
        self.runtime
            .read_history(ScopeId::Run(run_id), 0, 10_000)
            .await
            .expect("run history")
    }
}

/// Poll until `check` returns `Some`, panicking after [`WAIT`].
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the run is in `status` and its log has announced it, which
/// happens after the work that status stands for has been written.
pub async fn wait_for_status(runtime: &Runtime, run_id: RunId, status: RunStatus) -> Run {
    let run = eventually(&format!("run {} to reach {}", run_id, status), || async {
        runtime
            .get_run(run_id)
            .await
            .ok()
            .filter(|run| run.status == status)
    })
    .await;
    eventually(&format!("run {} to announce {}", run_id, status), || async {
        let events = runtime
            .read_history(ScopeId::Run(run_id), 0, 10_000)
            .await
            .ok()?;
        lifecycle_trail(&events).contains(&status).then_some(())
    })
    .await;
    run
}

/// Statuses a run's own log announced, in order.
pub fn lifecycle_trail(events: &[Event]) -> Vec<RunStatus> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::RunQueued { .. } => Some(RunStatus::Queued),
            EventPayload::RunRunning { .. } => Some(RunStatus::Running),
            EventPayload::RunWaitingTool { .. } => Some(RunStatus::WaitingTool),
            EventPayload::RunCompleted { .. } => Some(RunStatus::Completed),
            EventPayload::RunFailed { .. } => Some(RunStatus::Failed),
            EventPayload::RunCanceled { .. } => Some(RunStatus::Canceled),
            _ => None,
        })
        .collect()
}

/// Registry with `camera.snap` served by remote connections.
pub fn remote_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools
        .register(ToolSpec::remote(
            "camera.snap",
            "Take a photo on the user's device",
            json!({ "type": "object" }),
        ))
        .expect("camera.snap");
    tools
}

/// Registry with a local `math.add` tool.
pub fn local_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools
        .register_local(
            ToolSpec::local(
                "math.add",
                "Add two integers",
                json!({
                    "type": "object",
                    "properties": { "a": { "type": "integer" }, "b": { "type": "integer" } },
                    "required": ["a", "b"]
                }),
            ),
            local_fn(|args| async move {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok(json!({ "sum": a + b }))
            }),
        )
        .expect("math.add");
    tools
}

pub fn fresh_run_id() -> RunId {
    RunId::now_v7()
}
