//! Per-scope sequencing under concurrent writers, in memory and on LMDB.

mod support;

use serde_json::json;
use smartspace_core::{
    EntityIdType, EventPayload, IdentityId, Role, RunStatus, ScopeId, StorageConfig,
};
use smartspace_runtime::{Runtime, ToolRegistry};
use smartspace_test_utils::assertions::assert_gapless;
use smartspace_test_utils::{fixtures, ScriptedModel};
use std::sync::Arc;
use std::time::Duration;
use support::{lifecycle_trail, local_tools, wait_for_status, Harness};

const WRITERS: usize = 8;
const PER_WRITER: usize = 25;

/// `WRITERS` tasks each append `PER_WRITER` events to the same two scopes.
async fn hammer(runtime: &Runtime) -> (ScopeId, ScopeId) {
    let space = runtime.create_space("busy").await.unwrap();
    let first = ScopeId::Space(space.space_id);
    let second = ScopeId::Space(runtime.create_space("also-busy").await.unwrap().space_id);

    let mut tasks = Vec::new();
    for writer in 0..WRITERS {
        let runtime = runtime.clone();
        tasks.push(tokio::spawn(async move {
            let sender = IdentityId::now_v7();
            for i in 0..PER_WRITER {
                let scope = if i % 2 == 0 { first } else { second };
                runtime
                    .event_log()
                    .append(scope, fixtures::user_message(sender, &format!("{}-{}", writer, i)))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    (first, second)
}

async fn assert_scopes_gapless(runtime: &Runtime, first: ScopeId, second: ScopeId) {
    let a = runtime.read_history(first, 0, 10_000).await.unwrap();
    let b = runtime.read_history(second, 0, 10_000).await.unwrap();
    assert_eq!(a.len() + b.len(), WRITERS * PER_WRITER);
    assert_gapless(&a);
    assert_gapless(&b);
    assert_eq!(runtime.event_log().head(first).await.unwrap(), a.len() as u64);

    // Each writer's own appends keep their relative order.
    for writer in 0..WRITERS {
        let prefix = format!("{}-", writer);
        let mine: Vec<usize> = a
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::UserMessage { content, .. } => content
                    .strip_prefix(&prefix)
                    .and_then(|i| i.parse().ok()),
                _ => None,
            })
            .collect();
        let mut sorted = mine.clone();
        sorted.sort_unstable();
        assert_eq!(mine, sorted);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_are_gapless_in_memory() {
    let runtime = Runtime::in_memory(
        fixtures::test_config(),
        Arc::new(ScriptedModel::new()).into_registry(),
        ToolRegistry::new(),
    )
    .unwrap();
    let (first, second) = hammer(&runtime).await;
    assert_scopes_gapless(&runtime, first, second).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_are_gapless_on_lmdb() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig {
        path: dir.path().to_path_buf(),
        map_size_mb: 64,
    };
    let runtime = Runtime::open_lmdb(
        fixtures::test_config(),
        &storage,
        Arc::new(ScriptedModel::new()).into_registry(),
        ToolRegistry::new(),
    )
    .unwrap();
    let (first, second) = hammer(&runtime).await;
    assert_scopes_gapless(&runtime, first, second).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runs_in_different_spaces_keep_their_own_order() {
    let model = Arc::new(ScriptedModel::new().with_delay(Duration::from_millis(15)));
    let h = Harness::with_model(fixtures::test_config(), local_tools(), model).await;

    let other = h.runtime.create_space("other").await.unwrap();
    h.runtime
        .add_member(other.space_id, &h.human, Role::Owner)
        .await
        .unwrap();

    let left = fixtures::agent_with_tools("Left", &["math.add"]);
    let right = fixtures::agent_with_tools("Right", &["math.add"]);
    h.join(&left).await;
    h.runtime
        .add_member(other.space_id, &right, Role::Member)
        .await
        .unwrap();
    for agent in [&left, &right] {
        for i in 0..3 {
            h.model.tool_calls(
                agent.identity_id,
                vec![fixtures::call(&format!("c{}", i), "math.add", json!({ "a": i, "b": i }))],
            );
        }
    }

    let (l, r) = tokio::join!(
        h.runtime.post_message(h.space.space_id, h.human.identity_id, "left"),
        h.runtime.post_message(other.space_id, h.human.identity_id, "right"),
    );
    let left_run = l.unwrap().triggered[0];
    let right_run = r.unwrap().triggered[0];

    for run_id in [left_run, right_run] {
        wait_for_status(&h.runtime, run_id, RunStatus::Completed).await;
        let events = h.run_events(run_id).await;
        assert_gapless(&events);
        assert_eq!(
            lifecycle_trail(&events),
            vec![RunStatus::Queued, RunStatus::Running, RunStatus::Completed]
        );
        assert!(events.iter().all(|e| e.scope == ScopeId::Run(run_id)));

        let steps: Vec<u32> = events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::RunStep { step, .. } => Some(*step),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![1, 2, 3, 4]);
    }

    for space in [h.space.space_id, other.space_id] {
        let events = h.runtime.read_history(ScopeId::Space(space), 0, 100).await.unwrap();
        assert_gapless(&events);
        assert_eq!(events.len(), 2);
    }
}
