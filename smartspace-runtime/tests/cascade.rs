//! Agent-to-agent cascades stop at the configured trigger depth.

mod support;

use smartspace_core::{Run, RunStatus};
use smartspace_runtime::ToolRegistry;
use smartspace_test_utils::fixtures;
use std::time::Duration;
use support::{eventually, Harness};

/// Wait until `expected` runs exist and all of them are finished, then make
/// sure no straggler shows up.
async fn settled_runs(h: &Harness, expected: usize) -> Vec<Run> {
    eventually(&format!("{} finished runs", expected), || async {
        let runs = h.runtime.list_runs(h.space.space_id).await.ok()?;
        (runs.len() == expected && runs.iter().all(|r| r.status.is_terminal())).then_some(runs)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let runs = h.runtime.list_runs(h.space.space_id).await.unwrap();
    assert_eq!(runs.len(), expected, "cascade kept going");
    runs
}

async fn ping_pong() -> (Harness, smartspace_core::Identity, smartspace_core::Identity) {
    let h = Harness::new(ToolRegistry::new()).await;
    let a = fixtures::agent("Ping");
    let b = fixtures::agent("Pong");
    h.join(&a).await;
    h.join(&b).await;
    (h, a, b)
}

#[tokio::test]
async fn test_single_chain_stops_at_max_depth() {
    let (h, a, _b) = ping_pong().await;

    let first = h
        .runtime
        .create_run(h.space.space_id, a.identity_id, h.human.identity_id, None)
        .await
        .unwrap();
    assert_eq!(first.metadata.trigger_depth, 1);

    let mut runs = settled_runs(&h, 5).await;
    runs.sort_by_key(|r| r.metadata.trigger_depth);
    let depths: Vec<u32> = runs.iter().map(|r| r.metadata.trigger_depth).collect();
    assert_eq!(depths, vec![1, 2, 3, 4, 5]);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));

    // Each hop names the run whose answer woke it and alternates agents.
    for pair in runs.windows(2) {
        assert_eq!(pair[1].parent_run_id, Some(pair[0].run_id));
        assert_ne!(pair[1].agent_id, pair[0].agent_id);
        assert_eq!(pair[1].triggered_by, pair[0].agent_id);
    }

    // Five answers after zero human messages.
    assert_eq!(h.space_events().await.len(), 5);
}

#[tokio::test]
async fn test_human_message_wakes_two_bounded_chains() {
    let (h, _a, _b) = ping_pong().await;

    let posted = h
        .runtime
        .post_message(h.space.space_id, h.human.identity_id, "talk amongst yourselves")
        .await
        .unwrap();
    assert_eq!(posted.triggered.len(), 2);

    let runs = settled_runs(&h, 10).await;
    assert_eq!(runs.iter().map(|r| r.metadata.trigger_depth).max(), Some(5));
    for depth in 1..=5 {
        assert_eq!(
            runs.iter().filter(|r| r.metadata.trigger_depth == depth).count(),
            2,
            "depth {}",
            depth
        );
    }
}

#[tokio::test]
async fn test_lower_max_depth_shortens_chain() {
    let mut config = fixtures::test_config();
    config.max_trigger_depth = 2;
    let h = Harness::with_config(config, ToolRegistry::new()).await;
    let a = fixtures::agent("Ping");
    let b = fixtures::agent("Pong");
    h.join(&a).await;
    h.join(&b).await;

    h.runtime
        .create_run(h.space.space_id, a.identity_id, h.human.identity_id, None)
        .await
        .unwrap();
    settled_runs(&h, 2).await;
}

#[tokio::test]
async fn test_lone_agent_does_not_wake_itself() {
    let h = Harness::new(ToolRegistry::new()).await;
    let solo = fixtures::agent("Solo");
    h.join(&solo).await;

    let posted = h
        .runtime
        .post_message(h.space.space_id, h.human.identity_id, "hi")
        .await
        .unwrap();
    assert_eq!(posted.triggered.len(), 1);
    settled_runs(&h, 1).await;
}
