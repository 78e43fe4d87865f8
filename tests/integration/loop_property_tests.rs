//! Timing and bookkeeping guarantees of the loop over long tick runs.

use tokio::time::Instant;

use agent_conductor::config::LoopConfig;
use agent_conductor::models::work_unit::WorkStatus;

use super::test_helpers::{at, scenario_config, Harness};

fn config(cooldown_ms: u64, max_concurrent_agents: u32, grace_ms: u64) -> LoopConfig {
    LoopConfig {
        cooldown_ms,
        max_concurrent_agents,
        spawn_grace_period_ms: grace_ms,
        ..scenario_config()
    }
}

/// Make every window the loop has spawned visible.
fn show_all_spawned(h: &Harness) {
    let names: Vec<String> = h.spawner.requests().into_iter().map(|r| r.session_name).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    h.inspector.set_sessions(&refs);
}

#[tokio::test]
async fn unseen_agent_is_kept_for_grace_then_evicted_exactly_once() {
    let h = Harness::with_queued(&[1]);
    let (mut core, _handle) = h.core(config(60_000, 1, 3500));
    let t0 = Instant::now();

    let mut evictions = Vec::new();
    for ms in (0..=8000).step_by(500) {
        let report = core.tick(at(t0, ms)).await;
        if !report.departed.is_empty() {
            evictions.push((ms, report.departed.len()));
        }
        if ms < 3500 {
            assert_eq!(core.agents().len(), 1, "evicted early at {ms}ms");
        }
    }

    assert_eq!(evictions, vec![(3500, 1)]);
    assert_eq!(h.store.unit(1).retry_count, 1);
}

#[tokio::test]
async fn dispatches_are_spaced_by_cooldown() {
    let h = Harness::with_queued(&[1, 2, 3, 4, 5, 6]);
    let (mut core, _handle) = h.core(config(5000, 10, 3000));
    let t0 = Instant::now();

    let mut dispatch_times = Vec::new();
    for ms in (0..=31_500).step_by(700) {
        show_all_spawned(&h);
        if core.tick(at(t0, ms)).await.dispatched.is_some() {
            dispatch_times.push(ms);
        }
    }

    assert_eq!(dispatch_times.len(), 6);
    for pair in dispatch_times.windows(2) {
        assert!(pair[1] - pair[0] >= 5000, "dispatches at {pair:?}");
    }
}

#[tokio::test]
async fn executor_count_never_exceeds_cap() {
    let h = Harness::with_queued(&[1, 2, 3, 4, 5]);
    let (mut core, _handle) = h.core(config(0, 2, 1000));
    let t0 = Instant::now();

    for ms in (0..=5000).step_by(500) {
        show_all_spawned(&h);
        core.tick(at(t0, ms)).await;
        assert!(core.agents().executor_count() <= 2, "cap exceeded at {ms}ms");
    }
    assert_eq!(h.dispatched(), vec![1, 2]);

    // Unit 1 finishes and its window closes; the freed slot goes to unit 3.
    h.store.complete(1);
    let first = h.spawner.requests()[0].session_name.clone();
    let second = h.spawner.requests()[1].session_name.clone();
    h.inspector.set_sessions(&[second.as_str()]);
    let report = core.tick(at(t0, 5500)).await;

    assert_eq!(report.departed.len(), 1);
    assert_eq!(report.departed[0].name, first);
    assert_eq!(report.dispatched.map(|u| u.id), Some(3));
    assert_eq!(core.agents().executor_count(), 2);
}

#[tokio::test]
async fn each_departure_requeues_once() {
    let h = Harness::with_queued(&[1]);
    let (mut core, _handle) = h.core(config(0, 1, 1000));
    let t0 = Instant::now();

    core.tick(at(t0, 0)).await;
    show_all_spawned(&h);
    core.tick(at(t0, 500)).await;
    assert_eq!(h.store.unit(1).status, WorkStatus::Running);

    // Window closes; unit 1 is requeued and immediately redispatched.
    h.inspector.set_sessions(&[]);
    let report = core.tick(at(t0, 1000)).await;
    assert_eq!(report.departed.len(), 1);
    assert_eq!(h.store.unit(1).retry_count, 1);
    assert_eq!(h.dispatched(), vec![1, 1]);

    // The replacement is still inside its grace period: nothing changes.
    core.tick(at(t0, 1500)).await;
    assert_eq!(h.store.unit(1).retry_count, 1);

    let report = core.tick(at(t0, 2000)).await;
    assert_eq!(report.departed.len(), 1);
    assert_eq!(h.store.unit(1).retry_count, 2);
}

#[tokio::test]
async fn unit_is_blocked_after_max_retries() {
    let h = Harness::with_queued(&[1]);
    let config = LoopConfig {
        max_retries: 2,
        ..config(0, 1, 1000)
    };
    let (mut core, _handle) = h.core(config);
    let t0 = Instant::now();

    for ms in (0..=6000).step_by(1000) {
        core.tick(at(t0, ms)).await;
    }

    let unit = h.store.unit(1);
    assert_eq!(unit.status, WorkStatus::Blocked);
    assert_eq!(unit.retry_count, 2);
    assert_eq!(h.dispatched(), vec![1, 1, 1]);
    assert_eq!(h.blocked(), vec![1]);
    assert!(core.agents().is_empty());
}

#[tokio::test]
async fn review_feedback_is_one_shot_per_url() {
    let h = Harness::with_queued(&[]);
    let (mut core, handle) = h.core(scenario_config());
    let t0 = Instant::now();
    h.review.set_fallback(true);

    handle.set_tracked_url(Some("https://github.com/acme/widgets/pull/1".into()));
    for ms in (0..5000).step_by(1000) {
        core.tick(at(t0, ms)).await;
    }
    assert_eq!(h.feedback().len(), 1);

    // Re-sending the same URL does not re-arm.
    handle.set_tracked_url(Some("https://github.com/acme/widgets/pull/1".into()));
    core.tick(at(t0, 5000)).await;
    assert_eq!(h.feedback().len(), 1);

    handle.set_tracked_url(Some("https://github.com/acme/widgets/pull/2".into()));
    for ms in (6000..9000).step_by(1000) {
        core.tick(at(t0, ms)).await;
    }
    assert_eq!(
        h.feedback(),
        vec![
            "https://github.com/acme/widgets/pull/1",
            "https://github.com/acme/widgets/pull/2",
        ]
    );
    assert_eq!(h.review.calls(), 2);
}
