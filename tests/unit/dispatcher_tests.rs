//! Unit tests for dispatch gating and unit transitions.

use std::time::Duration;

use tokio::time::Instant;

use agent_conductor::config::LoopConfig;
use agent_conductor::models::agent::{AgentKind, AgentTable, SessionName, TrackedAgent};
use agent_conductor::models::work_unit::{WorkStatus, WorkUnit};
use agent_conductor::orchestrator::dispatcher::{Dispatcher, TransitionReason};

fn limits(max_concurrent_agents: u32, max_retries: u32) -> LoopConfig {
    LoopConfig {
        cooldown_ms: 5000,
        max_concurrent_agents,
        max_retries,
        ..LoopConfig::default()
    }
}

fn units(ids: &[u32]) -> Vec<WorkUnit> {
    ids.iter().copied().map(WorkUnit::queued).collect()
}

fn executor(unit: u32, now: Instant) -> TrackedAgent {
    TrackedAgent::dispatched(format!("executor-{unit}-abcdef"), AgentKind::Executor, unit, now)
}

#[test]
fn dispatches_lowest_queued_id_first() {
    let mut dispatcher = Dispatcher::new(&limits(1, 3), "");
    let mut queue = units(&[3, 1, 2]);
    let now = Instant::now();

    let request = dispatcher
        .decide(&AgentTable::new(), &mut queue, now)
        .expect("dispatch");

    assert_eq!(request.work_unit.id, 1);
    assert_eq!(request.work_unit.status, WorkStatus::Dispatched);
    assert_eq!(request.kind, AgentKind::Executor);
    assert_eq!(queue[1].status, WorkStatus::Dispatched);
    assert_eq!(dispatcher.last_dispatch_at(), Some(now));
}

#[test]
fn session_name_encodes_kind_and_unit() {
    let mut dispatcher = Dispatcher::new(&limits(1, 3), "ah-");
    let mut queue = units(&[7]);

    let request = dispatcher
        .decide(&AgentTable::new(), &mut queue, Instant::now())
        .expect("dispatch");

    assert!(request.session_name.starts_with("ah-executor-7-"));
    let parsed = SessionName::parse(&request.session_name, "ah-");
    assert_eq!(parsed.kind, AgentKind::Executor);
    assert_eq!(parsed.work_unit_ref, Some(7));
}

#[test]
fn first_dispatch_is_not_held_by_cooldown() {
    let mut dispatcher = Dispatcher::new(&limits(1, 3), "");
    let mut queue = units(&[1]);

    assert!(dispatcher
        .decide(&AgentTable::new(), &mut queue, Instant::now())
        .is_some());
}

#[test]
fn cooldown_blocks_second_dispatch() {
    let mut dispatcher = Dispatcher::new(&limits(5, 3), "");
    let mut queue = units(&[1, 2]);
    let t0 = Instant::now();

    let first = dispatcher.decide(&AgentTable::new(), &mut queue, t0).expect("dispatch");
    let table: AgentTable = [first.tracked_agent(t0)].into_iter().collect();

    assert!(dispatcher
        .decide(&table, &mut queue, t0 + Duration::from_millis(4999))
        .is_none());
    assert_eq!(queue[1].status, WorkStatus::Queued);

    let second = dispatcher
        .decide(&table, &mut queue, t0 + Duration::from_millis(5000))
        .expect("cooldown elapsed");
    assert_eq!(second.work_unit.id, 2);
}

#[test]
fn concurrency_cap_counts_only_executors() {
    let mut dispatcher = Dispatcher::new(&limits(1, 3), "");
    let now = Instant::now();
    let mut queue = units(&[1, 2]);
    queue[0].status = WorkStatus::Running;

    let busy: AgentTable = [executor(1, now)].into_iter().collect();
    assert!(dispatcher.decide(&busy, &mut queue, now).is_none());

    let coordinator_only: AgentTable = [TrackedAgent::observed(
        "coordinator".into(),
        SessionName::parse("coordinator", ""),
        now,
    )]
    .into_iter()
    .collect();
    let request = dispatcher
        .decide(&coordinator_only, &mut queue, now)
        .expect("coordinators do not count");
    assert_eq!(request.work_unit.id, 2);
}

#[test]
fn skips_units_already_serviced() {
    let mut dispatcher = Dispatcher::new(&limits(3, 3), "");
    let now = Instant::now();
    let mut queue = units(&[1, 2]);
    let table: AgentTable = [executor(1, now)].into_iter().collect();

    let request = dispatcher.decide(&table, &mut queue, now).expect("dispatch");

    assert_eq!(request.work_unit.id, 2);
    assert_eq!(queue[0].status, WorkStatus::Queued);
}

#[test]
fn nothing_queued_dispatches_nothing_and_keeps_cooldown_clear() {
    let mut dispatcher = Dispatcher::new(&limits(1, 3), "");
    let mut queue = units(&[1]);
    queue[0].status = WorkStatus::Done;

    assert!(dispatcher
        .decide(&AgentTable::new(), &mut queue, Instant::now())
        .is_none());
    assert_eq!(dispatcher.last_dispatch_at(), None);
}

#[test]
fn confirm_moves_dispatched_to_running() {
    let dispatcher = Dispatcher::new(&limits(1, 3), "");
    let now = Instant::now();
    let mut queue = units(&[1, 2]);
    queue[0].status = WorkStatus::Dispatched;
    queue[1].status = WorkStatus::Done;

    let transitions = dispatcher.confirm(&[executor(1, now), executor(2, now)], &mut queue);

    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].reason, TransitionReason::Confirmed);
    assert_eq!(queue[0].status, WorkStatus::Running);
    assert_eq!(queue[1].status, WorkStatus::Done);
}

#[test]
fn departure_requeues_with_retry_increment() {
    let dispatcher = Dispatcher::new(&limits(1, 3), "");
    let now = Instant::now();
    let mut queue = units(&[1]);
    queue[0].status = WorkStatus::Running;

    let transitions = dispatcher.resolve_departures(&[executor(1, now)], &mut queue);

    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].reason, TransitionReason::Requeued);
    assert_eq!(queue[0].status, WorkStatus::Queued);
    assert_eq!(queue[0].retry_count, 1);
}

#[test]
fn departure_after_max_retries_blocks() {
    let dispatcher = Dispatcher::new(&limits(1, 2), "");
    let now = Instant::now();
    let mut queue = units(&[1]);
    queue[0].status = WorkStatus::Dispatched;
    queue[0].retry_count = 2;

    let transitions = dispatcher.resolve_departures(&[executor(1, now)], &mut queue);

    assert_eq!(transitions[0].reason, TransitionReason::RetriesExhausted);
    assert_eq!(queue[0].status, WorkStatus::Blocked);
    assert_eq!(queue[0].retry_count, 2);
}

#[test]
fn departure_of_finished_unit_is_ignored() {
    let dispatcher = Dispatcher::new(&limits(1, 3), "");
    let now = Instant::now();
    let mut queue = units(&[1]);
    queue[0].status = WorkStatus::Done;

    let transitions = dispatcher.resolve_departures(&[executor(1, now)], &mut queue);

    assert!(transitions.is_empty());
    assert_eq!(queue[0].status, WorkStatus::Done);
    assert_eq!(queue[0].retry_count, 0);
}

#[test]
fn two_departures_for_one_unit_requeue_once() {
    let dispatcher = Dispatcher::new(&limits(2, 3), "");
    let now = Instant::now();
    let mut queue = units(&[4]);
    queue[0].status = WorkStatus::Running;
    let departed = [
        TrackedAgent::dispatched("executor-4-aaaaaa".into(), AgentKind::Executor, 4, now),
        TrackedAgent::dispatched("executor-4-bbbbbb".into(), AgentKind::Executor, 4, now),
    ];

    let transitions = dispatcher.resolve_departures(&departed, &mut queue);

    assert_eq!(transitions.len(), 1);
    assert_eq!(queue[0].retry_count, 1);
}

#[test]
fn unserviced_in_flight_units_are_requeued_or_blocked() {
    let dispatcher = Dispatcher::new(&limits(3, 2), "");
    let now = Instant::now();
    let mut queue = units(&[1, 2, 3, 4, 5]);
    queue[0].status = WorkStatus::Dispatched;
    queue[1].status = WorkStatus::Running;
    queue[1].retry_count = 2;
    queue[2].status = WorkStatus::Running;
    queue[3].status = WorkStatus::Done;
    let table: AgentTable = [executor(3, now)].into_iter().collect();

    let transitions = dispatcher.resolve_orphans(&table, &mut queue);

    let summary: Vec<(u32, TransitionReason)> =
        transitions.iter().map(|t| (t.unit.id, t.reason)).collect();
    assert_eq!(
        summary,
        vec![(1, TransitionReason::Requeued), (2, TransitionReason::RetriesExhausted)]
    );
    assert_eq!(queue[0].status, WorkStatus::Queued);
    assert_eq!(queue[0].retry_count, 1);
    assert_eq!(queue[1].status, WorkStatus::Blocked);
    assert_eq!(queue[1].retry_count, 2);
    assert_eq!(queue[2].status, WorkStatus::Running, "serviced by executor-3");
    assert_eq!(queue[3].status, WorkStatus::Done);
    assert_eq!(queue[4].status, WorkStatus::Queued);
}
