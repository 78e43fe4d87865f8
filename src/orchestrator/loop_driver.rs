//! Loop driver — the tick-driven scheduler that owns all loop state.
//!
//! One tokio task owns the agent table, dispatcher, branch monitor and
//! review poller. Every tick runs the phases in a fixed order:
//!
//! 1. apply queued [`LoopCommand`]s
//! 2. list sessions ([`SessionInspector`])
//! 3. reconcile the agent table
//! 4. check the branch ([`BranchMonitor`])
//! 5. poll review feedback ([`ReviewPoller`])
//! 6. resolve departures/confirmations and dispatch ([`Dispatcher`])
//! 7. publish a [`LoopSnapshot`]
//!
//! Reconciliation precedes dispatch so cooldown, concurrency and requeue
//! decisions see the corrected table. Nothing after dispatch reads the
//! table within the same tick.
//!
//! Outside code never touches loop state: it reads snapshots through
//! [`LoopHandle`], receives events through callbacks, and requests
//! changes through commands that the next tick applies.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::LoopConfig;
use crate::models::agent::{AgentTable, TrackedAgent};
use crate::models::snapshot::{LoopSnapshot, ReviewState};
use crate::models::work_unit::{WorkStatus, WorkUnit};
use crate::persistence::queue_store::WorkQueueStore;
use crate::AppError;

use super::branch_monitor::{BranchMonitor, BranchSource};
use super::dispatcher::{Dispatcher, TransitionReason, UnitTransition};
use super::reconciler::reconcile;
use super::review_poller::{ReviewPoller, ReviewSource};
use super::session_inspector::{SessionInspector, SessionSnapshot};
use super::spawner::SessionSpawner;

/// Callback receiving the full agent table after it changed.
pub type AgentsCallback = Box<dyn Fn(&[TrackedAgent]) + Send + Sync>;
/// Callback receiving a branch name or pull-request URL.
pub type TextCallback = Box<dyn Fn(&str) + Send + Sync>;
/// Callback receiving a work unit.
pub type UnitCallback = Box<dyn Fn(&WorkUnit) + Send + Sync>;

/// External collaborators the loop queries and drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Session listing.
    pub inspector: Arc<dyn SessionInspector>,
    /// Session creation for dispatch requests.
    pub spawner: Arc<dyn SessionSpawner>,
    /// Persistent work queue.
    pub store: Arc<dyn WorkQueueStore>,
    /// Active branch lookup.
    pub branch: Arc<dyn BranchSource>,
    /// Review availability check; `None` disables review polling.
    pub review: Option<Arc<dyn ReviewSource>>,
}

/// Requests from outside the loop, applied at the start of the next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopCommand {
    /// Track a pull-request URL for review feedback, or clear tracking.
    TrackReview(Option<String>),
}

#[derive(Default)]
struct Callbacks {
    on_agents_change: Option<AgentsCallback>,
    on_branch_change: Option<TextCallback>,
    on_review_feedback: Option<TextCallback>,
    on_dispatch: Option<UnitCallback>,
    on_blocked: Option<UnitCallback>,
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Whether the session listing failed this tick.
    pub sessions_degraded: bool,
    /// Agents evicted by reconciliation.
    pub departed: Vec<TrackedAgent>,
    /// Agents observed for the first time.
    pub newly_observed: Vec<TrackedAgent>,
    /// New branch, if it changed.
    pub branch_changed: Option<String>,
    /// Pull-request URL whose feedback was first seen this tick.
    pub review_feedback: Option<String>,
    /// Confirm/requeue/block transitions persisted this tick.
    pub transitions: Vec<UnitTransition>,
    /// Unit dispatched this tick.
    pub dispatched: Option<WorkUnit>,
}

/// Loop state and the per-tick algorithm.
///
/// Normally owned by the task started with [`LoopDriver::start`]. Tests
/// and embedders can take it from [`LoopDriver::into_parts`] and call
/// [`tick`](Self::tick) with their own clock.
pub struct LoopCore {
    config: LoopConfig,
    window_prefix: String,
    reset_review_on_branch_change: bool,
    collaborators: Collaborators,
    callbacks: Callbacks,
    agents: AgentTable,
    dispatcher: Dispatcher,
    branch: BranchMonitor,
    review: ReviewPoller,
    ticks: u64,
    sessions_degraded: bool,
    commands: mpsc::UnboundedReceiver<LoopCommand>,
    snapshot_tx: watch::Sender<LoopSnapshot>,
    cancel: CancellationToken,
}

impl LoopCore {
    /// Current agent table.
    #[must_use]
    pub fn agents(&self) -> &AgentTable {
        &self.agents
    }

    /// Last known branch.
    #[must_use]
    pub fn branch(&self) -> Option<&str> {
        self.branch.current()
    }

    /// Review polling state.
    #[must_use]
    pub fn review_state(&self) -> ReviewState {
        self.review.state()
    }

    /// Time of the most recent dispatch.
    #[must_use]
    pub fn last_dispatch_at(&self) -> Option<Instant> {
        self.dispatcher.last_dispatch_at()
    }

    /// Completed ticks.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Copy of the loop state.
    #[must_use]
    pub fn snapshot(&self) -> LoopSnapshot {
        LoopSnapshot {
            agents: self.agents.to_vec(),
            branch: self.branch.current().map(str::to_owned),
            review: self.review.state(),
            last_dispatch_at: self.dispatcher.last_dispatch_at(),
            ticks: self.ticks,
            sessions_degraded: self.sessions_degraded,
        }
    }

    /// Run one tick at time `now`.
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let span = info_span!("tick", n = self.ticks + 1);
        self.run_phases(now).instrument(span).await
    }

    async fn run_phases(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        let query_timeout = self.config.query_timeout();

        self.apply_commands();

        // Sessions.
        let inspector = Arc::clone(&self.collaborators.inspector);
        let prefix = self.window_prefix.clone();
        let filter = (!prefix.is_empty()).then_some(prefix.as_str());
        let snapshot = if let Ok(snapshot) =
            timeout(query_timeout, inspector.list_sessions(filter)).await
        {
            snapshot
        } else {
            warn!(timeout_ms = self.config.query_timeout_ms, "session listing timed out");
            SessionSnapshot::degraded()
        };
        self.sessions_degraded = snapshot.degraded;
        report.sessions_degraded = snapshot.degraded;

        // Reconciliation.
        let previous = std::mem::take(&mut self.agents);
        let reconciled = reconcile(
            previous,
            &snapshot,
            now,
            self.config.spawn_grace_period(),
            &self.window_prefix,
        );
        let mut agents_changed = reconciled.changed();
        self.agents = reconciled.table;
        report.departed = reconciled.departed;
        report.newly_observed = reconciled.newly_observed;
        self.flag_duplicate_mappings();

        // Branch.
        let branch_source = Arc::clone(&self.collaborators.branch);
        let reading = timeout(query_timeout, branch_source.current_branch())
            .await
            .unwrap_or_else(|_| {
                warn!(timeout_ms = self.config.query_timeout_ms, "branch lookup timed out");
                None
            });
        if let Some(branch) = self.branch.observe(reading) {
            if self.reset_review_on_branch_change && self.review.tracked_url().is_some() {
                self.review.set_tracked_url(None);
            }
            self.emit_text(self.callbacks.on_branch_change.as_ref(), "on_branch_change", &branch);
            report.branch_changed = Some(branch);
        }

        // Review feedback.
        let pending = self.review.pending_url().map(str::to_owned);
        if let (Some(url), Some(source)) = (pending, self.collaborators.review.clone()) {
            let result = timeout(query_timeout, source.check_feedback(&url))
                .await
                .unwrap_or_else(|_| {
                    Err(AppError::Review(format!(
                        "feedback check timed out after {}ms",
                        self.config.query_timeout_ms
                    )))
                });
            if let Some(url) = self.review.observe(result) {
                self.emit_text(self.callbacks.on_review_feedback.as_ref(), "on_review_feedback", &url);
                report.review_feedback = Some(url);
            }
        }

        // Dispatch.
        if self.dispatch_phase(now, &mut report) {
            agents_changed = true;
        }

        if agents_changed {
            if let Some(ref callback) = self.callbacks.on_agents_change {
                let agents = self.agents.to_vec();
                self.guarded("on_agents_change", || callback(&agents));
            }
        }

        self.ticks += 1;
        self.snapshot_tx.send_replace(self.snapshot());
        report
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                LoopCommand::TrackReview(url) => self.review.set_tracked_url(url),
            }
        }
    }

    /// Returns whether a new agent entered the table.
    fn dispatch_phase(&mut self, now: Instant, report: &mut TickReport) -> bool {
        let store = Arc::clone(&self.collaborators.store);
        let mut units = match store.load_work_units() {
            Ok(units) => units,
            Err(err) => {
                warn!(%err, "work queue unavailable; skipping dispatch this tick");
                return false;
            }
        };

        let confirmed = self.dispatcher.confirm(&report.newly_observed, &mut units);
        let mut resolved = self.dispatcher.resolve_departures(&report.departed, &mut units);
        if !report.sessions_degraded {
            resolved.extend(self.dispatcher.resolve_orphans(&self.agents, &mut units));
        }
        for transition in confirmed.into_iter().chain(resolved) {
            self.persist_transition(store.as_ref(), &transition);
            if transition.reason == TransitionReason::RetriesExhausted {
                self.emit_unit(self.callbacks.on_blocked.as_ref(), "on_blocked", &transition.unit);
            }
            report.transitions.push(transition);
        }

        let Some(request) = self.dispatcher.decide(&self.agents, &mut units, now) else {
            return false;
        };

        let unit = request.work_unit.clone();
        if let Err(err) = store.mark_status(unit.id, WorkStatus::Dispatched) {
            error!(%err, unit = unit.id, "failed to persist dispatch; abandoning it");
            return false;
        }

        self.agents.insert(request.tracked_agent(now));
        self.collaborators.spawner.spawn(request);
        self.emit_unit(self.callbacks.on_dispatch.as_ref(), "on_dispatch", &unit);
        report.dispatched = Some(unit);
        true
    }

    fn persist_transition(&self, store: &dyn WorkQueueStore, transition: &UnitTransition) {
        let unit = &transition.unit;
        let saved = if transition.reason == TransitionReason::Requeued {
            store.requeue(unit.id, unit.retry_count)
        } else {
            store.mark_status(unit.id, unit.status)
        };
        if let Err(err) = saved {
            warn!(%err, unit = unit.id, status = %unit.status, "failed to persist status");
        }
    }

    /// Detect work units mapped to several agents. This is a logic fault:
    /// it is logged loudly, and every entry involved is flagged so the
    /// reconciler evicts it on its first absence.
    fn flag_duplicate_mappings(&mut self) {
        for (unit, names) in self.agents.duplicate_work_units() {
            let mut newly_flagged = false;
            for name in &names {
                if let Some(agent) = self.agents.get_mut(name) {
                    newly_flagged |= !agent.flagged;
                    agent.flagged = true;
                }
            }
            if newly_flagged {
                error!(unit, agents = ?names, "work unit mapped to multiple agents");
            }
        }
    }

    fn emit_text(&self, callback: Option<&TextCallback>, name: &'static str, value: &str) {
        if let Some(callback) = callback {
            self.guarded(name, || callback(value));
        }
    }

    fn emit_unit(&self, callback: Option<&UnitCallback>, name: &'static str, unit: &WorkUnit) {
        if let Some(callback) = callback {
            self.guarded(name, || callback(unit));
        }
    }

    /// Run a callback unless the loop was stopped; a panic is logged and
    /// swallowed.
    fn guarded(&self, name: &'static str, f: impl FnOnce()) {
        if self.cancel.is_cancelled() {
            debug!(callback = name, "loop stopped; callback suppressed");
            return;
        }
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(callback = name, "callback panicked; continuing");
        }
    }
}

/// Builder for the orchestration loop.
pub struct LoopDriver {
    core: LoopCore,
    handle: LoopHandle,
}

impl LoopDriver {
    /// Loop over `collaborators` with `config` limits.
    #[must_use]
    pub fn new(config: LoopConfig, collaborators: Collaborators) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(LoopSnapshot::default());
        let cancel = CancellationToken::new();

        let core = LoopCore {
            dispatcher: Dispatcher::new(&config, ""),
            config,
            window_prefix: String::new(),
            reset_review_on_branch_change: false,
            collaborators,
            callbacks: Callbacks::default(),
            agents: AgentTable::new(),
            branch: BranchMonitor::new(),
            review: ReviewPoller::new(),
            ticks: 0,
            sessions_degraded: false,
            commands: command_rx,
            snapshot_tx,
            cancel: cancel.clone(),
        };
        let handle = LoopHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            cancel,
            task: Arc::new(Mutex::new(None)),
        };
        Self { core, handle }
    }

    /// Prefix of agent window names; also filters session listings.
    #[must_use]
    pub fn window_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.core.dispatcher = Dispatcher::new(&self.core.config, prefix.clone());
        self.core.window_prefix = prefix;
        self
    }

    /// Whether a branch change clears the tracked pull-request URL. Off by
    /// default.
    #[must_use]
    pub fn reset_review_on_branch_change(mut self, enabled: bool) -> Self {
        self.core.reset_review_on_branch_change = enabled;
        self
    }

    /// Register the agent-table change callback.
    #[must_use]
    pub fn on_agents_change(mut self, f: impl Fn(&[TrackedAgent]) + Send + Sync + 'static) -> Self {
        self.core.callbacks.on_agents_change = Some(Box::new(f));
        self
    }

    /// Register the branch change callback.
    #[must_use]
    pub fn on_branch_change(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.core.callbacks.on_branch_change = Some(Box::new(f));
        self
    }

    /// Register the review feedback callback; receives the pull-request URL.
    #[must_use]
    pub fn on_review_feedback(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.core.callbacks.on_review_feedback = Some(Box::new(f));
        self
    }

    /// Register the dispatch callback.
    #[must_use]
    pub fn on_dispatch(mut self, f: impl Fn(&WorkUnit) + Send + Sync + 'static) -> Self {
        self.core.callbacks.on_dispatch = Some(Box::new(f));
        self
    }

    /// Register the callback fired when a unit exhausts its retries.
    #[must_use]
    pub fn on_blocked(mut self, f: impl Fn(&WorkUnit) + Send + Sync + 'static) -> Self {
        self.core.callbacks.on_blocked = Some(Box::new(f));
        self
    }

    /// Split into the core and a handle without starting a task.
    #[must_use]
    pub fn into_parts(self) -> (LoopCore, LoopHandle) {
        (self.core, self.handle)
    }

    /// Start ticking on the current tokio runtime.
    #[must_use]
    pub fn start(self) -> LoopHandle {
        let Self { core, handle } = self;
        let tick_interval = core.config.tick_interval();
        let cancel = handle.cancel.clone();
        let task = tokio::spawn(
            run(core, tick_interval, cancel).instrument(info_span!("orchestration_loop")),
        );
        if let Ok(mut slot) = handle.task.try_lock() {
            *slot = Some(task);
        }
        handle
    }
}

async fn run(mut core: LoopCore, tick_interval: Duration, cancel: CancellationToken) {
    info!(tick_ms = tick_interval.as_millis(), "orchestration loop started");
    let mut interval = tokio::time::interval(tick_interval);
    // A late tick runs after the current one completes; ticks never overlap.
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let now = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            now = interval.tick() => now,
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = core.tick(now) => {}
        }

        let elapsed = now.elapsed();
        if elapsed > tick_interval {
            debug!(
                elapsed_ms = elapsed.as_millis(),
                tick_ms = tick_interval.as_millis(),
                "tick overran its interval; next tick delayed"
            );
        }
    }

    info!(ticks = core.ticks(), "orchestration loop stopped");
}

/// Handle to a running (or manually driven) loop.
#[derive(Clone)]
pub struct LoopHandle {
    commands: mpsc::UnboundedSender<LoopCommand>,
    snapshots: watch::Receiver<LoopSnapshot>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LoopHandle {
    /// Track `url` for review feedback, or clear tracking with `None`.
    /// Takes effect at the start of the next tick.
    pub fn set_tracked_url(&self, url: Option<String>) {
        self.send(LoopCommand::TrackReview(url));
    }

    /// Queue a command for the next tick.
    pub fn send(&self, command: LoopCommand) {
        if self.commands.send(command).is_err() {
            warn!("orchestration loop is gone; command dropped");
        }
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> LoopSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that is notified after every tick.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LoopSnapshot> {
        self.snapshots.clone()
    }

    /// Whether the loop has not been stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop the loop and wait for its task to exit.
    ///
    /// Safe to call at any point, including while a tick is waiting on an
    /// external query, and idempotent. No callback fires after this
    /// returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(%err, "orchestration loop task failed");
            }
        }
    }
}
