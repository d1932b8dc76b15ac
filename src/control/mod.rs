//! Control Loop
//!
//! One tick: capture -> perceive -> reason -> schedule -> act. A failure
//! anywhere skips the rest of that tick; the loop itself keeps going. The
//! run flag is read once at the top of every tick, and the only condition
//! that stops play on its own is a recovery task that keeps failing.

mod handle;

pub use handle::{ControlCommand, ControlHandle, RunFlag, RunState, StatusSnapshot};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::capture::{CaptureError, CaptureSource, Frame};
use crate::dispatch::{Action, DispatchError, DispatchResult, Dispatcher};
use crate::logging::{AlertSink, AutomationEvent, EventId, LogLevel};
use crate::perception::motion::{motion_since, Fingerprint};
use crate::perception::{aggregate, MatchResult, Matcher, OcrError, Template, TextRecognizer, TextSpan};
use crate::reasoner::StateReasoner;
use crate::scheduler::{OutcomeKind, Scheduler, Selection, TaskOutcome};
use crate::state::GameState;

/// Cadence and escalation thresholds, from the profile's `[loop]` table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    pub tick_interval_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Soft deadline for matcher + recognizer in one tick
    pub perception_budget_ms: u64,
    pub capture_alert_after: u32,
    pub dispatch_alert_after: u32,
    pub recovery_failure_limit: u32,
    pub paused_poll_ms: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            min_interval_ms: 100,
            max_interval_ms: 5_000,
            perception_budget_ms: 400,
            capture_alert_after: 5,
            dispatch_alert_after: 5,
            recovery_failure_limit: 3,
            paused_poll_ms: 250,
        }
    }
}

impl LoopSettings {
    pub fn perception_budget(&self) -> Duration {
        Duration::from_millis(self.perception_budget_ms)
    }

    /// Tick interval for a task's cadence request, clamped to the allowed range.
    pub fn interval(&self, hint: Option<Duration>) -> Duration {
        let min = Duration::from_millis(self.min_interval_ms);
        let max = Duration::from_millis(self.max_interval_ms.max(self.min_interval_ms));
        hint.unwrap_or(Duration::from_millis(self.tick_interval_ms)).clamp(min, max)
    }
}

/// Counts a streak of failures and fires once per streak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    threshold: u32,
    consecutive: u32,
    raised: bool,
}

impl Escalation {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            raised: false,
        }
    }

    /// Record a failure. True exactly once, when the streak reaches the threshold.
    pub fn failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        if !self.raised && self.consecutive >= self.threshold {
            self.raised = true;
            return true;
        }
        false
    }

    pub fn success(&mut self) {
        self.consecutive = 0;
        self.raised = false;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Matcher and recognizer, shared with the blocking pool.
#[derive(Clone)]
pub struct Perception {
    matcher: Arc<Matcher>,
    templates: Arc<Vec<Template>>,
    recognizer: Arc<TextRecognizer>,
}

impl Perception {
    pub fn new(matcher: Matcher, templates: Vec<Template>, recognizer: TextRecognizer) -> Self {
        Self {
            matcher: Arc::new(matcher),
            templates: Arc::new(templates),
            recognizer: Arc::new(recognizer),
        }
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    /// Run both perceivers side by side on the same frame. Past the budget
    /// the work is left to finish on its own and its results are dropped.
    pub async fn run(&self, frame: Arc<Frame>, budget: Duration) -> Result<(Vec<MatchResult>, Vec<TextSpan>), TickError> {
        let (matcher, templates, match_frame) = (self.matcher.clone(), self.templates.clone(), frame.clone());
        let match_job = tokio::task::spawn_blocking(move || matcher.find(&match_frame, &templates, None));

        let recognizer = self.recognizer.clone();
        let text_job = tokio::task::spawn_blocking(move || recognizer.recognize_all(&frame));

        let (matches, spans) = tokio::time::timeout(budget, async { tokio::join!(match_job, text_job) })
            .await
            .map_err(|_| TickError::PerceptionOverrun(budget))?;

        let matches = matches.map_err(|e| TickError::Worker(e.to_string()))?;
        let spans = spans.map_err(|e| TickError::Worker(e.to_string()))??;
        Ok((matches, spans))
    }
}

/// Everything that changes while the automation runs. Passed explicitly to
/// each tick; the run flag is its only field written from outside.
pub struct RunContext {
    pub run_id: Uuid,
    pub tick: u64,
    pub state: GameState,
    pub scheduler: Scheduler,
    flag: RunFlag,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    command_tx: mpsc::UnboundedSender<ControlCommand>,
    status: Arc<RwLock<StatusSnapshot>>,
    previous_frame: Option<Fingerprint>,
    capture_failures: Escalation,
    dispatch_rejections: Escalation,
    overruns: Escalation,
    recovery_failures: u32,
    last_alert: Option<AutomationEvent>,
}

impl RunContext {
    pub fn new(scheduler: Scheduler, settings: &LoopSettings) -> Self {
        let run_id = Uuid::new_v4();
        let (command_tx, commands) = mpsc::unbounded_channel();
        Self {
            run_id,
            tick: 0,
            state: GameState::initial(),
            scheduler,
            flag: RunFlag::new(),
            commands,
            command_tx,
            status: Arc::new(RwLock::new(StatusSnapshot::new(run_id))),
            previous_frame: None,
            capture_failures: Escalation::new(settings.capture_alert_after),
            dispatch_rejections: Escalation::new(settings.dispatch_alert_after),
            overruns: Escalation::new(1),
            recovery_failures: 0,
            last_alert: None,
        }
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle::new(self.flag.clone(), self.command_tx.clone(), self.status.clone())
    }

    pub fn run_state(&self) -> RunState {
        self.flag.get()
    }

    pub fn recovery_failures(&self) -> u32 {
        self.recovery_failures
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ControlCommand::ResetTask(id) => {
                    if !self.scheduler.reset(&id) {
                        tracing::warn!(task = %id, "reset requested for unknown task");
                    }
                }
                ControlCommand::ResetAll => self.scheduler.reset_all(),
            }
        }
    }

    async fn publish_status(&self) {
        let mut status = self.status.write().await;
        status.run_state = self.flag.get();
        status.tick = self.tick;
        status.state = self.state.clone();
        status.running_task = self.scheduler.running().map(String::from);
        status.tasks = self.scheduler.statuses();
        status.last_alert = self.last_alert.clone();
        status.updated_at = chrono::Utc::now();
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub state: GameState,
    pub action: Option<Action>,
    pub dispatch: Option<DispatchResult>,
    pub outcomes: Vec<TaskOutcome>,
}

/// Totals for a finished `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub skipped: u64,
    pub actions: u64,
}

pub struct ControlLoop {
    capture: Box<dyn CaptureSource>,
    perception: Perception,
    reasoner: StateReasoner,
    dispatcher: Arc<dyn Dispatcher>,
    alerts: Arc<dyn AlertSink>,
    settings: LoopSettings,
}

impl ControlLoop {
    pub fn new(
        capture: Box<dyn CaptureSource>,
        perception: Perception,
        reasoner: StateReasoner,
        dispatcher: Arc<dyn Dispatcher>,
        alerts: Arc<dyn AlertSink>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            capture,
            perception,
            reasoner,
            dispatcher,
            alerts,
            settings,
        }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    fn raise(&self, ctx: &mut RunContext, event: AutomationEvent) {
        let event = event.with_run(ctx.run_id);
        self.alerts.alert(&event);
        if event.level >= LogLevel::Warning {
            ctx.last_alert = Some(event);
        }
    }

    /// Run one tick and publish the resulting status.
    pub async fn tick(&mut self, ctx: &mut RunContext) -> Result<TickReport, TickError> {
        ctx.apply_commands();
        ctx.tick += 1;
        let result = self.tick_inner(ctx).await;
        if let Err(e) = &result {
            tracing::warn!(tick = ctx.tick, error = %e, "tick skipped");
        }
        ctx.publish_status().await;
        result
    }

    async fn tick_inner(&mut self, ctx: &mut RunContext) -> Result<TickReport, TickError> {
        let tick = ctx.tick;

        // Capture
        let frame = match self.capture.capture() {
            Ok(frame) => {
                ctx.capture_failures.success();
                Arc::new(frame)
            }
            Err(e) => {
                if let CaptureError::Unavailable(reason) = &e {
                    if ctx.capture_failures.failure() {
                        let event = AutomationEvent::new(EventId::CaptureUnavailable, LogLevel::Error, "Game window unavailable")
                            .with_tick(tick)
                            .with_count(ctx.capture_failures.consecutive())
                            .with_reason(reason.clone());
                        self.raise(ctx, event);
                    }
                    if let Err(re) = self.capture.reacquire() {
                        tracing::debug!(error = %re, "reacquire failed");
                    }
                }
                return Err(e.into());
            }
        };

        // Perceive
        let fingerprint = Fingerprint::of(frame.luma());
        let motion = motion_since(ctx.previous_frame.as_ref(), &fingerprint);
        ctx.previous_frame = Some(fingerprint);

        let budget = self.settings.perception_budget();
        let (matches, spans) = match self.perception.run(frame.clone(), budget).await {
            Ok(found) => {
                ctx.overruns.success();
                found
            }
            Err(e) => {
                if matches!(e, TickError::PerceptionOverrun(_)) && ctx.overruns.failure() {
                    let event = AutomationEvent::new(EventId::PerceptionOverrun, LogLevel::Warning, "Perception over budget")
                        .with_tick(tick)
                        .with_reason(e.to_string());
                    self.raise(ctx, event);
                }
                return Err(e);
            }
        };
        let obs = aggregate(matches, spans, tick, frame.captured_at()).with_motion(motion);
        tracing::debug!(tick, matches = obs.match_count(), texts = obs.texts().len(), ?motion, "observed");

        // Reason
        let previous = std::mem::take(&mut ctx.state);
        let state = self.reasoner.reason(&obs, &previous);
        if state.label != previous.label {
            let event = AutomationEvent::new(EventId::StateTransition, LogLevel::Debug, format!("{} -> {}", previous.label, state.label))
                .with_tick(tick)
                .with_state(&state.label);
            self.raise(ctx, event);
        }
        if state.prolonged && !previous.prolonged {
            let event = AutomationEvent::new(EventId::UnknownStateProlonged, LogLevel::Error, "Game state unknown for too long")
                .with_tick(tick)
                .with_count(state.staleness);
            self.raise(ctx, event);
        }
        if !state.label.is_unknown() {
            ctx.recovery_failures = 0;
        }
        ctx.state = state;

        // Schedule + act
        let now = tokio::time::Instant::now().into_std();
        let mut action = None;
        let mut dispatch = None;
        let mut dispatch_error = None;
        if let Selection::Act(directive) = ctx.scheduler.select(&ctx.state, &obs, now) {
            tracing::debug!(tick, task = %directive.task, step = directive.step, "dispatching {}", directive.action);
            match self.dispatcher.dispatch(&directive.action).await {
                Ok(result) => {
                    let reported_at = tokio::time::Instant::now().into_std();
                    ctx.scheduler.report(&directive, &result, reported_at);
                    self.note_dispatch(ctx, &directive.task, &result);
                    action = Some(directive.action);
                    dispatch = Some(result);
                }
                // Left in flight; the scheduler charges the step's wait budget
                Err(e) => dispatch_error = Some(e),
            }
        }

        let outcomes = ctx.scheduler.drain_outcomes();
        let mut exhausted = None;
        for outcome in &outcomes {
            if self.handle_outcome(ctx, outcome) {
                exhausted = Some(outcome.task.as_str());
            }
        }
        if let Some(task) = exhausted {
            self.exhaust_recovery(ctx, task);
        }
        if let Some(e) = dispatch_error {
            return Err(e.into());
        }

        Ok(TickReport {
            tick,
            state: ctx.state.clone(),
            action,
            dispatch,
            outcomes,
        })
    }

    fn note_dispatch(&self, ctx: &mut RunContext, task: &str, result: &DispatchResult) {
        let tick = ctx.tick;
        match result {
            DispatchResult::Sent => ctx.dispatch_rejections.success(),
            DispatchResult::Rejected(reason) => {
                tracing::warn!(tick, %task, %reason, "dispatch rejected");
                if ctx.dispatch_rejections.failure() {
                    let event = AutomationEvent::new(EventId::DispatchRejected, LogLevel::Error, "Game window is not taking input")
                        .with_tick(tick)
                        .with_task(task)
                        .with_count(ctx.dispatch_rejections.consecutive())
                        .with_reason(reason.clone());
                    self.raise(ctx, event);
                }
            }
        }
    }

    /// Alert on a finished run. True when it leaves recovery out of options.
    fn handle_outcome(&self, ctx: &mut RunContext, outcome: &TaskOutcome) -> bool {
        let tick = ctx.tick;
        match &outcome.kind {
            OutcomeKind::Succeeded => {
                if outcome.recovery {
                    ctx.recovery_failures = 0;
                }
                let event = AutomationEvent::new(EventId::TaskSucceeded, LogLevel::Info, "Task succeeded")
                    .with_tick(tick)
                    .with_task(outcome.task.clone());
                self.raise(ctx, event);
                false
            }
            OutcomeKind::Failed { attempt, reason } => {
                let event = AutomationEvent::new(EventId::TaskFailed, LogLevel::Warning, "Task failed")
                    .with_tick(tick)
                    .with_task(outcome.task.clone())
                    .with_count(*attempt)
                    .with_reason(reason.clone());
                self.raise(ctx, event);

                if !outcome.recovery {
                    return false;
                }
                ctx.recovery_failures += 1;
                ctx.recovery_failures >= self.settings.recovery_failure_limit.max(1)
            }
            OutcomeKind::Abandoned { attempts } => {
                let event = AutomationEvent::new(EventId::TaskAbandoned, LogLevel::Error, "Task abandoned")
                    .with_tick(tick)
                    .with_task(outcome.task.clone())
                    .with_count(*attempts);
                self.raise(ctx, event);
                // An abandoned recovery task would never run again
                outcome.recovery
            }
        }
    }

    /// Pause for the operator. The recovery task starts from a clean slate
    /// once play resumes.
    fn exhaust_recovery(&self, ctx: &mut RunContext, task: &str) {
        let event = AutomationEvent::new(
            EventId::RecoveryExhausted,
            LogLevel::Critical,
            "Recovery keeps failing; automation paused",
        )
        .with_tick(ctx.tick)
        .with_task(task)
        .with_count(ctx.recovery_failures);
        self.raise(ctx, event);
        ctx.recovery_failures = 0;
        ctx.scheduler.reset(task);
        ctx.flag.pause();
    }

    /// Tick until stopped (or `max_ticks` ticks have run).
    pub async fn run(&mut self, ctx: &mut RunContext, max_ticks: Option<u64>) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut paused = false;
        self.raise(
            ctx,
            AutomationEvent::new(EventId::LoopStarted, LogLevel::Info, format!("Loop started ({})", self.capture.describe())),
        );

        loop {
            match ctx.run_state() {
                RunState::Stopped => break,
                RunState::Paused => {
                    if !paused {
                        paused = true;
                        self.raise(ctx, AutomationEvent::new(EventId::LoopPaused, LogLevel::Info, "Loop paused").with_tick(ctx.tick));
                        ctx.publish_status().await;
                    }
                    tokio::time::sleep(Duration::from_millis(self.settings.paused_poll_ms.max(1))).await;
                    continue;
                }
                RunState::Running => {
                    if paused {
                        paused = false;
                        self.raise(ctx, AutomationEvent::new(EventId::LoopResumed, LogLevel::Info, "Loop resumed").with_tick(ctx.tick));
                    }
                }
            }
            if max_ticks.map_or(false, |max| summary.ticks >= max) {
                break;
            }

            let started = tokio::time::Instant::now();
            match self.tick(ctx).await {
                Ok(report) => {
                    if report.action.is_some() {
                        summary.actions += 1;
                    }
                }
                Err(_) => summary.skipped += 1,
            }
            summary.ticks += 1;

            let interval = self.settings.interval(ctx.scheduler.poll_hint());
            tokio::time::sleep_until(started + interval).await;
        }

        self.raise(
            ctx,
            AutomationEvent::new(EventId::LoopStopped, LogLevel::Info, "Loop stopped")
                .with_tick(ctx.tick)
                .with_count(summary.ticks.min(u32::MAX as u64) as u32),
        );
        ctx.publish_status().await;
        summary
    }
}

/// Why a tick was skipped
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Ocr(#[from] OcrError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Perception exceeded its {0:?} budget")]
    PerceptionOverrun(Duration),

    #[error("Perception worker failed: {0}")]
    Worker(String),
}
