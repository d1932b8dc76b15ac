//! Task definitions and their per-task runtime record.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::dispatch::Action;
use crate::perception::Observation;
use crate::state::StatePredicate;

/// What a step does. Targets named by template or text are resolved
/// against the current observation when the step is issued.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionSpec {
    Fixed(Action),
    /// Tap the centre of the best hit for a template
    TapTemplate { template: String, offset: (i32, i32) },
    /// Tap the centre of the most confident span containing `text`
    TapText { text: String, region: Option<String> },
}

impl ActionSpec {
    /// `None` when the target is not currently visible.
    pub fn resolve(&self, obs: &Observation) -> Option<Action> {
        match self {
            ActionSpec::Fixed(action) => Some(action.clone()),
            ActionSpec::TapTemplate { template, offset } => obs.best_match(template).map(|m| {
                let (x, y) = m.bbox.center();
                Action::Tap {
                    x: x.saturating_add(offset.0),
                    y: y.saturating_add(offset.1),
                }
            }),
            ActionSpec::TapText { text, region } => obs.find_text(text, region.as_deref()).first().map(|span| {
                let (x, y) = span.bbox.center();
                Action::Tap { x, y }
            }),
        }
    }
}

/// Completion criterion checked against the states of following ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    pub state: StatePredicate,
    pub within_ticks: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub action: ActionSpec,
    pub expect: Option<Expectation>,
    /// Ticks the step may spend unsendable (target not visible, dispatch
    /// rejected) before the task fails
    pub max_wait_ticks: u32,
}

impl Step {
    pub fn new(action: ActionSpec) -> Self {
        Self {
            action,
            expect: None,
            max_wait_ticks: 5,
        }
    }

    pub fn expecting(mut self, state: StatePredicate, within_ticks: u32) -> Self {
        self.expect = Some(Expectation {
            state,
            within_ticks: within_ticks.max(1),
        });
        self
    }

    pub fn with_max_wait(mut self, ticks: u32) -> Self {
        self.max_wait_ticks = ticks.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Cooldown after a failed attempt
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Read-only task definition.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDef {
    pub id: String,
    pub priority: i32,
    pub precondition: StatePredicate,
    pub steps: Vec<Step>,
    pub retry: RetryPolicy,
    /// Cooldown after a successful run
    pub cooldown: Duration,
    /// Preferred tick cadence while this task is running
    pub poll_interval: Option<Duration>,
    /// Runs when the game state cannot be determined; its failures count
    /// toward the loop's recovery limit
    pub recovery: bool,
}

impl TaskDef {
    pub fn new(id: impl Into<String>, priority: i32, precondition: StatePredicate, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            priority,
            precondition,
            steps,
            retry: RetryPolicy::default(),
            cooldown: Duration::ZERO,
            poll_interval: None,
            recovery: false,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.retry = RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff,
        };
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn as_recovery(mut self) -> Self {
        self.recovery = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Waiting,
    Running,
    Cooldown,
    /// Out of attempts; skipped until reset
    Abandoned,
}

/// Where the current step stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "progress", rename_all = "snake_case")]
pub enum StepProgress {
    /// Not sent yet
    Pending { waited: u32 },
    /// Handed to the dispatcher, no report yet
    InFlight { waited: u32 },
    /// Sent; watching for the expected state
    Awaiting { ticks: u32 },
}

/// Mutable fields owned by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRuntime {
    pub phase: TaskPhase,
    pub attempts: u32,
    pub last_run: Option<Instant>,
    pub step: usize,
    pub cooldown_until: Option<Instant>,
    pub progress: StepProgress,
}

impl Default for TaskRuntime {
    fn default() -> Self {
        Self {
            phase: TaskPhase::Waiting,
            attempts: 0,
            last_run: None,
            step: 0,
            cooldown_until: None,
            progress: StepProgress::Pending { waited: 0 },
        }
    }
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub id: String,
    pub priority: i32,
    pub phase: TaskPhase,
    pub attempts: u32,
    pub max_attempts: u32,
    pub step: usize,
    pub steps: usize,
}
