//! Task Scheduler
//!
//! Owns the task set and each task's runtime record. Per task:
//!
//! ```text
//! Waiting -> (eligible) -> Running -> Succeeded -> Cooldown -> Waiting
//!                                  -> Failed    -> Cooldown -> Waiting
//!                                               -> Abandoned (until reset)
//! ```
//!
//! A running task keeps the floor until it finishes. A step only advances
//! after the dispatcher reports its action, and a step with an expectation
//! is judged on the states of later ticks, never on the action alone.

mod task;

pub use task::{
    ActionSpec, Expectation, RetryPolicy, Step, StepProgress, TaskDef, TaskPhase, TaskRuntime, TaskStatus,
};

use serde::Serialize;
use std::cmp::Reverse;
use std::time::{Duration, Instant};

use crate::dispatch::{Action, DispatchResult};
use crate::perception::Observation;
use crate::state::GameState;

/// One action for the dispatcher, tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub task: String,
    pub step: usize,
    pub attempt: u32,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Act(Directive),
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    Failed { attempt: u32, reason: String },
    Abandoned { attempts: u32 },
}

/// Finished runs, drained by the control loop after each tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub task: String,
    pub recovery: bool,
    pub kind: OutcomeKind,
}

enum Progress {
    Act(Directive),
    Wait,
    Finished,
}

pub struct Scheduler {
    tasks: Vec<TaskDef>,
    runtime: Vec<TaskRuntime>,
    running: Option<usize>,
    outcomes: Vec<TaskOutcome>,
}

impl Scheduler {
    pub fn new(tasks: Vec<TaskDef>) -> Self {
        let runtime = vec![TaskRuntime::default(); tasks.len()];
        Self {
            tasks,
            runtime,
            running: None,
            outcomes: Vec::new(),
        }
    }

    pub fn tasks(&self) -> &[TaskDef] {
        &self.tasks
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    pub fn runtime(&self, id: &str) -> Option<&TaskRuntime> {
        self.index_of(id).map(|i| &self.runtime[i])
    }

    pub fn running(&self) -> Option<&str> {
        self.running.map(|i| self.tasks[i].id.as_str())
    }

    /// Pick the next action, or Idle.
    pub fn select(&mut self, state: &GameState, obs: &Observation, now: Instant) -> Selection {
        self.release_cooldowns(now);

        if let Some(idx) = self.running {
            match self.continue_running(idx, state, obs, now) {
                Progress::Act(directive) => return Selection::Act(directive),
                Progress::Wait => return Selection::Idle,
                Progress::Finished => {}
            }
        }

        let idx = match self.pick_eligible(state) {
            Some(idx) => idx,
            None => return Selection::Idle,
        };
        self.start(idx, now);
        match self.issue(idx, obs, now) {
            Some(directive) => Selection::Act(directive),
            None => Selection::Idle,
        }
    }

    /// Feed back the dispatcher's verdict for a directive from `select`.
    pub fn report(&mut self, directive: &Directive, result: &DispatchResult, now: Instant) {
        let idx = match self.running {
            Some(idx) if self.tasks[idx].id == directive.task => idx,
            _ => {
                tracing::debug!(task = %directive.task, "ignoring report for task that is no longer running");
                return;
            }
        };
        let rt = &self.runtime[idx];
        let waited = match rt.progress {
            StepProgress::InFlight { waited } if rt.step == directive.step => waited,
            _ => {
                tracing::debug!(task = %directive.task, step = directive.step, "ignoring stale report");
                return;
            }
        };
        let step = &self.tasks[idx].steps[directive.step];

        match result {
            DispatchResult::Sent => {
                if step.expect.is_some() {
                    self.runtime[idx].progress = StepProgress::Awaiting { ticks: 0 };
                } else {
                    self.advance(idx, now);
                }
            }
            DispatchResult::Rejected(reason) => {
                let waited = waited + 1;
                if waited >= step.max_wait_ticks {
                    let reason = format!("dispatch rejected {} times: {}", waited, reason);
                    self.fail(idx, now, reason);
                } else {
                    self.runtime[idx].progress = StepProgress::Pending { waited };
                }
            }
        }
    }

    pub fn drain_outcomes(&mut self) -> Vec<TaskOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    /// Clear a task back to Waiting, including Abandoned tasks.
    pub fn reset(&mut self, id: &str) -> bool {
        match self.index_of(id) {
            Some(idx) => {
                self.reset_index(idx);
                tracing::info!(task = %id, "task reset");
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&mut self) {
        for idx in 0..self.tasks.len() {
            self.reset_index(idx);
        }
        tracing::info!(tasks = self.tasks.len(), "all tasks reset");
    }

    fn reset_index(&mut self, idx: usize) {
        if self.running == Some(idx) {
            self.running = None;
        }
        let last_run = self.runtime[idx].last_run;
        self.runtime[idx] = TaskRuntime {
            last_run,
            ..TaskRuntime::default()
        };
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.tasks
            .iter()
            .zip(&self.runtime)
            .map(|(def, rt)| TaskStatus {
                id: def.id.clone(),
                priority: def.priority,
                phase: rt.phase,
                attempts: rt.attempts,
                max_attempts: def.retry.max_attempts,
                step: rt.step,
                steps: def.steps.len(),
            })
            .collect()
    }

    /// Cadence requested by the running task, else the fastest request
    /// among waiting tasks.
    pub fn poll_hint(&self) -> Option<Duration> {
        if let Some(idx) = self.running {
            if let Some(interval) = self.tasks[idx].poll_interval {
                return Some(interval);
            }
        }
        self.tasks
            .iter()
            .zip(&self.runtime)
            .filter(|(_, rt)| rt.phase == TaskPhase::Waiting)
            .filter_map(|(def, _)| def.poll_interval)
            .min()
    }

    fn release_cooldowns(&mut self, now: Instant) {
        for rt in &mut self.runtime {
            if rt.phase == TaskPhase::Cooldown && rt.cooldown_until.map_or(true, |until| until <= now) {
                rt.phase = TaskPhase::Waiting;
                rt.cooldown_until = None;
            }
        }
    }

    /// Recovery tasks first, then highest priority, then least recently
    /// run, then declaration order.
    fn pick_eligible(&self, state: &GameState) -> Option<usize> {
        (0..self.tasks.len())
            .filter(|&i| self.runtime[i].phase == TaskPhase::Waiting && self.tasks[i].precondition.holds(state))
            .min_by_key(|&i| {
                (
                    Reverse(self.tasks[i].recovery),
                    Reverse(self.tasks[i].priority),
                    self.runtime[i].last_run,
                    i,
                )
            })
    }

    fn start(&mut self, idx: usize, now: Instant) {
        let rt = &mut self.runtime[idx];
        rt.phase = TaskPhase::Running;
        rt.step = 0;
        rt.progress = StepProgress::Pending { waited: 0 };
        rt.last_run = Some(now);
        self.running = Some(idx);
        tracing::info!(
            task = %self.tasks[idx].id,
            priority = self.tasks[idx].priority,
            attempt = rt.attempts + 1,
            "task started"
        );
    }

    fn continue_running(&mut self, idx: usize, state: &GameState, obs: &Observation, now: Instant) -> Progress {
        match self.runtime[idx].progress {
            StepProgress::Awaiting { ticks } => {
                let rt = &self.runtime[idx];
                let expect = match self.tasks[idx].steps.get(rt.step).and_then(|s| s.expect.as_ref()) {
                    Some(expect) => expect,
                    None => {
                        return if self.advance(idx, now) {
                            Progress::Finished
                        } else {
                            self.issue_progress(idx, obs, now)
                        };
                    }
                };

                if expect.state.holds(state) {
                    if self.advance(idx, now) {
                        return Progress::Finished;
                    }
                    return self.issue_progress(idx, obs, now);
                }

                let ticks = ticks + 1;
                if ticks >= expect.within_ticks {
                    let reason = format!(
                        "step {} expectation not met within {} ticks (state {})",
                        rt.step, expect.within_ticks, state.label
                    );
                    self.fail(idx, now, reason);
                    return Progress::Finished;
                }
                self.runtime[idx].progress = StepProgress::Awaiting { ticks };
                Progress::Wait
            }
            StepProgress::InFlight { waited } => {
                // The previous directive was never reported; count the tick
                // and send again while the step's wait budget lasts
                let waited = waited + 1;
                let step = self.runtime[idx].step;
                if waited >= self.tasks[idx].steps[step].max_wait_ticks {
                    let reason = format!("step {} dispatch failed {} times", step, waited);
                    self.fail(idx, now, reason);
                    return Progress::Finished;
                }
                self.runtime[idx].progress = StepProgress::Pending { waited };
                self.issue_progress(idx, obs, now)
            }
            StepProgress::Pending { .. } => self.issue_progress(idx, obs, now),
        }
    }

    fn issue_progress(&mut self, idx: usize, obs: &Observation, now: Instant) -> Progress {
        match self.issue(idx, obs, now) {
            Some(directive) => Progress::Act(directive),
            None if self.running == Some(idx) => Progress::Wait,
            None => Progress::Finished,
        }
    }

    /// Resolve the current step's action. An unresolvable target uses up
    /// one tick of the step's wait budget.
    fn issue(&mut self, idx: usize, obs: &Observation, now: Instant) -> Option<Directive> {
        let rt = &self.runtime[idx];
        let step = match self.tasks[idx].steps.get(rt.step) {
            Some(step) => step,
            None => {
                self.succeed(idx, now);
                return None;
            }
        };
        let waited = match rt.progress {
            StepProgress::Pending { waited } | StepProgress::InFlight { waited } => waited,
            StepProgress::Awaiting { .. } => 0,
        };

        match step.action.resolve(obs) {
            Some(action) => {
                let directive = Directive {
                    task: self.tasks[idx].id.clone(),
                    step: rt.step,
                    attempt: rt.attempts + 1,
                    action,
                };
                self.runtime[idx].progress = StepProgress::InFlight { waited };
                Some(directive)
            }
            None => {
                let waited = waited + 1;
                if waited >= step.max_wait_ticks {
                    let reason = format!("step {} target not found after {} ticks", rt.step, waited);
                    self.fail(idx, now, reason);
                } else {
                    self.runtime[idx].progress = StepProgress::Pending { waited };
                }
                None
            }
        }
    }

    /// Move to the next step. Returns true when that finished the task.
    fn advance(&mut self, idx: usize, now: Instant) -> bool {
        let rt = &mut self.runtime[idx];
        rt.step += 1;
        if rt.step >= self.tasks[idx].steps.len() {
            self.succeed(idx, now);
            return true;
        }
        rt.progress = StepProgress::Pending { waited: 0 };
        false
    }

    fn succeed(&mut self, idx: usize, now: Instant) {
        let def = &self.tasks[idx];
        let rt = &mut self.runtime[idx];
        rt.attempts = 0;
        rt.step = 0;
        rt.progress = StepProgress::Pending { waited: 0 };
        rt.phase = TaskPhase::Cooldown;
        rt.cooldown_until = Some(now + def.cooldown);
        self.running = None;
        tracing::info!(task = %def.id, "task succeeded");
        self.outcomes.push(TaskOutcome {
            task: def.id.clone(),
            recovery: def.recovery,
            kind: OutcomeKind::Succeeded,
        });
    }

    fn fail(&mut self, idx: usize, now: Instant, reason: String) {
        let def = &self.tasks[idx];
        let rt = &mut self.runtime[idx];
        rt.attempts += 1;
        rt.step = 0;
        rt.progress = StepProgress::Pending { waited: 0 };
        self.running = None;
        tracing::warn!(
            task = %def.id,
            attempt = rt.attempts,
            max_attempts = def.retry.max_attempts,
            %reason,
            "task failed"
        );
        self.outcomes.push(TaskOutcome {
            task: def.id.clone(),
            recovery: def.recovery,
            kind: OutcomeKind::Failed {
                attempt: rt.attempts,
                reason,
            },
        });

        if rt.attempts >= def.retry.max_attempts {
            rt.phase = TaskPhase::Abandoned;
            rt.cooldown_until = None;
            tracing::error!(task = %def.id, attempts = rt.attempts, "task abandoned");
            self.outcomes.push(TaskOutcome {
                task: def.id.clone(),
                recovery: def.recovery,
                kind: OutcomeKind::Abandoned { attempts: rt.attempts },
            });
        } else {
            rt.phase = TaskPhase::Cooldown;
            rt.cooldown_until = Some(now + def.retry.backoff);
        }
    }
}
