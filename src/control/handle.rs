//! External control surface: pause, resume, stop, reset, status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::logging::AutomationEvent;
use crate::scheduler::TaskStatus;
use crate::state::GameState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RunState {
    Running = 0,
    Paused = 1,
    Stopped = 2,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RunState::Running,
            1 => RunState::Paused,
            _ => RunState::Stopped,
        }
    }
}

/// Shared run flag. Read once at the top of every tick.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicU8>);

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(RunState::Running as u8)))
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: RunState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Running -> Paused. Stopped is terminal; pause never leaves it.
    pub fn pause(&self) -> bool {
        self.transition(RunState::Running, RunState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(RunState::Paused, RunState::Running)
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Applied by the loop at the next tick boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    ResetTask(String),
    ResetAll,
}

/// Published after every tick.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub run_id: Uuid,
    pub run_state: RunState,
    pub tick: u64,
    pub state: GameState,
    pub running_task: Option<String>,
    pub tasks: Vec<TaskStatus>,
    pub last_alert: Option<AutomationEvent>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            run_state: RunState::Running,
            tick: 0,
            state: GameState::initial(),
            running_task: None,
            tasks: Vec::new(),
            last_alert: None,
            updated_at: Utc::now(),
        }
    }
}

/// Cloneable handle given to the front-end.
#[derive(Clone)]
pub struct ControlHandle {
    flag: RunFlag,
    commands: mpsc::UnboundedSender<ControlCommand>,
    status: Arc<RwLock<StatusSnapshot>>,
}

impl ControlHandle {
    pub(crate) fn new(
        flag: RunFlag,
        commands: mpsc::UnboundedSender<ControlCommand>,
        status: Arc<RwLock<StatusSnapshot>>,
    ) -> Self {
        Self { flag, commands, status }
    }

    pub fn run_state(&self) -> RunState {
        self.flag.get()
    }

    pub fn pause(&self) -> bool {
        self.flag.pause()
    }

    pub fn resume(&self) -> bool {
        self.flag.resume()
    }

    pub fn stop(&self) {
        self.flag.set(RunState::Stopped);
    }

    /// Returns false once the loop is gone.
    pub fn reset_task(&self, id: impl Into<String>) -> bool {
        self.commands.send(ControlCommand::ResetTask(id.into())).is_ok()
    }

    pub fn reset_all_tasks(&self) -> bool {
        self.commands.send(ControlCommand::ResetAll).is_ok()
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.status.read().await.clone()
    }
}
