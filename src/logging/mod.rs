//! Automation events and log setup
//!
//! Diagnostics go through `tracing`. Conditions a person watching the run
//! should know about (lost window, abandoned task, loop paused) are also
//! raised as [`AutomationEvent`]s to an [`AlertSink`].
//!
//! Filter with `RUST_LOG`, e.g. `RUST_LOG=pixelpilot=debug`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Event IDs for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum EventId {
    // Informational (1000-1099)
    LoopStarted = 1000,
    LoopStopped = 1001,
    LoopPaused = 1002,
    LoopResumed = 1003,
    StateTransition = 1010,
    TaskSucceeded = 1020,

    // Warnings (1100-1199)
    TaskFailed = 1100,
    PerceptionOverrun = 1110,

    // Errors (1200-1299)
    CaptureUnavailable = 1200,
    DispatchRejected = 1210,
    TaskAbandoned = 1220,
    UnknownStateProlonged = 1230,

    // Critical (1300-1399)
    RecoveryExhausted = 1300,
}

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Structured automation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationEvent {
    pub timestamp: DateTime<Utc>,
    pub event_id: EventId,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl AutomationEvent {
    pub fn new(event_id: EventId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id,
            level,
            message: message.into(),
            tick: None,
            task: None,
            state: None,
            count: None,
            reason: None,
            run_id: None,
        }
    }

    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = Some(tick);
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_state(mut self, state: impl fmt::Display) -> Self {
        self.state = Some(state.to_string());
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        // Truncate for log safety
        self.reason = Some(match reason.char_indices().nth(300) {
            Some((cut, _)) => reason[..cut].to_string(),
            None => reason,
        });
        self
    }

    pub fn with_run(mut self, run_id: impl fmt::Display) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    /// Single-line `key=value` rendering
    pub fn to_log_line(&self) -> String {
        let mut parts = vec![
            format!("PIXELPILOT[{}]", self.event_id as u32),
            format!("level={}", self.level),
        ];

        if let Some(tick) = self.tick {
            parts.push(format!("tick={}", tick));
        }
        if let Some(ref task) = self.task {
            parts.push(format!("task={}", task));
        }
        if let Some(ref state) = self.state {
            parts.push(format!("state={}", state));
        }
        if let Some(count) = self.count {
            parts.push(format!("count={}", count));
        }
        if let Some(ref reason) = self.reason {
            let escaped = reason.replace('"', "\\\"").replace('\n', " ");
            parts.push(format!("reason=\"{}\"", escaped));
        }
        if let Some(ref run) = self.run_id {
            parts.push(format!("run={}", &run[..8.min(run.len())]));
        }

        parts.push(format!("msg={}", self.message));
        parts.join(" ")
    }
}

/// Receives user-visible escalations.
pub trait AlertSink: Send + Sync {
    fn alert(&self, event: &AutomationEvent);
}

/// Writes events through `tracing` at the matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn alert(&self, event: &AutomationEvent) {
        let message = event.to_log_line();

        match event.level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
            LogLevel::Critical => tracing::error!(critical = true, "{}", message),
        }
    }
}

/// Keeps every event in memory, for status displays and tests.
#[derive(Debug, Default)]
pub struct CollectingAlerts {
    events: Mutex<Vec<AutomationEvent>>,
}

impl CollectingAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AutomationEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, id: EventId) -> usize {
        self.events().iter().filter(|e| e.event_id == id).count()
    }
}

impl AlertSink for CollectingAlerts {
    fn alert(&self, event: &AutomationEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the defaults.
pub fn init_tracing(json: bool, debug: bool) {
    let default = if debug { "pixelpilot=debug" } else { "pixelpilot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    // A second call (tests, embedding) keeps the first subscriber
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
