//! Action Dispatcher
//!
//! Delivers one [`Action`] to the game. `Sent` only means the input left
//! this process; whether the game reacted is judged from later frames.
//! `Rejected` means the game window could not take input right now.

mod input;

pub use input::{is_dangerous_key, parse_key_combo, InputDispatcher, DANGEROUS_KEYS, MAX_ACTIONS_PER_SECOND};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One synthetic input. Coordinates are relative to the game window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Tap { x: i32, y: i32 },
    /// A key or combo such as `esc` or `alt+1`
    Key { key: String },
    Text { text: String },
    Swipe {
        from: (i32, i32),
        to: (i32, i32),
        duration: Duration,
    },
    Wait { duration: Duration },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Tap { .. } => "tap",
            Action::Key { .. } => "key",
            Action::Text { .. } => "text",
            Action::Swipe { .. } => "swipe",
            Action::Wait { .. } => "wait",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Tap { x, y } => write!(f, "tap ({}, {})", x, y),
            Action::Key { key } => write!(f, "key {}", key),
            Action::Text { text } => write!(f, "text {:?}", text),
            Action::Swipe { from, to, duration } => write!(
                f,
                "swipe ({}, {}) -> ({}, {}) over {}ms",
                from.0,
                from.1,
                to.0,
                to.1,
                duration.as_millis()
            ),
            Action::Wait { duration } => write!(f, "wait {}ms", duration.as_millis()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum DispatchResult {
    Sent,
    Rejected(String),
}

/// Delivers actions to the game.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;

    /// Errors are internal failures (input backend broken, refused combo);
    /// a window that cannot take input is `Ok(Rejected)`.
    async fn dispatch(&self, action: &Action) -> Result<DispatchResult, DispatchError>;
}

/// Random pixel offset and extra delay so input does not land on the
/// exact same pixel at the exact same cadence.
pub struct Jitter {
    px: u32,
    delay_ms: u64,
    rng: Mutex<StdRng>,
}

impl Jitter {
    pub fn new(px: u32, delay_ms: u64) -> Self {
        Self {
            px,
            delay_ms,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible jitter for tests and replays.
    pub fn seeded(px: u32, delay_ms: u64, seed: u64) -> Self {
        Self {
            px,
            delay_ms,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn none() -> Self {
        Self::seeded(0, 0, 0)
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut rng)
    }

    pub fn offset(&self) -> (i32, i32) {
        if self.px == 0 {
            return (0, 0);
        }
        let px = self.px as i32;
        self.with_rng(|rng| (rng.gen_range(-px..=px), rng.gen_range(-px..=px)))
    }

    pub fn delay(&self) -> Duration {
        if self.delay_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.with_rng(|rng| rng.gen_range(0..=self.delay_ms)))
    }

    /// Nudge tap and swipe coordinates.
    pub fn apply(&self, action: &Action) -> Action {
        let nudge = |(x, y): (i32, i32)| {
            let (dx, dy) = self.offset();
            (x.saturating_add(dx), y.saturating_add(dy))
        };
        match action {
            Action::Tap { x, y } => {
                let (x, y) = nudge((*x, *y));
                Action::Tap { x, y }
            }
            Action::Swipe { from, to, duration } => Action::Swipe {
                from: nudge(*from),
                to: nudge(*to),
                duration: *duration,
            },
            other => other.clone(),
        }
    }
}

/// Logs actions instead of delivering them. Always `Sent`.
#[derive(Default)]
pub struct DryRunDispatcher {
    sent: AtomicU64,
}

impl DryRunDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for DryRunDispatcher {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn dispatch(&self, action: &Action) -> Result<DispatchResult, DispatchError> {
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(n, kind = action.kind(), "dry run: {}", action);
        Ok(DispatchResult::Sent)
    }
}

/// Dispatch errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Input feature not compiled. Rebuild with --features input")]
    FeatureNotCompiled,

    #[error("Input initialization failed: {0}")]
    InitError(String),

    #[error("Dangerous key combination blocked: {0}")]
    DangerousKey(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Text too long ({0} chars). Max 10000 characters per action")]
    TextTooLong(usize),

    #[error("Mouse operation failed: {0}")]
    MouseError(String),

    #[error("Keyboard operation failed: {0}")]
    KeyboardError(String),
}
