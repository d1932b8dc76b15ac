//! PixelPilot Library
//!
//! Screen-driven automation for games that expose no API. Each tick the
//! control loop captures the game window, finds known templates and text,
//! decides which discrete state the game is in, lets the scheduler pick
//! one task step, and sends the matching input.
//!
//! Real capture and real input are opt-in (`vision`, `input`,
//! `computer-use` features). Without them the crate runs against
//! replayed frames and the dry-run dispatcher.

pub mod capture;
pub mod cli;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod logging;
pub mod perception;
pub mod reasoner;
pub mod scheduler;
pub mod state;

pub use capture::{CaptureError, CaptureSource, Frame, ReplayCapture, WindowCapture, WindowInfo, WindowTarget};
pub use config::{AutomationPlan, ConfigError, Profile, ProfileManager};
pub use control::{ControlHandle, ControlLoop, Perception, RunContext, RunState, StatusSnapshot, TickError};
pub use dispatch::{Action, DispatchResult, Dispatcher, DryRunDispatcher, InputDispatcher};
pub use logging::{AlertSink, AutomationEvent, EventId, LogLevel, TracingAlerts};
pub use perception::{Matcher, Observation, Template, TextRecognizer};
pub use reasoner::StateReasoner;
pub use scheduler::{Scheduler, TaskDef};
pub use state::{GameState, StateLabel, StatePredicate};
