//! Synthetic input through enigo.
//!
//! Requires the `input` feature: `--features input`. Without it the
//! dispatcher still checks the window and refuses dangerous keys, then
//! fails with `FeatureNotCompiled`.
//!
//! Every action is window-relative; the window is located again before each
//! action so a moved or minimized window is never clicked blind.

#[cfg(feature = "input")]
use enigo::{Enigo, Keyboard, Mouse, Settings};

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{Action, DispatchError, DispatchResult, Dispatcher, Jitter};
use crate::capture::{WindowInfo, WindowProbe};

/// Rate limiting: max actions per second
pub const MAX_ACTIONS_PER_SECOND: u32 = 20;

/// Key combinations that could leave the game or the session
pub const DANGEROUS_KEYS: &[&str] = &[
    "ctrl+alt+delete",
    "alt+f4",
    "ctrl+shift+escape",
    "super+l", // Lock screen
    "ctrl+q",  // Quit application
    "ctrl+w",  // Close window
];

#[cfg(feature = "input")]
const SWIPE_SEGMENTS: u32 = 12;
const MAX_TEXT_LEN: usize = 10_000;

pub fn is_dangerous_key(keys: &str) -> bool {
    let normalized = keys.to_lowercase().replace(' ', "");
    DANGEROUS_KEYS.iter().any(|dk| normalized.contains(dk))
}

/// Split `"ctrl+shift+s"` into modifiers and the main key.
pub fn parse_key_combo(combo: &str) -> Result<(Vec<String>, String), DispatchError> {
    let keys: Vec<String> = combo
        .split('+')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    match keys.split_last() {
        Some((main, modifiers)) => Ok((modifiers.to_vec(), main.clone())),
        None => Err(DispatchError::UnknownKey(combo.to_string())),
    }
}

/// Sliding one-second window.
struct RateLimiter {
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    fn check(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= MAX_ACTIONS_PER_SECOND {
            return false;
        }
        self.count += 1;
        true
    }
}

/// Dispatcher that drives the real mouse and keyboard.
pub struct InputDispatcher {
    probe: Box<dyn WindowProbe>,
    jitter: Jitter,
    /// Pause after each action so the game can register it
    settle: Duration,
    rate: Mutex<RateLimiter>,
    #[cfg(feature = "input")]
    enigo: Mutex<Enigo>,
}

impl InputDispatcher {
    #[cfg(feature = "input")]
    pub fn new(probe: Box<dyn WindowProbe>, jitter: Jitter, settle: Duration) -> Result<Self, DispatchError> {
        let enigo = Enigo::new(&Settings::default()).map_err(|e| DispatchError::InitError(e.to_string()))?;
        Ok(Self {
            probe,
            jitter,
            settle,
            rate: Mutex::new(RateLimiter {
                window_start: Instant::now(),
                count: 0,
            }),
            enigo: Mutex::new(enigo),
        })
    }

    #[cfg(not(feature = "input"))]
    pub fn new(probe: Box<dyn WindowProbe>, jitter: Jitter, settle: Duration) -> Result<Self, DispatchError> {
        Ok(Self {
            probe,
            jitter,
            settle,
            rate: Mutex::new(RateLimiter {
                window_start: Instant::now(),
                count: 0,
            }),
        })
    }

    /// Why the window cannot take input right now, if it cannot.
    fn window_rejection(window: &WindowInfo) -> Option<String> {
        if window.minimized {
            Some(format!("{} is minimized", window.title))
        } else if window.width == 0 || window.height == 0 {
            Some(format!("{} has no visible area", window.title))
        } else {
            None
        }
    }

    fn within_rate_limit(&self) -> bool {
        let mut rate = match self.rate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rate.check(Instant::now())
    }

    fn preflight(&self, action: &Action) -> Result<(), DispatchError> {
        match action {
            Action::Key { key } if is_dangerous_key(key) => Err(DispatchError::DangerousKey(key.clone())),
            Action::Key { key } => parse_key_combo(key).map(|_| ()),
            Action::Text { text } if text.len() > MAX_TEXT_LEN => Err(DispatchError::TextTooLong(text.len())),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Dispatcher for InputDispatcher {
    fn name(&self) -> &str {
        "input"
    }

    async fn dispatch(&self, action: &Action) -> Result<DispatchResult, DispatchError> {
        if let Action::Wait { duration } = action {
            tokio::time::sleep(*duration).await;
            return Ok(DispatchResult::Sent);
        }

        self.preflight(action)?;

        let window = match self.probe.locate() {
            Some(w) => w,
            None => return Ok(DispatchResult::Rejected("game window not found".into())),
        };
        if let Some(reason) = Self::window_rejection(&window) {
            return Ok(DispatchResult::Rejected(reason));
        }

        if !self.within_rate_limit() {
            return Ok(DispatchResult::Rejected(format!(
                "rate limit of {} actions/second reached",
                MAX_ACTIONS_PER_SECOND
            )));
        }

        let delay = self.jitter.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let action = self.jitter.apply(action);
        self.deliver(&window, &action).await?;
        tracing::debug!(kind = action.kind(), window = %window.title, "sent {}", action);

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        Ok(DispatchResult::Sent)
    }
}

#[cfg(feature = "input")]
impl InputDispatcher {
    fn with_enigo<T>(&self, f: impl FnOnce(&mut Enigo) -> Result<T, DispatchError>) -> Result<T, DispatchError> {
        let mut enigo = match self.enigo.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut enigo)
    }

    async fn deliver(&self, window: &WindowInfo, action: &Action) -> Result<(), DispatchError> {
        match action {
            Action::Tap { x, y } => {
                let (sx, sy) = window.to_screen(*x, *y);
                self.with_enigo(|enigo| {
                    enigo
                        .move_mouse(sx, sy, enigo::Coordinate::Abs)
                        .map_err(|e| DispatchError::MouseError(e.to_string()))?;
                    enigo
                        .button(enigo::Button::Left, enigo::Direction::Click)
                        .map_err(|e| DispatchError::MouseError(e.to_string()))
                })
            }
            Action::Swipe { from, to, duration } => {
                let (fx, fy) = window.to_screen(from.0, from.1);
                let (tx, ty) = window.to_screen(to.0, to.1);
                self.with_enigo(|enigo| {
                    enigo
                        .move_mouse(fx, fy, enigo::Coordinate::Abs)
                        .map_err(|e| DispatchError::MouseError(e.to_string()))?;
                    enigo
                        .button(enigo::Button::Left, enigo::Direction::Press)
                        .map_err(|e| DispatchError::MouseError(e.to_string()))
                })?;

                let pause = *duration / SWIPE_SEGMENTS;
                for i in 1..=SWIPE_SEGMENTS {
                    tokio::time::sleep(pause).await;
                    let t = i as f32 / SWIPE_SEGMENTS as f32;
                    let x = fx + ((tx - fx) as f32 * t).round() as i32;
                    let y = fy + ((ty - fy) as f32 * t).round() as i32;
                    self.with_enigo(|enigo| {
                        enigo
                            .move_mouse(x, y, enigo::Coordinate::Abs)
                            .map_err(|e| DispatchError::MouseError(e.to_string()))
                    })?;
                }

                self.with_enigo(|enigo| {
                    enigo
                        .button(enigo::Button::Left, enigo::Direction::Release)
                        .map_err(|e| DispatchError::MouseError(e.to_string()))
                })
            }
            Action::Key { key } => {
                let (modifiers, main) = parse_key_combo(key)?;
                let modifiers = modifiers.iter().map(|m| parse_key(m)).collect::<Result<Vec<_>, _>>()?;
                let main = parse_key(&main)?;
                self.with_enigo(|enigo| {
                    let press = |enigo: &mut Enigo, key, dir| {
                        enigo
                            .key(key, dir)
                            .map_err(|e| DispatchError::KeyboardError(e.to_string()))
                    };
                    for m in &modifiers {
                        press(enigo, *m, enigo::Direction::Press)?;
                    }
                    let result = press(enigo, main, enigo::Direction::Click);
                    // Release modifiers even when the main key failed
                    for m in modifiers.iter().rev() {
                        press(enigo, *m, enigo::Direction::Release)?;
                    }
                    result
                })
            }
            Action::Text { text } => self.with_enigo(|enigo| {
                enigo
                    .text(text)
                    .map_err(|e| DispatchError::KeyboardError(e.to_string()))
            }),
            Action::Wait { .. } => Ok(()),
        }
    }
}

#[cfg(not(feature = "input"))]
impl InputDispatcher {
    async fn deliver(&self, _window: &WindowInfo, _action: &Action) -> Result<(), DispatchError> {
        Err(DispatchError::FeatureNotCompiled)
    }
}

/// Key name to enigo key.
#[cfg(feature = "input")]
fn parse_key(key: &str) -> Result<enigo::Key, DispatchError> {
    use enigo::Key;

    let parsed = match key {
        // Modifier keys
        "ctrl" | "control" => Key::Control,
        "alt" => Key::Alt,
        "shift" => Key::Shift,
        "super" | "win" | "meta" | "cmd" | "command" => Key::Meta,

        // Function keys
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,

        // Navigation keys
        "up" | "uparrow" => Key::UpArrow,
        "down" | "downarrow" => Key::DownArrow,
        "left" | "leftarrow" => Key::LeftArrow,
        "right" | "rightarrow" => Key::RightArrow,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" | "pgup" => Key::PageUp,
        "pagedown" | "pgdn" => Key::PageDown,

        // Editing keys
        "backspace" | "back" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "enter" | "return" => Key::Return,
        "tab" => Key::Tab,
        "escape" | "esc" => Key::Escape,
        "space" => Key::Space,

        _ => {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Key::Unicode(c),
                _ => return Err(DispatchError::UnknownKey(key.to_string())),
            }
        }
    };

    Ok(parsed)
}
