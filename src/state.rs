//! Game state model.
//!
//! The set of named states is closed per game profile; `Unknown` is always
//! present and is what the reasoner falls back to when no rule matches.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const UNKNOWN: &str = "unknown";

/// A discrete state label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateLabel {
    Unknown,
    Named(String),
}

impl StateLabel {
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.eq_ignore_ascii_case(UNKNOWN) {
            StateLabel::Unknown
        } else {
            StateLabel::Named(name)
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, StateLabel::Unknown)
    }

    pub fn as_str(&self) -> &str {
        match self {
            StateLabel::Unknown => UNKNOWN,
            StateLabel::Named(name) => name,
        }
    }
}

impl fmt::Display for StateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StateLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StateLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(StateLabel::named(name))
    }
}

/// The current state plus how long it has been uncorroborated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameState {
    pub label: StateLabel,
    /// Consecutive ticks without a matching rule
    pub staleness: u32,
    /// Set once staleness reaches the reasoner's `unknown_after`
    pub prolonged: bool,
    /// Tick at which `label` was first entered
    pub since_tick: u64,
    /// Tick of the observation this state was derived from
    pub tick: u64,
}

impl GameState {
    /// Starting state before the first tick.
    pub fn initial() -> Self {
        Self {
            label: StateLabel::Unknown,
            staleness: 0,
            prolonged: false,
            since_tick: 0,
            tick: 0,
        }
    }

    /// Ticks spent in the current label.
    pub fn dwell(&self) -> u64 {
        self.tick.saturating_sub(self.since_tick)
    }
}

impl Default for GameState {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_unknown() && self.staleness > 0 {
            write!(f, "{} ({} ticks)", self.label, self.staleness)
        } else {
            write!(f, "{}", self.label)
        }
    }
}

/// Precondition over the current GameState, used by tasks and step
/// expectations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatePredicate {
    Always,
    /// Unknown for at least the reasoner's `unknown_after` ticks
    UnknownProlonged,
    State(StateLabel),
    AnyState(Vec<StateLabel>),
    Not(Box<StatePredicate>),
}

impl StatePredicate {
    pub fn holds(&self, state: &GameState) -> bool {
        match self {
            StatePredicate::Always => true,
            StatePredicate::UnknownProlonged => state.label.is_unknown() && state.prolonged,
            StatePredicate::State(label) => &state.label == label,
            StatePredicate::AnyState(labels) => labels.contains(&state.label),
            StatePredicate::Not(inner) => !inner.holds(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(label: StateLabel, staleness: u32, prolonged: bool) -> GameState {
        GameState {
            label,
            staleness,
            prolonged,
            since_tick: 0,
            tick: 4,
        }
    }

    #[test]
    fn test_unknown_is_reserved() {
        assert_eq!(StateLabel::named("Unknown"), StateLabel::Unknown);
        assert_eq!(StateLabel::named("dialog"), StateLabel::Named("dialog".into()));
    }

    #[test]
    fn test_label_serializes_as_string() {
        let json = serde_json::to_string(&StateLabel::named("battle")).unwrap();
        assert_eq!(json, "\"battle\"");
        let back: StateLabel = serde_json::from_str("\"unknown\"").unwrap();
        assert!(back.is_unknown());
    }

    #[test]
    fn test_predicates() {
        let dialog = state(StateLabel::named("dialog"), 0, false);
        let lost = state(StateLabel::Unknown, 12, true);
        let briefly_lost = state(StateLabel::Unknown, 2, false);

        assert!(StatePredicate::State(StateLabel::named("dialog")).holds(&dialog));
        assert!(!StatePredicate::State(StateLabel::named("battle")).holds(&dialog));
        assert!(StatePredicate::UnknownProlonged.holds(&lost));
        assert!(!StatePredicate::UnknownProlonged.holds(&briefly_lost));
        assert!(StatePredicate::AnyState(vec![StateLabel::named("menu"), StateLabel::named("dialog")]).holds(&dialog));
        assert!(StatePredicate::Not(Box::new(StatePredicate::UnknownProlonged)).holds(&dialog));
        assert!(StatePredicate::Always.holds(&lost));
    }

    #[test]
    fn test_display_shows_staleness() {
        assert_eq!(state(StateLabel::Unknown, 3, false).to_string(), "unknown (3 ticks)");
        assert_eq!(state(StateLabel::named("menu"), 0, false).to_string(), "menu");
    }
}
