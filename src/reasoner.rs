//! State Reasoner.
//!
//! An ordered rule table maps an [`Observation`] onto a [`GameState`].
//! Rules are tried in declared order and the first that matches wins, even
//! when a later rule matches with higher confidence: profile authors encode
//! UI precedence by ordering rules.

use regex::Regex;
use std::fmt;

use crate::perception::aggregate::normalize;
use crate::perception::{Observation, TextSpan};
use crate::state::{GameState, StateLabel};

/// How a text predicate compares recognized text.
#[derive(Clone)]
pub enum TextPattern {
    /// Case-insensitive substring
    Contains(String),
    /// Case-insensitive, whitespace-normalized equality
    Equals(String),
    Regex(Regex),
}

impl TextPattern {
    pub fn is_match(&self, text: &str) -> bool {
        match self {
            TextPattern::Contains(needle) => normalize(text).contains(&normalize(needle)),
            TextPattern::Equals(expected) => normalize(text) == normalize(expected),
            TextPattern::Regex(re) => re.is_match(text),
        }
    }
}

impl fmt::Debug for TextPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextPattern::Contains(s) => write!(f, "Contains({:?})", s),
            TextPattern::Equals(s) => write!(f, "Equals({:?})", s),
            TextPattern::Regex(re) => write!(f, "Regex({:?})", re.as_str()),
        }
    }
}

/// Predicate over one Observation and the previous state.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Template seen with at least `min_confidence` (defaults to the
    /// template's own threshold when `None`).
    Template {
        id: String,
        min_confidence: Option<f32>,
    },
    Text {
        pattern: TextPattern,
        region: Option<String>,
        min_confidence: Option<f32>,
    },
    /// Fraction of the frame that changed since last tick. A tick without
    /// a previous frame never satisfies a motion predicate.
    Motion {
        above: Option<f32>,
        below: Option<f32>,
    },
    /// The previous tick's state
    Previous(StateLabel),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn evaluate(&self, obs: &Observation, previous: &GameState) -> bool {
        match self {
            Predicate::Template { id, min_confidence } => obs
                .best_match(id)
                .map_or(false, |m| m.confidence >= min_confidence.unwrap_or(0.0)),
            Predicate::Text {
                pattern,
                region,
                min_confidence,
            } => {
                let floor = min_confidence.unwrap_or(0.0);
                let hit = |span: &TextSpan| span.confidence >= floor && pattern.is_match(&span.text);
                match region {
                    Some(r) => obs.texts_in(r).any(hit),
                    None => obs.texts().iter().any(hit),
                }
            }
            Predicate::Motion { above, below } => match obs.motion() {
                Some(m) => above.map_or(true, |a| m > a) && below.map_or(true, |b| m < b),
                None => false,
            },
            Predicate::Previous(label) => &previous.label == label,
            Predicate::All(all) => all.iter().all(|p| p.evaluate(obs, previous)),
            Predicate::Any(any) => any.iter().any(|p| p.evaluate(obs, previous)),
            Predicate::Not(inner) => !inner.evaluate(obs, previous),
        }
    }
}

/// One row of the rule table.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub when: Predicate,
    pub target: StateLabel,
}

impl Rule {
    pub fn new(name: impl Into<String>, when: Predicate, target: StateLabel) -> Self {
        Self {
            name: name.into(),
            when,
            target,
        }
    }
}

/// First-match rule evaluation plus staleness tracking.
#[derive(Debug, Clone)]
pub struct StateReasoner {
    rules: Vec<Rule>,
    unknown_after: u32,
}

impl StateReasoner {
    pub fn new(rules: Vec<Rule>, unknown_after: u32) -> Self {
        Self {
            rules,
            unknown_after: unknown_after.max(1),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn unknown_after(&self) -> u32 {
        self.unknown_after
    }

    /// The first rule that matches, if any.
    pub fn first_match(&self, obs: &Observation, previous: &GameState) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.when.evaluate(obs, previous))
    }

    /// Derive the next state. Deterministic in `(obs, previous)`.
    pub fn reason(&self, obs: &Observation, previous: &GameState) -> GameState {
        let (label, staleness) = match self.first_match(obs, previous) {
            Some(rule) => {
                tracing::trace!(rule = %rule.name, tick = obs.tick, "rule matched");
                (rule.target.clone(), 0)
            }
            None => (StateLabel::Unknown, previous.staleness.saturating_add(1)),
        };

        let since_tick = if label == previous.label {
            previous.since_tick
        } else {
            tracing::info!(from = %previous.label, to = %label, tick = obs.tick, "state transition");
            obs.tick
        };

        GameState {
            prolonged: label.is_unknown() && staleness >= self.unknown_after,
            label,
            staleness,
            since_tick,
            tick: obs.tick,
        }
    }
}
