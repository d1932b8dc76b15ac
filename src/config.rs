//! Automation profile
//!
//! One TOML file describes one game: which window to follow, the templates
//! and text regions to look for, the closed set of states with the rules
//! that recognise them, and the tasks. [`Profile`] is the file as written;
//! [`Profile::build`] validates it, loads the template images and returns
//! the [`AutomationPlan`] the control loop runs.
//!
//! ```toml
//! states = ["home", "dialog", "battle"]
//!
//! [window]
//! title = "My Game"
//!
//! [[templates]]
//! id = "ok_button"
//! path = "templates/ok.png"
//! threshold = 0.9
//!
//! [[rules]]
//! state = "dialog"
//! when = { text = "Continue" }
//!
//! [[tasks]]
//! id = "dismiss"
//! priority = 10
//! when = { state = "dialog" }
//!
//! [[tasks.steps]]
//! action = { tap_template = "ok_button" }
//! expect = { state = "home", within_ticks = 3 }
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::WindowTarget;
use crate::control::LoopSettings;
use crate::dispatch::{is_dangerous_key, parse_key_combo, Action};
use crate::perception::{
    MatchError, NoOcr, OcrBackend, OverlapPolicy, Rect, Template, TesseractCli, TextRecognizer, TextRegion,
};
use crate::reasoner::{Predicate, Rule, StateReasoner, TextPattern};
use crate::scheduler::{ActionSpec, Step, TaskDef};
use crate::state::{StateLabel, StatePredicate};

/// Input delivery knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Max random offset applied to tap/swipe coordinates
    pub jitter_px: u32,
    /// Max random delay before each action
    pub delay_jitter_ms: u64,
    /// Pause after each action so the game can react
    pub settle_ms: u64,
    /// Log actions instead of sending them
    pub dry_run: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            jitter_px: 3,
            delay_jitter_ms: 80,
            settle_ms: 150,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrBackendKind {
    /// Text predicates never match
    #[default]
    None,
    Tesseract,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    pub backend: OcrBackendKind,
    /// Path to the tesseract executable (default: found on PATH)
    pub tesseract_path: Option<String>,
    pub lang: String,
    pub min_confidence: f32,
    pub merge_line_distance: Option<u32>,
    pub regions: Vec<TextRegion>,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            backend: OcrBackendKind::None,
            tesseract_path: None,
            lang: "eng".into(),
            min_confidence: 0.6,
            merge_line_distance: None,
            regions: Vec::new(),
        }
    }
}

impl TextConfig {
    pub fn recognizer(&self) -> TextRecognizer {
        let backend: Box<dyn OcrBackend> = match self.backend {
            OcrBackendKind::None => Box::new(NoOcr),
            OcrBackendKind::Tesseract => {
                let defaults = TesseractCli::default();
                Box::new(TesseractCli {
                    program: self.tesseract_path.clone().unwrap_or(defaults.program),
                    lang: self.lang.clone(),
                    psm: defaults.psm,
                })
            }
        };
        TextRecognizer::new(backend, self.min_confidence)
            .with_regions(self.regions.clone())
            .with_line_merging(self.merge_line_distance)
    }
}

fn default_threshold() -> f32 {
    0.85
}

fn default_scales() -> Vec<f32> {
    vec![1.0]
}

fn default_max_matches() -> usize {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub id: String,
    /// Relative paths resolve against the profile's directory
    pub path: PathBuf,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default)]
    pub region: Option<Rect>,
    #[serde(default = "default_scales")]
    pub scales: Vec<f32>,
    #[serde(default)]
    pub overlap: OverlapPolicy,
    #[serde(default = "default_max_matches")]
    pub max_matches: usize,
}

impl TemplateConfig {
    pub fn load(&self, base_dir: &Path) -> Result<Template, MatchError> {
        let path = if self.path.is_absolute() {
            self.path.clone()
        } else {
            base_dir.join(&self.path)
        };

        let mut template = Template::load(self.id.clone(), &path, self.threshold)?
            .with_scales(self.scales.clone())
            .with_overlap(self.overlap)
            .with_max_matches(self.max_matches);
        if let Some(region) = self.region {
            template = template.with_region(region);
        }
        Ok(template)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasonerConfig {
    /// Consecutive Unknown ticks before the state counts as prolonged
    pub unknown_after: u32,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self { unknown_after: 10 }
    }
}

/// An observation predicate. Every field that is set must hold; nest
/// `any`/`not` for anything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PredicateConfig {
    pub template: Option<String>,
    /// Case-insensitive substring
    pub text: Option<String>,
    pub equals: Option<String>,
    pub regex: Option<String>,
    /// Restrict a text test to one named region
    pub region: Option<String>,
    pub min_confidence: Option<f32>,
    pub motion_above: Option<f32>,
    pub motion_below: Option<f32>,
    pub previous: Option<String>,
    pub all: Option<Vec<PredicateConfig>>,
    pub any: Option<Vec<PredicateConfig>>,
    pub not: Option<Box<PredicateConfig>>,
}

/// A test on the current GameState. Exactly one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateCondition {
    pub state: Option<String>,
    pub any_state: Option<Vec<String>>,
    pub not: Option<Box<StateCondition>>,
    pub unknown_prolonged: Option<bool>,
    pub always: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActionConfig {
    /// `[x, y]` relative to the window
    pub tap: Option<[i32; 2]>,
    pub key: Option<String>,
    pub text: Option<String>,
    /// `[x1, y1, x2, y2]`
    pub swipe: Option<[i32; 4]>,
    pub swipe_ms: Option<u64>,
    pub wait_ms: Option<u64>,
    pub tap_template: Option<String>,
    /// Offset from the matched template's centre
    pub offset: Option<[i32; 2]>,
    pub tap_text: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectConfig {
    #[serde(flatten)]
    pub condition: StateCondition,
    pub within_ticks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub action: ActionConfig,
    #[serde(default)]
    pub expect: Option<ExpectConfig>,
    #[serde(default)]
    pub max_wait_ticks: Option<u32>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    pub when: StateCondition,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub recovery: bool,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub state: String,
    pub when: PredicateConfig,
}

/// A profile as written on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    #[serde(rename = "loop")]
    pub loop_settings: LoopSettings,
    pub window: Option<WindowTarget>,
    pub dispatch: DispatchConfig,
    pub text: TextConfig,
    pub templates: Vec<TemplateConfig>,
    pub states: Vec<String>,
    pub reasoner: ReasonerConfig,
    pub rules: Vec<RuleConfig>,
    pub tasks: Vec<TaskConfig>,
}

/// Everything the control loop needs, validated and loaded.
pub struct AutomationPlan {
    pub settings: LoopSettings,
    pub window: Option<WindowTarget>,
    pub dispatch: DispatchConfig,
    pub templates: Vec<Template>,
    pub recognizer: TextRecognizer,
    pub reasoner: StateReasoner,
    pub tasks: Vec<TaskDef>,
}

/// Rules and tasks compiled from a profile, before any file IO.
struct Compiled {
    rules: Vec<Rule>,
    tasks: Vec<TaskDef>,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".into(),
            reason: e.to_string(),
        })
    }

    /// Structural checks only; template files are not opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compile().map(|_| ())
    }

    pub fn build(&self, base_dir: &Path) -> Result<AutomationPlan, ConfigError> {
        let compiled = self.compile()?;

        let templates = self
            .templates
            .iter()
            .map(|t| t.load(base_dir))
            .collect::<Result<Vec<_>, _>>()?;

        let uses_text = self.rules.iter().any(|r| r.when.reads_text())
            || self.tasks.iter().flat_map(|t| &t.steps).any(|s| s.action.tap_text.is_some());
        if uses_text && self.text.backend == OcrBackendKind::None {
            tracing::warn!("profile tests recognized text but [text] backend is \"none\"; those tests never match");
        }

        Ok(AutomationPlan {
            settings: self.loop_settings,
            window: self.window.clone(),
            dispatch: self.dispatch.clone(),
            templates,
            recognizer: self.text.recognizer(),
            reasoner: StateReasoner::new(compiled.rules, self.reasoner.unknown_after),
            tasks: compiled.tasks,
        })
    }

    fn compile(&self) -> Result<Compiled, ConfigError> {
        let mut problems = Vec::new();

        let names = Names {
            templates: unique_ids(self.templates.iter().map(|t| t.id.as_str()), "template", &mut problems),
            states: unique_ids(self.states.iter().map(String::as_str), "state", &mut problems),
            regions: unique_ids(self.text.regions.iter().map(|r| r.name.as_str()), "text region", &mut problems),
        };
        unique_ids(self.tasks.iter().map(|t| t.id.as_str()), "task", &mut problems);

        self.check_settings(&mut problems);

        if self.states.iter().any(|s| StateLabel::named(s.as_str()).is_unknown()) {
            problems.push("state 'unknown' is reserved".into());
        }
        for t in &self.templates {
            if !(t.threshold > 0.0 && t.threshold <= 1.0) {
                problems.push(format!("template '{}': threshold {} outside (0, 1]", t.id, t.threshold));
            }
            if t.scales.is_empty() || t.scales.iter().any(|s| *s <= 0.0) {
                problems.push(format!("template '{}': scales must be positive and non-empty", t.id));
            }
            if t.max_matches == 0 {
                problems.push(format!("template '{}': max_matches must be at least 1", t.id));
            }
        }

        let mut rules = Vec::with_capacity(self.rules.len());
        for (i, rule) in self.rules.iter().enumerate() {
            let label = rule.name.clone().unwrap_or_else(|| format!("#{}", i + 1));
            let target = names.state(&rule.state);
            let when = rule.when.compile(&names);
            match (target, when) {
                (Ok(target), Ok(when)) => rules.push(Rule::new(label, when, target)),
                (Err(e), _) | (_, Err(e)) => problems.push(format!("rule '{}': {}", label, e)),
            }
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            match task.compile(&names) {
                Ok(def) => tasks.push(def),
                Err(e) => problems.push(format!("task '{}': {}", task.id, e)),
            }
        }

        if problems.is_empty() {
            Ok(Compiled { rules, tasks })
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }

    fn check_settings(&self, problems: &mut Vec<String>) {
        let s = &self.loop_settings;
        if s.tick_interval_ms == 0 {
            problems.push("[loop] tick_interval_ms must be positive".into());
        }
        if s.min_interval_ms > s.max_interval_ms {
            problems.push("[loop] min_interval_ms exceeds max_interval_ms".into());
        }
        if s.capture_alert_after == 0 || s.dispatch_alert_after == 0 || s.recovery_failure_limit == 0 {
            problems.push("[loop] alert thresholds must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.text.min_confidence) {
            problems.push("[text] min_confidence outside [0, 1]".into());
        }
        if self.reasoner.unknown_after == 0 {
            problems.push("[reasoner] unknown_after must be at least 1".into());
        }
    }
}

fn unique_ids<'a>(
    ids: impl Iterator<Item = &'a str>,
    kind: &str,
    problems: &mut Vec<String>,
) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            problems.push(format!("duplicate {} id '{}'", kind, id));
        }
    }
    seen
}

/// Declared names that rules and tasks may refer to.
struct Names<'a> {
    templates: HashSet<&'a str>,
    states: HashSet<&'a str>,
    regions: HashSet<&'a str>,
}

impl Names<'_> {
    fn state(&self, name: &str) -> Result<StateLabel, String> {
        let label = StateLabel::named(name);
        if label.is_unknown() || self.states.contains(name) {
            Ok(label)
        } else {
            Err(format!("unknown state '{}'", name))
        }
    }

    fn template(&self, id: &str) -> Result<(), String> {
        if self.templates.contains(id) {
            Ok(())
        } else {
            Err(format!("unknown template '{}'", id))
        }
    }

    fn region(&self, name: Option<&String>) -> Result<Option<String>, String> {
        match name {
            Some(n) if !self.regions.contains(n.as_str()) => Err(format!("unknown text region '{}'", n)),
            other => Ok(other.cloned()),
        }
    }
}

impl PredicateConfig {
    fn reads_text(&self) -> bool {
        self.text.is_some()
            || self.equals.is_some()
            || self.regex.is_some()
            || self.all.iter().chain(&self.any).flatten().any(PredicateConfig::reads_text)
            || self.not.as_ref().map_or(false, |p| p.reads_text())
    }

    fn compile(&self, names: &Names<'_>) -> Result<Predicate, String> {
        let mut parts = Vec::new();

        if let Some(id) = &self.template {
            names.template(id)?;
            parts.push(Predicate::Template {
                id: id.clone(),
                min_confidence: self.min_confidence,
            });
        }

        let mut pattern = None;
        let literal: [(&Option<String>, fn(String) -> TextPattern); 2] =
            [(&self.text, TextPattern::Contains), (&self.equals, TextPattern::Equals)];
        for (given, make) in literal {
            if let Some(s) = given {
                if pattern.replace(make(s.clone())).is_some() {
                    return Err("set only one of text, equals, regex".into());
                }
            }
        }
        if let Some(re) = &self.regex {
            let re = Regex::new(re).map_err(|e| format!("bad regex '{}': {}", re, e))?;
            if pattern.replace(TextPattern::Regex(re)).is_some() {
                return Err("set only one of text, equals, regex".into());
            }
        }
        match pattern {
            Some(pattern) => parts.push(Predicate::Text {
                pattern,
                region: names.region(self.region.as_ref())?,
                min_confidence: self.min_confidence,
            }),
            None if self.region.is_some() => return Err("region given without a text test".into()),
            None => {}
        }

        if self.motion_above.is_some() || self.motion_below.is_some() {
            parts.push(Predicate::Motion {
                above: self.motion_above,
                below: self.motion_below,
            });
        }
        if let Some(prev) = &self.previous {
            parts.push(Predicate::Previous(names.state(prev)?));
        }
        if let Some(all) = &self.all {
            parts.push(Predicate::All(compile_all(all, names)?));
        }
        if let Some(any) = &self.any {
            if any.is_empty() {
                return Err("'any' needs at least one predicate".into());
            }
            parts.push(Predicate::Any(compile_all(any, names)?));
        }
        if let Some(inner) = &self.not {
            parts.push(Predicate::Not(Box::new(inner.compile(names)?)));
        }

        match parts.len() {
            0 => Err("empty predicate".into()),
            1 => Ok(parts.remove(0)),
            _ => Ok(Predicate::All(parts)),
        }
    }
}

fn compile_all(list: &[PredicateConfig], names: &Names<'_>) -> Result<Vec<Predicate>, String> {
    list.iter().map(|p| p.compile(names)).collect()
}

impl StateCondition {
    fn compile(&self, names: &Names<'_>) -> Result<StatePredicate, String> {
        let mut found = Vec::new();

        if let Some(state) = &self.state {
            found.push(StatePredicate::State(names.state(state)?));
        }
        if let Some(states) = &self.any_state {
            if states.is_empty() {
                return Err("any_state needs at least one state".into());
            }
            let labels = states.iter().map(|s| names.state(s)).collect::<Result<Vec<_>, _>>()?;
            found.push(StatePredicate::AnyState(labels));
        }
        if let Some(inner) = &self.not {
            found.push(StatePredicate::Not(Box::new(inner.compile(names)?)));
        }
        if self.unknown_prolonged == Some(true) {
            found.push(StatePredicate::UnknownProlonged);
        }
        if self.always == Some(true) {
            found.push(StatePredicate::Always);
        }

        if found.len() == 1 {
            Ok(found.remove(0))
        } else {
            Err("a state condition needs exactly one of state, any_state, not, unknown_prolonged, always".into())
        }
    }
}

impl ActionConfig {
    fn compile(&self, names: &Names<'_>) -> Result<ActionSpec, String> {
        let mut found = Vec::new();

        if let Some([x, y]) = self.tap {
            found.push(ActionSpec::Fixed(Action::Tap { x, y }));
        }
        if let Some(key) = &self.key {
            if is_dangerous_key(key) {
                return Err(format!("key '{}' is blocked", key));
            }
            parse_key_combo(key).map_err(|e| e.to_string())?;
            found.push(ActionSpec::Fixed(Action::Key { key: key.clone() }));
        }
        if let Some(text) = &self.text {
            found.push(ActionSpec::Fixed(Action::Text { text: text.clone() }));
        }
        if let Some([x1, y1, x2, y2]) = self.swipe {
            found.push(ActionSpec::Fixed(Action::Swipe {
                from: (x1, y1),
                to: (x2, y2),
                duration: Duration::from_millis(self.swipe_ms.unwrap_or(300)),
            }));
        }
        if let Some(ms) = self.wait_ms {
            found.push(ActionSpec::Fixed(Action::Wait {
                duration: Duration::from_millis(ms),
            }));
        }
        if let Some(id) = &self.tap_template {
            names.template(id)?;
            let [dx, dy] = self.offset.unwrap_or([0, 0]);
            found.push(ActionSpec::TapTemplate {
                template: id.clone(),
                offset: (dx, dy),
            });
        }
        if let Some(text) = &self.tap_text {
            found.push(ActionSpec::TapText {
                text: text.clone(),
                region: names.region(self.region.as_ref())?,
            });
        }

        if self.offset.is_some() && self.tap_template.is_none() {
            return Err("offset only applies to tap_template".into());
        }
        if self.region.is_some() && self.tap_text.is_none() {
            return Err("region only applies to tap_text".into());
        }

        if found.len() == 1 {
            Ok(found.remove(0))
        } else {
            Err("an action needs exactly one of tap, key, text, swipe, wait_ms, tap_template, tap_text".into())
        }
    }
}

impl TaskConfig {
    fn compile(&self, names: &Names<'_>) -> Result<TaskDef, String> {
        if self.steps.is_empty() {
            return Err("no steps".into());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }

        let precondition = self.when.compile(names)?;
        let mut steps = Vec::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            let action = step.action.compile(names).map_err(|e| format!("step {}: {}", i + 1, e))?;
            let mut compiled = Step::new(action);
            if let Some(expect) = &step.expect {
                let state = expect
                    .condition
                    .compile(names)
                    .map_err(|e| format!("step {} expect: {}", i + 1, e))?;
                compiled = compiled.expecting(state, expect.within_ticks);
            }
            if let Some(ticks) = step.max_wait_ticks {
                compiled = compiled.with_max_wait(ticks);
            }
            steps.push(compiled);
        }

        let mut def = TaskDef::new(self.id.clone(), self.priority, precondition, steps)
            .with_retry(self.max_attempts, Duration::from_millis(self.retry_backoff_ms))
            .with_cooldown(Duration::from_millis(self.cooldown_ms));
        if let Some(ms) = self.poll_interval_ms {
            def = def.with_poll_interval(Duration::from_millis(ms));
        }
        if self.recovery {
            def = def.as_recovery();
        }
        Ok(def)
    }
}

/// Locates the profile file.
pub struct ProfileManager {
    path: PathBuf,
}

impl ProfileManager {
    /// `<config_dir>/pixelpilot/profile.toml`
    pub fn new() -> Self {
        Self { path: default_profile_path() }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory relative template paths resolve against.
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn load(&self) -> Result<Profile, ConfigError> {
        Profile::load(&self.path)
    }

    pub fn load_plan(&self) -> Result<AutomationPlan, ConfigError> {
        self.load()?.build(&self.base_dir())
    }
}

impl Default for ProfileManager {
    fn default() -> Self {
        Self::new()
    }
}

pub fn default_profile_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pixelpilot")
        .join("profile.toml")
}

/// Profile errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read profile {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Cannot parse profile {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Invalid profile: {0}")]
    Invalid(String),

    #[error(transparent)]
    Template(#[from] MatchError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::io::Write;

    const PROFILE: &str = r#"
states = ["home", "dialog", "battle"]

[loop]
tick_interval_ms = 250

[window]
title = "Test Game"

[dispatch]
dry_run = true

[text]
min_confidence = 0.5

[[text.regions]]
name = "dialog"
rect = { x = 0, y = 100, width = 400, height = 80 }

[[templates]]
id = "ok_button"
path = "ok.png"
threshold = 0.9

[[rules]]
name = "dialog-open"
state = "dialog"
when = { text = "Continue", region = "dialog" }

[[rules]]
state = "battle"
when = { all = [{ template = "ok_button" }, { not = { previous = "home" } }] }

[[tasks]]
id = "dismiss"
priority = 10
when = { state = "dialog" }
cooldown_ms = 1000

[[tasks.steps]]
action = { tap_template = "ok_button", offset = [0, 4] }
expect = { state = "home", within_ticks = 3 }

[[tasks]]
id = "recover"
when = { unknown_prolonged = true }
recovery = true

[[tasks.steps]]
action = { key = "esc" }
"#;

    fn write_template(dir: &Path) {
        let mut img = GrayImage::new(8, 8);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Luma([((x * 31 + y * 17) % 255) as u8]);
        }
        img.save(dir.join("ok.png")).unwrap();
    }

    fn invalid(profile: &str) -> String {
        match Profile::parse(profile).unwrap().validate() {
            Err(ConfigError::Invalid(msg)) => msg,
            other => panic!("expected invalid profile, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_parse_and_build() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path());
        let path = dir.path().join("profile.toml");
        fs::File::create(&path).unwrap().write_all(PROFILE.as_bytes()).unwrap();

        let manager = ProfileManager::with_path(&path);
        let plan = manager.load_plan().unwrap();

        assert_eq!(plan.settings.tick_interval_ms, 250);
        assert_eq!(plan.settings.capture_alert_after, 5);
        assert!(plan.dispatch.dry_run);
        assert_eq!(plan.window.unwrap().title, "Test Game");
        assert_eq!(plan.templates.len(), 1);
        assert_eq!(plan.templates[0].threshold, 0.9);
        assert_eq!(plan.reasoner.rules().len(), 2);
        assert_eq!(plan.reasoner.rules()[1].name, "#2");
        assert_eq!(plan.reasoner.unknown_after(), 10);
        assert_eq!(plan.recognizer.regions().len(), 1);

        assert_eq!(plan.tasks.len(), 2);
        let dismiss = &plan.tasks[0];
        assert_eq!(dismiss.cooldown, Duration::from_millis(1000));
        assert_eq!(
            dismiss.steps[0].action,
            ActionSpec::TapTemplate {
                template: "ok_button".into(),
                offset: (0, 4)
            }
        );
        let expect = dismiss.steps[0].expect.as_ref().unwrap();
        assert_eq!(expect.state, StatePredicate::State(StateLabel::named("home")));
        assert_eq!(expect.within_ticks, 3);
        assert!(plan.tasks[1].recovery);
        assert_eq!(plan.tasks[1].precondition, StatePredicate::UnknownProlonged);
    }

    #[test]
    fn test_missing_template_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::parse(PROFILE).unwrap();
        assert!(matches!(profile.build(dir.path()), Err(ConfigError::Template(_))));
    }

    #[test]
    fn test_missing_profile_is_io_error() {
        let manager = ProfileManager::with_path("/definitely/not/here/profile.toml");
        assert!(matches!(manager.load(), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        assert!(matches!(Profile::parse("states = ["), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Profile::parse("[[rules]]\nstate = \"a\"\nwhen = { colour = \"red\" }"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_unknown_names_rejected() {
        let msg = invalid(
            r#"
states = ["home"]
[[rules]]
state = "shop"
when = { template = "missing" }
"#,
        );
        assert!(msg.contains("unknown state 'shop'"));

        let msg = invalid(
            r#"
states = ["home"]
[[rules]]
state = "home"
when = { template = "missing" }
"#,
        );
        assert!(msg.contains("unknown template 'missing'"));
    }

    #[test]
    fn test_duplicates_and_thresholds_rejected() {
        let msg = invalid(
            r#"
states = ["home", "home"]
[[templates]]
id = "a"
path = "a.png"
threshold = 1.5
"#,
        );
        assert!(msg.contains("duplicate state id 'home'"));
        assert!(msg.contains("outside (0, 1]"));
    }

    #[test]
    fn test_task_shape_rejected() {
        let msg = invalid(
            r#"
states = ["home"]
[[tasks]]
id = "empty"
when = { state = "home" }

[[tasks]]
id = "never"
when = { state = "home" }
max_attempts = 0
[[tasks.steps]]
action = { wait_ms = 10 }
"#,
        );
        assert!(msg.contains("task 'empty': no steps"));
        assert!(msg.contains("task 'never': max_attempts"));
    }

    #[test]
    fn test_action_needs_exactly_one_kind() {
        let msg = invalid(
            r#"
states = ["home"]
[[tasks]]
id = "confused"
when = { state = "home" }
[[tasks.steps]]
action = { tap = [1, 2], key = "esc" }
"#,
        );
        assert!(msg.contains("exactly one of tap"));
    }

    #[test]
    fn test_dangerous_key_rejected() {
        let msg = invalid(
            r#"
states = ["home"]
[[tasks]]
id = "quit"
when = { state = "home" }
[[tasks.steps]]
action = { key = "alt+f4" }
"#,
        );
        assert!(msg.contains("blocked"));
    }

    #[test]
    fn test_unknown_is_reserved_but_referable() {
        let msg = invalid("states = [\"Unknown\"]");
        assert!(msg.contains("reserved"));

        let profile = Profile::parse(
            r#"
states = ["home"]
[[tasks]]
id = "back"
when = { state = "unknown" }
[[tasks.steps]]
action = { key = "esc" }
"#,
        )
        .unwrap();
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_text_pattern_exclusive() {
        let msg = invalid(
            r#"
states = ["home"]
[[rules]]
state = "home"
when = { text = "a", regex = "b" }
"#,
        );
        assert!(msg.contains("only one of text"));
    }

    #[test]
    fn test_sample_profile_is_valid() {
        let profile = Profile::parse(include_str!("../demos/profile.toml")).unwrap();
        profile.validate().unwrap();
        assert_eq!(profile.text.backend, OcrBackendKind::Tesseract);
        assert_eq!(profile.tasks.len(), 4);
    }

    #[test]
    fn test_default_path_layout() {
        let path = default_profile_path();
        assert!(path.ends_with("pixelpilot/profile.toml"));
    }
}
