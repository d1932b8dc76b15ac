//! Drives the whole loop through the public API with scripted collaborators.

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pixelpilot::capture::{CaptureError, CaptureSource, Frame, ReplayCapture, WindowInfo};
use pixelpilot::config::Profile;
use pixelpilot::control::{ControlLoop, LoopSettings, Perception, RunContext, RunState, TickError};
use pixelpilot::dispatch::{Action, DispatchError, DispatchResult, Dispatcher, DryRunDispatcher};
use pixelpilot::logging::{CollectingAlerts, EventId};
use pixelpilot::perception::{
    Matcher, NormalizedCrossCorrelation, OcrBackend, OcrError, RawText, Rect, TextRecognizer,
};
use pixelpilot::reasoner::{Predicate, Rule, StateReasoner, TextPattern};
use pixelpilot::scheduler::{ActionSpec, Scheduler, Step, TaskDef, TaskPhase};
use pixelpilot::state::{StateLabel, StatePredicate};

/// What the fake game shows right now.
#[derive(Default)]
struct Scene {
    window_gone: bool,
    words: Vec<String>,
    ocr_delay: Duration,
}

type SharedScene = Arc<Mutex<Scene>>;

struct SceneCapture(SharedScene);

impl CaptureSource for SceneCapture {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        if self.0.lock().unwrap().window_gone {
            return Err(CaptureError::Unavailable("window closed".into()));
        }
        Ok(Frame::new(RgbaImage::new(64, 48), WindowInfo::detached(64, 48)))
    }

    fn describe(&self) -> String {
        "scripted scene".into()
    }
}

struct SceneOcr(SharedScene);

impl OcrBackend for SceneOcr {
    fn name(&self) -> &str {
        "scene"
    }

    fn read(&self, _image: &RgbaImage) -> Result<Vec<RawText>, OcrError> {
        let (delay, words) = {
            let scene = self.0.lock().unwrap();
            (scene.ocr_delay, scene.words.clone())
        };
        std::thread::sleep(delay);
        Ok(words
            .into_iter()
            .enumerate()
            .map(|(i, text)| RawText {
                text,
                bbox: Rect::new(10, 10 + 12 * i as i32, 40, 10),
                confidence: 0.95,
            })
            .collect())
    }
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Action>>,
    reject: AtomicBool,
    broken: AtomicBool,
}

impl Recorder {
    fn sent(&self) -> Vec<Action> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn dispatch(&self, action: &Action) -> Result<DispatchResult, DispatchError> {
        self.sent.lock().unwrap().push(action.clone());
        if self.broken.load(Ordering::SeqCst) {
            return Err(DispatchError::FeatureNotCompiled);
        }
        if self.reject.load(Ordering::SeqCst) {
            Ok(DispatchResult::Rejected("window minimized".into()))
        } else {
            Ok(DispatchResult::Sent)
        }
    }
}

struct Harness {
    scene: SharedScene,
    dispatcher: Arc<Recorder>,
    alerts: Arc<CollectingAlerts>,
    control: ControlLoop,
    ctx: RunContext,
}

fn fast_settings() -> LoopSettings {
    LoopSettings {
        tick_interval_ms: 1,
        min_interval_ms: 1,
        max_interval_ms: 5,
        perception_budget_ms: 2_000,
        paused_poll_ms: 1,
        ..LoopSettings::default()
    }
}

fn harness(rules: Vec<Rule>, unknown_after: u32, tasks: Vec<TaskDef>, settings: LoopSettings) -> Harness {
    let scene: SharedScene = Arc::new(Mutex::new(Scene::default()));
    let dispatcher = Arc::new(Recorder::default());
    let alerts = Arc::new(CollectingAlerts::new());

    let perception = Perception::new(
        Matcher::new(Box::new(NormalizedCrossCorrelation)),
        Vec::new(),
        TextRecognizer::new(Box::new(SceneOcr(scene.clone())), 0.5),
    );
    let control = ControlLoop::new(
        Box::new(SceneCapture(scene.clone())),
        perception,
        StateReasoner::new(rules, unknown_after),
        dispatcher.clone(),
        alerts.clone(),
        settings,
    );
    let ctx = RunContext::new(Scheduler::new(tasks), &settings);

    Harness {
        scene,
        dispatcher,
        alerts,
        control,
        ctx,
    }
}

fn text_rule(text: &str, state: &str) -> Rule {
    Rule::new(
        format!("{}-text", state),
        Predicate::Text {
            pattern: TextPattern::Contains(text.into()),
            region: None,
            min_confidence: None,
        },
        StateLabel::named(state),
    )
}

fn show(scene: &SharedScene, words: &[&str]) {
    scene.lock().unwrap().words = words.iter().map(|w| w.to_string()).collect();
}

#[tokio::test]
async fn test_dialog_text_selects_tap_on_it() {
    let dismiss = TaskDef::new(
        "dismiss",
        1,
        StatePredicate::State(StateLabel::named("dialog")),
        vec![Step::new(ActionSpec::TapText {
            text: "continue".into(),
            region: None,
        })],
    );
    let mut h = harness(vec![text_rule("Continue", "dialog")], 10, vec![dismiss], fast_settings());
    show(&h.scene, &["Continue"]);

    let report = h.control.tick(&mut h.ctx).await.unwrap();

    assert_eq!(report.state.label, StateLabel::named("dialog"));
    // centre of the span's box (10, 10, 40x10)
    assert_eq!(report.action, Some(Action::Tap { x: 30, y: 15 }));
    assert_eq!(report.dispatch, Some(DispatchResult::Sent));
    assert_eq!(h.dispatcher.sent().len(), 1);
    assert_eq!(h.alerts.count(EventId::TaskSucceeded), 1);
    assert_eq!(h.alerts.count(EventId::StateTransition), 1);
}

#[tokio::test]
async fn test_no_action_while_state_unknown() {
    let dismiss = TaskDef::new(
        "dismiss",
        1,
        StatePredicate::State(StateLabel::named("dialog")),
        vec![Step::new(ActionSpec::Fixed(Action::Key { key: "esc".into() }))],
    );
    let mut h = harness(vec![text_rule("Continue", "dialog")], 10, vec![dismiss], fast_settings());
    show(&h.scene, &["Loading"]);

    for _ in 0..3 {
        let report = h.control.tick(&mut h.ctx).await.unwrap();
        assert!(report.state.label.is_unknown());
        assert!(report.action.is_none());
    }
    assert!(h.dispatcher.sent().is_empty());
}

#[tokio::test]
async fn test_capture_loss_escalates_once_per_streak() {
    let mut h = harness(Vec::new(), 10, Vec::new(), fast_settings());
    h.scene.lock().unwrap().window_gone = true;

    for _ in 0..7 {
        let err = h.control.tick(&mut h.ctx).await.unwrap_err();
        assert!(matches!(err, TickError::Capture(CaptureError::Unavailable(_))));
    }
    assert_eq!(h.alerts.count(EventId::CaptureUnavailable), 1);

    h.scene.lock().unwrap().window_gone = false;
    h.control.tick(&mut h.ctx).await.unwrap();

    h.scene.lock().unwrap().window_gone = true;
    for _ in 0..5 {
        let _ = h.control.tick(&mut h.ctx).await;
    }
    assert_eq!(h.alerts.count(EventId::CaptureUnavailable), 2);

    let status = h.ctx.handle().status().await;
    assert_eq!(status.tick, 13);
    assert_eq!(status.last_alert.unwrap().event_id, EventId::CaptureUnavailable);
}

#[tokio::test]
async fn test_unmet_expectation_fails_once_then_cools_down() {
    let attack = TaskDef::new(
        "attack",
        1,
        StatePredicate::Always,
        vec![Step::new(ActionSpec::Fixed(Action::Key { key: "space".into() }))
            .expecting(StatePredicate::State(StateLabel::named("battle")), 3)],
    )
    .with_retry(3, Duration::from_secs(60));
    let mut h = harness(Vec::new(), 100, vec![attack], fast_settings());

    let first = h.control.tick(&mut h.ctx).await.unwrap();
    assert!(first.action.is_some());
    assert_eq!(h.ctx.scheduler.runtime("attack").unwrap().phase, TaskPhase::Running);

    let mut failed_at = None;
    for _ in 0..5 {
        let report = h.control.tick(&mut h.ctx).await.unwrap();
        assert!(report.action.is_none());
        if !report.outcomes.is_empty() && failed_at.is_none() {
            failed_at = Some(report.tick);
        }
    }

    assert_eq!(failed_at, Some(4));
    let rt = h.ctx.scheduler.runtime("attack").unwrap();
    assert_eq!(rt.phase, TaskPhase::Cooldown);
    assert_eq!(rt.attempts, 1);
    assert_eq!(h.dispatcher.sent().len(), 1);
    assert_eq!(h.alerts.count(EventId::TaskFailed), 1);
}

#[tokio::test]
async fn test_rejected_dispatch_counts_toward_wait_budget() {
    let settings = LoopSettings {
        dispatch_alert_after: 2,
        ..fast_settings()
    };
    let poke = TaskDef::new(
        "poke",
        1,
        StatePredicate::Always,
        vec![Step::new(ActionSpec::Fixed(Action::Tap { x: 5, y: 5 })).with_max_wait(3)],
    )
    .with_retry(5, Duration::from_secs(60));
    let mut h = harness(Vec::new(), 100, vec![poke], settings);
    h.dispatcher.reject.store(true, Ordering::SeqCst);

    for _ in 0..3 {
        let report = h.control.tick(&mut h.ctx).await.unwrap();
        assert!(matches!(report.dispatch, Some(DispatchResult::Rejected(_))));
    }

    assert_eq!(h.dispatcher.sent().len(), 3);
    assert_eq!(h.alerts.count(EventId::DispatchRejected), 1);
    assert_eq!(h.alerts.count(EventId::TaskFailed), 1);
    assert_eq!(h.ctx.scheduler.runtime("poke").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_abandoned_task_waits_for_reset() {
    let grind = TaskDef::new(
        "grind",
        1,
        StatePredicate::Always,
        vec![Step::new(ActionSpec::TapText {
            text: "Start".into(),
            region: None,
        })
        .with_max_wait(1)],
    )
    .with_retry(2, Duration::ZERO);
    let mut h = harness(Vec::new(), 100, vec![grind], fast_settings());
    let handle = h.ctx.handle();

    for _ in 0..4 {
        h.control.tick(&mut h.ctx).await.unwrap();
    }
    assert_eq!(h.alerts.count(EventId::TaskFailed), 2);
    assert_eq!(h.alerts.count(EventId::TaskAbandoned), 1);
    assert_eq!(h.ctx.scheduler.runtime("grind").unwrap().phase, TaskPhase::Abandoned);

    let status = handle.status().await;
    assert_eq!(status.tasks[0].phase, TaskPhase::Abandoned);

    assert!(handle.reset_task("grind"));
    h.control.tick(&mut h.ctx).await.unwrap();
    let rt = h.ctx.scheduler.runtime("grind").unwrap();
    assert_eq!(rt.phase, TaskPhase::Cooldown);
    assert_eq!(rt.attempts, 1);
    assert_eq!(h.alerts.count(EventId::TaskFailed), 3);
}

#[tokio::test]
async fn test_recovery_exhaustion_pauses_loop() {
    let back = TaskDef::new(
        "back_out",
        0,
        StatePredicate::UnknownProlonged,
        vec![Step::new(ActionSpec::Fixed(Action::Key { key: "esc".into() }))
            .expecting(StatePredicate::State(StateLabel::named("home")), 1)],
    )
    .with_retry(10, Duration::ZERO)
    .as_recovery();
    let mut h = harness(vec![text_rule("Home", "home")], 2, vec![back], fast_settings());

    for _ in 0..20 {
        let _ = h.control.tick(&mut h.ctx).await;
        if h.ctx.run_state() == RunState::Paused {
            break;
        }
    }

    assert_eq!(h.ctx.run_state(), RunState::Paused);
    assert_eq!(h.alerts.count(EventId::UnknownStateProlonged), 1);
    assert_eq!(h.alerts.count(EventId::RecoveryExhausted), 1);
    assert_eq!(h.alerts.count(EventId::TaskFailed), 3);
    assert_eq!(h.dispatcher.sent().len(), 3);
    assert_eq!(h.ctx.recovery_failures(), 0);
    // ready to try again once the operator resumes
    assert_eq!(h.ctx.scheduler.runtime("back_out").unwrap().phase, TaskPhase::Waiting);
}

#[tokio::test]
async fn test_abandoned_recovery_pauses_and_rearms() {
    let back = TaskDef::new(
        "back_out",
        0,
        StatePredicate::UnknownProlonged,
        vec![Step::new(ActionSpec::Fixed(Action::Key { key: "esc".into() }))
            .expecting(StatePredicate::State(StateLabel::named("home")), 1)],
    )
    .with_retry(1, Duration::ZERO)
    .as_recovery();
    let mut h = harness(vec![text_rule("Home", "home")], 2, vec![back], fast_settings());
    let handle = h.ctx.handle();

    for _ in 0..3 {
        h.control.tick(&mut h.ctx).await.unwrap();
    }

    // One attempt allowed, so the first failure abandons the task
    assert_eq!(h.alerts.count(EventId::TaskAbandoned), 1);
    assert_eq!(h.alerts.count(EventId::RecoveryExhausted), 1);
    assert_eq!(h.ctx.run_state(), RunState::Paused);
    assert_eq!(h.ctx.scheduler.runtime("back_out").unwrap().phase, TaskPhase::Waiting);

    assert!(handle.resume());
    let report = h.control.tick(&mut h.ctx).await.unwrap();
    assert_eq!(report.action, Some(Action::Key { key: "esc".into() }));
    assert_eq!(h.dispatcher.sent().len(), 2);
}

#[tokio::test]
async fn test_failing_dispatcher_releases_the_floor() {
    let stuck = TaskDef::new(
        "stuck",
        5,
        StatePredicate::Always,
        vec![Step::new(ActionSpec::Fixed(Action::Tap { x: 1, y: 1 })).with_max_wait(2)],
    )
    .with_retry(3, Duration::from_secs(60));
    let other = TaskDef::new(
        "other",
        5,
        StatePredicate::Always,
        vec![Step::new(ActionSpec::Fixed(Action::Tap { x: 2, y: 2 }))],
    );
    let mut h = harness(Vec::new(), 100, vec![stuck, other], fast_settings());
    h.dispatcher.broken.store(true, Ordering::SeqCst);

    for _ in 0..3 {
        let err = h.control.tick(&mut h.ctx).await.unwrap_err();
        assert!(matches!(err, TickError::Dispatch(DispatchError::FeatureNotCompiled)));
    }

    assert_eq!(
        h.dispatcher.sent(),
        vec![
            Action::Tap { x: 1, y: 1 },
            Action::Tap { x: 1, y: 1 },
            Action::Tap { x: 2, y: 2 },
        ]
    );
    assert_eq!(h.alerts.count(EventId::TaskFailed), 1);
    let rt = h.ctx.scheduler.runtime("stuck").unwrap();
    assert_eq!(rt.phase, TaskPhase::Cooldown);
    assert_eq!(rt.attempts, 1);
    assert_eq!(h.ctx.scheduler.running(), Some("other"));
}

#[tokio::test]
async fn test_perception_overrun_skips_tick() {
    let settings = LoopSettings {
        perception_budget_ms: 20,
        ..fast_settings()
    };
    let tap = TaskDef::new(
        "tap",
        1,
        StatePredicate::Always,
        vec![Step::new(ActionSpec::Fixed(Action::Tap { x: 1, y: 1 }))],
    );
    let mut h = harness(Vec::new(), 100, vec![tap], settings);
    h.scene.lock().unwrap().ocr_delay = Duration::from_millis(300);

    let err = h.control.tick(&mut h.ctx).await.unwrap_err();
    assert!(matches!(err, TickError::PerceptionOverrun(_)));
    assert!(h.dispatcher.sent().is_empty());
    assert_eq!(h.alerts.count(EventId::PerceptionOverrun), 1);

    h.scene.lock().unwrap().ocr_delay = Duration::ZERO;
    let report = h.control.tick(&mut h.ctx).await.unwrap();
    assert_eq!(report.action, Some(Action::Tap { x: 1, y: 1 }));
}

#[tokio::test]
async fn test_run_honours_pause_resume_stop() {
    let mut h = harness(Vec::new(), 100, Vec::new(), fast_settings());
    let handle = h.ctx.handle();

    let driver = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.pause());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.status().await.run_state, RunState::Paused);
        assert!(handle.resume());
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop();
    };
    let (summary, _) = tokio::join!(h.control.run(&mut h.ctx, None), driver);

    assert!(summary.ticks > 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(h.alerts.count(EventId::LoopStarted), 1);
    assert_eq!(h.alerts.count(EventId::LoopPaused), 1);
    assert_eq!(h.alerts.count(EventId::LoopResumed), 1);
    assert_eq!(h.alerts.count(EventId::LoopStopped), 1);
    assert_eq!(handle.status().await.run_state, RunState::Stopped);
}

#[tokio::test]
async fn test_max_ticks_bounds_run() {
    let mut h = harness(Vec::new(), 100, Vec::new(), fast_settings());
    let summary = h.control.run(&mut h.ctx, Some(4)).await;
    assert_eq!(summary.ticks, 4);
    assert_eq!(h.ctx.tick, 4);
}

/// Grey-level texture with no repeating period, so a crop matches in one place only.
fn textured_frame(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        let v = ((x * 37 + y * 91) ^ (x * y * 7)) % 251;
        let v = v as u8;
        Rgba([v, v, v, 255])
    })
}

#[tokio::test]
async fn test_profile_driven_replay_taps_template() {
    let dir = tempfile::tempdir().unwrap();
    let frame = textured_frame(64, 48);
    let luma = image::imageops::grayscale(&frame);
    image::imageops::crop_imm(&luma, 20, 10, 12, 12)
        .to_image()
        .save(dir.path().join("button.png"))
        .unwrap();

    let profile = Profile::parse(
        r#"
states = ["menu"]

[loop]
tick_interval_ms = 1
min_interval_ms = 1
perception_budget_ms = 5000

[[templates]]
id = "button"
path = "button.png"
threshold = 0.9

[[rules]]
state = "menu"
when = { template = "button" }

[[tasks]]
id = "press"
priority = 5
when = { state = "menu" }
cooldown_ms = 60000

[[tasks.steps]]
action = { tap_template = "button" }
"#,
    )
    .unwrap();
    let plan = profile.build(dir.path()).unwrap();

    let frames = vec![(PathBuf::from("frame.png"), frame); 3];
    let dispatcher = Arc::new(DryRunDispatcher::new());
    let alerts = Arc::new(CollectingAlerts::new());
    let mut ctx = RunContext::new(Scheduler::new(plan.tasks), &plan.settings);
    let mut control = ControlLoop::new(
        Box::new(ReplayCapture::new(frames)),
        Perception::new(Matcher::new(Box::new(NormalizedCrossCorrelation)), plan.templates, plan.recognizer),
        plan.reasoner,
        dispatcher.clone(),
        alerts.clone(),
        plan.settings,
    );

    let report = control.tick(&mut ctx).await.unwrap();
    assert_eq!(report.state.label, StateLabel::named("menu"));
    assert_eq!(report.action, Some(Action::Tap { x: 26, y: 16 }));

    // cooldown keeps the task quiet, then the replay runs dry
    assert!(control.tick(&mut ctx).await.unwrap().action.is_none());
    assert!(control.tick(&mut ctx).await.unwrap().action.is_none());
    assert!(matches!(
        control.tick(&mut ctx).await,
        Err(TickError::Capture(CaptureError::Unavailable(_)))
    ));
    assert_eq!(dispatcher.sent(), 1);
}
