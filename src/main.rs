//! PixelPilot - screen-driven game automation
//!
//! ```bash
//! pixelpilot check --profile mygame.toml
//! pixelpilot run --profile mygame.toml --dry-run --max-ticks 200
//! pixelpilot run --replay ./captures        # offline, against screenshots
//! pixelpilot windows
//! pixelpilot snap --title "My Game" --out frame.png
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pixelpilot::capture::{list_windows, CaptureSource, ReplayCapture, WindowCapture, WindowTarget, XcapProbe};
use pixelpilot::cli::{
    print_banner, print_error, print_info, print_plan, print_success, print_summary, print_warning, print_windows,
};
use pixelpilot::config::{AutomationPlan, ProfileManager};
use pixelpilot::control::{ControlLoop, Perception, RunContext};
use pixelpilot::dispatch::{Dispatcher, DryRunDispatcher, InputDispatcher, Jitter};
use pixelpilot::logging::{init_tracing, TracingAlerts};
use pixelpilot::perception::{Matcher, NormalizedCrossCorrelation};
use pixelpilot::scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "pixelpilot")]
#[command(version)]
#[command(about = "Screen-driven game automation: capture, perceive, reason, schedule, act")]
#[command(long_about = r#"
PixelPilot plays a game through its window: it captures frames, finds
templates and text, decides which state the game is in, and runs the
tasks of an automation profile.

Live capture needs the `vision` feature and real input the `input`
feature (`computer-use` enables both). Without them use --replay and
--dry-run to develop a profile offline.
"#)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until stopped
    Run {
        /// Automation profile (default: <config dir>/pixelpilot/profile.toml)
        #[arg(short, long, env = "PIXELPILOT_PROFILE")]
        profile: Option<PathBuf>,

        /// Log actions instead of sending input
        #[arg(long)]
        dry_run: bool,

        /// Stop after this many ticks
        #[arg(long, value_name = "N")]
        max_ticks: Option<u64>,

        /// Read frames from a directory of screenshots (implies --dry-run)
        #[arg(long, value_name = "DIR")]
        replay: Option<PathBuf>,
    },

    /// Validate a profile and summarise it
    Check {
        #[arg(short, long, env = "PIXELPILOT_PROFILE")]
        profile: Option<PathBuf>,
    },

    /// List capturable windows
    Windows,

    /// Save one frame of the game window, for cutting templates
    Snap {
        #[arg(short, long)]
        out: PathBuf,

        /// Window title substring (default: the profile's [window])
        #[arg(long)]
        title: Option<String>,

        #[arg(short, long, env = "PIXELPILOT_PROFILE")]
        profile: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.json_logs, args.debug);

    if let Err(e) = execute(args).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn execute(args: Args) -> Result<()> {
    match args.command {
        Command::Run {
            profile,
            dry_run,
            max_ticks,
            replay,
        } => run(profile, dry_run, max_ticks, replay, args.json_logs).await,
        Command::Check { profile } => check(profile),
        Command::Windows => windows(),
        Command::Snap { out, title, profile } => snap(out, title, profile),
    }
}

fn manager_for(profile: Option<PathBuf>) -> ProfileManager {
    match profile {
        Some(path) => ProfileManager::with_path(path),
        None => ProfileManager::new(),
    }
}

/// Cargo features a run needs but this build was compiled without. Without
/// them every capture or every action would fail and the loop would idle.
fn missing_features(live_capture: bool, live_input: bool) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if live_capture && !cfg!(feature = "vision") {
        missing.push("vision");
    }
    if live_input && !cfg!(feature = "input") {
        missing.push("input");
    }
    missing
}

fn load_plan(manager: &ProfileManager) -> Result<AutomationPlan> {
    manager
        .load_plan()
        .with_context(|| format!("loading profile {}", manager.path().display()))
}

async fn run(
    profile: Option<PathBuf>,
    dry_run: bool,
    max_ticks: Option<u64>,
    replay: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let manager = manager_for(profile);
    let plan = load_plan(&manager)?;
    if !json {
        print_banner();
    }

    let dry_run = dry_run || plan.dispatch.dry_run || replay.is_some();
    let missing = missing_features(replay.is_none(), !dry_run);
    if !missing.is_empty() {
        bail!(
            "this build lacks the {} feature; rebuild with --features {} or use --replay/--dry-run",
            missing.join(" and "),
            missing.join(",")
        );
    }

    let capture: Box<dyn CaptureSource> = match &replay {
        Some(dir) => Box::new(
            ReplayCapture::from_dir(dir).with_context(|| format!("reading replay frames from {}", dir.display()))?,
        ),
        None => {
            let target = plan
                .window
                .clone()
                .context("profile has no [window] table; add one or pass --replay DIR")?;
            Box::new(WindowCapture::new(target))
        }
    };

    let dispatcher: Arc<dyn Dispatcher> = if dry_run {
        Arc::new(DryRunDispatcher::new())
    } else {
        let target = plan
            .window
            .clone()
            .context("real input needs a [window] table in the profile")?;
        let jitter = Jitter::new(plan.dispatch.jitter_px, plan.dispatch.delay_jitter_ms);
        let settle = Duration::from_millis(plan.dispatch.settle_ms);
        Arc::new(InputDispatcher::new(Box::new(XcapProbe::new(target)), jitter, settle).context("starting input backend")?)
    };

    let AutomationPlan {
        settings,
        templates,
        recognizer,
        reasoner,
        tasks,
        ..
    } = plan;

    let perception = Perception::new(Matcher::new(Box::new(NormalizedCrossCorrelation)), templates, recognizer);
    let mut ctx = RunContext::new(Scheduler::new(tasks), &settings);
    let handle = ctx.handle();

    let stopper = handle.clone();
    ctrlc::set_handler(move || stopper.stop()).context("installing Ctrl+C handler")?;

    let source = capture.describe();
    let mut control = ControlLoop::new(capture, perception, reasoner, dispatcher.clone(), Arc::new(TracingAlerts), settings);

    if !json {
        print_info(&format!("Capturing from {}", source));
        print_info(&format!("Dispatching through {}", dispatcher.name()));
        if dry_run {
            print_warning("Dry run: no input will be sent");
        }
        print_info("Press Ctrl+C to stop");
    }

    let summary = control.run(&mut ctx, max_ticks).await;
    let status = handle.status().await;

    if json {
        println!("{}", serde_json::to_string(&status).context("serializing final status")?);
    } else {
        print_summary(&summary, &status);
    }
    Ok(())
}

fn check(profile: Option<PathBuf>) -> Result<()> {
    let manager = manager_for(profile);
    let plan = load_plan(&manager)?;
    print_plan(&plan);
    print_success(&format!("{} is valid", manager.path().display()));
    Ok(())
}

fn windows() -> Result<()> {
    let windows = list_windows().context("listing windows")?;
    print_windows(&windows);
    Ok(())
}

fn snap(out: PathBuf, title: Option<String>, profile: Option<PathBuf>) -> Result<()> {
    if !missing_features(true, false).is_empty() {
        bail!("snap needs the `vision` feature; rebuild with --features vision");
    }
    let target = match title {
        Some(title) => WindowTarget::new(title),
        None => {
            let manager = manager_for(profile);
            let profile = manager
                .load()
                .with_context(|| format!("loading profile {}", manager.path().display()))?;
            profile
                .window
                .context("no --title given and the profile has no [window] table")?
        }
    };

    let mut capture = WindowCapture::new(target);
    let frame = capture.capture().context("capturing frame")?;
    frame
        .image()
        .save(&out)
        .with_context(|| format!("writing {}", out.display()))?;
    print_success(&format!(
        "Saved {}x{} frame to {}",
        frame.width(),
        frame.height(),
        out.display()
    ));
    Ok(())
}
