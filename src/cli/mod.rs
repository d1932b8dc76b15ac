//! Terminal output for the `pixelpilot` binary.

use console::style;

use crate::capture::WindowInfo;
use crate::config::AutomationPlan;
use crate::control::{RunSummary, StatusSnapshot};
use crate::scheduler::TaskPhase;

pub const BANNER_TEXT: &str = r#"
 ┏━┓╻╻ ╻┏━╸╻  ┏━┓╻╻  ┏━┓╺┳╸
 ┣━┛┃┏╋┛┣╸ ┃  ┣━┛┃┃  ┃ ┃ ┃
 ╹  ╹╹ ╹┗━╸┗━╸╹  ╹┗━╸┗━┛ ╹
"#;

pub fn print_banner() {
    println!("{}", style(BANNER_TEXT).cyan().bold());
    println!(
        "{}",
        style(format!("  capture -> perceive -> reason -> act   v{}", env!("CARGO_PKG_VERSION"))).dim()
    );
    println!();
}

pub fn print_info(msg: &str) {
    println!("{} {}", style("ℹ").cyan(), msg);
}

pub fn print_success(msg: &str) {
    println!("{} {}", style("✓").green().bold(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", style("⚠").yellow().bold(), msg);
}

fn rule() {
    println!(
        "{}",
        style("════════════════════════════════════════════════════════════").dim()
    );
}

/// What `check` found in a profile.
pub fn print_plan(plan: &AutomationPlan) {
    println!();
    rule();
    println!("{}", style("AUTOMATION PROFILE").cyan().bold());
    match &plan.window {
        Some(target) => println!("Window: {}", style(target).yellow()),
        None => println!("Window: {}", style("(none; replay or snap only)").dim()),
    }
    println!(
        "Tick: {}ms  (clamp {}..{}ms, perception budget {}ms)",
        plan.settings.tick_interval_ms,
        plan.settings.min_interval_ms,
        plan.settings.max_interval_ms,
        plan.settings.perception_budget_ms
    );
    println!("Text backend: {}", plan.recognizer.backend_name());
    rule();

    println!("{} ({})", style("Templates").bold(), plan.templates.len());
    for t in &plan.templates {
        println!(
            "  {} {}x{} threshold {:.2} scales {:?}",
            style(&t.id).green(),
            t.image.width(),
            t.image.height(),
            t.threshold,
            t.scales
        );
    }

    println!("{} ({})", style("Rules").bold(), plan.reasoner.rules().len());
    for (i, r) in plan.reasoner.rules().iter().enumerate() {
        println!("  {}. {} -> {}", i + 1, r.name, style(&r.target).cyan());
    }

    println!("{} ({})", style("Tasks").bold(), plan.tasks.len());
    for t in &plan.tasks {
        let recovery = if t.recovery {
            style(" [recovery]").magenta().to_string()
        } else {
            String::new()
        };
        println!(
            "  {} prio {} steps {} attempts {}{}",
            style(&t.id).green(),
            t.priority,
            t.steps.len(),
            t.retry.max_attempts,
            recovery
        );
    }
    rule();
}

pub fn print_windows(windows: &[WindowInfo]) {
    if windows.is_empty() {
        print_warning("No capturable windows found");
        return;
    }
    for w in windows {
        let title = if w.title.is_empty() { "(untitled)" } else { w.title.as_str() };
        let mut line = format!(
            "{}  {}  {}x{} at ({}, {})",
            style(title).bold(),
            style(&w.app_name).dim(),
            w.width,
            w.height,
            w.x,
            w.y
        );
        if w.minimized {
            line.push_str(&style("  minimized").yellow().to_string());
        }
        println!("{}", line);
    }
}

fn phase_style(phase: TaskPhase) -> console::StyledObject<&'static str> {
    match phase {
        TaskPhase::Waiting => style("waiting").dim(),
        TaskPhase::Running => style("running").green().bold(),
        TaskPhase::Cooldown => style("cooldown").cyan(),
        TaskPhase::Abandoned => style("abandoned").red().bold(),
    }
}

/// End-of-run report.
pub fn print_summary(summary: &RunSummary, status: &StatusSnapshot) {
    println!();
    rule();
    println!(
        "{} {} ticks, {} skipped, {} actions",
        style("RUN").cyan().bold(),
        summary.ticks,
        summary.skipped,
        summary.actions
    );
    println!("Final state: {}", style(&status.state).yellow());
    for t in &status.tasks {
        println!(
            "  {:<20} {:<10} attempts {}/{}",
            t.id,
            phase_style(t.phase),
            t.attempts,
            t.max_attempts
        );
    }
    if let Some(alert) = &status.last_alert {
        println!("Last alert: {}", style(alert.to_log_line()).yellow());
    }
    rule();
}
