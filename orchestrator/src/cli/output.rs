//! Terminal rendering for CLI results

use colored::{ColoredString, Colorize};

use crate::bootstrap::StepReport;
use crate::deploy::fsm::AttemptState;
use crate::models::attempt::DeploymentAttempt;
use crate::models::status::ServiceStatus;

fn paint_state(state: AttemptState) -> ColoredString {
    match state {
        AttemptState::Committed => state.as_str().green(),
        AttemptState::RolledBack => state.as_str().yellow(),
        AttemptState::Failed => state.as_str().red(),
        _ => state.as_str().cyan(),
    }
}

pub fn print_attempt(attempt: &DeploymentAttempt) {
    for step in &attempt.steps {
        let mark = if step.ok { "ok".green() } else { "fail".red() };
        let took = (step.finished_at - step.started_at).num_milliseconds();
        match &step.detail {
            Some(detail) => println!("  {:>4} {:<18} {:>6}ms  {}", mark, step.step.as_str(), took, detail),
            None => println!("  {:>4} {:<18} {:>6}ms", mark, step.step.as_str(), took),
        }
    }

    println!(
        "{} {} {} -> {}",
        attempt.service.bold(),
        attempt.version,
        attempt.id.dimmed(),
        paint_state(attempt.state)
    );
    if let Some(error) = &attempt.error {
        eprintln!("{} {} ({})", "error:".red(), error.message, error.kind);
    }
}

pub fn print_statuses(statuses: &[ServiceStatus]) {
    if statuses.is_empty() {
        println!("no services registered");
        return;
    }

    for status in statuses {
        let current = status
            .current
            .as_ref()
            .map(|c| format!("{} ({})", c.version, c.handle))
            .unwrap_or_else(|| "-".to_string());
        println!("{}  {}  current: {}", status.service.bold(), status.image, current);

        if let Some(route) = &status.route {
            println!("    route: {} -> {}:{}", route.rule.host, route.target, route.port);
        }

        if let Some(latest) = &status.latest {
            let marker = if status.in_progress { " (in progress)" } else { "" };
            println!(
                "    latest: {} {} {}{}",
                latest.version,
                paint_state(latest.state),
                latest.id.dimmed(),
                marker
            );
        }
    }
}

pub fn print_bootstrap_step(report: &StepReport) {
    let mark = if report.ok() { "ok".green() } else { "fail".red() };
    match &report.error {
        Some(error) => println!("{} {} after {} tries: {}", mark, report.step, report.tries, error),
        None => println!("{} {}", mark, report.step),
    }
}
