//! Terminal output: a spinner while a run is in flight and coloured summaries.
//!
//! Uses `indicatif` for the spinner and `console` for styling. Logs go to
//! stderr through `tracing`; everything here is the human-facing stdout view.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::jobs::JobOutcome;
use crate::sequencer::{ClusterStatus, TransitionPlan};
use crate::state_machine::{Direction, TransitionReport, TransitionState};

pub struct TransitionProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl TransitionProgress {
    pub fn start(direction: Direction) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("{direction}: {}", TransitionState::Idle));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// A handle the sequencer's state observer can move into its closure.
    pub fn bar(&self) -> ProgressBar {
        self.pb.clone()
    }

    pub fn complete(&self, report: &TransitionReport) {
        self.pb.finish_and_clear();
        if report.succeeded {
            println!(
                "  {} {} completed on {} edge node(s)",
                self.green.apply_to("✓"),
                report.direction,
                report.edge_nodes.len()
            );
        } else {
            println!(
                "  {} {} failed: {}",
                self.red.apply_to("✗"),
                report.direction,
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
        for result in &report.job_results {
            match &result.outcome {
                JobOutcome::Succeeded => {
                    println!("    {} {}", self.green.apply_to("✓"), result.node)
                }
                JobOutcome::Failed(reason) => {
                    println!("    {} {}: {reason}", self.red.apply_to("✗"), result.node)
                }
                JobOutcome::TimedOut => {
                    println!("    {} {}: timed out", self.yellow.apply_to("…"), result.node)
                }
            }
        }
        if let Some(err) = &report.lock_release_error {
            println!(
                "  {} lock was not released ({err}); delete it before the next run",
                self.yellow.apply_to("!")
            );
        }
    }

    pub fn print_report(&self, report: &TransitionReport) {
        let style = if report.succeeded { &self.green } else { &self.red };
        println!();
        println!("{}", style.apply_to("─── Transition Report ───"));
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
    }
}

/// Dry-run output.
pub fn print_plan(plan: &TransitionPlan) {
    let heading = Style::new().cyan().bold();
    println!("{}", heading.apply_to(format!("Planned {} (dry run)", plan.direction)));
    print_section("Edge nodes", &plan.edge_nodes);
    print_section("Node updates", &plan.node_updates);
    print_section("Resource steps", &plan.resource_steps);
    print_section("Servant jobs", &plan.servant_jobs);
}

pub fn print_status(status: &ClusterStatus) {
    let bold = Style::new().bold();
    println!("{} {}", bold.apply_to("Server version:"), status.server_version);
    print_section("Edge nodes", &status.edge_nodes);
    print_section("Cloud nodes", &status.cloud_nodes);
    match (&status.lock_holder, status.lock_acquired_at) {
        (Some(holder), Some(at)) => {
            println!("{} held by {holder} since {}", bold.apply_to("Lock:"), at.to_rfc3339())
        }
        (Some(holder), None) => println!("{} held by {holder}", bold.apply_to("Lock:")),
        _ => println!("{} free", bold.apply_to("Lock:")),
    }
}

fn print_section(title: &str, items: &[String]) {
    let dim = Style::new().dim();
    println!("{title}:");
    if items.is_empty() {
        println!("  {}", dim.apply_to("(none)"));
    }
    for item in items {
        println!("  - {item}");
    }
}
