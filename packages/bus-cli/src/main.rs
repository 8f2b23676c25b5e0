//! bus-trace: poke at a topic bus from the command line.
//!
//! `match` shows which subscriptions an event reaches and in which order.
//! `lifecycle` runs a simulated page start-up through request-will-did.
//! Pass `--json` to either for machine readable output.

mod config;
mod lifecycle;
mod trace;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::lifecycle::{LifecycleOptions, LifecycleReport, Role, LIFECYCLE_REQUEST};
use crate::trace::MatchRow;

#[derive(Parser)]
#[command(name = "bus-trace")]
#[command(about = "Trace delivery order and request-will-did exchanges on a topic bus")]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe the given patterns and show who receives an event
    Match {
        /// Subscription pattern (repeatable)
        #[arg(short, long = "subscribe", required = true)]
        subscribe: Vec<String>,

        /// Event name to publish
        #[arg(short, long)]
        event: String,
    },

    /// Simulate a page lifecycle request gathered from widgets
    Lifecycle {
        #[arg(long, default_value_t = 4)]
        widgets: usize,

        /// Widgets answering with will, then did after --delay-ms
        #[arg(long, default_value_t = 1)]
        slow: usize,

        /// Widgets answering with will only
        #[arg(long, default_value_t = 0)]
        silent: usize,

        #[arg(long, default_value_t = 250)]
        delay_ms: u64,

        /// Pending reply timeout (defaults to BUS_PENDING_REPLY_TIMEOUT_MS)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,topic_bus=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::Match { subscribe, event } => {
            let rows = trace::run_match(&config.bus, &subscribe, &event).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_match(&event, &rows);
            }
        }
        Commands::Lifecycle {
            widgets,
            slow,
            silent,
            delay_ms,
            timeout_ms,
        } => {
            let options = LifecycleOptions {
                widgets,
                slow,
                silent,
                delay: Duration::from_millis(delay_ms),
                timeout: timeout_ms.map(Duration::from_millis),
            };
            let report = lifecycle::run_lifecycle(&config.bus, &options).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_lifecycle(&report);
            }
        }
    }

    Ok(())
}

fn print_match(event: &str, rows: &[MatchRow]) {
    println!("{} {}", "📨 Delivering".bright_cyan().bold(), event.bold());
    if rows.is_empty() {
        println!("  {}", "no subscription matched".bright_yellow());
        return;
    }
    for row in rows {
        println!(
            "  {:>2}. {:<6} {:<40} {}",
            row.order,
            row.label.bright_green(),
            row.pattern,
            format!("weight ({}, {})", row.segments, row.subsegments).dimmed()
        );
    }
}

fn print_lifecycle(report: &LifecycleReport) {
    println!(
        "{} {}",
        "🔄 Gathering".bright_cyan().bold(),
        LIFECYCLE_REQUEST.bold()
    );
    for widget in &report.widgets {
        let role = match widget.role {
            Role::Ready => "ready".bright_green(),
            Role::Slow => "slow".bright_blue(),
            Role::Silent => "silent".bright_red(),
        };
        println!("  {} {}", widget.id, role);
    }

    println!();
    println!(
        "{} {} in {} ms",
        "✅ Replies:".bright_green().bold(),
        report.replies.len(),
        report.elapsed_ms
    );
    for sender in &report.replies {
        println!("  {} {}", "✓".bright_green(), sender);
    }

    if !report.missing.is_empty() {
        println!();
        println!("{}", "⏱  Timed out waiting for:".bright_red().bold());
        for sender in &report.missing {
            println!("  {} {}", "✗".bright_red(), sender);
        }
    }
    for fault in &report.faults {
        println!("  {}", fault.dimmed());
    }
}
