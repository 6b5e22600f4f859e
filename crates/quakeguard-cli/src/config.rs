//! `quakeguard config`: print, write and validate pipeline configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use quakeguard_eew::EewConfig;

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the default configuration, or write it to a file
    Default {
        /// Write to this path instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load and validate a configuration file
    Check {
        /// Path to a JSON config file
        path: PathBuf,
    },
}

#[derive(Tabled)]
struct FeedRow {
    #[tabled(rename = "Priority")]
    priority: u8,
    #[tabled(rename = "Feed")]
    id: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Authoritative")]
    authoritative: String,
    #[tabled(rename = "Min M")]
    min_magnitude: String,
}

/// Execute a config command
pub fn execute(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Default { output } => execute_default(output),
        ConfigCommand::Check { path } => execute_check(path),
    }
}

fn execute_default(output: Option<PathBuf>) -> Result<()> {
    let config = EewConfig::default();
    match output {
        Some(path) => {
            config
                .to_json(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("{} Wrote default configuration to {}", "[OK]".green().bold(), path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}

fn execute_check(path: PathBuf) -> Result<()> {
    let config = EewConfig::from_json(&path).with_context(|| format!("invalid configuration {}", path.display()))?;

    println!("{} {} is valid", "[OK]".green().bold(), path.display());
    println!();
    println!("{}", "Pipeline".bold());
    println!("  {} {}", "Device:".dimmed(), display_or_default(&config.device_id));
    println!("  {} {:.2}", "Sensitivity:".dimmed(), config.sensitivity());
    println!("  {} {:.1}", "Trigger ratio:".dimmed(), config.detector.trigger_ratio);
    println!("  {} {} devices", "Crowd quorum:".dimmed(), config.consensus.quorum);
    println!(
        "  {} M{:.1} / M{:.1}",
        "Min / critical magnitude:".dimmed(),
        config.alerting.preferences.min_magnitude,
        config.alerting.preferences.critical_magnitude
    );
    println!(
        "  {} {:.0} km",
        "Max distance:".dimmed(),
        config.alerting.preferences.max_distance_km
    );
    println!();

    let rows: Vec<FeedRow> = config
        .sources
        .feeds
        .iter()
        .map(|f| FeedRow {
            priority: f.priority,
            id: f.id.clone(),
            mode: format!("{:?}", f.mode).to_lowercase(),
            authoritative: if f.authoritative { "yes".into() } else { "no".into() },
            min_magnitude: format!("{:.1}", f.min_magnitude),
        })
        .collect();
    if rows.is_empty() {
        println!("{} No external feeds configured", "[WARN]".yellow());
    } else {
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
    Ok(())
}

fn display_or_default(device_id: &str) -> &str {
    if device_id.is_empty() {
        "(default)"
    } else {
        device_id
    }
}
