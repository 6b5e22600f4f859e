//! `quakeguard simulate`: drive scripted scenarios through the full pipeline.
//!
//! Every scenario runs against a simulation system: recording notification
//! channels, scripted stand-ins for the configured feeds and a fixed user
//! location. Nothing touches the network.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Args, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use quakeguard_eew::alerting::ChannelOutcome;
use quakeguard_eew::consensus::IngestOutcome;
use quakeguard_eew::detection::ShakingBurst;
use quakeguard_eew::{
    DetectionCandidate, DeviceId, EarlyWarningSystem, EewConfig, GeoPoint, LocatedFix, OnDeviceDetector,
    RawFeedReport, SeverityTier, SyntheticWaveform,
};

use crate::{short_id, OutputFormat};

/// Built-in scenarios
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// An authoritative and a secondary agency report the same quake
    FeedMerge,
    /// Five nearby phones trigger within eight seconds
    CrowdQuorum,
    /// A single phone triggers alone
    LoneDevice,
    /// The local accelerometer records shaking; peers corroborate it
    DeviceShake,
}

/// Arguments for the simulate command
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Scenario to run
    #[arg(value_enum)]
    pub scenario: Scenario,

    /// JSON config file (defaults are used when omitted)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// User latitude
    #[arg(long, default_value = "38.42", allow_hyphen_values = true)]
    pub lat: f64,

    /// User longitude
    #[arg(long, default_value = "27.14", allow_hyphen_values = true)]
    pub lon: f64,

    /// Epicentral distance from the user in km
    #[arg(short, long, default_value = "120")]
    pub distance_km: f64,

    /// Magnitude reported by feeds
    #[arg(short, long, default_value = "6.1")]
    pub magnitude: f64,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Event display row
#[derive(Tabled, Serialize)]
struct EventRow {
    #[tabled(rename = "Event")]
    id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "M")]
    magnitude: String,
    #[tabled(rename = "Epicenter")]
    epicenter: String,
    #[tabled(rename = "Sources")]
    sources: String,
    #[tabled(rename = "Devices")]
    devices: usize,
    #[tabled(rename = "Rev")]
    revision: u32,
}

/// Decision display row
#[derive(Tabled, Serialize)]
struct DecisionRow {
    #[tabled(rename = "Event")]
    event: String,
    #[tabled(rename = "Distance")]
    distance: String,
    #[tabled(rename = "Warning")]
    warning: String,
    #[tabled(rename = "Intensity")]
    intensity: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Mode")]
    mode: String,
}

/// Dispatch display row
#[derive(Tabled, Serialize)]
struct DispatchRow {
    #[tabled(rename = "Alert")]
    alert: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Channels")]
    channels: String,
    #[tabled(rename = "First delivery")]
    first_delivery: String,
}

/// Everything a scenario produced
#[derive(Serialize)]
struct ScenarioOutput {
    scenario: String,
    notes: Vec<String>,
    events: Vec<EventRow>,
    decisions: Vec<DecisionRow>,
    dispatches: Vec<DispatchRow>,
}

/// Execute the simulate command
pub async fn execute(args: SimulateArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => EewConfig::from_json(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => EewConfig::default(),
    };

    let user = GeoPoint::new(args.lat, args.lon);
    anyhow::ensure!(user.is_valid(), "invalid user location {user}");
    let fix = LocatedFix::new(user, Utc::now());

    let mut system =
        EarlyWarningSystem::simulation(config, Some(fix)).context("failed to assemble the pipeline")?;
    system.start().await?;

    // Due south of the user
    let epicenter = user.offset_km(-args.distance_km, 0.0);
    let notes = match args.scenario {
        Scenario::FeedMerge => feed_merge(&system, epicenter, args.magnitude)?,
        Scenario::CrowdQuorum => crowd(&system, epicenter, 5)?,
        Scenario::LoneDevice => crowd(&system, epicenter, 1)?,
        Scenario::DeviceShake => device_shake(&system, epicenter)?,
    };

    // Let the decision loop drain the store updates
    tokio::time::sleep(StdDuration::from_millis(250)).await;

    let output = collect(&system, args.scenario, notes);
    system.shutdown().await;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => print_tables(&output),
    }
    Ok(())
}

fn raw(id: &str, magnitude: f64, at: GeoPoint, origin: chrono::DateTime<Utc>) -> RawFeedReport {
    RawFeedReport {
        id: id.to_string(),
        magnitude,
        latitude: at.latitude,
        longitude: at.longitude,
        depth_km: Some(10.0),
        origin_time: origin,
        reported_at: None,
    }
}

fn feed_merge(system: &EarlyWarningSystem, epicenter: GeoPoint, magnitude: f64) -> Result<Vec<String>> {
    let feeds: Vec<_> = system
        .monitor()
        .feeds()
        .iter()
        .map(|f| f.descriptor().clone())
        .collect();
    let primary = feeds
        .iter()
        .find(|f| f.authoritative)
        .context("scenario needs an authoritative feed")?;
    let secondary = feeds
        .iter()
        .find(|f| !f.authoritative)
        .context("scenario needs a non-authoritative feed")?;

    let origin = Utc::now() - Duration::seconds(3);
    let mut notes = Vec::new();

    let first = system.ingest_report(&primary.id, &raw("sim-1", magnitude, epicenter, origin), Utc::now())?;
    notes.push(format!("{} reported M{magnitude:.1}: {}", primary.id, describe_upsert(first.as_ref())));

    let second = system.ingest_report(
        &secondary.id,
        &raw(
            "sim-2",
            magnitude - 0.1,
            epicenter.offset_km(8.0, 0.0),
            origin + Duration::seconds(2),
        ),
        Utc::now(),
    )?;
    notes.push(format!(
        "{} reported M{:.1} 8 km away: {}",
        secondary.id,
        magnitude - 0.1,
        describe_upsert(second.as_ref())
    ));
    Ok(notes)
}

fn describe_upsert(outcome: Option<&quakeguard_eew::UpsertOutcome>) -> &'static str {
    match outcome {
        Some(quakeguard_eew::UpsertOutcome::Created(_)) => "new event",
        Some(quakeguard_eew::UpsertOutcome::Updated { .. }) => "merged into existing event",
        Some(quakeguard_eew::UpsertOutcome::Unchanged(_)) => "duplicate",
        None => "dropped",
    }
}

fn crowd(system: &EarlyWarningSystem, epicenter: GeoPoint, devices: usize) -> Result<Vec<String>> {
    let t0 = Utc::now() - Duration::seconds(8);
    let mut notes = Vec::new();
    for n in 0..devices {
        let ts = t0 + Duration::seconds((n * 2) as i64);
        let at = epicenter.offset_km(n as f64, n as f64 * 0.5);
        let candidate =
            DetectionCandidate::new(DeviceId::new(format!("peer-{n}")), ts, 4.2, 0.12, 0.8).with_location(at);
        let outcome = system.submit_candidate(candidate, ts)?;
        notes.push(format!("peer-{n}: {}", describe_ingest(&outcome)));
    }
    if devices < system.consensus().quorum() {
        notes.push(format!(
            "below quorum of {}; cluster will expire without an event",
            system.consensus().quorum()
        ));
    }
    Ok(notes)
}

fn describe_ingest(outcome: &IngestOutcome) -> String {
    match outcome {
        IngestOutcome::Rejected(reason) => format!("rejected ({reason:?})"),
        IngestOutcome::Duplicate(_) => "already counted".into(),
        IngestOutcome::Pooled { devices, .. } => format!("pooled ({devices} devices)"),
        IngestOutcome::Promoted { outcome, .. } => format!("quorum reached, event {}", short_id(outcome.event_id())),
    }
}

fn device_shake(system: &EarlyWarningSystem, epicenter: GeoPoint) -> Result<Vec<String>> {
    let config = system.config();
    let rate_hz = config.scheduler.foreground_rate_hz;
    let local = epicenter.offset_km(3.0, 0.0);

    let mut detector = OnDeviceDetector::new(config.detector.clone(), DeviceId::new(config.device_id.clone()));
    detector.set_location(Some(local));
    detector.start(rate_hz)?;

    let waveform = SyntheticWaveform::quiet(Utc::now() - Duration::seconds(25)).with_burst(ShakingBurst {
        start_sec: 15.0,
        duration_sec: 6.0,
        amplitude_g: 0.15,
        frequency_hz: 3.0,
    });

    let mut notes = Vec::new();
    let mut triggered = None;
    for sample in waveform.samples(rate_hz, 25.0) {
        if let Some(candidate) = detector.process_sample(&sample) {
            triggered.get_or_insert(candidate);
        }
    }

    let Some(candidate) = triggered else {
        notes.push("local detector did not trigger".into());
        return Ok(notes);
    };
    notes.push(format!(
        "local trigger: ratio {:.1}, peak {:.3} g, confidence {:.2}",
        candidate.sta_lta_ratio, candidate.peak_amplitude, candidate.confidence
    ));

    let ts = candidate.timestamp;
    let outcome = system.submit_candidate(candidate, ts)?;
    notes.push(format!("{}: {}", config.device_id, describe_ingest(&outcome)));

    for n in 0..3 {
        let at = epicenter.offset_km(-(n as f64), n as f64);
        let peer_ts = ts + Duration::seconds(n + 1);
        let peer = DetectionCandidate::new(DeviceId::new(format!("peer-{n}")), peer_ts, 3.8, 0.1, 0.7)
            .with_location(at);
        let outcome = system.submit_candidate(peer, peer_ts)?;
        notes.push(format!("peer-{n}: {}", describe_ingest(&outcome)));
    }
    Ok(notes)
}

fn collect(system: &EarlyWarningSystem, scenario: Scenario, notes: Vec<String>) -> ScenarioOutput {
    let events = system
        .events()
        .iter()
        .map(|e| EventRow {
            id: short_id(e.id()),
            status: e.status().to_string(),
            magnitude: format!("{:.1}", e.magnitude()),
            epicenter: e.epicenter().to_string(),
            sources: e
                .confirming_sources()
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(","),
            devices: e.confirming_device_cluster_size(),
            revision: e.revision(),
        })
        .collect();

    let decisions = system
        .decisions()
        .iter()
        .map(|d| DecisionRow {
            event: short_id(&d.event_id),
            distance: format!("{:.0} km", d.distance_km),
            warning: format!("{:.1} s", d.warning_time_sec),
            intensity: format!("{:.1}", d.intensity),
            severity: d.severity_tier.to_string(),
            mode: d.delivery_mode.to_string(),
        })
        .collect();

    let dispatches = system
        .dispatch_history()
        .iter()
        .map(|r| DispatchRow {
            alert: short_id(&r.alert_id),
            severity: r.severity.to_string(),
            channels: r
                .channels
                .iter()
                .map(|c| {
                    let status = match &c.outcome {
                        ChannelOutcome::Delivered => "ok".to_string(),
                        ChannelOutcome::Failed(e) => format!("failed: {e}"),
                        ChannelOutcome::Skipped(reason) => format!("{reason:?}").to_lowercase(),
                    };
                    format!("{}={}", c.kind, status)
                })
                .collect::<Vec<_>>()
                .join(" "),
            first_delivery: r
                .first_delivery
                .map(|d| format!("{} ms", d.as_millis()))
                .unwrap_or_else(|| "-".into()),
        })
        .collect();

    ScenarioOutput {
        scenario: format!("{scenario:?}"),
        notes,
        events,
        decisions,
        dispatches,
    }
}

fn severity_color(severity: &str) -> colored::ColoredString {
    match severity {
        s if s == SeverityTier::Extreme.to_string() || s == SeverityTier::Severe.to_string() => s.red().bold(),
        s if s == SeverityTier::Strong.to_string() => s.yellow().bold(),
        s => s.normal(),
    }
}

fn print_tables(output: &ScenarioOutput) {
    println!("{} {}", "[SIMULATION]".yellow().bold(), output.scenario);
    for note in &output.notes {
        println!("  {} {}", "-".dimmed(), note);
    }
    println!();

    println!("{}", "Events".bold().cyan());
    if output.events.is_empty() {
        println!("  {}", "none".dimmed());
    } else {
        println!("{}", Table::new(&output.events).with(Style::rounded()));
    }
    println!();

    println!("{}", "Decisions".bold().cyan());
    if output.decisions.is_empty() {
        println!("  {}", "none".dimmed());
    } else {
        println!("{}", Table::new(&output.decisions).with(Style::rounded()));
        if let Some(last) = output.decisions.last() {
            println!("  {} {}", "Latest severity:".dimmed(), severity_color(&last.severity));
        }
    }
    println!();

    println!("{}", "Dispatches".bold().cyan());
    if output.dispatches.is_empty() {
        println!("  {}", "none".dimmed());
    } else {
        println!("{}", Table::new(&output.dispatches).with(Style::rounded()));
    }
}
