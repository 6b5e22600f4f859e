//! `quakeguard wave`: arrival times and expected shaking for one observer.

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use quakeguard_eew::alerting::magnitude_radius_km;
use quakeguard_eew::{SeverityTier, SoilClass, WaveCalculator, WaveSpeeds};

use crate::OutputFormat;

/// Arguments for the wave command
#[derive(Args, Debug)]
pub struct WaveArgs {
    /// Event magnitude
    #[arg(short, long)]
    pub magnitude: f64,

    /// Epicentral distance to the observer in km
    #[arg(short, long)]
    pub distance_km: f64,

    /// Focal depth in km
    #[arg(long, default_value = "10.0")]
    pub depth_km: f64,

    /// Site soil class (A-F)
    #[arg(short, long, default_value = "C")]
    pub soil: String,

    /// Seconds since origin time
    #[arg(short, long, default_value = "0")]
    pub elapsed_sec: f64,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Computed arrivals for display
#[derive(Debug, Serialize)]
pub struct WaveSummary {
    /// Hypocentral distance
    pub hypocentral_km: f64,
    /// P-wave travel time
    pub p_travel_sec: f64,
    /// S-wave travel time
    pub s_travel_sec: f64,
    /// Surface-wave travel time
    pub surface_travel_sec: f64,
    /// Seconds left before the S-wave
    pub warning_time_sec: f64,
    /// Expected intensity
    pub intensity: f64,
    /// Severity tier for that intensity
    pub severity: SeverityTier,
    /// Inside the magnitude relevance radius
    pub within_radius: bool,
}

#[derive(Tabled)]
struct Row {
    #[tabled(rename = "Quantity")]
    name: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

/// Compute the summary for one set of arguments
pub fn summarize(args: &WaveArgs) -> Result<WaveSummary> {
    let soil = SoilClass::from_letter(&args.soil).ok_or_else(|| anyhow!("unknown soil class '{}'", args.soil))?;
    let speeds = WaveSpeeds::default();
    let calc = WaveCalculator::new(speeds)?;

    let origin = Utc::now();
    let now = origin + Duration::milliseconds((args.elapsed_sec * 1000.0) as i64);
    let hypocentral_km = calc
        .hypocentral_distance_km(args.distance_km, args.depth_km)
        .context("invalid distance or depth")?;

    let p = calc.p_arrival(hypocentral_km, origin)?;
    let s = calc.s_arrival(hypocentral_km, origin)?;
    let surface = calc.arrival_time(speeds.surface_km_s, args.distance_km, origin)?;
    let intensity = calc
        .attenuated_intensity(args.magnitude, hypocentral_km, soil)
        .context("invalid magnitude")?;

    let secs = |t: chrono::DateTime<Utc>| (t - origin).num_milliseconds() as f64 / 1000.0;

    Ok(WaveSummary {
        hypocentral_km,
        p_travel_sec: secs(p),
        s_travel_sec: secs(s),
        surface_travel_sec: secs(surface),
        warning_time_sec: calc.warning_time_sec(now, s),
        intensity,
        severity: SeverityTier::from_intensity(intensity),
        within_radius: args.distance_km <= magnitude_radius_km(args.magnitude),
    })
}

/// Execute the wave command
pub fn execute(args: WaveArgs) -> Result<()> {
    let summary = summarize(&args)?;

    if args.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "{} M{:.1} at {:.0} km, depth {:.0} km, soil {}",
        "[WAVE]".bright_cyan().bold(),
        args.magnitude,
        args.distance_km,
        args.depth_km,
        args.soil.to_uppercase()
    );

    let rows = vec![
        Row {
            name: "Hypocentral distance",
            value: format!("{:.1} km", summary.hypocentral_km),
        },
        Row {
            name: "P-wave arrival",
            value: format!("+{:.1} s", summary.p_travel_sec),
        },
        Row {
            name: "S-wave arrival",
            value: format!("+{:.1} s", summary.s_travel_sec),
        },
        Row {
            name: "Surface-wave arrival",
            value: format!("+{:.1} s", summary.surface_travel_sec),
        },
        Row {
            name: "Warning time",
            value: format!("{:.1} s", summary.warning_time_sec),
        },
        Row {
            name: "Intensity",
            value: format!("{:.1}", summary.intensity),
        },
        Row {
            name: "Severity",
            value: summary.severity.to_string(),
        },
    ];
    println!("{}", Table::new(rows).with(Style::rounded()));

    if summary.warning_time_sec <= 0.0 {
        println!("{} S-wave has already arrived", "[WARN]".yellow());
    }
    if !summary.within_radius {
        println!(
            "{} Outside the {:.0} km relevance radius for this magnitude",
            "[INFO]".blue(),
            magnitude_radius_km(args.magnitude)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(magnitude: f64, distance_km: f64, elapsed_sec: f64) -> WaveArgs {
        WaveArgs {
            magnitude,
            distance_km,
            depth_km: 10.0,
            soil: "C".into(),
            elapsed_sec,
            format: OutputFormat::Json,
        }
    }

    #[test]
    fn test_s_after_p() {
        let s = summarize(&args(6.0, 100.0, 0.0)).unwrap();
        assert!(s.s_travel_sec > s.p_travel_sec);
        assert!(s.warning_time_sec > 0.0);
        assert!(s.within_radius);
    }

    #[test]
    fn test_warning_clamped_after_arrival() {
        let s = summarize(&args(6.0, 30.0, 120.0)).unwrap();
        assert_eq!(s.warning_time_sec, 0.0);
    }

    #[test]
    fn test_bad_soil_rejected() {
        let mut a = args(6.0, 30.0, 0.0);
        a.soil = "Z".into();
        assert!(summarize(&a).is_err());
    }
}
