use anyhow::Context;
use clap::Parser;
use env_logger::Builder;
use log::{LevelFilter, debug, info};
use std::path::PathBuf;

use area_speed_advisor::common::{MobilitySource, MobilityTrace, ScenarioConfig};
use area_speed_advisor::simulation::{RunSummary, Simulation, append_cumulative_csv, write_summary_json, write_vehicle_csv};

/// Area speed advisor V2X simulation.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Scenario configuration (TOML). Defaults are used when omitted.
    #[arg(long, env = "ASA_CONFIG")]
    config: Option<PathBuf>,

    /// Mobility trace (JSON).
    #[arg(long, env = "ASA_TRACE")]
    trace: PathBuf,

    /// Simulated time in seconds.
    #[arg(long)]
    sim_time: Option<f64>,

    /// Supervisor baseline (ms) after which an unresolved message is lost.
    #[arg(long)]
    baseline: Option<f64>,

    /// Disable PRR/latency supervision.
    #[arg(long)]
    no_prr_sup: bool,

    /// Turn vehicle beaconing, and with it the whole application, on or off.
    #[arg(long)]
    send_cam: Option<bool>,

    /// Turn advisory emission on zone crossings on or off.
    #[arg(long)]
    send_denm: Option<bool>,

    /// Inter-beacon interval in milliseconds.
    #[arg(long)]
    interval: Option<u64>,

    /// Channel random seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Write the run summary as JSON.
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// Append average PRR and latency to this CSV.
    #[arg(long)]
    csv_cumulative: Option<PathBuf>,

    /// Write per-vehicle reception statistics to this CSV.
    #[arg(long)]
    csv_log: Option<PathBuf>,

    /// Debug logging for the simulator.
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<ScenarioConfig> {
    let mut config = match &args.config {
        Some(path) => ScenarioConfig::load(path).with_context(|| format!("Failed to load scenario {}", path.display()))?,
        None => ScenarioConfig::default(),
    };

    if let Some(sim_time) = args.sim_time {
        config.run.sim_time_s = sim_time;
    }
    if let Some(baseline) = args.baseline {
        config.supervisor.baseline_ms = baseline;
    }
    if args.no_prr_sup {
        config.supervisor.enabled = false;
    }
    if let Some(send_cam) = args.send_cam {
        config.beacon.enabled = send_cam;
    }
    if let Some(send_denm) = args.send_denm {
        config.advisor.enabled = send_denm;
    }
    if let Some(interval) = args.interval {
        config.beacon.interval_ms = interval;
    }
    if let Some(seed) = args.seed {
        config.channel.seed = seed;
    }
    config.validate().context("Invalid scenario after command line overrides")?;
    Ok(config)
}

fn print_summary(summary: &RunSummary) {
    info!("Advisories sent: {}", summary.advisories_sent());
    info!("Beacons processed: {}", summary.beacons_processed());
    info!("Zone changes: {}", summary.server.zone_changes);
    info!("Pool exhaustion events: {}", summary.pool_exhaustion_events());
    let Some(reception) = &summary.reception else {
        return;
    };
    match summary.avg_prr {
        Some(prr) => info!("Average PRR: {:.4}", prr),
        None => info!("Average PRR: n/a"),
    }
    match summary.avg_latency_ms {
        Some(latency) => info!("Average latency (ms): {:.3}", latency),
        None => info!("Average latency (ms): n/a"),
    }
    for (vehicle, stats) in &reception.per_vehicle {
        debug!("Vehicle {}: {} received, {} lost", vehicle, stats.received, stats.lost);
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logging setup
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(
            Some("area_speed_advisor"),
            if args.verbose { LevelFilter::Debug } else { LevelFilter::Info },
        )
        .parse_default_env()
        .init();

    info!("Starting up");

    let config = load_config(&args)?;
    let trace = MobilityTrace::load(&args.trace).with_context(|| format!("Failed to load mobility trace {}", args.trace.display()))?;
    info!(
        "Loaded mobility trace with {} ticks for {} vehicles",
        trace.remaining_ticks(),
        trace.declared_vehicle_count()
    );

    let summary = Simulation::new(config, trace).run().context("Simulation aborted")?;
    print_summary(&summary);

    if let Some(path) = &args.summary_json {
        write_summary_json(path, &summary)?;
        info!("Summary written to {}", path.display());
    }
    if let Some(path) = &args.csv_cumulative {
        append_cumulative_csv(path, &summary)?;
    }
    if let Some(path) = &args.csv_log {
        write_vehicle_csv(path, &summary)?;
        info!("Per-vehicle statistics written to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides_application_toggles() {
        let args = Args::parse_from([
            "area-speed-advisor-simulator",
            "--trace",
            "trace.json",
            "--send-cam",
            "false",
            "--send-denm",
            "false",
            "--interval",
            "200",
            "--csv-log",
            "vehicles.csv",
        ]);
        let config = load_config(&args).unwrap();
        assert!(!config.beacon.enabled);
        assert!(!config.advisor.enabled);
        assert_eq!(config.beacon.interval_ms, 200);
        assert_eq!(args.csv_log, Some(PathBuf::from("vehicles.csv")));
    }

    #[test]
    fn zero_interval_override_is_rejected() {
        let args = Args::parse_from(["area-speed-advisor-simulator", "--trace", "trace.json", "--interval", "0"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn toggles_default_to_the_scenario() {
        let args = Args::parse_from(["area-speed-advisor-simulator", "--trace", "trace.json"]);
        let config = load_config(&args).unwrap();
        assert!(config.beacon.enabled);
        assert!(config.advisor.enabled);
        assert_eq!(config.beacon.interval_ms, 100);
    }
}
