//! Airbox DST Simulator CLI
//!
//! Run deterministic fleet scenarios, or export a simulated reading window.

use airbox_core::{Profile, SimulatorConfig};
use airbox_sim::scenarios::ScenarioId;
use airbox_sim::{decode_frame_hex, ScenarioResult, ScenarioRunner, WindowExport};
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Airbox Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "airbox-sim")]
#[command(about = "Run deterministic simulation tests for the airbox fleet", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (chronic_window, battery_continuity, deregistration,
    /// backend_outage, throttle, config_outage, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export a reading window to this JSON file instead of running scenarios
    #[arg(long)]
    export: Option<String>,

    /// Profile for --export (healthy, intermittent, chronic)
    #[arg(long, default_value = "intermittent")]
    profile: String,

    /// Window length in hours for --export
    #[arg(long, default_value = "24")]
    hours: f64,

    /// Window start (RFC 3339) for --export
    #[arg(long, default_value = "2024-03-12T05:00:00Z")]
    start: String,

    /// Decode one hex wire frame, print it as JSON and exit
    #[arg(long, value_name = "HEX")]
    decode: Option<String>,
}

fn run_export(args: &Args, seed: u64, path: &str) -> Result<usize, String> {
    let profile: Profile = args.profile.parse()?;
    let start = DateTime::parse_from_rfc3339(&args.start)
        .map_err(|e| format!("invalid --start {:?}: {}", args.start, e))?
        .with_timezone(&Utc);
    let config = SimulatorConfig {
        profile,
        seed,
        ..SimulatorConfig::default()
    };

    let export = WindowExport::generate(config, start, args.hours);
    export
        .write_to_file(path)
        .map_err(|e| format!("failed to write {}: {}", path, e))?;
    Ok(export.frames.len())
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if let Some(hex) = &args.decode {
        match decode_frame_hex(hex).map(|reading| serde_json::to_string_pretty(&reading)) {
            Ok(Ok(text)) => println!("{}", text),
            Ok(Err(e)) => {
                error!("Failed to render reading: {}", e);
                std::process::exit(1);
            }
            Err(e) => {
                error!("Cannot decode frame: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if !args.json {
        info!("Airbox DST Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    if let Some(path) = &args.export {
        match run_export(&args, base_seed, path) {
            Ok(frames) => info!("Exported {} frames (seed={}) to {}", frames, base_seed, path),
            Err(e) => {
                error!("Export failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(1);
        })]
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed);

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "time_secs": r.final_time_secs,
                    "readings": r.metrics.readings,
                    "delivered": r.metrics.delivered,
                    "attempts": r.metrics.attempts,
                    "peak_in_flight": r.metrics.peak_in_flight,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to render summary: {}", e),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if failed_count > 0 {
        std::process::exit(1);
    }
}
