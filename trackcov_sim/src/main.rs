//! TrackCov Validation CLI
//!
//! Runs seeded Monte-Carlo scenarios through the vertex fitter and checks
//! that pulls and χ²/ndof come out as expected.

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use trackcov_sim::scenarios::ScenarioId;
use trackcov_sim::{HarnessConfig, ScenarioResult, ScenarioRunner};

#[derive(Parser, Debug)]
#[command(name = "trackcov-sim")]
#[command(about = "Deterministic pull validation for the TrackCov vertex fitter")]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Events per scenario (overrides the configuration file)
    #[arg(short, long)]
    events: Option<usize>,

    /// Scenario to run (primary, beam_spot, displaced_v0, with_neutral, collinear, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Harness configuration as JSON; missing fields take defaults
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print the pull report of every run
    #[arg(long)]
    report: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export per-event fit records of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        fail(format!("failed to set tracing subscriber: {}", e));
    }

    if !args.json {
        info!("TrackCov Validation Harness v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Available scenarios: primary, beam_spot, displaced_v0, with_neutral, collinear, all");
            fail(e)
        })]
    };
    if args.export.is_some() && (scenarios.len() > 1 || args.seeds > 1) {
        fail("--export only supports a single scenario and a single seed");
    }

    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_json_file(path).unwrap_or_else(|e| fail(e)),
        None => HarnessConfig::default(),
    };
    if let Some(events) = args.events {
        config.events = events;
    }

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed, config.events)
            .with_config(config.clone())
            .with_export(args.export.is_some());

        for scenario in &scenarios {
            let result = runner.run(*scenario).unwrap_or_else(|e| fail(e));

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
                if args.report {
                    result.report.print();
                }
            }

            if let (Some(path), Some(export)) = (&args.export, &result.export) {
                match export.write_to_file(path) {
                    Ok(()) => info!("Exported {} events to {}", export.events.len(), path),
                    Err(e) => fail(format!("export to {} failed: {}", path, e)),
                }
            }

            if !result.passed {
                failed_count += 1;
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "events": r.events,
                    "mean_chi2_per_dof": r.report.mean_chi_square_per_dof,
                    "metrics": r.metrics,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => fail(e),
        }
    } else {
        info!("");
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

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
