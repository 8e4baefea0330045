use clap::{App, Arg, ArgMatches};
use colored::*;
use plantsim::{EventSink, NullSink, RunSummary, SimConfig, Simulation, StdoutSink};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = App::new("plantsim")
        .version("0.1.0")
        .author("Plant Systems Engineering Team")
        .about("🏭 Plant Simulator - machine sensor and piece tracking stream")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("multiplier")
                .short("m")
                .long("multiplier")
                .value_name("FACTOR")
                .help("Simulated seconds per real second")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("pieces")
                .short("n")
                .long("pieces")
                .value_name("COUNT")
                .help("Number of pieces to inject")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("seed")
                .short("s")
                .long("seed")
                .value_name("SEED")
                .help("Random seed")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .value_name("SINK")
                .help("Where records go")
                .takes_value(true)
                .possible_values(&["stdout", "null"])
                .default_value("stdout"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Increase log verbosity (-v debug, -vv trace)"),
        )
        .get_matches();

    init_tracing(matches.occurrences_of("verbose"));

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{} {}", "❌ Configuration error:".red().bold(), message);
            return ExitCode::FAILURE;
        }
    };

    let sink: Arc<dyn EventSink> = match matches.value_of("output") {
        Some("null") => Arc::new(NullSink),
        _ => Arc::new(StdoutSink),
    };

    let sim = match Simulation::new(config, sink) {
        Ok(sim) => Arc::new(sim),
        Err(e) => {
            eprintln!("{} {}", "❌ Configuration error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let interrupt = {
        let sim = Arc::clone(&sim);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, winding down");
                sim.cancel();
            }
        })
    };

    let result = sim.run().await;
    interrupt.abort();

    match result {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "simulation failed");
            eprintln!("{} {}", "❌ Simulation failed:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbosity: u64) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbosity > 0 {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// File values first, then command-line overrides.
fn load_config(matches: &ArgMatches) -> Result<SimConfig, String> {
    let mut config = match matches.value_of("config") {
        Some(path) => SimConfig::from_toml_file(Path::new(path)).map_err(|e| e.to_string())?,
        None => SimConfig::default(),
    };
    if let Some(value) = matches.value_of("multiplier") {
        config.time_multiplier = value
            .parse()
            .map_err(|_| format!("invalid multiplier `{value}`"))?;
    }
    if let Some(value) = matches.value_of("pieces") {
        config.piece_count = value.parse().map_err(|_| format!("invalid piece count `{value}`"))?;
    }
    if let Some(value) = matches.value_of("seed") {
        config.seed = value.parse().map_err(|_| format!("invalid seed `{value}`"))?;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn print_summary(summary: &RunSummary) {
    eprintln!();
    eprintln!("{}", "🏭 Run Summary".bright_cyan().bold());
    eprintln!("{}", "═══════════════".bright_cyan());
    eprintln!(
        "Pieces:     {} injected, {} completed, {}",
        summary.pieces_injected,
        summary.pieces_completed.to_string().green(),
        if summary.pieces_aborted == 0 {
            "0 aborted".normal()
        } else {
            format!("{} aborted", summary.pieces_aborted).yellow()
        }
    );
    eprintln!(
        "Records:    {} published, {}",
        summary.publish.published,
        if summary.publish.dropped == 0 {
            "0 dropped".normal()
        } else {
            format!("{} dropped", summary.publish.dropped).red()
        }
    );
    eprintln!(
        "Time:       {:.1} min simulated in {:.2} s",
        summary.simulated.as_secs_f64() / 60.0,
        summary.real.as_secs_f64()
    );
    eprintln!();
    for machine in &summary.machines {
        let wear = format!("{:.4}", machine.wear);
        eprintln!(
            "  {:<10} {:<8} ops {:>3}  busy {:>7.1} min  temp {:>6.2} °C  wear {}",
            machine.name.bold(),
            machine.machine_type.as_str(),
            machine.operations,
            machine.busy_seconds / 60.0,
            machine.temperature_c,
            if machine.wear_alert { wear.red() } else { wear.normal() }
        );
    }
}
