use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use harmoniq_cli::{Report, Scenario};
use harmoniq_routing::CoreConfig;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Route(args) => execute_route(args),
        Commands::Check(args) => execute_check(args),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Replay routing scenarios against the Harmoniq routing core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the devices and streams of a scenario and replay its actions.
    Route(RouteArgs),
    /// Validate a scenario file without running it.
    Check(CheckArgs),
}

#[derive(Args)]
struct RouteArgs {
    /// Path to the scenario description (JSON).
    #[arg(long)]
    scenario: PathBuf,
    /// Core configuration overriding the one embedded in the scenario.
    #[arg(long)]
    config: Option<PathBuf>,
    /// How to print the final routing state.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Args)]
struct CheckArgs {
    #[arg(long)]
    scenario: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn load_scenario(path: &Path) -> Result<Scenario> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario file {}", path.display()))?;
    Scenario::from_json(&text).with_context(|| format!("{} is not a valid scenario", path.display()))
}

fn execute_check(args: CheckArgs) -> Result<()> {
    let scenario = load_scenario(&args.scenario)?;
    println!(
        "Scenario ok: {} devices, {} streams, {} actions",
        scenario.devices.len(),
        scenario.streams.len(),
        scenario.actions.len()
    );
    Ok(())
}

fn execute_route(args: RouteArgs) -> Result<()> {
    let mut scenario = load_scenario(&args.scenario)?;
    if let Some(path) = &args.config {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        scenario.config = CoreConfig::from_json(&text)?;
    }

    let report = scenario.run()?;
    match args.format {
        OutputFormat::Json => {
            let text = serde_json::to_string_pretty(&report.snapshot).context("failed to encode snapshot")?;
            println!("{text}");
        }
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &Report) {
    let snapshot = &report.snapshot;
    for (label, devices) in [("Sinks", &snapshot.sinks), ("Sources", &snapshot.sources)] {
        if devices.is_empty() {
            continue;
        }
        println!("{label}:");
        for device in devices {
            let marker = if device.is_default { "*" } else { " " };
            println!(
                " {marker} #{} {} [{:?}] {} Hz, volume {:.2}{}",
                device.index,
                device.name,
                device.state,
                device.sample_spec.rate,
                device.real_volume.max().fraction(),
                if device.muted { " (muted)" } else { "" }
            );
        }
    }
    for (label, streams) in [("Sink inputs", &snapshot.sink_inputs), ("Source outputs", &snapshot.source_outputs)] {
        if streams.is_empty() {
            continue;
        }
        println!("{label}:");
        for stream in streams {
            let name = stream.proplist.get("media.name").unwrap_or("?");
            let device = stream.device.map_or_else(|| "-".to_string(), |d| format!("#{d}"));
            println!(
                "   #{} {name} -> {device} [{:?}] volume {:.2}",
                stream.index,
                stream.state,
                stream.volume.max().fraction()
            );
        }
    }
    if report.rendered_bytes > 0 {
        println!("Rendered {} bytes", report.rendered_bytes);
    }
    if !report.failures.is_empty() {
        println!("Refused actions:");
        for (position, reason) in &report.failures {
            println!("   {position}: {reason}");
        }
    }
}
