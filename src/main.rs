// src/main.rs - rustmill entry point

use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use rustmill::config::Settings;
use rustmill::hardware::{Clock, SimClock, SimDriver, SystemClock};
use rustmill::motion::MotionEngine;
use rustmill::protocol::Protocol;

#[derive(Parser, Debug)]
#[command(name = "rustmill", version, about = "G-code interpreter and stepper motion engine")]
struct Cli {
    /// Settings file, created with defaults when missing
    #[arg(long, default_value = "rustmill.toml")]
    config: PathBuf,

    /// G-code program to run; reads stdin interactively when omitted
    program: Option<PathBuf>,

    /// Run against a virtual clock, finishing instantly instead of pacing
    /// moves in real time
    #[arg(long)]
    dry_run: bool,
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load_or_create(&cli.config)?;
    tracing::info!(config = %cli.config.display(), "settings loaded");

    // Virtual travel matches the configured work area, so limit behavior in
    // simulation mirrors the physical switches.
    let driver = if settings.limit_switch {
        let max_steps = std::array::from_fn(|i| {
            (settings.work_area[i] * settings.steps_per_mm[i]).round() as i64
        });
        SimDriver::with_travel(max_steps)
    } else {
        SimDriver::unbounded()
    };
    let clock: Box<dyn Clock> = if cli.dry_run {
        Box::new(SimClock::new())
    } else {
        Box::new(SystemClock::new())
    };

    let engine = MotionEngine::new(driver, clock);
    let mut protocol = Protocol::new(settings, Some(cli.config.clone()), engine);

    let stdout = io::stdout().lock();
    match &cli.program {
        Some(path) => {
            let file = std::fs::File::open(path)?;
            protocol.run(BufReader::new(file), stdout)?;
        }
        None => {
            protocol.run(io::stdin().lock(), stdout)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
