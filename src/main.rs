//! CLI Entry Point for power_bench
//!
//! # Usage
//!
//! Check a configuration without touching any instrument:
//! ```bash
//! power_bench validate --config config/bench.toml
//! ```
//!
//! Run a test, optionally against the simulated bench:
//! ```bash
//! power_bench run sweep --config config/bench.toml --simulate
//! power_bench run ocp --config config/bench.toml
//! ```
//!
//! Ctrl-C asks the running test to stop at its next step. A second Ctrl-C
//! aborts it immediately; the instruments are still put in the safe state.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use power_bench::config::{RegulationKind, TestConfig, TestKind};
use power_bench::instrument::capabilities::ProtectionKind;
use power_bench::procedures::{
    Procedure, RegulationProcedure, SweepProcedure, ThresholdSearchProcedure,
};
use power_bench::tracing_setup::{self, OutputFormat, TracingConfig};
use power_bench::{HostEvent, TestExecutionHost};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "power_bench")]
#[command(about = "DC power source characterization bench", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file
    Validate {
        /// Configuration file
        #[arg(long, default_value = "config/bench.toml")]
        config: PathBuf,
    },

    /// Run one test
    Run {
        /// Test to run
        #[arg(value_enum)]
        test: TestName,

        /// Configuration file
        #[arg(long, default_value = "config/bench.toml")]
        config: PathBuf,

        /// Replace every instrument with the simulated bench
        #[arg(long)]
        simulate: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TestName {
    /// Current/voltage or power sweep
    Sweep,
    /// Over-voltage protection trip point
    Ovp,
    /// Over-current protection trip point
    Ocp,
    /// Load regulation
    LoadReg,
    /// Line regulation
    LineReg,
}

impl TestName {
    fn kind(self) -> TestKind {
        match self {
            TestName::Sweep => TestKind::Sweep,
            TestName::Ovp | TestName::Ocp => TestKind::Protection,
            TestName::LoadReg | TestName::LineReg => TestKind::Regulation,
        }
    }

    fn procedure(self) -> Box<dyn Procedure> {
        match self.kind() {
            TestKind::Sweep => Box::new(SweepProcedure::new()),
            TestKind::Protection => Box::new(ThresholdSearchProcedure::new()),
            TestKind::Regulation => Box::new(RegulationProcedure::new()),
        }
    }

    /// Point the configured section at the requested variant.
    fn apply(self, config: &mut TestConfig) {
        match self {
            TestName::Ovp | TestName::Ocp => {
                if let Some(protection) = config.protection.as_mut() {
                    protection.kind = if matches!(self, TestName::Ovp) {
                        ProtectionKind::Ovp
                    } else {
                        ProtectionKind::Ocp
                    };
                }
            }
            TestName::LineReg => {
                if let Some(regulation) = config.regulation.as_mut() {
                    regulation.kind = RegulationKind::Line;
                }
            }
            TestName::LoadReg => {
                if let Some(regulation) = config.regulation.as_mut() {
                    if regulation.kind == RegulationKind::Line {
                        regulation.kind = RegulationKind::LoadCv;
                    }
                }
            }
            TestName::Sweep => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate(config, cli.log_format),
        Commands::Run {
            test,
            config,
            simulate,
        } => run(test, config, simulate, cli.log_format).await,
    }
}

fn load_config(path: &Path, format: LogFormat) -> Result<TestConfig> {
    let config = TestConfig::load_from(path)
        .with_context(|| format!("Loading {}", path.display()))?;
    let format = match format {
        LogFormat::Pretty => OutputFormat::Pretty,
        LogFormat::Compact => OutputFormat::Compact,
        LogFormat::Json => OutputFormat::Json,
    };
    tracing_setup::init(TracingConfig::from_test_config(&config)?.with_format(format))?;
    Ok(config)
}

fn validate(path: PathBuf, format: LogFormat) -> Result<()> {
    let config = load_config(&path, format)?;
    config.validate()?;

    println!("✅ {} is valid", path.display());
    for (section, present) in [
        ("sweep", config.sweep.is_some()),
        ("protection", config.protection.is_some()),
        ("regulation", config.regulation.is_some()),
    ] {
        let mark = if present { "configured" } else { "absent" };
        println!("   [{section}] {mark}");
    }
    Ok(())
}

async fn run(test: TestName, path: PathBuf, simulate: bool, format: LogFormat) -> Result<()> {
    let mut config = load_config(&path, format)?;
    if simulate {
        config = config.simulated();
    }
    test.apply(&mut config);
    let config = Arc::new(config);

    let procedure = test.procedure();
    procedure.validate(&config)?;
    let host = TestExecutionHost::connect(&config).await?;
    let mut handle = host.start(procedure, Arc::clone(&config))?;
    println!("▶️  Run {} ({test:?})", handle.run_id());

    let mut interrupts = 0;
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Listening for Ctrl-C")?;
                interrupts += 1;
                if interrupts == 1 {
                    println!("⏹  Stopping after the current step (Ctrl-C again to abort)");
                    handle.request_cancel();
                } else {
                    println!("⚠️  Aborting");
                    handle.force_abort();
                }
            }
        }
    }

    let outcome = handle.wait().await?;
    let result = outcome.result();
    if !outcome.is_completed() || !result.success {
        bail!("{}", result.summary());
    }
    Ok(())
}

fn print_event(event: &HostEvent) {
    match event {
        HostEvent::ProgressText(text) => println!("   {text}"),
        HostEvent::ProgressPercent(percent) => tracing::debug!(percent, "Progress"),
        HostEvent::Sample(record) => match serde_json::to_string(record) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "Unprintable sample"),
        },
        HostEvent::Error(error) => eprintln!("❌ {error}"),
        HostEvent::Completed(result) => println!("✅ {}", result.summary()),
        HostEvent::Aborted(result) => println!("⏹  {}", result.summary()),
    }
}
