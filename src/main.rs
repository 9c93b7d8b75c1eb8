// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the DDII bench controller
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rust_ddii_bench::config::{
    output_config_schema, output_plan_schema, Config, LinkMode, MeasurementPlan,
};
use rust_ddii_bench::connection::{ConnectionManager, ConnectionMode};
use rust_ddii_bench::measurement::{MeasurementRunner, PulseCount, PulseTrain};
use rust_ddii_bench::modbus::{or_sentinel, SimulatedDevice, TransportHandle};
use rust_ddii_bench::source::{connect_source, SourceDriver};
use rust_ddii_bench::supervisor::{TaskHandle, TaskOutcome, TaskSupervisor};

/// Bench controller for the DDII measurement module and its voltage source
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file, created with defaults when missing
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print the configuration JSON schema and exit
    #[arg(long)]
    show_config_schema: bool,

    /// Print the measurement plan JSON schema and exit
    #[arg(long)]
    show_plan_schema: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// No logging at all
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Serial port of the RTU link (selects serial mode)
    #[arg(long)]
    serial_port: Option<String>,

    /// Serial line speed
    #[arg(long)]
    baud_rate: Option<u32>,

    /// Modbus TCP server host (selects TCP mode)
    #[arg(long)]
    tcp_host: Option<String>,

    /// Modbus TCP server port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Unit id of the measurement module
    #[arg(long)]
    mpp_id: Option<u8>,

    /// Use the simulated device and source
    #[arg(long)]
    simulate: bool,

    /// Log every Modbus request and response
    #[arg(long)]
    wire_trace: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that both modules answer and dump the main MPP registers
    Probe,

    /// Run a measurement plan (YAML or JSON)
    Run {
        /// Plan file
        plan: PathBuf,
    },

    /// Emit a pulse train and read the oscilloscope after each pulse
    Pulse {
        /// Pulse amplitude in volts
        #[arg(long)]
        amplitude: f64,

        /// Pulse duration in microseconds
        #[arg(long, default_value_t = 100.0)]
        duration_us: f64,

        /// Pulse period in microseconds
        #[arg(long, default_value_t = 1000.0)]
        period_us: f64,

        /// Number of pulses; 0 holds a constant level until Ctrl+C
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Pulse until Ctrl+C
        #[arg(long)]
        continuous: bool,

        /// Source current limit in amperes
        #[arg(long, default_value_t = 0.01)]
        current_limit: f64,
    },

    /// Expose the serial-attached device to Modbus TCP clients
    Relay {
        /// Listen address, overrides the configuration
        #[arg(long)]
        address: Option<String>,

        /// Listen port, overrides the configuration
        #[arg(long)]
        port: Option<u16>,
    },
}

impl Command {
    /// Whether the command is useless without the configured Modbus link
    ///
    /// A plan can still run without it: direct-mode processes only drive the
    /// source and calibration processes may bring their own serial settings.
    fn needs_link(&self) -> bool {
        !matches!(self, Command::Run { .. })
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if quiet {
        builder.filter_level(LevelFilter::Off);
    } else if verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}

fn micros(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value * 1e-6)
        .with_context(|| format!("Invalid {what}: {value} µs"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if args.show_config_schema {
        return output_config_schema();
    }
    if args.show_plan_schema {
        return output_plan_schema();
    }

    let Some(command) = args.command else {
        anyhow::bail!("No command given, see --help");
    };

    let mut config = Config::from_file(&args.config)?;
    config.apply_args(
        args.serial_port,
        args.baud_rate,
        args.tcp_host,
        args.tcp_port,
        args.mpp_id,
        args.simulate,
        args.wire_trace,
    );
    debug!("Effective configuration: {:?}", config);

    let manager = Arc::new(ConnectionManager::new(config.connection_settings()));
    if let Err(e) = connect(&config, &manager).await {
        if command.needs_link() {
            return Err(e);
        }
        warn!("{e:#}, continuing without the configured Modbus link");
    }

    let result = match command {
        Command::Probe => probe(&manager).await,
        Command::Run { plan } => run_plan(&config, &manager, plan).await,
        Command::Pulse {
            amplitude,
            duration_us,
            period_us,
            count,
            continuous,
            current_limit,
        } => {
            let train = PulseTrain {
                amplitude_v: amplitude,
                duration: micros(duration_us, "pulse duration")?,
                period: micros(period_us, "pulse period")?,
                count: PulseCount::from_count(count, continuous),
                current_limit,
            };
            run_pulse(&config, &manager, train).await
        }
        Command::Relay { address, port } => {
            let address = address.unwrap_or_else(|| config.relay.address.clone());
            let port = port.unwrap_or(config.relay.port);
            run_relay(&manager, &address, port).await
        }
    };

    manager.disconnect().await;
    result
}

/// Open the link selected by the configuration
async fn connect(config: &Config, manager: &ConnectionManager) -> Result<()> {
    let connection = &config.connection;
    let connected = match connection.mode {
        LinkMode::Serial => {
            manager
                .connect_serial(&connection.serial_port, connection.baud_rate)
                .await
        }
        LinkMode::Tcp => {
            manager
                .connect_tcp(&connection.tcp_host, connection.tcp_port)
                .await
        }
        LinkMode::Simulated => {
            let device = SimulatedDevice::new(connection.mpp_id);
            manager
                .attach_transport(ConnectionMode::Serial, TransportHandle::new(device))
                .await
        }
    };
    if !connected {
        let reason = manager
            .last_error()
            .await
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        anyhow::bail!("Connection failed: {reason}");
    }
    Ok(())
}

async fn probe(manager: &ConnectionManager) -> Result<()> {
    let health = manager.check_modules(true, true).await;
    println!(
        "CM: {}  MPP: {}",
        if health.cm_ok { "ok" } else { "unreachable" },
        if health.mpp_ok { "ok" } else { "unreachable" }
    );
    if !health.mpp_ok {
        anyhow::bail!("Measurement module is not answering");
    }

    let mpp = manager.mpp().await?;
    println!("Level       : {}", or_sentinel("read level", mpp.read_level().await, 0));
    println!("Temp count  : {}", or_sentinel("read temp count", mpp.read_temp_count().await, 0));
    println!("ACQ1 peak   : {}", or_sentinel("read ACQ1 peak", mpp.read_acq_peak(1).await, 0));
    println!("ACQ2 peak   : {}", or_sentinel("read ACQ2 peak", mpp.read_acq_peak(2).await, 0));
    println!("DDII peak   : {}", or_sentinel("read DDII peak", mpp.read_ddii_peak().await, 0));
    println!("Bin number  : {}", or_sentinel("read bin number", mpp.read_bin_number().await, 0));
    println!("HH          : {:?}", or_sentinel("read HH", mpp.read_hh().await, Vec::new()));
    Ok(())
}

fn build_runner(
    config: &Config,
    manager: &Arc<ConnectionManager>,
    supervisor: &TaskSupervisor,
    source: Arc<dyn SourceDriver>,
) -> MeasurementRunner {
    MeasurementRunner::new(
        manager.clone(),
        supervisor.clone(),
        source,
        config.measurement.clone(),
    )
}

async fn run_plan(config: &Config, manager: &Arc<ConnectionManager>, plan: PathBuf) -> Result<()> {
    let plan = MeasurementPlan::from_file(&plan)?;
    info!("Loaded {} processes", plan.len());

    let supervisor = TaskSupervisor::new();
    let source = connect_source(&config.source).await;
    let runner = build_runner(config, manager, &supervisor, source);
    let handle = runner.start_plan(plan)?;
    supervise(&supervisor, handle).await
}

async fn run_pulse(
    config: &Config,
    manager: &Arc<ConnectionManager>,
    train: PulseTrain,
) -> Result<()> {
    let supervisor = TaskSupervisor::new();
    let source = connect_source(&config.source).await;
    let runner = build_runner(config, manager, &supervisor, source);
    let handle = runner.start_pulse_train(train)?;
    supervise(&supervisor, handle).await
}

/// Wait for the task, cancelling everything on Ctrl+C
async fn supervise(supervisor: &TaskSupervisor, handle: TaskHandle) -> Result<()> {
    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Ctrl+C handler failed: {e}");
            }
            info!("Interrupted, stopping {}", handle.name());
            supervisor.cancel_all().await;
            handle.wait().await
        }
    };

    match outcome {
        TaskOutcome::Completed => Ok(()),
        TaskOutcome::Cancelled => {
            info!("Task {} cancelled", handle.name());
            Ok(())
        }
        TaskOutcome::Failed(reason) => {
            error!("Task {} failed: {reason}", handle.name());
            anyhow::bail!("{reason}")
        }
    }
}

async fn run_relay(manager: &ConnectionManager, address: &str, port: u16) -> Result<()> {
    let local = manager
        .start_relay(address, port)
        .await
        .context("Could not start the relay")?;
    println!("Relay listening on {local}, Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    manager.stop_relay().await;
    info!("Relay stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(argv: &[&str]) -> Command {
        Args::try_parse_from(argv)
            .unwrap()
            .command
            .unwrap()
    }

    #[test]
    fn test_only_plans_run_without_the_link() {
        assert!(!command(&["bench", "run", "plan.yaml"]).needs_link());
        assert!(command(&["bench", "probe"]).needs_link());
        assert!(command(&["bench", "relay", "--port", "5020"]).needs_link());
        assert!(command(&["bench", "pulse", "--amplitude", "2.5"]).needs_link());
    }
}
