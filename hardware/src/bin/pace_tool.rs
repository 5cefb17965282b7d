//! Command-line access to the pressure reference.
//!
//! Subcommands:
//! - `idn`: Query the identification string
//! - `query`: Send a raw SCPI query and print the reply
//! - `write`: Send a raw SCPI command
//! - `prereqs`: Check and enforce the calibration prerequisites
//! - `set`: Set a pressure and wait for it to settle
//! - `zero`: Vent to zero and run the zero check
//! - `read`: Read the measured pressure and status register

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use hardware::pace::commands::SETTLED_BIT;
use hardware::pace::{
    ControllerConfig, DriverKind, InstrumentArgs, PressureController, Progress,
    SimulatedManifold,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Pressure reference control tool
#[derive(Parser, Debug)]
#[command(name = "pace_tool")]
#[command(about = "Control tool for the SCPI pressure reference")]
#[command(version)]
struct Args {
    #[command(flatten)]
    instrument: InstrumentArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query the identification string
    Idn,

    /// Send a raw query (must end in '?') and print the reply
    Query {
        /// SCPI query, e.g. "OUTPut:STATe?"
        command: String,
    },

    /// Send a raw command that produces no reply
    Write {
        /// SCPI command, e.g. "OUTPut:STATe ON"
        command: String,
    },

    /// Check output state, pressure mode, static mode and tolerance, enforcing as needed
    Prereqs {
        /// Tolerance to program into the instrument
        #[arg(long, default_value = "0.1")]
        tolerance: f64,
    },

    /// Set a pressure and wait for the settled bit
    Set {
        /// Target pressure in instrument units
        pressure: f64,

        /// Skip the read-back tolerance check
        #[arg(long)]
        no_verify: bool,
    },

    /// Vent to zero and confirm the reading is below tolerance
    Zero,

    /// Read the measured pressure and operation status register
    Read,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let kind = match args.instrument.driver_kind(SimulatedManifold::default()) {
        DriverKind::Real(mut config) => {
            // One-shot tool: a dropped connection should fail fast
            config.auto_reconnect = false;
            DriverKind::Real(config)
        }
        simulated => simulated,
    };

    let mut controller_config = ControllerConfig::default();
    if let Command::Prereqs { tolerance } = &args.command {
        controller_config.instrument_tolerance = *tolerance;
    }

    let controller = PressureController::new(kind.build(), controller_config);
    controller.connect().await?;

    let result = run(&controller, args.command).await;
    controller.disconnect().await?;
    result
}

async fn run(controller: &PressureController, command: Command) -> Result<()> {
    let always = || true;

    match command {
        Command::Idn => {
            println!("{}", controller.identify().await?);
        }
        Command::Query { command } => {
            println!("{}", controller.query(&command).await?);
        }
        Command::Write { command } => {
            controller.write(&command).await?;
            info!("Sent `{command}`");
        }
        Command::Prereqs { .. } => match controller.run_prerequisites(&always).await? {
            Progress::Completed { enforced } if enforced.is_empty() => {
                println!("All prerequisites already satisfied");
            }
            Progress::Completed { enforced } => {
                println!("Enforced: {}", enforced.join(", "));
            }
            Progress::Cancelled => bail!("prerequisite checks cancelled"),
        },
        Command::Set {
            pressure,
            no_verify,
        } => {
            if pressure < 0.0 {
                bail!("pressure must be non-negative, got {pressure}");
            }
            controller
                .set_pressure(pressure, !no_verify, &always)
                .await?;
            println!("{:.4}", controller.read_pressure().await?);
        }
        Command::Zero => {
            controller.set_pressure(0.0, true, &always).await?;
            if !controller.check_zero_pressure().await? {
                bail!("pressure did not reach zero");
            }
            println!("At zero");
        }
        Command::Read => {
            let pressure = controller.read_pressure().await?;
            let status = controller.read_status().await?;
            println!("pressure: {pressure:.4}");
            println!("status:   {status} (settled: {})", status & SETTLED_BIT != 0);
        }
    }

    Ok(())
}
