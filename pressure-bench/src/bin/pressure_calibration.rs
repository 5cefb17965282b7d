//! Run a pressure calibration session.
//!
//! Connects the selected sensors, prepares the pressure reference, sweeps the configured
//! profile and writes one JSON record per sensor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use hardware::pace::{DriverKind, InstrumentArgs, SimulatedManifold};
use hardware::sensor::SimulatedTransport;
use pressure_bench::report::JsonFileSink;
use pressure_bench::session::{
    CalibrationSession, PartialConnectionPolicy, SessionConfig, SessionEvent, SessionHandle,
    SessionState, StartRequest,
};
use pressure_bench::sweep::SweepArgs;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pressure_calibration")]
#[command(about = "Calibrate wireless pressure sensors against a pressure reference")]
struct Args {
    #[command(flatten)]
    instrument: InstrumentArgs,

    #[command(flatten)]
    sweep: SweepArgs,

    #[arg(
        long = "device",
        help = "Sensor id to calibrate (repeatable)",
        long_help = "Sensor id to calibrate. Repeat to calibrate several sensors; they are \
            connected one at a time in the order given. Without any, every sensor found \
            by a scan is calibrated, strongest signal first."
    )]
    devices: Vec<String>,

    #[arg(
        long,
        default_value = "5",
        help = "Scan duration in seconds when no --device is given"
    )]
    scan_secs: u64,

    #[arg(
        long,
        help = "Abort if any selected sensor fails to connect",
        long_help = "By default the session continues with the sensors that connected. With \
            this flag a single connection failure aborts the session."
    )]
    abort_on_partial: bool,

    #[arg(
        long,
        default_value = "calibration_results",
        help = "Directory for calibration records"
    )]
    output_dir: PathBuf,

    #[arg(
        long,
        default_value = "3",
        help = "Number of simulated sensors"
    )]
    simulated_sensors: usize,

    #[arg(
        long,
        help = "Allow a real pressure reference with simulated sensors",
        long_help = "Sensors are always simulated, so a run against real hardware cannot \
            calibrate anything. This flag allows it anyway, to exercise the instrument \
            sequence end to end."
    )]
    dry_run: bool,
}

/// Refuse to pair a real pressure reference with simulated sensors unless asked to.
fn check_sensor_pairing(kind: &DriverKind, dry_run: bool) -> Result<()> {
    match kind {
        DriverKind::Real(config) if !dry_run => bail!(
            "no wireless sensor transport is available to pair with the instrument at {}; \
             use --simulate-instrument, or --dry-run to drive it against simulated sensors",
            config.addr()
        ),
        DriverKind::Real(config) => {
            warn!(
                "Dry run: pressure reference at {} with simulated sensors",
                config.addr()
            );
            Ok(())
        }
        DriverKind::Simulated(_) => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let sweep = args.sweep.to_config()?;

    // Simulated instrument and sensors see the same manifold pressure
    let manifold = SimulatedManifold::default();
    let kind = args.instrument.driver_kind(manifold.clone());
    check_sensor_pairing(&kind, args.dry_run)?;
    let driver = kind.build();
    let ids: Vec<String> = (1..=args.simulated_sensors)
        .map(|n| format!("SIM-{n:02}"))
        .collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let transport = Arc::new(SimulatedTransport::with_devices(manifold, &id_refs));

    let mut session = CalibrationSession::new(driver, transport, SessionConfig::default());

    let device_ids = if args.devices.is_empty() {
        let found = session
            .discover(Duration::from_secs(args.scan_secs))
            .await?;
        if found.is_empty() {
            bail!("No sensors found");
        }
        found.into_iter().map(|d| d.id).collect()
    } else {
        args.devices.clone()
    };
    info!("Calibrating {} sensor(s): {:?}", device_ids.len(), device_ids);

    let mut request = StartRequest::new(device_ids, sweep);
    if args.abort_on_partial {
        request.policy = PartialConnectionPolicy::AbortOnPartial;
    }

    tokio::spawn(log_events(session.subscribe()));
    tokio::spawn(cancel_on_signal(session.handle()));

    let sink = JsonFileSink::new(&args.output_dir);
    let outcome = session.run(request, &sink).await;

    match outcome.state {
        SessionState::Completed => {
            for record in &outcome.records {
                info!(
                    "{}: max deviation {:?}, hysteresis {:?}",
                    record.device_id,
                    record.max_deviation(),
                    record.hysteresis()
                );
            }
            info!(
                "Wrote {} record(s) to {}",
                outcome.records.len(),
                sink.dir().display()
            );
            Ok(())
        }
        SessionState::Aborted => {
            info!("Calibration aborted");
            Ok(())
        }
        state => match outcome.error {
            Some(err) => bail!("Calibration {state}: {err}"),
            None => bail!("Calibration ended in state {state}"),
        },
    }
}

async fn cancel_on_signal(handle: SessionHandle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, stopping after the current step...");
            handle.cancel();
        }
        Err(err) => warn!("Could not install Ctrl+C handler: {err}"),
    }
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::StepReady {
                step,
                reference,
                readings,
            }) => info!(
                "Step {} ({}): reference {reference}, sensors {readings:?}",
                step.index + 1,
                step.phase
            ),
            Ok(SessionEvent::Peripheral(event)) => info!("{event:?}"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Event log skipped {missed} event(s)")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
