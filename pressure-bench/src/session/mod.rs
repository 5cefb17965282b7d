//! Calibration session state machine.
//!
//! A [`CalibrationSession`] runs exactly once:
//!
//! ```text
//! Idle -> Connecting -> ConfiguringInstrument -> ZeroCheck -> Sweeping -> Completed
//!                                                                      \-> Aborted | Failed
//! ```
//!
//! Cancellation is a shared flag ([`SessionHandle`]) sampled before every sub-step.
//! Whatever the terminal state, the instrument link and every connected sensor are
//! released before the session reports it.

mod events;
mod shutdown;

pub use events::{EventBus, SessionEvent};
pub use shutdown::ShutdownSequence;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hardware::pace::{
    ActivePredicate, ControllerConfig, InstrumentDriver, PaceError, PressureController, Progress,
};
use hardware::sensor::{
    ConnectionConfig, DiscoveredDevice, PeripheralConnectionManager, PeripheralDevice,
    PeripheralEvent, PeripheralTransport, TransportError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::report::{CalibrationRecord, ReportError, ResultSink, StepMeasurement};
use crate::sweep::{Phase, SweepConfig, SweepConfigError, SweepScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    ConfiguringInstrument,
    ZeroCheck,
    Sweeping,
    Completed,
    Aborted,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Aborted | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::ConfiguringInstrument => "configuring instrument",
            SessionState::ZeroCheck => "zero check",
            SessionState::Sweeping => "sweeping",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to do when some, but not all, requested sensors connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialConnectionPolicy {
    #[default]
    ProceedWithConnected,
    AbortOnPartial,
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Sensors to calibrate, connected in this order
    pub device_ids: Vec<String>,
    pub sweep: SweepConfig,
    pub policy: PartialConnectionPolicy,
    /// Discovery information for ids the session has not scanned itself
    pub known_devices: Vec<DiscoveredDevice>,
}

impl StartRequest {
    pub fn new(device_ids: Vec<String>, sweep: SweepConfig) -> Self {
        Self {
            device_ids,
            sweep,
            policy: PartialConnectionPolicy::default(),
            known_devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub controller: ControllerConfig,
    pub connection: ConnectionConfig,
}

/// Cancel command for a running session. Cheap to clone and safe to use from any task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    active: Arc<AtomicBool>,
}

impl SessionHandle {
    fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Stop the session before its next sub-step. An instrument command already on the
    /// wire is allowed to finish.
    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Session cancel requested");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid sweep configuration: {0}")]
    InvalidConfig(#[from] SweepConfigError),

    #[error(transparent)]
    Instrument(#[from] PaceError),

    #[error("no sensor could be connected ({failed} failed)")]
    NoPeripherals { failed: usize },

    #[error("sensor(s) {failed:?} failed to connect and partial sessions are disabled")]
    PartialConnection { failed: Vec<String> },

    #[error("pressure reference reads {measured} after venting, expected below {tolerance}")]
    NotAtZero { measured: f64, tolerance: f64 },

    #[error("storing calibration results: {0}")]
    Report(#[from] ReportError),

    #[error("session cancelled")]
    Cancelled,

    #[error("session already ran (state {0})")]
    NotIdle(SessionState),
}

impl SessionError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            SessionError::Cancelled => true,
            SessionError::Instrument(err) => err.is_cancelled(),
            _ => false,
        }
    }

    /// Terminal state this error leads to. Stops requested by the caller abort, faults fail.
    pub fn terminal_state(&self) -> SessionState {
        match self {
            SessionError::PartialConnection { .. } => SessionState::Aborted,
            err if err.is_cancelled() => SessionState::Aborted,
            _ => SessionState::Failed,
        }
    }
}

/// Result of [`CalibrationSession::run`].
#[derive(Debug)]
pub struct SessionOutcome {
    pub state: SessionState,
    /// Records handed to the sink; empty unless the sweep completed
    pub records: Vec<CalibrationRecord>,
    pub error: Option<SessionError>,
}

/// One calibration run over a pressure reference and a set of wireless sensors.
///
/// The session owns its peripheral registry; nothing it connects is visible to, or
/// shared with, another session.
pub struct CalibrationSession {
    controller: Arc<PressureController>,
    peripherals: Arc<PeripheralConnectionManager>,
    peripheral_events: broadcast::Receiver<PeripheralEvent>,
    events: EventBus,
    handle: SessionHandle,
    state: SessionState,
    sweep: Option<SweepConfig>,
    current_step_index: usize,
    total_steps: usize,
    increasing_phase: bool,
}

impl CalibrationSession {
    pub fn new(
        driver: Arc<dyn InstrumentDriver>,
        transport: Arc<dyn PeripheralTransport>,
        config: SessionConfig,
    ) -> Self {
        let peripherals = Arc::new(PeripheralConnectionManager::new(
            transport,
            config.connection,
        ));
        let peripheral_events = peripherals.subscribe();
        Self {
            controller: Arc::new(PressureController::new(driver, config.controller)),
            peripherals,
            peripheral_events,
            events: EventBus::default(),
            handle: SessionHandle::new(),
            state: SessionState::Idle,
            sweep: None,
            current_step_index: 0,
            total_steps: 0,
            increasing_phase: true,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sweep_config(&self) -> Option<&SweepConfig> {
        self.sweep.as_ref()
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn is_increasing_phase(&self) -> bool {
        self.increasing_phase
    }

    /// Snapshot of the sensors this session knows about.
    pub fn devices(&self) -> Vec<PeripheralDevice> {
        self.peripherals.snapshot()
    }

    /// Scan for sensors. Results are remembered for [`run`](Self::run).
    pub async fn discover(
        &self,
        duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError> {
        self.peripherals.discover(duration).await
    }

    /// Run the session to a terminal state.
    ///
    /// Never returns before the instrument and every connected sensor have been
    /// released. A session runs once; later calls return [`SessionError::NotIdle`].
    pub async fn run(&mut self, request: StartRequest, sink: &dyn ResultSink) -> SessionOutcome {
        if self.state != SessionState::Idle {
            return SessionOutcome {
                state: self.state,
                records: Vec::new(),
                error: Some(SessionError::NotIdle(self.state)),
            };
        }

        let mut shutdown = ShutdownSequence::new();
        let result = self.execute(request, sink, &mut shutdown).await;
        shutdown.release().await;
        self.forward_peripheral_events();

        match result {
            Ok(records) => {
                self.transition(SessionState::Completed);
                SessionOutcome {
                    state: SessionState::Completed,
                    records,
                    error: None,
                }
            }
            Err(err) => {
                let state = err.terminal_state();
                if state == SessionState::Aborted {
                    info!("Session aborted: {err}");
                    self.events.emit(SessionEvent::SessionAborted {
                        reason: err.to_string(),
                    });
                } else {
                    error!("Session failed in {}: {err}", self.state);
                    self.events.emit(SessionEvent::SessionFailed {
                        error: err.to_string(),
                    });
                }
                self.transition(state);
                SessionOutcome {
                    state,
                    records: Vec::new(),
                    error: Some(err),
                }
            }
        }
    }

    async fn execute(
        &mut self,
        request: StartRequest,
        sink: &dyn ResultSink,
        shutdown: &mut ShutdownSequence,
    ) -> Result<Vec<CalibrationRecord>, SessionError> {
        let scheduler = SweepScheduler::start(request.sweep.clone())?;
        self.total_steps = scheduler.total_steps();
        self.sweep = Some(request.sweep.clone());

        let active = self.handle.active.clone();
        let is_active = move || active.load(Ordering::SeqCst);

        self.transition(SessionState::Connecting);
        self.check_active(&is_active)?;
        shutdown.register_peripherals(self.peripherals.clone());
        let sensors = self.connect_peripherals(&request, &is_active).await?;

        self.check_active(&is_active)?;
        shutdown.register_instrument(self.controller.clone());
        let identity = self.controller.connect().await?;
        self.events.emit(SessionEvent::InstrumentConnected {
            identity: identity.clone(),
        });

        self.transition(SessionState::ConfiguringInstrument);
        match self.controller.run_prerequisites(&is_active).await? {
            Progress::Completed { enforced } => {
                for name in enforced {
                    self.events
                        .emit(SessionEvent::PrerequisiteEnforced { name });
                }
            }
            Progress::Cancelled => return Err(SessionError::Cancelled),
        }

        self.check_active(&is_active)?;
        self.transition(SessionState::ZeroCheck);
        self.ensure_zero(&is_active).await?;

        self.check_active(&is_active)?;
        self.transition(SessionState::Sweeping);
        let measurements = self.run_sweep(scheduler, &sensors, &is_active).await?;

        let records: Vec<_> = sensors
            .iter()
            .zip(measurements)
            .map(|(sensor, steps)| {
                let device = self
                    .peripherals
                    .device(&sensor.id)
                    .unwrap_or_else(|| sensor.clone());
                CalibrationRecord {
                    device_id: device.id,
                    display_name: device.display_name,
                    firmware_version: device.firmware_version,
                    reference_identity: identity.clone(),
                    sweep: request.sweep.clone(),
                    steps,
                }
            })
            .collect();

        for record in &records {
            sink.store(record).await?;
        }
        self.events.emit(SessionEvent::SweepCompleted {
            records: records.clone(),
        });
        Ok(records)
    }

    async fn connect_peripherals(
        &mut self,
        request: &StartRequest,
        is_active: &ActivePredicate,
    ) -> Result<Vec<PeripheralDevice>, SessionError> {
        let known: HashMap<&str, &DiscoveredDevice> = request
            .known_devices
            .iter()
            .map(|d| (d.id.as_str(), d))
            .collect();
        let lookup = |id: &str| known.get(id).map(|d| (*d).clone());

        let manager = self.peripherals.clone();
        let connect = manager.connect_sequential(&request.device_ids, lookup, is_active);
        tokio::pin!(connect);

        let report = loop {
            tokio::select! {
                report = &mut connect => break report,
                Ok(event) = self.peripheral_events.recv() => {
                    self.events.emit(SessionEvent::Peripheral(event));
                }
            }
        };
        self.forward_peripheral_events();

        for failure in &report.failed {
            warn!("{failure}");
        }
        if report.cancelled {
            return Err(SessionError::Cancelled);
        }
        if report.successful.is_empty() {
            return Err(SessionError::NoPeripherals {
                failed: report.failed.len(),
            });
        }
        if report.is_partial() {
            let failed: Vec<_> = report.failed.iter().map(|f| f.id.clone()).collect();
            match request.policy {
                PartialConnectionPolicy::AbortOnPartial => {
                    return Err(SessionError::PartialConnection { failed })
                }
                PartialConnectionPolicy::ProceedWithConnected => info!(
                    "Continuing with {} sensor(s), {:?} unavailable",
                    report.successful.len(),
                    failed
                ),
            }
        }
        Ok(report.successful)
    }

    /// Confirm the reference reads zero, venting once if it does not.
    async fn ensure_zero(&self, is_active: &ActivePredicate) -> Result<(), SessionError> {
        if self.controller.check_zero_pressure().await? {
            return Ok(());
        }

        info!("Venting to zero before sweeping");
        self.controller.set_pressure(0.0, false, is_active).await?;
        if self.controller.check_zero_pressure().await? {
            return Ok(());
        }
        Err(SessionError::NotAtZero {
            measured: self.controller.read_pressure().await?,
            tolerance: self.controller.config().instrument_tolerance,
        })
    }

    /// Walk the sweep, reading every sensor at each settled step.
    ///
    /// Returns one measurement series per sensor, in `sensors` order.
    async fn run_sweep(
        &mut self,
        mut scheduler: SweepScheduler,
        sensors: &[PeripheralDevice],
        is_active: &ActivePredicate,
    ) -> Result<Vec<Vec<StepMeasurement>>, SessionError> {
        let controller = self.controller.clone();
        let mut series = vec![Vec::new(); sensors.len()];

        self.events.emit(SessionEvent::PhaseChanged {
            phase: Phase::Increasing,
        });
        while !scheduler.is_complete() {
            self.check_active(is_active)?;
            let Some(ready) = scheduler.advance(&controller, is_active).await? else {
                break;
            };
            self.current_step_index = scheduler.current_step_index();
            self.increasing_phase = scheduler.is_increasing_phase();

            if ready.phase_changed {
                info!("Sweep entering {} phase", ready.step.phase);
                self.events.emit(SessionEvent::PhaseChanged {
                    phase: ready.step.phase,
                });
            }

            let reference = controller.read_pressure().await?;
            let mut readings = Vec::with_capacity(sensors.len());
            for (sensor, steps) in sensors.iter().zip(series.iter_mut()) {
                let reading = match self.peripherals.read_pressure(&sensor.id).await {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!("Step {}: {err}", ready.step.index);
                        None
                    }
                };
                steps.push(StepMeasurement {
                    index: ready.step.index,
                    phase: ready.step.phase,
                    nominal: ready.step.pressure,
                    reference,
                    sensor: reading,
                });
                readings.push((sensor.id.clone(), reading));
            }

            self.events.emit(SessionEvent::StepReady {
                step: ready.step,
                reference,
                readings,
            });
        }

        info!("Sweep complete: {} step(s)", scheduler.total_steps());
        Ok(series)
    }

    fn check_active(&self, is_active: &ActivePredicate) -> Result<(), SessionError> {
        if is_active() {
            Ok(())
        } else {
            info!("Session cancelled in {}", self.state);
            Err(SessionError::Cancelled)
        }
    }

    fn forward_peripheral_events(&mut self) {
        while let Ok(event) = self.peripheral_events.try_recv() {
            self.events.emit(SessionEvent::Peripheral(event));
        }
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("Session: {from} -> {to}");
        self.state = to;
        self.events.emit(SessionEvent::StateChanged { from, to });
    }
}
