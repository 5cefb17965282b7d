//! Pressure reference controller.
//!
//! [`PressureController`] implements the calibration-facing operations of a PACE-style
//! pressure reference on top of an [`InstrumentDriver`]:
//!
//! - **Prerequisites**: [`run_prerequisites`](PressureController::run_prerequisites) checks
//!   output state, pressure mode, static mode and tolerance, enforcing and re-verifying
//!   only the ones that fail
//! - **Setpoints**: [`set_pressure`](PressureController::set_pressure) commands a target,
//!   waits for the settled bit and verifies the measured pressure
//! - **Zero**: [`check_zero_pressure`](PressureController::check_zero_pressure) and the
//!   zero path of `set_pressure`
//!
//! Every wait takes an activity predicate that is sampled before each sub-step. When it
//! turns false the operation stops scheduling instrument commands; a command already on
//! the wire is allowed to finish.

mod args;
pub mod commands;
mod driver;
mod prerequisites;
mod simulated;

pub use args::{InstrumentArgs, DEFAULT_INSTRUMENT_HOST};
pub use driver::{DriverKind, InstrumentDriver, RealInstrument};
pub use prerequisites::{standard_prerequisites, PrerequisiteCheck};
pub use simulated::{SimulatedInstrument, SimulatedManifold, SIMULATED_IDN};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::scpi::LinkError;
pub use crate::ActivePredicate;

/// Errors raised by the pressure controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PaceError {
    #[error(transparent)]
    Link(#[from] LinkError),

    /// A setting still read back wrong after one enforce and recheck.
    #[error("prerequisite `{name}` not satisfied: `{command}` returned {observed:?} after enforcement, expected {expected:?}")]
    Prerequisite {
        name: String,
        command: String,
        expected: String,
        observed: String,
    },

    #[error("pressure set to {target} settled at {measured} (difference {difference:.4}, tolerance {tolerance})")]
    PressureSet {
        target: f64,
        measured: f64,
        difference: f64,
        tolerance: f64,
    },

    #[error("unexpected response to `{command}`: {response:?}")]
    InvalidResponse { command: String, response: String },

    /// The session stopped while the operation was waiting.
    #[error("{operation} cancelled")]
    Cancelled { operation: String },
}

impl PaceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PaceError::Cancelled { .. })
    }
}

pub type PaceResult<T> = Result<T, PaceError>;

/// Tolerances and timing used by the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Tolerance programmed into the instrument, also the "at zero" threshold.
    pub instrument_tolerance: f64,
    /// Maximum |measured - target| accepted after a verified set.
    pub pressure_tolerance: f64,
    /// Status register poll period while waiting for settle.
    pub settle_poll_interval: Duration,
    /// Delay between an enforce command and its recheck.
    pub enforce_settle_delay: Duration,
    /// Pressure poll period while venting to zero.
    pub zero_poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instrument_tolerance: 0.1,
            pressure_tolerance: 0.5,
            settle_poll_interval: Duration::from_secs(2),
            enforce_settle_delay: Duration::from_millis(500),
            zero_poll_interval: Duration::from_secs(1),
        }
    }
}

/// How a cancellable routine ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Ran to the end. `enforced` names the prerequisites that had to be corrected.
    Completed { enforced: Vec<String> },
    Cancelled,
}

/// Calibration operations on a pressure reference.
pub struct PressureController {
    driver: Arc<dyn InstrumentDriver>,
    config: ControllerConfig,
}

impl PressureController {
    pub fn new(driver: Arc<dyn InstrumentDriver>, config: ControllerConfig) -> Self {
        Self { driver, config }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Connect and probe the instrument with `*IDN?`.
    pub async fn connect(&self) -> PaceResult<String> {
        self.driver.connect().await?;
        self.identify().await
    }

    pub async fn disconnect(&self) -> PaceResult<()> {
        self.driver.disconnect().await?;
        Ok(())
    }

    pub async fn identify(&self) -> PaceResult<String> {
        let idn = self.driver.query(commands::IDENTIFY).await?;
        info!("Pressure reference {}: {}", self.driver.describe(), idn);
        Ok(idn)
    }

    /// Check, enforce and re-verify every prerequisite in order.
    ///
    /// Returns [`Progress::Cancelled`] without error if `is_active` turns false between
    /// sub-steps. A setting that still fails after enforcement is fatal and not retried.
    pub async fn run_prerequisites(&self, is_active: &ActivePredicate) -> PaceResult<Progress> {
        let mut enforced = Vec::new();

        for check in standard_prerequisites(self.config.instrument_tolerance) {
            if !is_active() {
                info!("Prerequisite checks cancelled before {}", check.name);
                return Ok(Progress::Cancelled);
            }

            let response = self.driver.query(check.check_command).await?;
            if check.validate(&response) {
                debug!("{} OK ({})", check.name, response);
                continue;
            }

            info!(
                "{} is {:?}, expected {:?}; sending `{}`",
                check.name, response, check.expected, check.enforce_command
            );
            if !is_active() {
                info!("Prerequisite checks cancelled before enforcing {}", check.name);
                return Ok(Progress::Cancelled);
            }
            self.driver.write(&check.enforce_command).await?;
            sleep(self.config.enforce_settle_delay).await;

            if !is_active() {
                info!("Prerequisite checks cancelled before rechecking {}", check.name);
                return Ok(Progress::Cancelled);
            }
            let recheck = self.driver.query(check.check_command).await?;
            if !check.validate(&recheck) {
                return Err(PaceError::Prerequisite {
                    name: check.name.to_string(),
                    command: check.check_command.to_string(),
                    expected: check.expected.clone(),
                    observed: recheck,
                });
            }
            enforced.push(check.name.to_string());
        }

        Ok(Progress::Completed { enforced })
    }

    /// Command `target` and wait for it to settle.
    ///
    /// A target of zero takes the vent path: the setpoint is written and the pressure
    /// itself is polled until it drops below the instrument tolerance. Any other target
    /// waits on the settled status bit and, with `verify`, rejects a reading further than
    /// `pressure_tolerance` from the target.
    pub async fn set_pressure(
        &self,
        target: f64,
        verify: bool,
        is_active: &ActivePredicate,
    ) -> PaceResult<()> {
        let tolerance = verify.then_some(self.config.pressure_tolerance);
        self.command_pressure(target, tolerance, is_active).await
    }

    /// [`set_pressure`](Self::set_pressure) with verification against `tolerance`.
    pub async fn set_pressure_within(
        &self,
        target: f64,
        tolerance: f64,
        is_active: &ActivePredicate,
    ) -> PaceResult<()> {
        self.command_pressure(target, Some(tolerance), is_active).await
    }

    async fn command_pressure(
        &self,
        target: f64,
        tolerance: Option<f64>,
        is_active: &ActivePredicate,
    ) -> PaceResult<()> {
        if !is_active() {
            return Err(cancelled(format!("setting {target}")));
        }

        self.driver.write(&commands::set_amplitude(target)).await?;

        if target == 0.0 {
            return self.wait_for_zero(is_active).await;
        }

        self.wait_for_settle(&format!("{target}"), is_active).await?;

        if let Some(tolerance) = tolerance {
            let measured = self.read_pressure().await?;
            let difference = (measured - target).abs();
            if difference > tolerance {
                return Err(PaceError::PressureSet {
                    target,
                    measured,
                    difference,
                    tolerance,
                });
            }
            debug!("Pressure {measured} within {difference:.4} of {target}");
        }
        Ok(())
    }

    /// Poll the operation status register until the settled bit is set.
    ///
    /// The first poll happens one interval after the call. `is_active` is sampled before
    /// every poll; if it turns false the wait stops with [`PaceError::Cancelled`]. A poll
    /// that times out counts as "not settled yet" rather than a failure.
    pub async fn wait_for_settle(
        &self,
        target_description: &str,
        is_active: &ActivePredicate,
    ) -> PaceResult<()> {
        let period = self.config.settle_poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut polls = 0u32;
        loop {
            if !is_active() {
                return Err(cancelled(format!("settle at {target_description}")));
            }
            ticker.tick().await;
            if !is_active() {
                return Err(cancelled(format!("settle at {target_description}")));
            }

            polls += 1;
            match self.read_status().await {
                Ok(status) if status & commands::SETTLED_BIT != 0 => {
                    info!("Settled at {target_description} after {polls} poll(s)");
                    return Ok(());
                }
                Ok(status) => debug!("Waiting for {target_description}: status {status}"),
                Err(PaceError::Link(err @ LinkError::Timeout { .. })) => {
                    warn!("Status poll while settling at {target_description}: {err}")
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn wait_for_zero(&self, is_active: &ActivePredicate) -> PaceResult<()> {
        let period = self.config.zero_poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !is_active() {
                return Err(cancelled("vent to zero".to_string()));
            }
            ticker.tick().await;
            if !is_active() {
                return Err(cancelled("vent to zero".to_string()));
            }

            let pressure = self.read_pressure().await?;
            if pressure < self.config.instrument_tolerance {
                info!("Vented to zero ({pressure})");
                return Ok(());
            }
            debug!("Venting: {pressure}");
        }
    }

    /// True iff the measured pressure is below the instrument tolerance.
    pub async fn check_zero_pressure(&self) -> PaceResult<bool> {
        let pressure = self.read_pressure().await?;
        let at_zero = pressure < self.config.instrument_tolerance;
        info!(
            "Zero check: {pressure} ({})",
            if at_zero { "ok" } else { "not at zero" }
        );
        Ok(at_zero)
    }

    pub async fn read_pressure(&self) -> PaceResult<f64> {
        let response = self.driver.query(commands::MEASURE_PRESSURE).await?;
        parse_number(commands::MEASURE_PRESSURE, &response)
    }

    /// Operation condition register.
    pub async fn read_status(&self) -> PaceResult<u32> {
        let response = self.driver.query(commands::OPERATION_CONDITION).await?;
        let value = parse_number(commands::OPERATION_CONDITION, &response)?;
        if value < 0.0 || value.fract() != 0.0 {
            return Err(PaceError::InvalidResponse {
                command: commands::OPERATION_CONDITION.to_string(),
                response,
            });
        }
        Ok(value as u32)
    }

    pub async fn query(&self, command: &str) -> PaceResult<String> {
        Ok(self.driver.query(command).await?)
    }

    pub async fn write(&self, command: &str) -> PaceResult<()> {
        Ok(self.driver.write(command).await?)
    }
}

fn parse_number(command: &str, response: &str) -> PaceResult<f64> {
    response
        .trim()
        .parse::<f64>()
        .map_err(|_| PaceError::InvalidResponse {
            command: command.to_string(),
            response: response.to_string(),
        })
}

fn cancelled(operation: String) -> PaceError {
    info!("{operation} cancelled");
    PaceError::Cancelled { operation }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use approx::assert_relative_eq;

    fn always() -> bool {
        true
    }

    async fn controller(sim: &SimulatedInstrument) -> PressureController {
        let controller =
            PressureController::new(Arc::new(sim.clone()), ControllerConfig::default());
        controller.connect().await.unwrap();
        controller
    }

    async fn ready(sim: &SimulatedInstrument) -> PressureController {
        let controller = controller(sim).await;
        controller.run_prerequisites(&always).await.unwrap();
        controller
    }

    #[tokio::test(start_paused = true)]
    async fn test_prerequisites_enforce_only_failing_settings() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default());
        let controller = controller(&sim).await;

        let first = controller.run_prerequisites(&always).await.unwrap();
        assert_eq!(
            first,
            Progress::Completed {
                enforced: vec![
                    "Output State".to_string(),
                    "Pressure Mode".to_string(),
                    "Static Mode".to_string(),
                    "Tolerance".to_string(),
                ]
            }
        );

        let second = controller.run_prerequisites(&always).await.unwrap();
        assert_eq!(second, Progress::Completed { enforced: vec![] });
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_mode_enforced_then_verified() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default());
        let controller = controller(&sim).await;
        controller.run_prerequisites(&always).await.unwrap();

        let log = sim.command_log();
        let enforce = log
            .iter()
            .position(|c| c == "SOURce:PRESsure:STATic 0")
            .unwrap();
        assert_eq!(log[enforce - 1], "SOURce:PRESsure:STATic?");
        assert_eq!(log[enforce + 1], "SOURce:PRESsure:STATic?");
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_mode_that_will_not_clear_is_fatal() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default())
            .with_stuck_setting("SOURce:PRESsure:STATic");
        let controller = controller(&sim).await;

        let err = controller.run_prerequisites(&always).await.unwrap_err();
        assert_eq!(
            err,
            PaceError::Prerequisite {
                name: "Static Mode".to_string(),
                command: "SOURce:PRESsure:STATic?".to_string(),
                expected: "0".to_string(),
                observed: "1".to_string(),
            }
        );
        // Nothing after the failed entry runs
        assert!(!sim
            .command_log()
            .iter()
            .any(|c| c.starts_with("SOURce:PRESsure:TOLerance")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prerequisites_return_quietly_when_inactive() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default());
        let controller = controller(&sim).await;
        let before = sim.command_log().len();

        let progress = controller.run_prerequisites(&|| false).await.unwrap();
        assert_eq!(progress, Progress::Cancelled);
        assert_eq!(sim.command_log().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_polls_every_interval() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default()).with_slew_per_poll(4.0);
        let controller = ready(&sim).await;

        let start = Instant::now();
        controller.set_pressure(10.0, true, &always).await.unwrap();
        // 0 -> 4 -> 8 -> 10: settled on the third poll
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_relative_eq!(sim.manifold().pressure(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_timeouts_while_settling_keep_polling() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default());
        let controller = ready(&sim).await;

        sim.set_unresponsive(true);
        let busy = sim.clone();
        tokio::spawn(async move {
            // Polls at 2 s and 4 s go unanswered
            sleep(Duration::from_secs(5)).await;
            busy.set_unresponsive(false);
        });

        let start = Instant::now();
        controller.set_pressure(10.0, true, &always).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(6));

        let polls = sim
            .command_log()
            .iter()
            .filter(|c| c.as_str() == commands::OPERATION_CONDITION)
            .count();
        assert_eq!(polls, 3);
        assert_relative_eq!(controller.read_pressure().await.unwrap(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_accepts_boundary_and_rejects_beyond() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default()).with_reading_offset(0.5);
        let controller = ready(&sim).await;
        controller.set_pressure(10.0, true, &always).await.unwrap();

        let sim = SimulatedInstrument::new(SimulatedManifold::default()).with_reading_offset(0.6);
        let controller = ready(&sim).await;
        let err = controller.set_pressure(10.0, true, &always).await.unwrap_err();
        match err {
            PaceError::PressureSet {
                target,
                measured,
                difference,
                tolerance,
            } => {
                assert_relative_eq!(target, 10.0);
                assert_relative_eq!(measured, 10.6);
                assert_relative_eq!(difference, 0.6, epsilon = 1e-9);
                assert_relative_eq!(tolerance, 0.5);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Without verification the offset is not checked
        controller.set_pressure(15.0, false, &always).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_pressure_within_uses_given_tolerance() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default()).with_reading_offset(0.3);
        let controller = ready(&sim).await;
        controller
            .set_pressure_within(10.0, 0.35, &always)
            .await
            .unwrap();
        let err = controller
            .set_pressure_within(12.0, 0.25, &always)
            .await
            .unwrap_err();
        assert!(matches!(err, PaceError::PressureSet { tolerance, .. } if tolerance == 0.25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_settle_rejects_within_one_poll() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default()).with_slew_per_poll(1.0);
        let controller = ready(&sim).await;

        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            flag.store(false, Ordering::SeqCst);
        });

        let start = Instant::now();
        let is_active = move || active.load(Ordering::SeqCst);
        let err = controller
            .set_pressure(20.0, true, &is_active)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        let limit = Duration::from_secs(3) + controller.config().settle_poll_interval;
        assert!(start.elapsed() <= limit);

        let status_polls = sim
            .command_log()
            .iter()
            .filter(|c| c.as_str() == commands::OPERATION_CONDITION)
            .count();
        assert_eq!(status_polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_uses_vent_path() {
        let manifold = SimulatedManifold::new(12.0);
        let sim = SimulatedInstrument::new(manifold.clone());
        let controller = ready(&sim).await;
        let before = sim.command_log().len();

        controller.set_pressure(0.0, true, &always).await.unwrap();

        let log = sim.command_log()[before..].to_vec();
        assert_eq!(log[0], "SOURce:PRESsure:LEVel:IMMediate:AMPLitude 0");
        assert!(log.iter().all(|c| c != commands::OPERATION_CONDITION));
        assert!(controller.check_zero_pressure().await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_check_is_strictly_below_tolerance() {
        let manifold = SimulatedManifold::new(0.05);
        let sim = SimulatedInstrument::new(manifold.clone());
        let controller = controller(&sim).await;
        assert!(controller.check_zero_pressure().await.unwrap());

        manifold.set_pressure(0.1);
        assert!(!controller.check_zero_pressure().await.unwrap());

        manifold.set_pressure(3.0);
        assert!(!controller.check_zero_pressure().await.unwrap());
    }

    #[test]
    fn test_unparseable_reading_is_invalid_response() {
        let err = parse_number("MEASure:PRESsure?", "ERR").unwrap_err();
        assert!(matches!(err, PaceError::InvalidResponse { .. }));
    }
}
