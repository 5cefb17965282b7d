//! Ascending-then-descending pressure sweep.
//!
//! [`SweepScheduler`] walks a [`SweepConfig`] one setpoint at a time. Steps are derived
//! from the configuration and the current index, never stored:
//!
//! - index `i < increasing.len()` is `increasing[i]` in [`Phase::Increasing`]
//! - otherwise it is `decreasing[i - increasing.len()]` in [`Phase::Decreasing`]
//!
//! The phase therefore flips exactly once, at index `increasing.len()`.

mod config;

pub use config::{SweepArgs, SweepConfig, SweepConfigError};

use std::fmt;

use hardware::pace::{ActivePredicate, PaceResult, PressureController};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Increasing,
    Decreasing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Increasing => f.write_str("increasing"),
            Phase::Decreasing => f.write_str("decreasing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepStep {
    pub index: usize,
    pub pressure: f64,
    pub phase: Phase,
}

/// Reported by [`SweepScheduler::advance`] once a step has settled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReady {
    pub step: SweepStep,
    /// This is the first step of the descending phase.
    pub phase_changed: bool,
    /// This was the last step.
    pub completed: bool,
}

pub struct SweepScheduler {
    config: SweepConfig,
    current_step_index: usize,
}

impl SweepScheduler {
    /// Validate `config` and position the scheduler before the first step.
    pub fn start(config: SweepConfig) -> Result<Self, SweepConfigError> {
        config.validate()?;
        info!(
            "Sweep: {} increasing, {} decreasing step(s), tolerance {}",
            config.increasing_steps.len(),
            config.decreasing_steps.len(),
            config.tolerance_absolute
        );
        Ok(Self {
            config,
            current_step_index: 0,
        })
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn total_steps(&self) -> usize {
        self.config.total_steps()
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn is_increasing_phase(&self) -> bool {
        self.current_step_index < self.config.increasing_steps.len()
    }

    pub fn is_complete(&self) -> bool {
        self.current_step_index >= self.total_steps()
    }

    pub fn step_at(&self, index: usize) -> Option<SweepStep> {
        let rising = &self.config.increasing_steps;
        if index < rising.len() {
            return Some(SweepStep {
                index,
                pressure: rising[index],
                phase: Phase::Increasing,
            });
        }
        self.config
            .decreasing_steps
            .get(index - rising.len())
            .map(|&pressure| SweepStep {
                index,
                pressure,
                phase: Phase::Decreasing,
            })
    }

    /// Next step to execute, or `None` once the sweep is complete.
    pub fn current_step(&self) -> Option<SweepStep> {
        self.step_at(self.current_step_index)
    }

    pub fn steps(&self) -> impl Iterator<Item = SweepStep> + '_ {
        (0..self.total_steps()).filter_map(|index| self.step_at(index))
    }

    /// Command the current step, wait for it to settle and move to the next.
    ///
    /// The settled reading must be within `tolerance_absolute` of the setpoint. Issues
    /// exactly one setpoint per call. Returns `None` if the sweep was already
    /// complete. On error the index is not advanced.
    pub async fn advance(
        &mut self,
        controller: &PressureController,
        is_active: &ActivePredicate,
    ) -> PaceResult<Option<StepReady>> {
        let Some(step) = self.current_step() else {
            return Ok(None);
        };

        info!(
            "Step {}/{}: {} ({})",
            step.index + 1,
            self.total_steps(),
            step.pressure,
            step.phase
        );
        controller
            .set_pressure_within(step.pressure, self.config.tolerance_absolute, is_active)
            .await?;

        self.current_step_index += 1;
        Ok(Some(StepReady {
            step,
            phase_changed: step.index == self.config.increasing_steps.len(),
            completed: self.is_complete(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hardware::pace::{
        ControllerConfig, InstrumentDriver, SimulatedInstrument, SimulatedManifold,
    };

    fn always() -> bool {
        true
    }

    #[test]
    fn test_default_profile_steps() {
        let scheduler = SweepScheduler::start(SweepConfig::default()).unwrap();
        assert_eq!(scheduler.total_steps(), 9);

        let steps: Vec<_> = scheduler.steps().collect();
        let pressures: Vec<_> = steps.iter().map(|s| s.pressure).collect();
        assert_eq!(
            pressures,
            [5.0, 10.0, 15.0, 20.0, 25.0, 20.0, 15.0, 10.0, 5.0]
        );
        for step in &steps[..5] {
            assert_eq!(step.phase, Phase::Increasing);
        }
        for step in &steps[5..] {
            assert_eq!(step.phase, Phase::Decreasing);
        }

        let flips: Vec<_> = steps
            .windows(2)
            .filter(|w| w[0].phase != w[1].phase)
            .map(|w| w[1].index)
            .collect();
        assert_eq!(flips, [5]);
        assert_eq!(scheduler.step_at(9), None);
    }

    #[test]
    fn test_start_rejects_missing_phase() {
        let config = SweepConfig {
            decreasing_steps: vec![],
            ..SweepConfig::default()
        };
        assert!(matches!(
            SweepScheduler::start(config),
            Err(SweepConfigError::MissingDecreasingSteps)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_advance_walks_profile_in_order() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default());
        sim.connect().await.unwrap();
        let controller = PressureController::new(Arc::new(sim.clone()), ControllerConfig::default());
        controller.run_prerequisites(&always).await.unwrap();

        let config = SweepConfig {
            increasing_steps: vec![5.0, 10.0],
            decreasing_steps: vec![5.0],
            tolerance_absolute: 0.5,
        };
        let mut scheduler = SweepScheduler::start(config).unwrap();
        assert!(scheduler.is_increasing_phase());

        let first = scheduler.advance(&controller, &always).await.unwrap().unwrap();
        assert_eq!(first.step.pressure, 5.0);
        assert!(!first.phase_changed);
        assert!(!first.completed);

        let second = scheduler.advance(&controller, &always).await.unwrap().unwrap();
        assert!(!second.phase_changed);
        assert!(!scheduler.is_increasing_phase());

        let third = scheduler.advance(&controller, &always).await.unwrap().unwrap();
        assert!(third.phase_changed);
        assert!(third.completed);
        assert_eq!(scheduler.current_step_index(), 3);

        assert_eq!(scheduler.advance(&controller, &always).await.unwrap(), None);

        let setpoints: Vec<_> = sim
            .command_log()
            .into_iter()
            .filter(|c| c.starts_with("SOURce:PRESsure:LEVel"))
            .collect();
        assert_eq!(
            setpoints,
            [
                "SOURce:PRESsure:LEVel:IMMediate:AMPLitude 5",
                "SOURce:PRESsure:LEVel:IMMediate:AMPLitude 10",
                "SOURce:PRESsure:LEVel:IMMediate:AMPLitude 5",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_step_does_not_advance() {
        let sim = SimulatedInstrument::new(SimulatedManifold::default()).with_reading_offset(2.0);
        sim.connect().await.unwrap();
        let controller = PressureController::new(Arc::new(sim.clone()), ControllerConfig::default());
        controller.run_prerequisites(&always).await.unwrap();

        let mut scheduler = SweepScheduler::start(SweepConfig::default()).unwrap();
        assert!(scheduler.advance(&controller, &always).await.is_err());
        assert_eq!(scheduler.current_step_index(), 0);
    }
}
