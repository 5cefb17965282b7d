//! In-memory pressure reference.
//!
//! Models the settings the calibration flow touches (output state, pressure mode,
//! static mode, tolerance) and a setpoint that the manifold pressure slews towards a
//! fixed amount on every status or pressure query. The manifold is shared with the
//! simulated sensors so they read what the reference produces.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::commands::{self, SETTLED_BIT};
use super::driver::InstrumentDriver;
use crate::scpi::{Command, LinkError, LinkResult};

pub const SIMULATED_IDN: &str = "SIMULATED,PACE6000,0000000,1.00";

/// Pressure in the shared test manifold.
#[derive(Debug, Clone, Default)]
pub struct SimulatedManifold {
    pressure: Arc<Mutex<f64>>,
}

impl SimulatedManifold {
    pub fn new(initial: f64) -> Self {
        Self {
            pressure: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn pressure(&self) -> f64 {
        *self.pressure.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_pressure(&self, value: f64) {
        *self.pressure.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

#[derive(Debug)]
struct State {
    connected: bool,
    output_on: bool,
    mode: String,
    static_mode: String,
    tolerance: f64,
    setpoint: f64,
    slew_per_poll: f64,
    reading_offset: f64,
    stuck: HashSet<String>,
    unresponsive: bool,
    log: Vec<String>,
}

/// Simulated instrument.
///
/// A fresh instance starts with output off, measure mode, static mode on and a coarse
/// tolerance, so every prerequisite needs enforcing. It holds whatever pressure the
/// manifold has until a new setpoint is written.
#[derive(Debug, Clone)]
pub struct SimulatedInstrument {
    manifold: SimulatedManifold,
    state: Arc<Mutex<State>>,
}

impl SimulatedInstrument {
    pub fn new(manifold: SimulatedManifold) -> Self {
        let setpoint = manifold.pressure();
        Self {
            manifold,
            state: Arc::new(Mutex::new(State {
                connected: false,
                output_on: false,
                mode: "MEASURE".to_string(),
                static_mode: "1".to_string(),
                tolerance: 0.5,
                setpoint,
                slew_per_poll: f64::INFINITY,
                reading_offset: 0.0,
                stuck: HashSet::new(),
                unresponsive: false,
                log: Vec::new(),
            })),
        }
    }

    /// Limit how far the pressure moves per status/pressure query.
    pub fn with_slew_per_poll(self, slew: f64) -> Self {
        self.lock().slew_per_poll = slew;
        self
    }

    /// Add a fixed error to every pressure reading.
    pub fn with_reading_offset(self, offset: f64) -> Self {
        self.lock().reading_offset = offset;
        self
    }

    /// Ignore writes to `header` (case-insensitive), leaving the setting unchanged.
    pub fn with_stuck_setting(self, header: &str) -> Self {
        self.lock().stuck.insert(header.to_ascii_uppercase());
        self
    }

    /// Stop answering queries, as a busy instrument would.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    /// Every command received, in order.
    pub fn command_log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn manifold(&self) -> &SimulatedManifold {
        &self.manifold
    }

    pub fn setpoint(&self) -> f64 {
        self.lock().setpoint
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the manifold one step towards the setpoint. Returns true once there.
    fn slew(&self, state: &State) -> bool {
        if !state.output_on {
            return false;
        }
        let current = self.manifold.pressure();
        let diff = state.setpoint - current;
        if diff.abs() <= state.slew_per_poll {
            self.manifold.set_pressure(state.setpoint);
            true
        } else {
            self.manifold
                .set_pressure(current + state.slew_per_poll.copysign(diff));
            false
        }
    }

    fn answer(&self, state: &State, header: &str) -> Option<String> {
        let response = match header {
            commands::IDENTIFY => SIMULATED_IDN.to_string(),
            commands::OUTPUT_STATE_QUERY => {
                let value = if state.output_on { "1" } else { "0" };
                value.to_string()
            }
            commands::PRESSURE_MODE_QUERY => state.mode.clone(),
            commands::STATIC_MODE_QUERY => state.static_mode.clone(),
            commands::TOLERANCE_QUERY => format!("{}", state.tolerance),
            commands::MEASURE_PRESSURE => {
                self.slew(state);
                format!("{:.4}", self.manifold.pressure() + state.reading_offset)
            }
            commands::OPERATION_CONDITION => {
                let bits = if self.slew(state) { SETTLED_BIT } else { 0 };
                bits.to_string()
            }
            _ => return None,
        };
        Some(response)
    }

    fn apply(&self, state: &mut State, command: &Command) {
        let header = command.header();
        if state.stuck.contains(&header.to_ascii_uppercase()) {
            debug!("Simulated instrument ignoring `{command}`");
            return;
        }
        let argument = command.text()[header.len()..].trim();

        match header {
            "OUTPut:STATe" => {
                state.output_on = argument.eq_ignore_ascii_case("ON") || argument == "1"
            }
            "OUTPut:PRESsure:MODE" => state.mode = argument.to_ascii_uppercase(),
            "SOURce:PRESsure:STATic" => state.static_mode = argument.to_string(),
            "SOURce:PRESsure:TOLerance" => {
                if let Ok(value) = argument.parse() {
                    state.tolerance = value;
                }
            }
            "SOURce:PRESsure:LEVel:IMMediate:AMPLitude" => {
                if let Ok(value) = argument.parse() {
                    state.setpoint = value;
                }
            }
            _ => debug!("Simulated instrument ignoring unknown command `{command}`"),
        }
    }
}

#[async_trait]
impl InstrumentDriver for SimulatedInstrument {
    async fn connect(&self) -> LinkResult<()> {
        self.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> LinkResult<()> {
        self.lock().connected = false;
        Ok(())
    }

    async fn query(&self, text: &str) -> LinkResult<String> {
        let command = Command::new(text);
        if !command.expects_response() {
            return Err(LinkError::NotAQuery {
                command: text.to_string(),
            });
        }

        let mut state = self.lock();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        state.log.push(text.to_string());

        let response = if state.unresponsive {
            None
        } else {
            self.answer(&state, command.header())
        };
        response.ok_or_else(|| LinkError::Timeout {
            command: text.to_string(),
            timeout: Duration::ZERO,
        })
    }

    async fn write(&self, text: &str) -> LinkResult<()> {
        let command = Command::new(text);
        let mut state = self.lock();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        state.log.push(text.to_string());
        self.apply(&mut state, &command);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}
