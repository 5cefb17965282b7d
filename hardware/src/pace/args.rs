use std::time::Duration;

use clap::Args;

use super::{DriverKind, SimulatedManifold};
use crate::scpi::{LinkConfig, DEFAULT_PORT};

/// Default pressure reference address on the bench network.
pub const DEFAULT_INSTRUMENT_HOST: &str = "192.168.1.50";

/// Command-line arguments selecting the pressure reference.
///
/// Use with `#[command(flatten)]` in your CLI args struct.
#[derive(Args, Debug, Clone)]
pub struct InstrumentArgs {
    #[arg(
        long,
        default_value = DEFAULT_INSTRUMENT_HOST,
        help = "Pressure reference host name or IP address",
        long_help = "Host name or IP address of the pressure reference. The instrument is \
            controlled with newline-terminated SCPI over a raw TCP socket."
    )]
    pub instrument_host: String,

    #[arg(
        long,
        default_value_t = DEFAULT_PORT,
        help = "Pressure reference SCPI port"
    )]
    pub instrument_port: u16,

    #[arg(
        long,
        default_value = "5000",
        help = "Query response timeout in milliseconds",
        long_help = "How long to wait for the reply to a single query before reporting the \
            instrument as busy. Independent of how long a setpoint may take to settle."
    )]
    pub response_timeout_ms: u64,

    #[arg(
        long,
        help = "Use the in-memory simulated pressure reference",
        long_help = "Run against a simulated pressure reference instead of hardware. The \
            simulation models output state, control mode, static mode, tolerance and a \
            slewing setpoint."
    )]
    pub simulate_instrument: bool,
}

impl InstrumentArgs {
    pub fn link_config(&self) -> LinkConfig {
        let mut config = LinkConfig::new(&self.instrument_host, self.instrument_port);
        config.response_timeout = Duration::from_millis(self.response_timeout_ms);
        config
    }

    /// Backend selected by the flags. `manifold` is only used when simulating.
    pub fn driver_kind(&self, manifold: SimulatedManifold) -> DriverKind {
        if self.simulate_instrument {
            DriverKind::Simulated(manifold)
        } else {
            DriverKind::Real(self.link_config())
        }
    }
}
