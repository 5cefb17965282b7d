use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::simulated::{SimulatedInstrument, SimulatedManifold};
use crate::scpi::{LinkConfig, LinkResult, ScpiLink};

/// Command-level access to a pressure reference.
///
/// [`PressureController`](super::PressureController) only talks to the instrument through
/// this trait, so the same calibration logic runs against hardware or the in-memory model.
#[async_trait]
pub trait InstrumentDriver: Send + Sync {
    async fn connect(&self) -> LinkResult<()>;

    /// Release the instrument. Must be safe to call repeatedly.
    async fn disconnect(&self) -> LinkResult<()>;

    /// Send a query and return the trimmed response line.
    async fn query(&self, command: &str) -> LinkResult<String>;

    /// Send a command that produces no response.
    async fn write(&self, command: &str) -> LinkResult<()>;

    fn is_connected(&self) -> bool;

    /// Short label for logs, e.g. the instrument address.
    fn describe(&self) -> String;
}

/// Driver backed by a TCP SCPI link.
pub struct RealInstrument {
    link: ScpiLink,
}

impl RealInstrument {
    /// Create the driver. The link task starts immediately; the socket opens on `connect`.
    pub fn new(config: LinkConfig) -> Self {
        Self {
            link: ScpiLink::new(config),
        }
    }

    /// Underlying link, for subscribing to lifecycle events.
    pub fn link(&self) -> &ScpiLink {
        &self.link
    }
}

#[async_trait]
impl InstrumentDriver for RealInstrument {
    async fn connect(&self) -> LinkResult<()> {
        self.link.connect().await
    }

    async fn disconnect(&self) -> LinkResult<()> {
        self.link.disconnect().await
    }

    async fn query(&self, command: &str) -> LinkResult<String> {
        let response = self.link.query(command).await?;
        Ok(response.trim().to_string())
    }

    async fn write(&self, command: &str) -> LinkResult<()> {
        self.link.write(command).await
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn describe(&self) -> String {
        self.link.config().addr()
    }
}

/// Which instrument backend a session runs against. Chosen once, at construction.
#[derive(Debug, Clone)]
pub enum DriverKind {
    Real(LinkConfig),
    Simulated(SimulatedManifold),
}

impl DriverKind {
    pub fn build(&self) -> Arc<dyn InstrumentDriver> {
        match self {
            DriverKind::Real(config) => {
                info!("Using instrument at {}", config.addr());
                Arc::new(RealInstrument::new(config.clone()))
            }
            DriverKind::Simulated(manifold) => {
                info!("Using simulated pressure reference");
                Arc::new(SimulatedInstrument::new(manifold.clone()))
            }
        }
    }
}
