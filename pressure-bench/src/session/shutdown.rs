use std::sync::Arc;

use hardware::pace::PressureController;
use hardware::sensor::PeripheralConnectionManager;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Releases session hardware in a fixed order: instrument link first, then every
/// peripheral. Each resource is released at most once.
#[derive(Default)]
pub struct ShutdownSequence {
    instrument: Option<Arc<PressureController>>,
    peripherals: Option<Arc<PeripheralConnectionManager>>,
    released: bool,
}

impl ShutdownSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_instrument(&mut self, controller: Arc<PressureController>) {
        self.instrument = Some(controller);
        self.released = false;
    }

    pub fn register_peripherals(&mut self, manager: Arc<PeripheralConnectionManager>) {
        self.peripherals = Some(manager);
        self.released = false;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub async fn release(&mut self) {
        release(self.instrument.take(), self.peripherals.take()).await;
        self.released = true;
    }
}

async fn release(
    instrument: Option<Arc<PressureController>>,
    peripherals: Option<Arc<PeripheralConnectionManager>>,
) {
    if let Some(controller) = instrument {
        match controller.disconnect().await {
            Ok(()) => info!("Pressure reference released"),
            Err(err) => warn!("Releasing pressure reference: {err}"),
        }
    }
    if let Some(manager) = peripherals {
        manager.disconnect_all().await;
        info!("Peripherals released");
    }
}

impl Drop for ShutdownSequence {
    fn drop(&mut self) {
        let instrument = self.instrument.take();
        let peripherals = self.peripherals.take();
        if instrument.is_none() && peripherals.is_none() {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                debug!("Shutdown sequence dropped unreleased, releasing in background");
                handle.spawn(release(instrument, peripherals));
            }
            Err(_) => warn!("Shutdown sequence dropped outside a runtime; hardware not released"),
        }
    }
}
