//! In-memory wireless transport.
//!
//! Every simulated sensor reads the shared manifold pressure plus an optional per-device
//! offset. Connection failures, disconnect failures and unreadable details can be
//! scripted per device, and every call is recorded for inspection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use uuid::Uuid;

use super::characteristics;
use super::{DiscoveredDevice, PeripheralTransport, TransportError};
use crate::pace::SimulatedManifold;

#[derive(Debug, Default)]
struct State {
    devices: Vec<DiscoveredDevice>,
    connected: HashSet<String>,
    /// Remaining connect attempts that will fail, per device.
    failing_connects: HashMap<String, u32>,
    failing_disconnects: HashSet<String>,
    failing_details: HashSet<String>,
    offsets: HashMap<String, f64>,
    connect_latency: Duration,
    connect_attempts: Vec<String>,
    disconnect_calls: Vec<String>,
    in_flight: u32,
    max_in_flight: u32,
}

#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    manifold: SimulatedManifold,
    state: Arc<Mutex<State>>,
}

impl SimulatedTransport {
    pub const FIRMWARE: &'static str = "2.4.1";

    pub fn new(manifold: SimulatedManifold) -> Self {
        Self {
            manifold,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Transport advertising one sensor per id, named `PS-<id>`, weakest signal first.
    pub fn with_devices(manifold: SimulatedManifold, ids: &[&str]) -> Self {
        let transport = Self::new(manifold);
        for (index, id) in ids.iter().enumerate() {
            let offset = i16::try_from(index).unwrap_or(i16::MAX).saturating_mul(5);
            transport.add_device(DiscoveredDevice {
                id: id.to_string(),
                name: format!("PS-{id}"),
                address: format!("C0:FF:EE:00:00:{index:02X}"),
                rssi: (-90_i16).saturating_add(offset),
            });
        }
        transport
    }

    pub fn add_device(&self, device: DiscoveredDevice) {
        self.lock().devices.push(device);
    }

    /// Fail the next `count` connects to `id`. `u32::MAX` fails forever.
    pub fn fail_connects(&self, id: &str, count: u32) {
        self.lock().failing_connects.insert(id.to_string(), count);
    }

    pub fn fail_disconnects(&self, id: &str) {
        self.lock().failing_disconnects.insert(id.to_string());
    }

    pub fn fail_detail_reads(&self, id: &str) {
        self.lock().failing_details.insert(id.to_string());
    }

    /// Sensor `id` reads `offset` above the manifold.
    pub fn set_reading_offset(&self, id: &str, offset: f64) {
        self.lock().offsets.insert(id.to_string(), offset);
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.lock().connect_latency = latency;
    }

    /// Ids passed to `connect`, in call order.
    pub fn connect_attempts(&self) -> Vec<String> {
        self.lock().connect_attempts.clone()
    }

    pub fn disconnect_calls(&self) -> Vec<String> {
        self.lock().disconnect_calls.clone()
    }

    /// Largest number of connects that were ever in progress at once.
    pub fn max_concurrent_connects(&self) -> u32 {
        self.lock().max_in_flight
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.lock().connected.contains(id)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PeripheralTransport for SimulatedTransport {
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        sleep(duration).await;
        Ok(self.lock().devices.clone())
    }

    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        let latency = {
            let mut state = self.lock();
            state.connect_attempts.push(id.to_string());
            if !state.devices.iter().any(|d| d.id == id) {
                return Err(TransportError::NotFound { id: id.to_string() });
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.connect_latency
        };

        if !latency.is_zero() {
            sleep(latency).await;
        }

        let mut state = self.lock();
        state.in_flight -= 1;
        if let Some(remaining) = state.failing_connects.get_mut(id) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(TransportError::ConnectFailed {
                    id: id.to_string(),
                    reason: "simulated stack error".to_string(),
                });
            }
        }
        state.connected.insert(id.to_string());
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.disconnect_calls.push(id.to_string());
        state.connected.remove(id);
        if state.failing_disconnects.contains(id) {
            return Err(TransportError::Adapter(format!(
                "simulated disconnect failure for {id}"
            )));
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        id: &str,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let state = self.lock();
        if !state.connected.contains(id) {
            return Err(TransportError::NotConnected { id: id.to_string() });
        }

        if characteristic == characteristics::PRESSURE_READING {
            let offset = state.offsets.get(id).copied().unwrap_or(0.0);
            let value = (self.manifold.pressure() + offset) as f32;
            return Ok(value.to_le_bytes().to_vec());
        }

        if state.failing_details.contains(id) {
            return Err(TransportError::Read {
                id: id.to_string(),
                characteristic,
                reason: "simulated read failure".to_string(),
            });
        }

        let mut text = if characteristic == characteristics::FIRMWARE_REVISION {
            Self::FIRMWARE.to_string()
        } else if characteristic == characteristics::DEVICE_NAME {
            format!("PS-{id}")
        } else {
            return Err(TransportError::Read {
                id: id.to_string(),
                characteristic,
                reason: "unknown characteristic".to_string(),
            });
        };
        // Real sensors pad fixed-size text fields with NULs
        text.push_str("\0\0\0");
        Ok(text.into_bytes())
    }
}
