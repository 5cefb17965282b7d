//! Wireless pressure sensor peripherals.
//!
//! Sensors are reached through a [`PeripheralTransport`] and managed by a
//! [`PeripheralConnectionManager`], which connects them strictly one at a time with
//! bounded retries and keeps a per-owner registry of their lifecycle state.

pub mod characteristics;
mod manager;
mod simulated;
mod transport;

pub use manager::{ConnectionConfig, PeripheralConnectionManager, PeripheralEvent};
pub use simulated::SimulatedTransport;
pub use transport::PeripheralTransport;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of a peripheral within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Discovered => "discovered",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A sensor seen while scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub address: String,
    pub rssi: i16,
}

/// Registry entry for a peripheral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralDevice {
    pub id: String,
    pub display_name: String,
    pub address: String,
    pub rssi: Option<i16>,
    pub connection_state: ConnectionState,
    pub firmware_version: Option<String>,
}

impl PeripheralDevice {
    pub fn from_discovery(device: &DiscoveredDevice) -> Self {
        Self {
            id: device.id.clone(),
            display_name: device.name.clone(),
            address: device.address.clone(),
            rssi: Some(device.rssi),
            connection_state: ConnectionState::Discovered,
            firmware_version: None,
        }
    }

    /// Entry for an id the caller knows nothing else about.
    pub fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            address: String::new(),
            rssi: None,
            connection_state: ConnectionState::Discovered,
            firmware_version: None,
        }
    }
}

/// Result of a sequential connection batch.
#[derive(Debug, Clone, Default)]
pub struct ConnectionReport {
    /// Connected devices, in request order.
    pub successful: Vec<PeripheralDevice>,
    pub failed: Vec<DeviceConnectionError>,
    /// The batch stopped early because its owner went inactive. Devices after the stop
    /// appear in neither list.
    pub cancelled: bool,
}

impl ConnectionReport {
    pub fn is_partial(&self) -> bool {
        !self.successful.is_empty() && !self.failed.is_empty()
    }
}

/// Failures reported by a wireless transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("device {id} not found")]
    NotFound { id: String },

    #[error("connection to {id} failed: {reason}")]
    ConnectFailed { id: String, reason: String },

    #[error("device {id} is not connected")]
    NotConnected { id: String },

    #[error("reading {characteristic} from {id} failed: {reason}")]
    Read {
        id: String,
        characteristic: Uuid,
        reason: String,
    },

    #[error("{operation} on {id} timed out")]
    Timeout { id: String, operation: String },

    #[error("invalid {characteristic} value from {id}")]
    InvalidValue { id: String, characteristic: Uuid },

    #[error("adapter error: {0}")]
    Adapter(String),
}

/// A peripheral that could not be connected within its retry budget.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("could not connect to {id} after {attempts} attempt(s): {last_error}")]
pub struct DeviceConnectionError {
    pub id: String,
    pub attempts: u32,
    pub last_error: TransportError,
}
