use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ActivePredicate;

use super::characteristics::{self, decode_pressure, decode_text};
use super::{
    ConnectionReport, ConnectionState, DeviceConnectionError, DiscoveredDevice,
    PeripheralDevice, PeripheralTransport, TransportError,
};

const EVENT_CAPACITY: usize = 256;

/// Connection sequencing parameters.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection attempts per device before it is reported failed.
    pub max_retries: u32,
    /// Pause after a successful connection before the next device is attempted.
    pub inter_connection_delay: Duration,
    /// Pause between failed attempts on the same device. Longer than the
    /// inter-connection delay so the stack can release the half-open link.
    pub retry_delay: Duration,
    /// Limit on a single transport connect.
    pub connect_timeout: Duration,
    /// Limit on each post-connect detail read.
    pub detail_read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            inter_connection_delay: Duration::from_millis(500),
            retry_delay: Duration::from_millis(1500),
            connect_timeout: Duration::from_secs(10),
            detail_read_timeout: Duration::from_secs(2),
        }
    }
}

/// Progress notifications for a UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    ConnectionStarted { id: String, attempt: u32 },
    ConnectionSucceeded { device: PeripheralDevice },
    ConnectionRetry { id: String, attempt: u32, error: String },
    ConnectionFailed { id: String, reason: String },
    Disconnected { id: String },
}

/// Per-owner view of known peripherals, keyed by id.
///
/// Each id has exactly one entry and therefore exactly one state, so a device is never
/// both connecting and connected.
#[derive(Debug, Default)]
struct DeviceRegistry {
    devices: HashMap<String, PeripheralDevice>,
}

impl DeviceRegistry {
    fn entry(&mut self, id: &str) -> &mut PeripheralDevice {
        self.devices
            .entry(id.to_string())
            .or_insert_with(|| PeripheralDevice::unknown(id))
    }

    fn set_state(&mut self, id: &str, state: ConnectionState) {
        self.entry(id).connection_state = state;
    }

    fn state(&self, id: &str) -> Option<ConnectionState> {
        self.devices.get(id).map(|d| d.connection_state)
    }

    fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .devices
            .values()
            .filter(|d| d.connection_state == ConnectionState::Connected)
            .map(|d| d.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Connects and tracks wireless pressure sensors.
///
/// Connection attempts are strictly sequential in caller order: concurrent attempts on
/// one host adapter are the main cause of stack failures. The manager owns its registry;
/// callers only get cloned snapshots.
pub struct PeripheralConnectionManager {
    transport: Arc<dyn PeripheralTransport>,
    config: ConnectionConfig,
    registry: Mutex<DeviceRegistry>,
    events: broadcast::Sender<PeripheralEvent>,
}

impl PeripheralConnectionManager {
    pub fn new(transport: Arc<dyn PeripheralTransport>, config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            config,
            registry: Mutex::new(DeviceRegistry::default()),
            events,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeripheralEvent> {
        self.events.subscribe()
    }

    /// Scan and register everything seen as discovered, strongest signal first.
    ///
    /// Entries for devices this manager is already tracking keep their state.
    pub async fn discover(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let mut found = self.transport.scan(duration).await?;
        found.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        let mut registry = self.registry();
        for device in &found {
            match registry.devices.get_mut(&device.id) {
                Some(existing) => existing.rssi = Some(device.rssi),
                None => {
                    registry
                        .devices
                        .insert(device.id.clone(), PeripheralDevice::from_discovery(device));
                }
            }
        }
        info!("Discovered {} sensor(s)", found.len());
        Ok(found)
    }

    /// Connect `ids` one at a time, in order.
    ///
    /// `lookup` supplies discovery information for ids the registry has not seen. A device
    /// that fails every attempt is reported in `failed` and does not stop the batch.
    /// `is_active` is sampled before every device and every retry; once it turns false no
    /// further connect is started and the report comes back with `cancelled` set.
    pub async fn connect_sequential<F>(
        &self,
        ids: &[String],
        lookup: F,
        is_active: &ActivePredicate,
    ) -> ConnectionReport
    where
        F: Fn(&str) -> Option<DiscoveredDevice> + Send + Sync,
    {
        let mut report = ConnectionReport::default();

        for (index, id) in ids.iter().enumerate() {
            if !is_active() {
                info!("Connection batch stopped before {id}");
                report.cancelled = true;
                break;
            }

            {
                let mut registry = self.registry();
                if registry.state(id) == Some(ConnectionState::Connected) {
                    debug!("{id} already connected");
                    report.successful.push(registry.entry(id).clone());
                    continue;
                }
                if !registry.devices.contains_key(id) {
                    let device = lookup(id)
                        .map(|d| PeripheralDevice::from_discovery(&d))
                        .unwrap_or_else(|| PeripheralDevice::unknown(id));
                    registry.devices.insert(id.clone(), device);
                }
            }

            match self.connect_with_retry(id, is_active).await {
                Ok(Some(device)) => {
                    report.successful.push(device);
                    if index + 1 < ids.len() {
                        sleep(self.config.inter_connection_delay).await;
                    }
                }
                Ok(None) => {
                    info!("Connection batch stopped while retrying {id}");
                    report.cancelled = true;
                    break;
                }
                Err(err) => {
                    warn!("{err}");
                    report.failed.push(err);
                }
            }
        }

        info!(
            "Connected {} of {} sensor(s)",
            report.successful.len(),
            ids.len()
        );
        report
    }

    /// `Ok(None)` when `is_active` turned false before a retry.
    async fn connect_with_retry(
        &self,
        id: &str,
        is_active: &ActivePredicate,
    ) -> Result<Option<PeripheralDevice>, DeviceConnectionError> {
        let max = self.config.max_retries.max(1);
        let mut last_error = TransportError::NotFound { id: id.to_string() };

        for attempt in 1..=max {
            if attempt > 1 && !is_active() {
                self.registry().set_state(id, ConnectionState::Disconnected);
                return Ok(None);
            }

            self.registry().set_state(id, ConnectionState::Connecting);
            info!("Connecting to {id} (attempt {attempt}/{max})");
            self.emit(PeripheralEvent::ConnectionStarted {
                id: id.to_string(),
                attempt,
            });

            let result = with_timeout(
                self.config.connect_timeout,
                id,
                "connect",
                self.transport.connect(id),
            )
            .await;

            match result {
                Ok(()) => {
                    let device = self.complete_connection(id).await;
                    info!("Connected to {} ({})", device.display_name, id);
                    self.emit(PeripheralEvent::ConnectionSucceeded {
                        device: device.clone(),
                    });
                    return Ok(Some(device));
                }
                Err(err) => {
                    warn!("Attempt {attempt} to connect {id} failed: {err}");
                    if let Err(cleanup) = self.transport.disconnect(id).await {
                        debug!("Cleanup after failed connect to {id}: {cleanup}");
                    }
                    if attempt < max {
                        self.emit(PeripheralEvent::ConnectionRetry {
                            id: id.to_string(),
                            attempt,
                            error: err.to_string(),
                        });
                        sleep(self.config.retry_delay).await;
                    }
                    last_error = err;
                }
            }
        }

        self.registry().set_state(id, ConnectionState::Failed);
        let err = DeviceConnectionError {
            id: id.to_string(),
            attempts: max,
            last_error,
        };
        self.emit(PeripheralEvent::ConnectionFailed {
            id: id.to_string(),
            reason: err.last_error.to_string(),
        });
        Err(err)
    }

    /// Read firmware and name, falling back to what is already known on any failure.
    async fn complete_connection(&self, id: &str) -> PeripheralDevice {
        let firmware = self.read_text(id, characteristics::FIRMWARE_REVISION).await;
        let name = self.read_text(id, characteristics::DEVICE_NAME).await;

        let mut registry = self.registry();
        let device = registry.entry(id);
        device.connection_state = ConnectionState::Connected;
        if let Some(firmware) = firmware {
            device.firmware_version = Some(firmware);
        }
        if let Some(name) = name {
            device.display_name = name;
        }
        device.clone()
    }

    async fn read_text(&self, id: &str, characteristic: Uuid) -> Option<String> {
        let result = with_timeout(
            self.config.detail_read_timeout,
            id,
            "detail read",
            self.transport.read_characteristic(id, characteristic),
        )
        .await;

        match result {
            Ok(bytes) => Some(decode_text(&bytes)).filter(|text| !text.is_empty()),
            Err(err) => {
                warn!("Could not read {characteristic} from {id}: {err}");
                None
            }
        }
    }

    /// Disconnect `id`. A device that is not connected is left alone.
    ///
    /// The registry marks the device disconnected even if the transport reports an error.
    pub async fn disconnect(&self, id: &str) -> Result<(), TransportError> {
        if self.registry().state(id) != Some(ConnectionState::Connected) {
            debug!("{id} not connected, nothing to disconnect");
            return Ok(());
        }

        let result = self.transport.disconnect(id).await;
        self.registry().set_state(id, ConnectionState::Disconnected);
        info!("Disconnected {id}");
        self.emit(PeripheralEvent::Disconnected { id: id.to_string() });
        result
    }

    /// Disconnect every connected device independently, then forget all devices.
    pub async fn disconnect_all(&self) {
        let ids = self.registry().connected_ids();
        for id in &ids {
            if let Err(err) = self.disconnect(id).await {
                warn!("Disconnecting {id} failed: {err}");
            }
        }
        self.registry().devices.clear();
        debug!("Device registry cleared after disconnecting {} device(s)", ids.len());
    }

    /// Current pressure reported by a connected sensor.
    pub async fn read_pressure(&self, id: &str) -> Result<f64, TransportError> {
        if self.registry().state(id) != Some(ConnectionState::Connected) {
            return Err(TransportError::NotConnected { id: id.to_string() });
        }
        let bytes = self
            .transport
            .read_characteristic(id, characteristics::PRESSURE_READING)
            .await?;
        decode_pressure(&bytes).ok_or_else(|| TransportError::InvalidValue {
            id: id.to_string(),
            characteristic: characteristics::PRESSURE_READING,
        })
    }

    pub fn device(&self, id: &str) -> Option<PeripheralDevice> {
        self.registry().devices.get(id).cloned()
    }

    /// Every tracked device, sorted by id.
    pub fn snapshot(&self) -> Vec<PeripheralDevice> {
        let mut devices: Vec<_> = self.registry().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn connected(&self) -> Vec<PeripheralDevice> {
        self.snapshot()
            .into_iter()
            .filter(|d| d.connection_state == ConnectionState::Connected)
            .collect()
    }

    fn registry(&self) -> MutexGuard<'_, DeviceRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PeripheralEvent) {
        let _ = self.events.send(event);
    }
}

async fn with_timeout<T>(
    limit: Duration,
    id: &str,
    operation: &str,
    future: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            id: id.to_string(),
            operation: operation.to_string(),
        }),
    }
}
