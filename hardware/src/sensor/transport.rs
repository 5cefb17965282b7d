use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{DiscoveredDevice, TransportError};

/// Wireless stack operations needed by the connection manager.
///
/// Implementations wrap a host adapter. They are not expected to serialize connection
/// attempts themselves; [`PeripheralConnectionManager`](super::PeripheralConnectionManager)
/// never issues two at once.
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    /// Scan for advertising sensors for `duration`.
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError>;

    async fn connect(&self, id: &str) -> Result<(), TransportError>;

    /// Tear down any connection state for `id`, including a half-open one.
    async fn disconnect(&self, id: &str) -> Result<(), TransportError>;

    async fn read_characteristic(
        &self,
        id: &str,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError>;
}
