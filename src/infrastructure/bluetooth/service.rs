//! Bluetooth Service Module
//!
//! Top-level orchestrator. Owns the device registry and wires it into the
//! scan, connection, characteristic and notification components, exposing the
//! request/stream surface callers use.

use crate::domain::error::BleError;
use crate::domain::models::{AccessStatus, ConnectionState, DiscoveryRecord, ScanFilter, ServiceMap};
use crate::infrastructure::bluetooth::connection::ConnectionCoordinator;
use crate::infrastructure::bluetooth::gatt::CharacteristicIo;
use crate::infrastructure::bluetooth::host::HostStack;
use crate::infrastructure::bluetooth::notify::NotificationManager;
use crate::infrastructure::bluetooth::protocol::{Clock, SystemClock};
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::scanner::ScanCoordinator;
use crate::infrastructure::bluetooth::sink::{self, EventStream};
use crate::infrastructure::permission::{PermissionNegotiator, PermissionPlatform};
use std::sync::Arc;
use tracing::warn;

/// Main Bluetooth service coordinating all BLE operations
pub struct BleService {
    registry: Arc<DeviceRegistry>,
    scanner: ScanCoordinator,
    connections: ConnectionCoordinator,
    io: CharacteristicIo,
    notifications: NotificationManager,
    permissions: PermissionNegotiator,
}

impl BleService {
    pub fn new(host: Arc<dyn HostStack>, platform: Arc<dyn PermissionPlatform>) -> Self {
        Self::with_clock(host, platform, Arc::new(SystemClock::new()))
    }

    /// Create a service whose discovery timestamps come from `clock`.
    pub fn with_clock(
        host: Arc<dyn HostStack>,
        platform: Arc<dyn PermissionPlatform>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        Self {
            scanner: ScanCoordinator::new(host.clone(), registry.clone(), clock),
            connections: ConnectionCoordinator::new(host, registry.clone()),
            io: CharacteristicIo::new(registry.clone()),
            notifications: NotificationManager::new(registry.clone()),
            permissions: PermissionNegotiator::new(platform),
            registry,
        }
    }

    /// Start scanning. Dropping the returned stream stops the scan.
    pub fn scan_start(&self, filter: ScanFilter) -> EventStream<DiscoveryRecord> {
        let (tx, rx) = sink::channel();
        self.scanner.start(filter, tx);
        rx
    }

    pub fn scan_stop(&self) {
        self.scanner.stop();
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Connect to a scanned device and stream its state changes. A device
    /// the scanner never saw yields a stream that fails with `NotInitialized`.
    pub fn connect_start(
        &self,
        device_id: &str,
        wait_for_device: bool,
    ) -> EventStream<ConnectionState> {
        let (tx, rx) = sink::channel();
        if let Err(e) = self.connections.connect(device_id, wait_for_device, tx.clone()) {
            warn!("Cannot connect to {}: {}", device_id, e);
            tx.error(e);
        }
        rx
    }

    /// Disconnect one device, or all of them.
    pub fn connect_stop(&self, device_id: Option<&str>) {
        self.connections.disconnect(device_id);
    }

    pub fn connection_state(&self, device_id: &str) -> Result<ConnectionState, BleError> {
        self.connections.connection_state(device_id)
    }

    pub async fn discover(&self, device_id: &str) -> Result<ServiceMap, BleError> {
        self.io.discover(device_id).await
    }

    pub async fn read(&self, device_id: &str, uuid: &str) -> Result<Vec<u8>, BleError> {
        self.io.read(device_id, uuid).await
    }

    pub async fn write(
        &self,
        device_id: &str,
        uuid: &str,
        value: &[u8],
    ) -> Result<Vec<u8>, BleError> {
        self.io.write(device_id, uuid, value).await
    }

    pub async fn request_mtu(&self, device_id: &str, mtu: u16) -> Result<u16, BleError> {
        self.io.request_mtu(device_id, mtu).await
    }

    /// Stream notifications from a discovered characteristic.
    pub fn notify_start(&self, device_id: &str, uuid: &str) -> EventStream<Vec<u8>> {
        let (tx, rx) = sink::channel();
        if let Err(e) = self.notifications.subscribe(device_id, uuid, tx.clone()) {
            warn!("Cannot enable notifications for {} on {}: {}", uuid, device_id, e);
            tx.error(e);
        }
        rx
    }

    pub fn notify_stop(&self, device_id: &str, uuid: &str) {
        self.notifications.unsubscribe(device_id, uuid);
    }

    pub async fn request_access(&self) -> Result<AccessStatus, BleError> {
        self.permissions.request_access().await
    }

    pub async fn has_access(&self) -> bool {
        self.permissions.has_access().await
    }

    pub async fn request_location_permission(&self) -> Result<AccessStatus, BleError> {
        self.permissions.request_location_permission().await
    }

    pub fn open_app_settings(&self) {
        self.permissions.open_app_settings();
    }

    /// The negotiator, for routing OS prompt callbacks back in.
    pub fn permissions(&self) -> &PermissionNegotiator {
        &self.permissions
    }

    /// Every device id seen since the service was created.
    pub fn known_devices(&self) -> Vec<String> {
        let mut ids = self.registry.device_ids();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulated::{SimPeripheral, SimulatedHost};
    use crate::infrastructure::permission::SimulatedPlatform;
    use futures::StreamExt;

    fn service() -> (SimulatedHost, BleService) {
        let host = SimulatedHost::new();
        host.add_peripheral(
            SimPeripheral::new("AA:BB:CC:DD:EE:FF", Some("Widget"), -42).with_service("180D", &["2A37"]),
        );
        let service = BleService::with_clock(
            Arc::new(host.clone()),
            Arc::new(SimulatedPlatform::granted()),
            host.clock(),
        );
        (host, service)
    }

    #[tokio::test]
    async fn test_start_failure_is_terminal_stream_error() {
        let (_host, service) = service();
        let events: Vec<_> = service.connect_start("unknown", false).collect().await;
        assert_eq!(events, vec![Err(BleError::NotInitialized("unknown".into()))]);

        let events: Vec<_> = service.notify_start("unknown", "2A37").collect().await;
        assert_eq!(events, vec![Err(BleError::NotInitialized("unknown".into()))]);
    }

    #[tokio::test]
    async fn test_known_devices_after_scan() {
        let (host, service) = service();
        assert!(service.known_devices().is_empty());
        let mut scan = service.scan_start(ScanFilter::default());
        host.advertise("AA:BB:CC:DD:EE:FF");
        scan.next().await.unwrap().unwrap();
        service.scan_stop();
        assert_eq!(service.known_devices(), vec!["AA:BB:CC:DD:EE:FF".to_string()]);
        assert_eq!(
            service.connection_state("AA:BB:CC:DD:EE:FF"),
            Ok(ConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_access_passthrough() {
        let (_host, service) = service();
        assert!(service.has_access().await);
        assert_eq!(service.request_access().await, Ok(AccessStatus::Ok));
    }
}
