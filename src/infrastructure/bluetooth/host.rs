//! Native Host Stack Interface
//!
//! The orchestrator never talks to a radio directly. Everything it needs from
//! the platform BLE stack goes through the two traits in this module:
//! [`HostStack`] for scanning and connection establishment, and
//! [`GattConnection`] for I/O on an established session.
//!
//! Every stream handed out here is cold and owned by the caller: dropping it
//! unsubscribes from the native primitive.

pub use crate::domain::error::NativeError;
use crate::domain::models::{ConnectionState, ScanFilter};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Opaque reference to a discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub address: String,
    pub token: u64,
}

/// Opaque reference to a characteristic on an established session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub uuid: String,
    pub service_uuid: String,
    pub instance_id: u64,
}

#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub uuid: String,
    pub characteristics: Vec<CharacteristicHandle>,
}

/// A single advertisement seen by the native scanner.
#[derive(Debug, Clone)]
pub struct ScanEvent {
    pub device: DeviceHandle,
    pub name: Option<String>,
    pub rssi: i32,
    /// Monotonic time since boot at which the advertisement was received
    pub elapsed_realtime_nanos: i64,
}

pub type NativeStream<T> = BoxStream<'static, Result<T, NativeError>>;

pub trait HostStack: Send + Sync {
    /// Continuous discovery stream matching `filter`.
    fn scan(&self, filter: &ScanFilter) -> NativeStream<ScanEvent>;

    /// Emits the connection once established and stays open while the link
    /// is up. Completion means the link is gone.
    fn establish_connection(
        &self,
        device: &DeviceHandle,
        wait_for_device: bool,
    ) -> NativeStream<Arc<dyn GattConnection>>;

    fn observe_connection_state(&self, device: &DeviceHandle) -> NativeStream<ConnectionState>;
}

#[async_trait]
pub trait GattConnection: Send + Sync {
    async fn discover_services(&self) -> Result<Vec<ServiceRecord>, NativeError>;

    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>, NativeError>;

    /// Writes with response and yields the value the stack reports back.
    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<Vec<u8>, NativeError>;

    async fn request_mtu(&self, mtu: u16) -> Result<u16, NativeError>;

    /// Enables notifications and streams every payload.
    fn notifications(&self, characteristic: &CharacteristicHandle) -> NativeStream<Vec<u8>>;
}
