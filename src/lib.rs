//! BLE session orchestration: scanning, per-device connections, GATT I/O,
//! notifications and Bluetooth/location access negotiation.

pub mod domain;
pub mod infrastructure;

pub use domain::error::BleError;
pub use domain::models::{
    AccessStatus, ConnectionState, DiscoveryRecord, ErrorPayload, ScanFilter, ScanMode, ServiceMap,
};
pub use infrastructure::bluetooth::sink::EventStream;
pub use infrastructure::bluetooth::BleService;
