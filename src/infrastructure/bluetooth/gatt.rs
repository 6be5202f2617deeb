//! Characteristic discovery and single-shot GATT I/O.
//!
//! Discovery fills the per-device characteristic index that read, write and
//! notify resolve UUIDs against. Every call here resolves exactly once.

use crate::domain::error::BleError;
use crate::domain::models::ServiceMap;
use crate::infrastructure::bluetooth::host::GattConnection;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::registry::{DeviceRegistry, SessionLookup};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CharacteristicIo {
    registry: Arc<DeviceRegistry>,
}

impl CharacteristicIo {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Enumerate services and their characteristics, caching the handles.
    pub async fn discover(&self, device_id: &str) -> Result<ServiceMap, BleError> {
        let connection = self.registry.established(device_id)?;
        let services = connection.discover_services().await?;

        let mut service_map = ServiceMap::new();
        let mut index = HashMap::new();
        for service in services {
            let characteristics = service_map.entry(service.uuid.clone()).or_default();
            for characteristic in service.characteristics {
                match protocol::parse_uuid(&characteristic.uuid) {
                    Ok(key) => {
                        characteristics.push(characteristic.uuid.clone());
                        index.insert(key, characteristic);
                    }
                    Err(e) => warn!("Skipping characteristic on {}: {}", device_id, e),
                }
            }
        }

        info!(
            "Discovered {} services / {} characteristics on {}",
            service_map.len(),
            index.len(),
            device_id
        );

        // The session may have been replaced while discovery was in flight;
        // handles from an old connection must not leak into the new one.
        let stored = self.registry.get(device_id, |session| {
            match &session.connection {
                Some(current) if same_session(current, &connection) => {
                    session.characteristic_index = index;
                    session.service_map = service_map.clone();
                    true
                }
                _ => false,
            }
        })?;
        if !stored {
            return Err(BleError::NotConnected(device_id.to_string()));
        }

        Ok(service_map)
    }

    pub async fn read(&self, device_id: &str, uuid: &str) -> Result<Vec<u8>, BleError> {
        let (connection, characteristic) = self.registry.characteristic(device_id, uuid)?;
        let value = connection.read(&characteristic).await?;
        debug!("Read {} bytes from {} on {}", value.len(), uuid, device_id);
        Ok(value)
    }

    pub async fn write(
        &self,
        device_id: &str,
        uuid: &str,
        value: &[u8],
    ) -> Result<Vec<u8>, BleError> {
        let (connection, characteristic) = self.registry.characteristic(device_id, uuid)?;
        let written = connection.write(&characteristic, value).await?;
        debug!("Wrote {} bytes to {} on {}", value.len(), uuid, device_id);
        Ok(written)
    }

    /// Negotiate the ATT MTU; yields the value the stack settled on.
    pub async fn request_mtu(&self, device_id: &str, mtu: u16) -> Result<u16, BleError> {
        let connection = self.registry.established(device_id)?;
        let negotiated = connection.request_mtu(mtu).await?;
        info!("MTU for {}: requested {}, got {}", device_id, mtu, negotiated);
        Ok(negotiated)
    }
}

fn same_session(a: &Arc<dyn GattConnection>, b: &Arc<dyn GattConnection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const u8, Arc::as_ptr(b) as *const u8)
}
