//! Device Registry
//!
//! Maps device identifiers to per-device session state. Entries are created
//! lazily and kept for the lifetime of the orchestrator: the set is bounded by
//! the number of peripherals actually seen over the air, and keeping them lets
//! a later `connect` reuse the handle from an earlier scan.

use crate::domain::error::BleError;
use crate::domain::models::{ConnectionState, ServiceMap};
use crate::infrastructure::bluetooth::host::{CharacteristicHandle, DeviceHandle, GattConnection};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::sink::EventSink;
use crate::infrastructure::bluetooth::subscription::Subscription;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

pub struct DeviceSession {
    /// Set by the scanner only
    pub native_device: Option<DeviceHandle>,
    /// Set by the connection coordinator only
    pub connection: Option<Arc<dyn GattConnection>>,
    /// Drives the connect-establishment and state-change streams together
    pub connection_task: Option<Subscription>,
    pub output_sink: Option<EventSink<ConnectionState>>,
    pub connection_state: ConnectionState,
    pub characteristic_index: HashMap<Uuid, CharacteristicHandle>,
    pub service_map: ServiceMap,
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self {
            native_device: None,
            connection: None,
            connection_task: None,
            output_sink: None,
            connection_state: ConnectionState::Disconnected,
            characteristic_index: HashMap::new(),
            service_map: ServiceMap::new(),
        }
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceSession>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeviceSession>> {
        // Session state stays consistent across a panicking closure, so a
        // poisoned lock is still usable.
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the session for `device_id`, creating it if needed.
    pub fn get_or_create<R>(&self, device_id: &str, f: impl FnOnce(&mut DeviceSession) -> R) -> R {
        let mut devices = self.lock();
        let session = devices.entry(device_id.to_string()).or_default();
        f(session)
    }

    /// Run `f` against a session the scanner has already populated.
    pub fn get<R>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut DeviceSession) -> R,
    ) -> Result<R, BleError> {
        let mut devices = self.lock();
        match devices.get_mut(device_id) {
            Some(session) if session.native_device.is_some() => Ok(f(session)),
            _ => Err(BleError::NotInitialized(device_id.to_string())),
        }
    }

    /// Run `f` only if an entry exists, scanned or not.
    pub fn if_present<R>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut DeviceSession) -> R,
    ) -> Option<R> {
        self.lock().get_mut(device_id).map(f)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Read-only view of established sessions, handed to components that do
/// I/O on a connection but never mutate registry state.
pub trait SessionLookup: Send + Sync {
    fn established(&self, device_id: &str) -> Result<Arc<dyn GattConnection>, BleError>;

    fn characteristic(
        &self,
        device_id: &str,
        uuid: &str,
    ) -> Result<(Arc<dyn GattConnection>, CharacteristicHandle), BleError>;
}

impl SessionLookup for DeviceRegistry {
    fn established(&self, device_id: &str) -> Result<Arc<dyn GattConnection>, BleError> {
        self.get(device_id, |session| session.connection.clone())?
            .ok_or_else(|| BleError::NotConnected(device_id.to_string()))
    }

    fn characteristic(
        &self,
        device_id: &str,
        uuid: &str,
    ) -> Result<(Arc<dyn GattConnection>, CharacteristicHandle), BleError> {
        self.get(device_id, |session| {
            let connection = session
                .connection
                .clone()
                .ok_or_else(|| BleError::NotConnected(device_id.to_string()))?;
            let key = protocol::parse_uuid(uuid)?;
            let characteristic = session.characteristic_index.get(&key).cloned().ok_or_else(|| {
                BleError::CharacteristicNotFound {
                    device_id: device_id.to_string(),
                    uuid: uuid.to_string(),
                }
            })?;
            Ok((connection, characteristic))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(address: &str) -> DeviceHandle {
        DeviceHandle {
            address: address.to_string(),
            token: 1,
        }
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = DeviceRegistry::new();
        registry.get_or_create("A", |s| s.native_device = Some(handle("A")));
        let state = registry.get_or_create("A", |s| s.connection_state);
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("A", |s| s.native_device.clone()).unwrap().is_some());
    }

    #[test]
    fn test_unscanned_device_is_not_initialized() {
        let registry = DeviceRegistry::new();
        assert_eq!(
            registry.get("B", |_| ()).unwrap_err(),
            BleError::NotInitialized("B".into())
        );

        // An entry without a native handle still counts as unscanned.
        registry.get_or_create("B", |_| ());
        assert_eq!(
            registry.get("B", |_| ()).unwrap_err(),
            BleError::NotInitialized("B".into())
        );
    }

    #[test]
    fn test_lookup_error_order() {
        let registry = DeviceRegistry::new();
        assert!(matches!(
            registry.established("C"),
            Err(BleError::NotInitialized(_))
        ));

        registry.get_or_create("C", |s| s.native_device = Some(handle("C")));
        assert!(matches!(
            registry.established("C"),
            Err(BleError::NotConnected(_))
        ));
        assert!(matches!(
            registry.characteristic("C", "2A37"),
            Err(BleError::NotConnected(_))
        ));
        // Device checks come before UUID parsing.
        assert!(matches!(
            registry.characteristic("D", "bogus"),
            Err(BleError::NotInitialized(_))
        ));
    }
}
