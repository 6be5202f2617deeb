//! Simulated Host Stack
//!
//! An in-memory [`HostStack`] that behaves like a well-mannered native BLE
//! stack: advertisements, connection establishment, GATT I/O and
//! notifications are all driven explicitly by the owner. Used by the demo
//! binary and by the test suites.

use crate::domain::models::{ConnectionState, ScanFilter};
use crate::infrastructure::bluetooth::host::{
    CharacteristicHandle, DeviceHandle, GattConnection, HostStack, NativeError, NativeStream,
    ScanEvent, ServiceRecord,
};
use crate::infrastructure::bluetooth::protocol::{self, SystemClock};
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Largest ATT MTU the simulated radio accepts.
pub const MAX_MTU: u16 = 517;

/// Native stream kinds, for counting live subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Scan,
    Connect,
    State,
    Notify,
}

type Tx<T> = mpsc::UnboundedSender<Result<T, NativeError>>;

/// A peripheral the simulated radio can see.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i32,
    pub advertised_services: Vec<String>,
    pub services: Vec<(String, Vec<String>)>,
    pub values: HashMap<Uuid, Vec<u8>>,
    pub reachable: bool,
}

impl SimPeripheral {
    pub fn new(address: &str, name: Option<&str>, rssi: i32) -> Self {
        Self {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi,
            advertised_services: Vec::new(),
            services: Vec::new(),
            values: HashMap::new(),
            reachable: true,
        }
    }

    pub fn with_service(mut self, service: &str, characteristics: &[&str]) -> Self {
        self.advertised_services.push(service.to_string());
        self.services.push((
            service.to_string(),
            characteristics.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    pub fn with_value(mut self, characteristic: &str, value: &[u8]) -> Self {
        if let Ok(key) = protocol::parse_uuid(characteristic) {
            self.values.insert(key, value.to_vec());
        }
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    fn matches(&self, filter: &ScanFilter) -> bool {
        let id_ok = filter
            .device_id
            .as_ref()
            .map_or(true, |id| id.eq_ignore_ascii_case(&self.address));
        let name_ok = filter
            .name
            .as_ref()
            .map_or(true, |name| self.name.as_deref() == Some(name.as_str()));
        let service_ok = filter.service.as_ref().map_or(true, |wanted| {
            let wanted = protocol::parse_uuid(wanted).ok();
            self.advertised_services
                .iter()
                .any(|s| protocol::parse_uuid(s).ok() == wanted)
        });
        id_ok && name_ok && service_ok
    }
}

struct PeripheralState {
    profile: SimPeripheral,
    token: u64,
    state: ConnectionState,
    mtu: u16,
    connect_subscribers: Vec<Tx<Arc<dyn GattConnection>>>,
    state_subscribers: Vec<Tx<ConnectionState>>,
    notify_subscribers: HashMap<Uuid, Vec<Tx<Vec<u8>>>>,
    gatt_failure: Option<String>,
}

#[derive(Default)]
struct SimState {
    peripherals: HashMap<String, PeripheralState>,
    scan_subscribers: Vec<(ScanFilter, Tx<ScanEvent>)>,
    active: HashMap<StreamKind, usize>,
    peak: HashMap<StreamKind, usize>,
    next_token: u64,
}

impl SimState {
    fn opened(&mut self, kind: StreamKind) {
        let count = self.active.entry(kind).or_default();
        *count += 1;
        let count = *count;
        let peak = self.peak.entry(kind).or_default();
        *peak = (*peak).max(count);
    }

    fn broadcast_state(&mut self, address: &str, state: ConnectionState) {
        if let Some(p) = self.peripherals.get_mut(address) {
            p.state = state;
            p.state_subscribers.retain(|tx| tx.send(Ok(state)).is_ok());
        }
    }
}

#[derive(Clone)]
pub struct SimulatedHost {
    state: Arc<Mutex<SimState>>,
    clock: Arc<SystemClock>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// The clock advertisements are stamped with.
    pub fn clock(&self) -> Arc<SystemClock> {
        self.clock.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_peripheral(&self, peripheral: SimPeripheral) {
        let mut state = self.lock();
        state.next_token += 1;
        let token = state.next_token;
        state.peripherals.insert(
            peripheral.address.clone(),
            PeripheralState {
                profile: peripheral,
                token,
                state: ConnectionState::Disconnected,
                mtu: 23,
                connect_subscribers: Vec::new(),
                state_subscribers: Vec::new(),
                notify_subscribers: HashMap::new(),
                gatt_failure: None,
            },
        );
    }

    /// Deliver one advertisement from `address` to every matching scan.
    pub fn advertise(&self, address: &str) {
        let elapsed = self.clock.elapsed_realtime_nanos();
        let mut state = self.lock();
        let SimState {
            peripherals,
            scan_subscribers,
            ..
        } = &mut *state;
        let Some(p) = peripherals.get(address) else {
            return;
        };
        let event = ScanEvent {
            device: DeviceHandle {
                address: p.profile.address.clone(),
                token: p.token,
            },
            name: p.profile.name.clone(),
            rssi: p.profile.rssi,
            elapsed_realtime_nanos: elapsed,
        };
        scan_subscribers.retain(|(filter, tx)| {
            !p.profile.matches(filter) || tx.send(Ok(event.clone())).is_ok()
        });
    }

    /// Fail every running scan.
    pub fn fail_scan(&self, message: &str) {
        let mut state = self.lock();
        for (_, tx) in state.scan_subscribers.drain(..) {
            let _ = tx.send(Err(NativeError::new(message)));
        }
    }

    /// Push a notification payload to every subscriber of a characteristic.
    pub fn notify(&self, address: &str, characteristic: &str, payload: &[u8]) {
        let Ok(key) = protocol::parse_uuid(characteristic) else {
            return;
        };
        let mut state = self.lock();
        if let Some(subscribers) = state
            .peripherals
            .get_mut(address)
            .and_then(|p| p.notify_subscribers.get_mut(&key))
        {
            subscribers.retain(|tx| tx.send(Ok(payload.to_vec())).is_ok());
        }
    }

    /// Fail every notification stream on a characteristic.
    pub fn fail_notifications(&self, address: &str, characteristic: &str, message: &str) {
        let Ok(key) = protocol::parse_uuid(characteristic) else {
            return;
        };
        let mut state = self.lock();
        if let Some(subscribers) = state
            .peripherals
            .get_mut(address)
            .and_then(|p| p.notify_subscribers.remove(&key))
        {
            for tx in subscribers {
                let _ = tx.send(Err(NativeError::new(message)));
            }
        }
    }

    /// Simulate link loss: the establishment stream errors out.
    pub fn drop_link(&self, address: &str) {
        let mut state = self.lock();
        if let Some(p) = state.peripherals.get_mut(address) {
            for tx in p.connect_subscribers.drain(..) {
                let _ = tx.send(Err(NativeError::new("peripheral disconnected")));
            }
            for (_, subscribers) in p.notify_subscribers.drain() {
                for tx in subscribers {
                    let _ = tx.send(Err(NativeError::new("peripheral disconnected")));
                }
            }
        }
        state.broadcast_state(address, ConnectionState::Disconnected);
    }

    /// Make every GATT operation on `address` fail (or succeed again).
    pub fn set_gatt_failure(&self, address: &str, failure: Option<&str>) {
        if let Some(p) = self.lock().peripherals.get_mut(address) {
            p.gatt_failure = failure.map(str::to_string);
        }
    }

    pub fn value(&self, address: &str, characteristic: &str) -> Option<Vec<u8>> {
        let key = protocol::parse_uuid(characteristic).ok()?;
        self.lock()
            .peripherals
            .get(address)
            .and_then(|p| p.profile.values.get(&key).cloned())
    }

    pub fn state_of(&self, address: &str) -> Option<ConnectionState> {
        self.lock().peripherals.get(address).map(|p| p.state)
    }

    /// Number of native streams of `kind` that are still subscribed.
    pub fn active_streams(&self, kind: StreamKind) -> usize {
        self.lock().active.get(&kind).copied().unwrap_or(0)
    }

    /// Most native streams of `kind` ever subscribed at the same time.
    pub fn peak_streams(&self, kind: StreamKind) -> usize {
        self.lock().peak.get(&kind).copied().unwrap_or(0)
    }

    fn open<T: Send + 'static>(&self, kind: StreamKind) -> (Tx<T>, NativeStream<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().opened(kind);
        let stream = TrackedStream {
            rx,
            _guard: StreamGuard {
                host: self.clone(),
                kind,
                on_drop: None,
            },
        };
        (tx, Box::pin(stream))
    }

    fn open_with_drop<T: Send + 'static>(
        &self,
        kind: StreamKind,
        on_drop: impl FnOnce(&mut SimState) + Send + 'static,
    ) -> (Tx<T>, NativeStream<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().opened(kind);
        let stream = TrackedStream {
            rx,
            _guard: StreamGuard {
                host: self.clone(),
                kind,
                on_drop: Some(Box::new(on_drop)),
            },
        };
        (tx, Box::pin(stream))
    }
}

impl HostStack for SimulatedHost {
    fn scan(&self, filter: &ScanFilter) -> NativeStream<ScanEvent> {
        debug!("Simulated scan started, mode {:?}", filter.mode);
        let (tx, stream) = self.open(StreamKind::Scan);
        self.lock().scan_subscribers.push((filter.clone(), tx));
        stream
    }

    fn establish_connection(
        &self,
        device: &DeviceHandle,
        wait_for_device: bool,
    ) -> NativeStream<Arc<dyn GattConnection>> {
        let address = device.address.clone();
        let (tx, stream) = self.open_with_drop(StreamKind::Connect, {
            let address = address.clone();
            move |state: &mut SimState| {
                // The link only goes down once its last holder lets go.
                let link_released = match state.peripherals.get_mut(&address) {
                    Some(p) => {
                        p.connect_subscribers.retain(|tx| !tx.is_closed());
                        let released = p.connect_subscribers.is_empty()
                            && p.state == ConnectionState::Connected;
                        if released {
                            // Notification streams complete with the link.
                            p.notify_subscribers.clear();
                        }
                        released
                    }
                    None => false,
                };
                if link_released {
                    state.broadcast_state(&address, ConnectionState::Disconnecting);
                    state.broadcast_state(&address, ConnectionState::Disconnected);
                }
            }
        });

        let mut state = self.lock();
        let reachable = match state.peripherals.get(&address) {
            Some(p) => p.profile.reachable,
            None => {
                let _ = tx.send(Err(NativeError::new(format!("unknown device {address}"))));
                return stream;
            }
        };

        state.broadcast_state(&address, ConnectionState::Connecting);
        if !reachable {
            if !wait_for_device {
                let _ = tx.send(Err(NativeError::new(format!(
                    "device {address} is not reachable"
                ))));
            } else if let Some(p) = state.peripherals.get_mut(&address) {
                p.connect_subscribers.push(tx);
            }
            return stream;
        }

        state.broadcast_state(&address, ConnectionState::Connected);
        let connection: Arc<dyn GattConnection> = Arc::new(SimConnection {
            host: self.clone(),
            address: address.clone(),
        });
        let _ = tx.send(Ok(connection));
        if let Some(p) = state.peripherals.get_mut(&address) {
            p.connect_subscribers.push(tx);
        }
        stream
    }

    fn observe_connection_state(&self, device: &DeviceHandle) -> NativeStream<ConnectionState> {
        let (tx, stream) = self.open(StreamKind::State);
        if let Some(p) = self.lock().peripherals.get_mut(&device.address) {
            p.state_subscribers.push(tx);
        }
        stream
    }
}

struct SimConnection {
    host: SimulatedHost,
    address: String,
}

impl SimConnection {
    fn with_peripheral<R>(
        &self,
        f: impl FnOnce(&mut PeripheralState) -> Result<R, NativeError>,
    ) -> Result<R, NativeError> {
        let mut state = self.host.lock();
        let p = state
            .peripherals
            .get_mut(&self.address)
            .ok_or_else(|| NativeError::new(format!("unknown device {}", self.address)))?;
        if p.state != ConnectionState::Connected {
            return Err(NativeError::new("peripheral disconnected"));
        }
        if let Some(failure) = &p.gatt_failure {
            return Err(NativeError::new(failure.clone()));
        }
        f(p)
    }
}

#[async_trait]
impl GattConnection for SimConnection {
    async fn discover_services(&self) -> Result<Vec<ServiceRecord>, NativeError> {
        self.with_peripheral(|p| {
            let mut instance_id = 0;
            let records = p
                .profile
                .services
                .iter()
                .map(|(service, chars)| ServiceRecord {
                    uuid: service.clone(),
                    characteristics: chars
                        .iter()
                        .map(|c| {
                            instance_id += 1;
                            CharacteristicHandle {
                                uuid: c.clone(),
                                service_uuid: service.clone(),
                                instance_id,
                            }
                        })
                        .collect(),
                })
                .collect();
            Ok(records)
        })
    }

    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>, NativeError> {
        let key = parse_native(&characteristic.uuid)?;
        self.with_peripheral(|p| Ok(p.profile.values.get(&key).cloned().unwrap_or_default()))
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<Vec<u8>, NativeError> {
        let key = parse_native(&characteristic.uuid)?;
        self.with_peripheral(|p| {
            p.profile.values.insert(key, value.to_vec());
            Ok(value.to_vec())
        })
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16, NativeError> {
        self.with_peripheral(|p| {
            p.mtu = mtu.min(MAX_MTU);
            Ok(p.mtu)
        })
    }

    fn notifications(&self, characteristic: &CharacteristicHandle) -> NativeStream<Vec<u8>> {
        let (tx, stream) = self.host.open(StreamKind::Notify);
        let subscribed = parse_native(&characteristic.uuid).and_then(|key| {
            self.with_peripheral(|p| {
                p.notify_subscribers.entry(key).or_default().push(tx.clone());
                Ok(())
            })
        });
        if let Err(e) = subscribed {
            let _ = tx.send(Err(e));
        }
        stream
    }
}

fn parse_native(uuid: &str) -> Result<Uuid, NativeError> {
    protocol::parse_uuid(uuid).map_err(|e| NativeError::new(e.to_string()))
}

struct StreamGuard {
    host: SimulatedHost,
    kind: StreamKind,
    on_drop: Option<Box<dyn FnOnce(&mut SimState) + Send>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut state = self.host.lock();
        if let Some(count) = state.active.get_mut(&self.kind) {
            *count = count.saturating_sub(1);
        }
        if let Some(on_drop) = self.on_drop.take() {
            on_drop(&mut state);
        }
    }
}

struct TrackedStream<T> {
    rx: mpsc::UnboundedReceiver<Result<T, NativeError>>,
    // Dropped after `rx`, so senders already observe the closed channel.
    _guard: StreamGuard,
}

impl<T> Stream for TrackedStream<T> {
    type Item = Result<T, NativeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
