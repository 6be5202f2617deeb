//! BLE Connection Module
//!
//! Owns at most one connection attempt per device. A connection is two native
//! streams: connect-establishment (yields the GATT session) and state changes
//! (forwarded to the caller as ordinals). Both are driven by a single task, so
//! they are always disposed together.

use crate::domain::error::BleError;
use crate::domain::models::ConnectionState;
use crate::infrastructure::bluetooth::host::{GattConnection, HostStack, NativeStream};
use crate::infrastructure::bluetooth::registry::{DeviceRegistry, DeviceSession};
use crate::infrastructure::bluetooth::sink::EventSink;
use crate::infrastructure::bluetooth::subscription::{self, Detachable, Subscription};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ConnectionCoordinator {
    host: Arc<dyn HostStack>,
    registry: Arc<DeviceRegistry>,
}

impl ConnectionCoordinator {
    pub fn new(host: Arc<dyn HostStack>, registry: Arc<DeviceRegistry>) -> Self {
        Self { host, registry }
    }

    /// Connect to a scanned device, tearing down any previous session first.
    pub fn connect(
        &self,
        device_id: &str,
        wait_for_device: bool,
        sink: EventSink<ConnectionState>,
    ) -> Result<(), BleError> {
        self.disconnect(Some(device_id));

        let device = self
            .registry
            .get(device_id, |session| session.native_device.clone())?
            .ok_or_else(|| BleError::NotInitialized(device_id.to_string()))?;

        info!(
            "Connecting to Bluetooth device: {} (wait for device: {})",
            device_id, wait_for_device
        );

        // State changes are observed before establishment starts so that the
        // `connecting` transition is never missed.
        let (states, release_states) =
            subscription::detachable(self.host.observe_connection_state(&device));
        let (establish, release_establish) =
            subscription::detachable(self.host.establish_connection(&device, wait_for_device));

        let registry = self.registry.clone();
        let task_device_id = device_id.to_string();
        let task_sink = sink.clone();

        // Spawned under the registry lock so the task cannot tear itself down
        // before it has been stored in the session.
        self.registry.get(device_id, move |session| {
            let subscription = Subscription::spawn(move |generation| {
                drive(registry, task_device_id, generation, establish, states, task_sink)
            })
            .holding(release_states)
            .holding(release_establish);
            session.connection_task = Some(subscription);
            session.output_sink = Some(sink);
        })
    }

    /// Disconnect one device, or every registered device when `None`.
    /// Disconnecting a device with no active session is a no-op.
    pub fn disconnect(&self, device_id: Option<&str>) {
        match device_id {
            Some(id) => teardown(&self.registry, id, None),
            None => {
                for id in self.registry.device_ids() {
                    teardown(&self.registry, &id, None);
                }
            }
        }
    }

    /// Last state reported by the native stack for this device.
    pub fn connection_state(&self, device_id: &str) -> Result<ConnectionState, BleError> {
        self.registry
            .get(device_id, |session| session.connection_state)
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.registry
            .get(device_id, |session| session.connection.is_some())
            .unwrap_or(false)
    }
}

impl Drop for ConnectionCoordinator {
    fn drop(&mut self) {
        // Running tasks hold the registry, so they would outlive us otherwise.
        self.disconnect(None);
    }
}

async fn drive(
    registry: Arc<DeviceRegistry>,
    device_id: String,
    generation: u64,
    mut establish: Detachable<NativeStream<Arc<dyn GattConnection>>>,
    mut states: Detachable<NativeStream<ConnectionState>>,
    sink: EventSink<ConnectionState>,
) {
    loop {
        tokio::select! {
            // Establishment first: the session must be stored before the
            // caller can observe `connected`.
            biased;

            connection = establish.next() => match connection {
                Some(Ok(connection)) => {
                    info!("Device connected: {}", device_id);
                    with_generation(&registry, &device_id, generation, |session| {
                        session.connection = Some(connection);
                    });
                }
                Some(Err(e)) => {
                    error!("Connection to {} failed: {}", device_id, e);
                    sink.error(e.into());
                    break;
                }
                None => {
                    debug!("Connection stream for {} completed", device_id);
                    break;
                }
            },
            state = states.next() => match state {
                Some(Ok(state)) => {
                    debug!("Device {} state: {:?}", device_id, state);
                    with_generation(&registry, &device_id, generation, |session| {
                        session.connection_state = state;
                    });
                    if !sink.send(state) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!("State stream for {} failed: {}", device_id, e);
                    sink.error(e.into());
                    break;
                }
                None => break,
            },
            _ = sink.consumer_gone() => {
                debug!("Connection consumer for {} went away", device_id);
                break;
            }
        }
    }
    teardown(&registry, &device_id, Some(generation));
}

fn with_generation(
    registry: &DeviceRegistry,
    device_id: &str,
    generation: u64,
    f: impl FnOnce(&mut DeviceSession),
) {
    registry.if_present(device_id, |session| {
        if session.connection_task.as_ref().map(Subscription::id) == Some(generation) {
            f(session);
        }
    });
}

/// The one teardown path for a session. With `Some(generation)` only that
/// session is torn down, so a finishing task never ends a newer connection.
fn teardown(registry: &DeviceRegistry, device_id: &str, generation: Option<u64>) {
    let taken = registry
        .if_present(device_id, |session| {
            if let Some(generation) = generation {
                if session.connection_task.as_ref().map(Subscription::id) != Some(generation) {
                    return None;
                }
            }
            let task = session.connection_task.take();
            let sink = session.output_sink.take();
            if task.is_none() && sink.is_none() {
                return None;
            }
            session.connection = None;
            session.connection_state = ConnectionState::Disconnected;
            session.characteristic_index.clear();
            session.service_map.clear();
            Some((task, sink))
        })
        .flatten();

    match taken {
        Some((task, sink)) => {
            info!("Disconnected from device {}", device_id);
            if let Some(mut task) = task {
                task.dispose();
            }
            if let Some(sink) = sink {
                sink.end_of_stream();
            }
        }
        None if generation.is_none() => {
            debug!("Device {} has no active session", device_id);
        }
        None => warn!("Stale connection task for {} finished", device_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ScanFilter;
    use crate::infrastructure::bluetooth::registry::SessionLookup;
    use crate::infrastructure::bluetooth::scanner::ScanCoordinator;
    use crate::infrastructure::bluetooth::simulated::{SimPeripheral, SimulatedHost, StreamKind};
    use crate::infrastructure::bluetooth::sink;

    const WIDGET: &str = "AA:BB:CC:DD:EE:FF";
    const GADGET: &str = "11:22:33:44:55:66";

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn setup() -> (SimulatedHost, Arc<DeviceRegistry>, ConnectionCoordinator) {
        let host = SimulatedHost::new();
        host.add_peripheral(SimPeripheral::new(WIDGET, Some("Widget"), -42));
        host.add_peripheral(SimPeripheral::new(GADGET, Some("Gadget"), -60));
        let registry = Arc::new(DeviceRegistry::new());
        let shared: Arc<dyn HostStack> = Arc::new(host.clone());

        let scanner = ScanCoordinator::new(shared.clone(), registry.clone(), host.clock());
        let (tx, mut rx) = sink::channel();
        scanner.start(ScanFilter::default(), tx);
        host.advertise(WIDGET);
        host.advertise(GADGET);
        rx.next().await.unwrap().unwrap();
        rx.next().await.unwrap().unwrap();
        scanner.stop();

        let connections = ConnectionCoordinator::new(shared, registry.clone());
        (host, registry, connections)
    }

    #[tokio::test]
    async fn test_unscanned_device_fails() {
        let (_host, _registry, connections) = setup().await;
        let (tx, _rx) = sink::channel();
        assert_eq!(
            connections.connect("00:00:00:00:00:00", false, tx),
            Err(BleError::NotInitialized("00:00:00:00:00:00".into()))
        );
        assert!(connections.connection_state("00:00:00:00:00:00").is_err());
    }

    #[tokio::test]
    async fn test_connect_reports_states_and_stores_session() {
        let (_host, registry, connections) = setup().await;
        assert_eq!(
            connections.connection_state(WIDGET),
            Ok(ConnectionState::Disconnected)
        );

        let (tx, mut rx) = sink::channel();
        connections.connect(WIDGET, false, tx).unwrap();
        assert_eq!(rx.next().await, Some(Ok(ConnectionState::Connecting)));
        assert_eq!(rx.next().await, Some(Ok(ConnectionState::Connected)));
        assert!(registry.established(WIDGET).is_ok());
        assert_eq!(
            connections.connection_state(WIDGET),
            Ok(ConnectionState::Connected)
        );

        connections.disconnect(Some(WIDGET));
        assert_eq!(rx.next().await, None);
        assert!(matches!(
            registry.established(WIDGET),
            Err(BleError::NotConnected(_))
        ));
        assert_eq!(
            connections.connection_state(WIDGET),
            Ok(ConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_reconnect_disposes_previous_session() {
        let (host, _registry, connections) = setup().await;
        let (first_tx, mut first_rx) = sink::channel();
        connections.connect(WIDGET, false, first_tx).unwrap();
        assert_eq!(first_rx.next().await, Some(Ok(ConnectionState::Connecting)));

        let (second_tx, mut second_rx) = sink::channel();
        connections.connect(WIDGET, false, second_tx).unwrap();

        // The first session's streams were gone before the second opened.
        assert_eq!(host.active_streams(StreamKind::Connect), 1);
        assert_eq!(host.active_streams(StreamKind::State), 1);
        assert_eq!(host.peak_streams(StreamKind::Connect), 1);
        assert_eq!(host.peak_streams(StreamKind::State), 1);

        // Whatever the first session delivered before the second call, it
        // ends cleanly and delivers nothing afterwards.
        let rest: Vec<_> = first_rx.collect().await;
        assert!(rest.iter().all(|e| e.is_ok()));
        assert_eq!(second_rx.next().await, Some(Ok(ConnectionState::Connecting)));
        assert_eq!(second_rx.next().await, Some(Ok(ConnectionState::Connected)));

        settle().await;
        assert_eq!(host.active_streams(StreamKind::Connect), 1);
        assert_eq!(host.active_streams(StreamKind::State), 1);
    }

    #[tokio::test]
    async fn test_disconnect_all_and_noop() {
        let (host, _registry, connections) = setup().await;
        // Nothing connected yet.
        connections.disconnect(Some(GADGET));
        connections.disconnect(Some("never-seen"));

        let (a_tx, a_rx) = sink::channel();
        let (b_tx, b_rx) = sink::channel();
        connections.connect(WIDGET, false, a_tx).unwrap();
        connections.connect(GADGET, false, b_tx).unwrap();

        connections.disconnect(None);
        assert_eq!(host.active_streams(StreamKind::Connect), 0);
        assert_eq!(host.active_streams(StreamKind::State), 0);
        let _: Vec<_> = a_rx.collect().await;
        let _: Vec<_> = b_rx.collect().await;

        // Again, now with nothing to do.
        connections.disconnect(None);
    }

    #[tokio::test]
    async fn test_link_loss_is_terminal_error() {
        let (host, _registry, connections) = setup().await;
        let (tx, mut rx) = sink::channel();
        connections.connect(WIDGET, false, tx).unwrap();
        assert_eq!(rx.next().await, Some(Ok(ConnectionState::Connecting)));
        assert_eq!(rx.next().await, Some(Ok(ConnectionState::Connected)));

        host.drop_link(WIDGET);
        let err = rx.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "NativeStackError");
        assert_eq!(rx.next().await, None);
        assert!(!connections.is_connected(WIDGET));
    }

    #[tokio::test]
    async fn test_unreachable_without_waiting_fails() {
        let host = SimulatedHost::new();
        host.add_peripheral(SimPeripheral::new(WIDGET, None, -80).unreachable());
        let registry = Arc::new(DeviceRegistry::new());
        let shared: Arc<dyn HostStack> = Arc::new(host.clone());
        let scanner = ScanCoordinator::new(shared.clone(), registry.clone(), host.clock());
        let (scan_tx, mut scan_rx) = sink::channel();
        scanner.start(ScanFilter::default(), scan_tx);
        host.advertise(WIDGET);
        scan_rx.next().await.unwrap().unwrap();

        let connections = ConnectionCoordinator::new(shared, registry);
        let (tx, rx) = sink::channel();
        connections.connect(WIDGET, false, tx).unwrap();
        let events: Vec<_> = rx.collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }

    #[tokio::test]
    async fn test_disconnect_releases_native_streams_immediately() {
        let (host, _registry, connections) = setup().await;
        let (tx, mut rx) = sink::channel();
        connections.connect(WIDGET, false, tx).unwrap();
        assert_eq!(host.active_streams(StreamKind::Connect), 1);
        assert_eq!(host.active_streams(StreamKind::State), 1);
        assert_eq!(rx.next().await, Some(Ok(ConnectionState::Connecting)));
        assert_eq!(rx.next().await, Some(Ok(ConnectionState::Connected)));

        connections.disconnect(Some(WIDGET));
        assert_eq!(host.active_streams(StreamKind::Connect), 0);
        assert_eq!(host.active_streams(StreamKind::State), 0);
        assert_eq!(host.state_of(WIDGET), Some(ConnectionState::Disconnected));
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn test_drop_disconnects_every_session() {
        let (host, registry, connections) = setup().await;
        let (tx, mut rx) = sink::channel();
        connections.connect(WIDGET, false, tx).unwrap();
        assert_eq!(rx.next().await, Some(Ok(ConnectionState::Connecting)));
        assert_eq!(rx.next().await, Some(Ok(ConnectionState::Connected)));

        drop(connections);
        assert_eq!(host.active_streams(StreamKind::Connect), 0);
        assert_eq!(host.active_streams(StreamKind::State), 0);
        assert_eq!(rx.next().await, None);
        assert!(matches!(
            registry.established(WIDGET),
            Err(BleError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_consumer_cancel_tears_down() {
        let (host, _registry, connections) = setup().await;
        let (tx, rx) = sink::channel();
        connections.connect(WIDGET, false, tx).unwrap();
        drop(rx);

        settle().await;
        assert!(!connections.is_connected(WIDGET));
        assert_eq!(host.active_streams(StreamKind::Connect), 0);
        assert_eq!(host.active_streams(StreamKind::State), 0);
    }
}
