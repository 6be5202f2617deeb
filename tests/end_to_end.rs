use ble_orchestrator::domain::models::PromptKind;
use ble_orchestrator::infrastructure::bluetooth::simulated::{SimPeripheral, SimulatedHost, StreamKind};
use ble_orchestrator::infrastructure::permission::platform::{RESULT_CANCELED, RESULT_OK};
use ble_orchestrator::infrastructure::permission::SimulatedPlatform;
use ble_orchestrator::{AccessStatus, BleError, BleService, ConnectionState, ScanFilter};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;

const WIDGET: &str = "AA:BB:CC:DD:EE:FF";

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn setup() -> (SimulatedHost, SimulatedPlatform, BleService) {
    let host = SimulatedHost::new();
    host.add_peripheral(
        SimPeripheral::new(WIDGET, Some("Widget"), -42)
            .with_service("180D", &["2A37"])
            .with_value("2A37", &[0x06, 0x48]),
    );
    let platform = SimulatedPlatform::granted();
    let service = BleService::with_clock(
        Arc::new(host.clone()),
        Arc::new(platform.clone()),
        host.clock(),
    );
    (host, platform, service)
}

#[tokio::test]
async fn test_full_session() {
    let (host, _platform, service) = setup();

    let mut scan = service.scan_start(ScanFilter::default());
    host.advertise(WIDGET);
    let record = scan.next().await.unwrap().unwrap();
    assert_eq!(record.name.as_deref(), Some("Widget"));
    assert_eq!(record.id, WIDGET);
    assert_eq!(record.rssi, -42);
    assert!(record.timestamp_ms > 0);
    service.scan_stop();
    assert!(scan.next().await.is_none());

    let mut states = service.connect_start(WIDGET, false);
    let first = states.next().await.unwrap().unwrap();
    let second = states.next().await.unwrap().unwrap();
    assert_eq!([first.ordinal(), second.ordinal()], [0, 1]);
    assert_eq!(service.connection_state(WIDGET), Ok(ConnectionState::Connected));

    let services = service.discover(WIDGET).await.unwrap();
    let expected: BTreeMap<String, Vec<String>> =
        [("180D".to_string(), vec!["2A37".to_string()])].into_iter().collect();
    assert_eq!(services, expected);

    assert_eq!(service.read(WIDGET, "2A37").await, Ok(vec![0x06, 0x48]));

    let mut notifications = service.notify_start(WIDGET, "2A37");
    host.notify(WIDGET, "2A37", &[0x01, 0x02]);
    assert_eq!(notifications.next().await, Some(Ok(vec![0x01, 0x02])));

    service.connect_stop(Some(WIDGET));
    assert_eq!(host.active_streams(StreamKind::Connect), 0);
    assert_eq!(host.active_streams(StreamKind::State), 0);
    assert_eq!(host.state_of(WIDGET), Some(ConnectionState::Disconnected));
    assert_eq!(states.next().await, None);
    assert_eq!(notifications.next().await, None);

    settle().await;
    assert_eq!(host.active_streams(StreamKind::Notify), 0);
    assert_eq!(
        service.connection_state(WIDGET),
        Ok(ConnectionState::Disconnected)
    );
}

#[tokio::test]
async fn test_scan_cancelled_before_any_event() {
    let (host, _platform, service) = setup();
    let scan = service.scan_start(ScanFilter::default());
    drop(scan);
    settle().await;
    host.advertise(WIDGET);

    assert!(!service.is_scanning());
    assert_eq!(host.active_streams(StreamKind::Scan), 0);
    assert!(service.known_devices().is_empty());
}

#[tokio::test]
async fn test_scan_stop_right_after_start_is_clean() {
    let (host, _platform, service) = setup();
    let scan = service.scan_start(ScanFilter::default());
    service.scan_stop();
    assert_eq!(host.active_streams(StreamKind::Scan), 0);
    let events: Vec<_> = scan.collect().await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_unscanned_device_is_not_initialized_everywhere() {
    let (_host, _platform, service) = setup();
    let not_initialized = BleError::NotInitialized(WIDGET.into());

    let events: Vec<_> = service.connect_start(WIDGET, false).collect().await;
    assert_eq!(events, vec![Err(not_initialized.clone())]);
    assert_eq!(service.connection_state(WIDGET), Err(not_initialized.clone()));
    assert_eq!(service.discover(WIDGET).await, Err(not_initialized.clone()));
    assert_eq!(service.read(WIDGET, "2A37").await, Err(not_initialized.clone()));
    assert_eq!(
        service.write(WIDGET, "2A37", &[0x00]).await,
        Err(not_initialized.clone())
    );
    assert_eq!(service.request_mtu(WIDGET, 185).await, Err(not_initialized.clone()));
    let events: Vec<_> = service.notify_start(WIDGET, "2A37").collect().await;
    assert_eq!(events, vec![Err(not_initialized)]);

    // Disconnecting something never seen is a no-op.
    service.connect_stop(Some(WIDGET));
    service.connect_stop(None);
}

#[tokio::test]
async fn test_reconnect_silences_previous_session() {
    let (host, _platform, service) = setup();
    let mut scan = service.scan_start(ScanFilter::default());
    host.advertise(WIDGET);
    scan.next().await.unwrap().unwrap();

    let first = service.connect_start(WIDGET, false);
    assert_eq!(host.active_streams(StreamKind::Connect), 1);
    let mut second = service.connect_start(WIDGET, false);
    // The first session was released before the second was established.
    assert_eq!(host.peak_streams(StreamKind::Connect), 1);
    assert_eq!(host.peak_streams(StreamKind::State), 1);

    let first_events: Vec<_> = first.collect().await;
    assert!(first_events.is_empty());
    assert_eq!(second.next().await, Some(Ok(ConnectionState::Connecting)));
    assert_eq!(second.next().await, Some(Ok(ConnectionState::Connected)));

    settle().await;
    assert_eq!(host.active_streams(StreamKind::Connect), 1);
    assert_eq!(host.active_streams(StreamKind::State), 1);
}

#[tokio::test]
async fn test_disconnect_all() {
    let (host, _platform, service) = setup();
    host.add_peripheral(SimPeripheral::new("11:22:33:44:55:66", None, -60));
    let mut scan = service.scan_start(ScanFilter::default());
    host.advertise(WIDGET);
    host.advertise("11:22:33:44:55:66");
    scan.next().await.unwrap().unwrap();
    scan.next().await.unwrap().unwrap();

    let mut a = service.connect_start(WIDGET, false);
    let mut b = service.connect_start("11:22:33:44:55:66", false);
    for states in [&mut a, &mut b] {
        states.next().await.unwrap().unwrap();
        states.next().await.unwrap().unwrap();
    }

    service.connect_stop(None);
    assert_eq!(a.next().await, None);
    assert_eq!(b.next().await, None);
}

#[tokio::test]
async fn test_permission_fifo_across_queues() {
    let (_host, platform, service) = setup();
    platform.set_bluetooth_enabled(false);
    let negotiator = service.permissions();
    let bt = PromptKind::EnableBluetooth.request_code();

    let r1 = negotiator.submit_access_request().await;
    let r2 = negotiator.submit_access_request().await;
    let r3 = negotiator.submit_access_request().await;

    // Activity on another queue does not disturb the Bluetooth queue.
    platform.set_permission_granted(false);
    let other = negotiator.submit_location_permission_request();
    assert!(negotiator.on_permission_result(PromptKind::LocationPermission.request_code(), &[true]));
    assert_eq!(other.await, Ok(AccessStatus::Ok));
    platform.set_permission_granted(true);

    assert!(negotiator.on_activity_result(bt, RESULT_CANCELED, true).await);
    platform.set_bluetooth_enabled(true);
    assert!(negotiator.on_activity_result(bt, RESULT_OK, true).await);
    assert!(negotiator.on_activity_result(bt, 99, true).await);

    assert_eq!(r1.await, Ok(AccessStatus::BtDisabled));
    assert_eq!(r2.await, Ok(AccessStatus::Ok));
    assert!(matches!(
        r3.await,
        Err(BleError::UnexpectedCallbackCode { code: 99, .. })
    ));
    assert!(service.has_access().await);
}

#[tokio::test]
async fn test_dropping_service_ends_sessions() {
    let (host, _platform, service) = setup();
    let mut scan = service.scan_start(ScanFilter::default());
    host.advertise(WIDGET);
    scan.next().await.unwrap().unwrap();

    let mut states = service.connect_start(WIDGET, false);
    states.next().await.unwrap().unwrap();
    states.next().await.unwrap().unwrap();
    let mut notifications = {
        service.discover(WIDGET).await.unwrap();
        service.notify_start(WIDGET, "2A37")
    };

    drop(service);
    assert_eq!(host.active_streams(StreamKind::Scan), 0);
    assert_eq!(host.active_streams(StreamKind::Connect), 0);
    assert_eq!(host.active_streams(StreamKind::State), 0);
    assert_eq!(host.active_streams(StreamKind::Notify), 0);
    assert_eq!(host.state_of(WIDGET), Some(ConnectionState::Disconnected));
    assert_eq!(scan.next().await, None);
    assert_eq!(states.next().await, None);
    assert_eq!(notifications.next().await, None);
}

#[tokio::test]
async fn test_permission_denied_with_rationale() {
    let (_host, platform, service) = setup();
    platform.set_permission_granted(false);
    let negotiator = service.permissions();

    let pending = negotiator.submit_access_request().await;
    platform.set_show_rationale(true);
    assert!(negotiator.on_permission_result(PromptKind::LocationPermission.request_code(), &[false]));
    let status = pending.await.unwrap();
    assert_eq!(status, AccessStatus::LocDenied);
    assert_eq!(status.ordinal(), 3);
    assert!(!service.has_access().await);
}
