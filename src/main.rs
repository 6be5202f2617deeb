use ble_orchestrator::domain::models::{ConnectionState, PromptKind, ScanFilter};
use ble_orchestrator::domain::settings::SettingsService;
use ble_orchestrator::infrastructure::bluetooth::simulated::{SimPeripheral, SimulatedHost};
use ble_orchestrator::infrastructure::logging;
use ble_orchestrator::infrastructure::permission::platform::RESULT_OK;
use ble_orchestrator::infrastructure::permission::SimulatedPlatform;
use ble_orchestrator::BleService;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{info, warn};

const DEMO_DEVICE: &str = "AA:BB:CC:DD:EE:FF";
const HEART_RATE_MEASUREMENT: &str = "2A37";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = SettingsService::new()?;
    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting BLE Orchestrator demo");
    info!("Settings file: {:?}", settings.path());

    let host = SimulatedHost::new();
    host.add_peripheral(
        SimPeripheral::new(DEMO_DEVICE, Some("Widget"), -42)
            .with_service("180D", &[HEART_RATE_MEASUREMENT])
            .with_value(HEART_RATE_MEASUREMENT, &[0x06, 0x48]),
    );
    let platform = SimulatedPlatform::granted();
    platform.set_bluetooth_enabled(false);

    let service = BleService::with_clock(
        Arc::new(host.clone()),
        Arc::new(platform.clone()),
        host.clock(),
    );

    // The user accepts the enable-Bluetooth prompt.
    let pending = service.permissions().submit_access_request().await;
    platform.set_bluetooth_enabled(true);
    service
        .permissions()
        .on_activity_result(PromptKind::EnableBluetooth.request_code(), RESULT_OK, true)
        .await;
    let status = pending.await?;
    info!("Access status: {:?} (ordinal {})", status, status.ordinal());

    let ble = settings.get().ble.clone();
    let mut scan = service.scan_start(ScanFilter {
        mode: ble.scan_mode,
        ..Default::default()
    });
    host.advertise(DEMO_DEVICE);
    if let Some(record) = scan.next().await.transpose()? {
        info!(
            "Found {:?} at {} (rssi {}, t={})",
            record.name, record.id, record.rssi, record.timestamp_ms
        );
    }
    service.scan_stop();

    let mut states = service.connect_start(DEMO_DEVICE, ble.wait_for_device);
    while let Some(state) = states.next().await.transpose()? {
        info!("Connection state: {:?} ({})", state, state.ordinal());
        if state == ConnectionState::Connected {
            break;
        }
    }
    let watcher = tokio::spawn(async move {
        while let Some(state) = states.next().await {
            match state {
                Ok(state) => info!("Connection state: {:?} ({})", state, state.ordinal()),
                Err(e) => warn!("Connection ended with error: {}", e),
            }
        }
        info!("Connection stream closed");
    });

    let services = service.discover(DEMO_DEVICE).await?;
    info!("Services: {:?}", services);
    let value = service.read(DEMO_DEVICE, HEART_RATE_MEASUREMENT).await?;
    info!("Read {}: {:02X?}", HEART_RATE_MEASUREMENT, value);
    let mtu = service.request_mtu(DEMO_DEVICE, ble.preferred_mtu).await?;
    info!("Negotiated MTU {}", mtu);

    let mut notifications = service.notify_start(DEMO_DEVICE, HEART_RATE_MEASUREMENT);
    host.notify(DEMO_DEVICE, HEART_RATE_MEASUREMENT, &[0x01, 0x02]);
    if let Some(payload) = notifications.next().await.transpose()? {
        info!("Notification: {:02X?}", payload);
    }

    service.connect_stop(Some(DEMO_DEVICE));
    watcher.await?;
    while notifications.next().await.is_some() {}

    if let Err(e) = settings.remember_device(DEMO_DEVICE) {
        warn!("Could not persist known device: {}", e);
    }
    info!("Demo finished");
    Ok(())
}
