//! BLE Scanner Module
//!
//! Owns at most one active discovery stream. Every advertisement upserts the
//! device's native handle into the registry and is forwarded to the caller as
//! a [`DiscoveryRecord`].

use crate::domain::models::{DiscoveryRecord, ScanFilter};
use crate::infrastructure::bluetooth::host::{HostStack, ScanEvent};
use crate::infrastructure::bluetooth::protocol::{self, Clock};
use crate::infrastructure::bluetooth::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::sink::EventSink;
use crate::infrastructure::bluetooth::subscription::{self, Subscription};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

struct ActiveScan {
    subscription: Subscription,
    sink: EventSink<DiscoveryRecord>,
}

type ScanSlot = Arc<Mutex<Option<ActiveScan>>>;

/// BLE scanner with a single-active-scan invariant
pub struct ScanCoordinator {
    host: Arc<dyn HostStack>,
    registry: Arc<DeviceRegistry>,
    clock: Arc<dyn Clock>,
    active: ScanSlot,
}

impl ScanCoordinator {
    pub fn new(
        host: Arc<dyn HostStack>,
        registry: Arc<DeviceRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            host,
            registry,
            clock,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Start scanning, replacing any scan already running.
    pub fn start(&self, filter: ScanFilter, sink: EventSink<DiscoveryRecord>) {
        // Stop any existing scan
        self.stop();

        info!(
            "Starting BLE scan (mode {:?}, device {:?}, name {:?}, service {:?})",
            filter.mode, filter.device_id, filter.name, filter.service
        );

        let (upstream, release) = subscription::detachable(self.host.scan(&filter));
        let registry = self.registry.clone();
        let clock = self.clock.clone();
        let slot = self.active.clone();
        let task_sink = sink.clone();

        // Spawned under the slot lock so a task that finishes immediately
        // cannot run its teardown before it has been stored.
        let mut active = lock(&self.active);
        let subscription = Subscription::spawn(move |id| async move {
            let mut upstream = upstream;
            loop {
                tokio::select! {
                    event = upstream.next() => match event {
                        Some(Ok(event)) => {
                            let record = record_for(&registry, clock.as_ref(), event);
                            debug!("Discovered {} ({:?}) rssi {}", record.id, record.name, record.rssi);
                            if !task_sink.send(record) {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Scan failed: {}", e);
                            task_sink.error(e.into());
                            break;
                        }
                        None => break,
                    },
                    _ = task_sink.consumer_gone() => {
                        debug!("Scan consumer went away");
                        break;
                    }
                }
            }
            teardown(&slot, Some(id));
        })
        .holding(release);
        *active = Some(ActiveScan { subscription, sink });
    }

    /// Stop scanning. Safe to call when idle.
    pub fn stop(&self) {
        teardown(&self.active, None);
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.active).is_some()
    }
}

impl Drop for ScanCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(slot: &ScanSlot) -> MutexGuard<'_, Option<ActiveScan>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record_for(registry: &DeviceRegistry, clock: &dyn Clock, event: ScanEvent) -> DiscoveryRecord {
    let id = event.device.address.clone();
    registry.get_or_create(&id, |session| session.native_device = Some(event.device));
    DiscoveryRecord {
        name: event.name,
        id,
        rssi: event.rssi,
        timestamp_ms: protocol::reconcile_timestamp(clock, event.elapsed_realtime_nanos),
    }
}

/// The one teardown path for a scan. With `Some(id)` only that generation is
/// torn down, so a finishing task never stops a scan that replaced it.
fn teardown(slot: &ScanSlot, id: Option<u64>) {
    let taken = {
        let mut active = lock(slot);
        match (&*active, id) {
            (Some(scan), Some(id)) if scan.subscription.id() != id => None,
            _ => active.take(),
        }
    };
    if let Some(mut scan) = taken {
        info!("Stopping BLE scan...");
        scan.subscription.dispose();
        scan.sink.end_of_stream();
    }
}
