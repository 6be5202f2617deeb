//! Notification subscriptions, at most one per (device, characteristic).

use crate::domain::error::BleError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::registry::SessionLookup;
use crate::infrastructure::bluetooth::sink::EventSink;
use crate::infrastructure::bluetooth::subscription::{self, Subscription};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};
use uuid::Uuid;

type NotificationKey = (String, Uuid);

struct ActiveNotification {
    subscription: Subscription,
    sink: EventSink<Vec<u8>>,
}

type NotificationTable = Arc<Mutex<HashMap<NotificationKey, ActiveNotification>>>;

pub struct NotificationManager {
    sessions: Arc<dyn SessionLookup>,
    active: NotificationTable,
}

impl NotificationManager {
    pub fn new(sessions: Arc<dyn SessionLookup>) -> Self {
        Self {
            sessions,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Forward every notification of `uuid` on `device_id` to `sink`,
    /// replacing any subscription already open on the same characteristic.
    pub fn subscribe(
        &self,
        device_id: &str,
        uuid: &str,
        sink: EventSink<Vec<u8>>,
    ) -> Result<(), BleError> {
        self.unsubscribe(device_id, uuid);

        let (connection, characteristic) = self.sessions.characteristic(device_id, uuid)?;
        let key: NotificationKey = (device_id.to_string(), protocol::parse_uuid(uuid)?);

        info!("Enabling notifications for {} on {}", uuid, device_id);
        let (upstream, release) = subscription::detachable(connection.notifications(&characteristic));
        let table = self.active.clone();
        let task_key = key.clone();
        let task_sink = sink.clone();

        let mut active = lock(&self.active);
        let subscription = Subscription::spawn(move |id| async move {
            let mut upstream = upstream;
            loop {
                tokio::select! {
                    payload = upstream.next() => match payload {
                        Some(Ok(payload)) => {
                            debug!("Notification on {:?}: {} bytes", task_key, payload.len());
                            if !task_sink.send(payload) {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Notification stream {:?} failed: {}", task_key, e);
                            task_sink.error(e.into());
                            break;
                        }
                        None => break,
                    },
                    _ = task_sink.consumer_gone() => break,
                }
            }
            teardown(&table, &task_key, Some(id));
        })
        .holding(release);
        active.insert(key, ActiveNotification { subscription, sink });
        Ok(())
    }

    /// Dispose the subscription for this key, if any.
    pub fn unsubscribe(&self, device_id: &str, uuid: &str) {
        if let Ok(uuid) = protocol::parse_uuid(uuid) {
            teardown(&self.active, &(device_id.to_string(), uuid), None);
        }
    }

    pub fn is_subscribed(&self, device_id: &str, uuid: &str) -> bool {
        match protocol::parse_uuid(uuid) {
            Ok(uuid) => lock(&self.active).contains_key(&(device_id.to_string(), uuid)),
            Err(_) => false,
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }
}

impl Drop for NotificationManager {
    fn drop(&mut self) {
        let keys: Vec<_> = lock(&self.active).keys().cloned().collect();
        for key in keys {
            teardown(&self.active, &key, None);
        }
    }
}

fn lock(table: &NotificationTable) -> MutexGuard<'_, HashMap<NotificationKey, ActiveNotification>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn teardown(table: &NotificationTable, key: &NotificationKey, id: Option<u64>) {
    let taken = {
        let mut active = lock(table);
        match (active.get(key), id) {
            (Some(current), Some(id)) if current.subscription.id() != id => None,
            _ => active.remove(key),
        }
    };
    if let Some(mut notification) = taken {
        info!("Disabling notifications for {} on {}", key.1, key.0);
        notification.subscription.dispose();
        notification.sink.end_of_stream();
    }
}
