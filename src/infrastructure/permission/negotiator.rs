//! Access negotiation
//!
//! A `request_access` call walks Bluetooth availability, Bluetooth enabled,
//! location services and location permission in that order. Any step that
//! needs the user parks the caller in the queue for that prompt kind; the
//! matching OS callback resumes the oldest parked caller from where it left
//! off.

use crate::domain::error::BleError;
use crate::domain::models::{AccessStatus, PromptKind};
use crate::infrastructure::permission::platform::{ActivityResult, LocationCheck, PermissionPlatform};
use crate::infrastructure::permission::queue::{PendingRequestQueue, Responder};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Outcome of one access request, resolved by the negotiator.
pub struct PendingAccess {
    rx: oneshot::Receiver<Result<AccessStatus, BleError>>,
}

impl Future for PendingAccess {
    type Output = Result<AccessStatus, BleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(BleError::RequestDropped)))
    }
}

struct PromptQueues {
    bluetooth: PendingRequestQueue,
    location: PendingRequestQueue,
    permission: PendingRequestQueue,
}

impl PromptQueues {
    fn new() -> Self {
        Self {
            bluetooth: PendingRequestQueue::new(),
            location: PendingRequestQueue::new(),
            permission: PendingRequestQueue::new(),
        }
    }

    fn for_kind(&mut self, kind: PromptKind) -> &mut PendingRequestQueue {
        match kind {
            PromptKind::EnableBluetooth => &mut self.bluetooth,
            PromptKind::EnableLocation => &mut self.location,
            PromptKind::LocationPermission => &mut self.permission,
        }
    }
}

pub struct PermissionNegotiator {
    platform: Arc<dyn PermissionPlatform>,
    queues: Mutex<PromptQueues>,
}

impl PermissionNegotiator {
    pub fn new(platform: Arc<dyn PermissionPlatform>) -> Self {
        Self {
            platform,
            queues: Mutex::new(PromptQueues::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PromptQueues> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a request and return as soon as it is either resolved or parked
    /// behind an OS prompt. Await the returned handle for the status.
    pub async fn submit_access_request(&self) -> PendingAccess {
        let (tx, rx) = oneshot::channel();
        self.begin(tx).await;
        PendingAccess { rx }
    }

    pub async fn request_access(&self) -> Result<AccessStatus, BleError> {
        self.submit_access_request().await.await
    }

    /// Ask for the location permission alone, skipping the Bluetooth and
    /// location-services steps.
    pub fn submit_location_permission_request(&self) -> PendingAccess {
        let (tx, rx) = oneshot::channel();
        if self.platform.has_location_permission() {
            resolve(tx, Ok(AccessStatus::Ok));
        } else {
            self.park(PromptKind::LocationPermission, tx);
        }
        PendingAccess { rx }
    }

    pub async fn request_location_permission(&self) -> Result<AccessStatus, BleError> {
        self.submit_location_permission_request().await
    }

    /// True only while Bluetooth is enabled, location services are usable and
    /// the location permission is granted.
    pub async fn has_access(&self) -> bool {
        if !self.platform.is_bluetooth_available() {
            return false;
        }
        let location_enabled = self.platform.check_location().await == LocationCheck::Enabled;
        self.platform.is_bluetooth_enabled()
            && location_enabled
            && self.platform.has_location_permission()
    }

    pub fn open_app_settings(&self) {
        info!("Opening application settings");
        self.platform.open_app_settings();
    }

    pub fn pending(&self, kind: PromptKind) -> usize {
        self.lock().for_kind(kind).len()
    }

    /// Entry point for the enable-Bluetooth and enable-location prompts.
    ///
    /// `location_usable` is the host's view of location services at callback
    /// time. Returns false when the callback was not ours or nobody was
    /// waiting for it.
    pub async fn on_activity_result(
        &self,
        request_code: i32,
        result_code: i32,
        location_usable: bool,
    ) -> bool {
        let kind = match PromptKind::from_request_code(request_code) {
            Some(kind @ (PromptKind::EnableBluetooth | PromptKind::EnableLocation)) => kind,
            _ => return false,
        };
        // Dequeue before any await so concurrent callbacks keep their order.
        let Some(responder) = self.lock().for_kind(kind).dequeue() else {
            warn!("{} callback with no pending request", kind.label());
            return false;
        };
        debug!("{} answered with result code {}", kind.label(), result_code);

        match ActivityResult::from_code(result_code) {
            ActivityResult::Other(code) => {
                warn!("Unexpected result code {} for {}", code, kind.label());
                resolve(
                    responder,
                    Err(BleError::UnexpectedCallbackCode {
                        prompt: kind.label(),
                        code,
                    }),
                );
            }
            ActivityResult::Ok if kind == PromptKind::EnableBluetooth => {
                self.after_bluetooth(responder).await;
            }
            ActivityResult::Canceled if kind == PromptKind::EnableBluetooth => {
                resolve(responder, Ok(AccessStatus::BtDisabled));
            }
            ActivityResult::Ok if location_usable => self.after_location(responder),
            _ => resolve(responder, Ok(AccessStatus::LocDisabled)),
        }
        true
    }

    /// Entry point for the runtime location-permission prompt. An empty
    /// grant list (the prompt was interrupted) counts as a denial.
    pub fn on_permission_result(&self, request_code: i32, grants: &[bool]) -> bool {
        if PromptKind::from_request_code(request_code) != Some(PromptKind::LocationPermission) {
            return false;
        }
        let Some(responder) = self.lock().permission.dequeue() else {
            warn!("Permission callback with no pending request");
            return false;
        };

        let status = if grants.first().copied().unwrap_or(false) {
            AccessStatus::Ok
        } else if self.platform.should_show_rationale() {
            // Denied, but the OS will still show the prompt next time.
            AccessStatus::LocDenied
        } else {
            AccessStatus::LocDeniedNeverAskAgain
        };
        info!("Location permission resolved: {:?}", status);
        resolve(responder, Ok(status));
        true
    }

    async fn begin(&self, responder: Responder) {
        if !self.platform.is_bluetooth_available() {
            resolve(responder, Ok(AccessStatus::BluetoothNotAvailable));
        } else if self.platform.is_bluetooth_enabled() {
            self.after_bluetooth(responder).await;
        } else {
            self.park(PromptKind::EnableBluetooth, responder);
        }
    }

    async fn after_bluetooth(&self, responder: Responder) {
        match self.platform.check_location().await {
            LocationCheck::Enabled => self.after_location(responder),
            LocationCheck::ResolutionRequired => self.park(PromptKind::EnableLocation, responder),
            LocationCheck::Disabled => resolve(responder, Ok(AccessStatus::LocDisabled)),
        }
    }

    fn after_location(&self, responder: Responder) {
        if self.platform.has_location_permission() {
            resolve(responder, Ok(AccessStatus::Ok));
        } else if self.platform.should_show_rationale() {
            resolve(responder, Ok(AccessStatus::LocDeniedShowPermRationale));
        } else {
            self.park(PromptKind::LocationPermission, responder);
        }
    }

    /// Queue first, then prompt, so a callback delivered synchronously from
    /// inside `prompt` still finds its caller.
    fn park(&self, kind: PromptKind, responder: Responder) {
        self.lock().for_kind(kind).enqueue(responder);
        info!("Prompting user: {}", kind.label());
        self.platform.prompt(kind);
    }
}

fn resolve(responder: Responder, result: Result<AccessStatus, BleError>) {
    if responder.send(result).is_err() {
        debug!("Access requester went away before resolution");
    }
}
