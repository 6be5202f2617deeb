//! In-memory [`PermissionPlatform`] with settable flags and a prompt log.

use crate::domain::models::PromptKind;
use crate::infrastructure::permission::platform::{LocationCheck, PermissionPlatform};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct PlatformState {
    bluetooth_available: bool,
    bluetooth_enabled: bool,
    location: LocationCheck,
    permission_granted: bool,
    show_rationale: bool,
    prompts: Vec<PromptKind>,
    settings_opened: usize,
}

#[derive(Clone)]
pub struct SimulatedPlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl SimulatedPlatform {
    /// A device where every check already passes.
    pub fn granted() -> Self {
        Self {
            state: Arc::new(Mutex::new(PlatformState {
                bluetooth_available: true,
                bluetooth_enabled: true,
                location: LocationCheck::Enabled,
                permission_granted: true,
                show_rationale: false,
                prompts: Vec::new(),
                settings_opened: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, PlatformState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_bluetooth_available(&self, available: bool) {
        self.state().bluetooth_available = available;
    }

    pub fn set_bluetooth_enabled(&self, enabled: bool) {
        self.state().bluetooth_enabled = enabled;
    }

    pub fn set_location(&self, location: LocationCheck) {
        self.state().location = location;
    }

    pub fn set_permission_granted(&self, granted: bool) {
        self.state().permission_granted = granted;
    }

    pub fn set_show_rationale(&self, show: bool) {
        self.state().show_rationale = show;
    }

    /// Prompts issued so far, oldest first.
    pub fn prompts(&self) -> Vec<PromptKind> {
        self.state().prompts.clone()
    }

    pub fn settings_opened(&self) -> usize {
        self.state().settings_opened
    }
}

#[async_trait]
impl PermissionPlatform for SimulatedPlatform {
    fn is_bluetooth_available(&self) -> bool {
        self.state().bluetooth_available
    }

    fn is_bluetooth_enabled(&self) -> bool {
        let state = self.state();
        state.bluetooth_available && state.bluetooth_enabled
    }

    async fn check_location(&self) -> LocationCheck {
        tokio::task::yield_now().await;
        self.state().location
    }

    fn has_location_permission(&self) -> bool {
        self.state().permission_granted
    }

    fn should_show_rationale(&self) -> bool {
        self.state().show_rationale
    }

    fn prompt(&self, kind: PromptKind) {
        self.state().prompts.push(kind);
    }

    fn open_app_settings(&self) {
        self.state().settings_opened += 1;
    }
}
