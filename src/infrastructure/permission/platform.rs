//! OS prompt and permission primitives the negotiation runs against.

use crate::domain::models::PromptKind;
use async_trait::async_trait;

/// Android `Activity.RESULT_OK`
pub const RESULT_OK: i32 = -1;
/// Android `Activity.RESULT_CANCELED`
pub const RESULT_CANCELED: i32 = 0;

/// Live location-services status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationCheck {
    Enabled,
    /// Off, but the OS can prompt the user to turn it on
    ResolutionRequired,
    /// Off, and no prompt is available
    Disabled,
}

/// Result code carried by an activity callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityResult {
    Ok,
    Canceled,
    Other(i32),
}

impl ActivityResult {
    pub fn from_code(code: i32) -> Self {
        match code {
            RESULT_OK => Self::Ok,
            RESULT_CANCELED => Self::Canceled,
            other => Self::Other(other),
        }
    }
}

#[async_trait]
pub trait PermissionPlatform: Send + Sync {
    fn is_bluetooth_available(&self) -> bool;

    fn is_bluetooth_enabled(&self) -> bool;

    /// Asks the OS whether location services are usable.
    async fn check_location(&self) -> LocationCheck;

    fn has_location_permission(&self) -> bool;

    fn should_show_rationale(&self) -> bool;

    /// Fire-and-forget. The answer arrives later through the negotiator's
    /// callback entry points.
    fn prompt(&self, kind: PromptKind);

    fn open_app_settings(&self);
}
