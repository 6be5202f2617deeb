//! Permission Module
//!
//! Negotiates Bluetooth and location access with the user and the OS.

pub mod negotiator;
pub mod platform;
pub mod queue;
pub mod simulated;

pub use negotiator::{PendingAccess, PermissionNegotiator};
pub use platform::{ActivityResult, LocationCheck, PermissionPlatform};
pub use simulated::SimulatedPlatform;
