//! BLE Protocol Helpers
//!
//! UUID normalization shared by the characteristic cache and the
//! notification manager, plus the clock used to stamp discovery records.

use crate::domain::error::BleError;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Bluetooth Base UUID: 0000xxxx-0000-1000-8000-00805F9B34FB
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Parse a UUID string, expanding 16- and 32-bit short forms against the
/// Bluetooth base UUID so that "2A37" and its 128-bit form compare equal.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, BleError> {
    let trimmed = uuid_str.trim();
    let hex = trimmed.strip_prefix("0x").unwrap_or(trimmed);

    match hex.len() {
        4 | 8 if hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
            let short = u32::from_str_radix(hex, 16)
                .map_err(|_| BleError::InvalidUuid(uuid_str.to_string()))?;
            Ok(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96)))
        }
        _ => Uuid::parse_str(hex).map_err(|_| BleError::InvalidUuid(uuid_str.to_string())),
    }
}

/// Wall-clock and monotonic samples used to stamp scan results.
pub trait Clock: Send + Sync {
    fn wall_clock_ms(&self) -> i64;
    fn elapsed_realtime_ms(&self) -> i64;
}

/// Process clock. The monotonic origin is the moment the clock was created.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Monotonic nanoseconds since this clock's origin, the unit native
    /// scan events are stamped in.
    pub fn elapsed_realtime_nanos(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn wall_clock_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }

    fn elapsed_realtime_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

/// Convert a monotonic event time into Unix milliseconds.
///
/// `wall_now - elapsed_now` is the wall-clock instant of the monotonic origin;
/// adding the event's monotonic offset keeps timestamps stable even if the
/// wall clock is adjusted while a scan is running.
pub fn reconcile_timestamp(clock: &dyn Clock, event_elapsed_nanos: i64) -> i64 {
    let origin_ms = clock.wall_clock_ms() - clock.elapsed_realtime_ms();
    (origin_ms as f64 + event_elapsed_nanos as f64 / 1e6) as i64
}
