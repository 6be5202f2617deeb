use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Service UUID -> characteristic UUIDs, as reported by the native stack.
pub type ServiceMap = BTreeMap<String, Vec<String>>;

/// One scan result describing a nearby peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub name: Option<String>,
    pub id: String,
    pub rssi: i32,
    /// Unix milliseconds, reconciled against the monotonic clock
    pub timestamp_ms: i64,
}

/// Scan duty mode, carried at the boundary as an ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanMode {
    Opportunistic,
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

impl ScanMode {
    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Opportunistic),
            1 => Some(Self::LowPower),
            2 => Some(Self::Balanced),
            3 => Some(Self::LowLatency),
            _ => None,
        }
    }

    pub fn ordinal(&self) -> i32 {
        match self {
            Self::Opportunistic => 0,
            Self::LowPower => 1,
            Self::Balanced => 2,
            Self::LowLatency => 3,
        }
    }

    /// Code understood by the native scanner (opportunistic is -1).
    pub fn native_code(&self) -> i32 {
        self.ordinal() - 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    pub device_id: Option<String>,
    pub name: Option<String>,
    /// Advertised service UUID
    pub service: Option<String>,
    #[serde(default)]
    pub mode: ScanMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Disconnecting,
}

impl ConnectionState {
    pub fn ordinal(&self) -> i32 {
        match self {
            Self::Connecting => 0,
            Self::Connected => 1,
            Self::Disconnected => 2,
            Self::Disconnecting => 3,
        }
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Connecting),
            1 => Some(Self::Connected),
            2 => Some(Self::Disconnected),
            3 => Some(Self::Disconnecting),
            _ => None,
        }
    }
}

/// Outcome of a permission negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessStatus {
    Ok,
    BtDisabled,
    LocDisabled,
    LocDenied,
    LocDeniedNeverAskAgain,
    LocDeniedShowPermRationale,
    BluetoothNotAvailable,
}

impl AccessStatus {
    pub fn ordinal(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::BtDisabled => 1,
            Self::LocDisabled => 2,
            Self::LocDenied => 3,
            Self::LocDeniedNeverAskAgain => 4,
            Self::LocDeniedShowPermRationale => 5,
            Self::BluetoothNotAvailable => 6,
        }
    }
}

/// The three OS prompts the permission negotiation can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    EnableBluetooth,
    EnableLocation,
    LocationPermission,
}

impl PromptKind {
    pub fn request_code(&self) -> i32 {
        match self {
            Self::EnableBluetooth => 1,
            Self::EnableLocation => 2,
            Self::LocationPermission => 3,
        }
    }

    pub fn from_request_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::EnableBluetooth),
            2 => Some(Self::EnableLocation),
            3 => Some(Self::LocationPermission),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::EnableBluetooth => "REQUEST_ENABLE_BT",
            Self::EnableLocation => "REQUEST_ENABLE_LOC",
            Self::LocationPermission => "REQUEST_PERM_LOC",
        }
    }
}

/// Error shape handed across the application boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}
