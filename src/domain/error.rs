//! Error taxonomy surfaced by every orchestrator operation.

use crate::domain::models::ErrorPayload;
use thiserror::Error;

/// Lower-level radio / GATT / OS failure reported by the host stack.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct NativeError {
    pub message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BleError {
    /// The device was referenced before a scan discovered it.
    #[error("device {0} has not been initialized yet; start a scan and wait for it to appear in the results before accessing it")]
    NotInitialized(String),

    /// The operation needs an established connection.
    #[error("connection to device {0} has not been established; connect and wait for the connected state before any read/write operation")]
    NotConnected(String),

    /// The characteristic was not part of the last discovery for this device.
    #[error("characteristic {uuid} of device {device_id} has not been discovered")]
    CharacteristicNotFound { device_id: String, uuid: String },

    #[error("native stack error: {0}")]
    NativeStack(#[from] NativeError),

    /// An OS callback carried a result code outside the known set.
    #[error("unexpected result code {code} for {prompt}")]
    UnexpectedCallbackCode { prompt: &'static str, code: i32 },

    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    /// The pending request was dropped before the OS answered it.
    #[error("pending request was dropped before it resolved")]
    RequestDropped,
}

impl BleError {
    /// Stable code used at the application boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "NotInitialized",
            Self::NotConnected(_) => "NotConnected",
            Self::CharacteristicNotFound { .. } => "CharacteristicNotFound",
            Self::NativeStack(_) => "NativeStackError",
            Self::UnexpectedCallbackCode { .. } => "UnexpectedCallbackCode",
            Self::InvalidUuid(_) => "InvalidUuid",
            Self::RequestDropped => "RequestDropped",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}
