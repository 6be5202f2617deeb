//! Bluetooth Module
//!
//! BLE session orchestration over an abstract native stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       BleService                         │
//! │  (Owns the registry; public request/stream surface)      │
//! └──────┬──────────────┬──────────────┬──────────────┬─────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │   GATT    │  │  Notify  │
//! │           │  │            │  │           │  │          │
//! │ - single  │  │ - per-dev  │  │ - discover│  │ - one per│
//! │   scan    │  │   session  │  │ - read/   │  │   (dev,  │
//! │           │  │            │  │   write   │  │   char)  │
//! └─────┬─────┘  └─────┬──────┘  └─────┬─────┘  └────┬─────┘
//!       │              │               │             │
//!       └──────────────┴───────┬───────┴─────────────┘
//!                              ▼
//!                 ┌─────────────────────────┐
//!                 │ DeviceRegistry / Host   │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`host`] - Native stack traits the orchestrator drives
//! - [`protocol`] - UUID normalization and timestamp reconciliation
//! - [`sink`] - Event channel that terminates exactly once
//! - [`subscription`] - Idempotent cancellation handles
//! - [`registry`] - Per-device session state
//! - [`scanner`] - BLE device discovery
//! - [`connection`] - Connection sessions and state streams
//! - [`gatt`] - Characteristic discovery and I/O
//! - [`notify`] - Notification subscriptions
//! - [`service`] - Main service coordinator
//! - [`simulated`] - In-memory host stack

pub mod connection;
pub mod gatt;
pub mod host;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod sink;
pub mod subscription;

// Re-export main service for convenience
pub use service::BleService;
