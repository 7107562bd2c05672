//! Bluetooth Module
//!
//! BLE communication with the CARTA.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceService                        │
//! │  (select loop: transport events, commands, timers)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!               DeviceController ──────────────┐
//!                       │                      │
//!                       ▼                      ▼
//! ┌───────────┐  ┌────────────┐         ┌──────────┐
//! │  Scanner  │◄─│ Connection │         │ Protocol │
//! │           │  │            │         │          │
//! │ - dedup   │  │ - GATT     │         │ - UUIDs  │
//! │           │  │ - reconcile│         │ - frames │
//! └───────────┘  └─────┬──────┘         └──────────┘
//!                      │
//!                      ▼
//!            Transport (simulator / bluest)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, command frames and telemetry decoding
//! - [`transport`] - Host BLE stack port and its events
//! - [`scanner`] - Discovery set
//! - [`connection`] - Link state machine and reconnect policy
//! - [`service`] - Execution context
//! - [`simulator`] - In-process virtual CARTA
//! - `bluest_backend` - Real adapter (feature `ble`)

#[cfg(feature = "ble")]
pub mod bluest_backend;
pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulator;
pub mod transport;

// Re-export main service for convenience
pub use service::DeviceService;
