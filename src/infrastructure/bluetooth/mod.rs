//! Bluetooth Module
//!
//! Central-role BLE connection engine: link lifecycle, capability
//! resolution and serialized GATT transactions over a pluggable transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (one live Connection per device, scanning)              │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │ Resolver  │
//! │           │  │            │  │           │
//! │ - dedup   │  │ - states   │  │ - roles → │
//! │ - filter  │  │ - queue    │  │   handles │
//! │           │  │ - streams  │  │           │
//! └─────┬─────┘  └─────┬──────┘  └───────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          TransportAdapter (platform stack / simulated)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Profile UUIDs, role names and ATT limits
//! - [`transport`] - The adapter contract every platform stack implements
//! - [`transaction`] - One queued GATT operation with timeout and retries
//! - [`queue`] - FIFO of transactions, one in flight per link
//! - [`resolver`] - Binds required roles to discovered characteristics
//! - [`connection`] - Per-device state machine and notification streams
//! - [`scanner`] - BLE device discovery
//! - [`simulated`] - In-memory adapter for the CLI and tests
//! - [`service`] - Main service coordinator

pub mod connection;
pub mod protocol;
pub mod queue;
pub mod resolver;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transaction;
pub mod transport;

// Re-export main types for convenience
pub use connection::{Connection, ConnectionConfig, NotificationStream};
pub use service::BluetoothService;
pub use transport::TransportAdapter;
