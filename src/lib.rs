//! BLE central-role connection engine.
//!
//! Connects to a peripheral, resolves the roles a device profile requires
//! and runs serialized GATT reads, writes and subscriptions over a
//! pluggable [`TransportAdapter`].

pub mod domain;
pub mod infrastructure;

pub use domain::capability::{CapabilityRequirement, RequiredCapabilitySet};
pub use domain::error::{ConnectError, OperationError};
pub use domain::models::{ConnectionState, DeviceId, NotificationEvent, StreamClosed};
pub use infrastructure::bluetooth::{
    BluetoothService, Connection, ConnectionConfig, NotificationStream, TransportAdapter,
};
