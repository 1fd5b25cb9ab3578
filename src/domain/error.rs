//! Error taxonomy for the connection engine
//!
//! Transport adapter failures travel through these types unchanged; the
//! engine only adds the state-machine level kinds (`NotReady`, `LinkLost`,
//! `Timeout`, `UnsupportedDevice`).

use crate::domain::models::{CharProperties, ConnectionState, DeviceId};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Single-operation failure reported by the transport adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Operation not permitted")]
    NotPermitted,
    #[error("Insufficient authentication")]
    InsufficientAuthentication,
    #[error("Invalid attribute handle")]
    InvalidHandle,
    #[error("GATT failure: {0}")]
    Failure(String),
}

/// Service enumeration failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Service discovery failed: {0}")]
    Failed(String),
    #[error("Service discovery timed out after {0:?}")]
    Timeout(Duration),
}

/// First entry of the capability set that the device could not satisfy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingRequirement {
    Service(Uuid),
    Characteristic { service: Uuid, characteristic: Uuid },
    Properties {
        characteristic: Uuid,
        required: CharProperties,
        advertised: CharProperties,
    },
}

impl std::fmt::Display for MissingRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service(uuid) => write!(f, "service {} not present", uuid),
            Self::Characteristic {
                service,
                characteristic,
            } => write!(
                f,
                "characteristic {} not present in service {}",
                characteristic, service
            ),
            Self::Properties {
                characteristic,
                required,
                advertised,
            } => write!(
                f,
                "characteristic {} advertises {}, missing {}",
                characteristic,
                advertised,
                advertised.missing(*required)
            ),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported device: role '{role}' unmet ({missing})")]
pub struct UnsupportedDevice {
    pub role: String,
    pub missing: MissingRequirement,
}

/// Failures of the connect attempt (and of the connection lifecycle)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("A connect attempt is already in progress")]
    AlreadyConnecting,
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Device {0} already has a live connection")]
    DuplicateDevice(DeviceId),
    #[error("Failed to open link: {0}")]
    Open(String),
    #[error("Failed to close link: {0}")]
    Close(String),
    #[error("Link operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Link dropped while connecting")]
    LinkLost,
    #[error("Connect attempt aborted by disconnect")]
    Aborted,
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    UnsupportedDevice(#[from] UnsupportedDevice),
}

/// Failure of a role-level read/write/subscribe
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("Connection is not ready (state: {0})")]
    NotReady(ConnectionState),
    #[error("Unknown role '{0}'")]
    UnknownRole(String),
    #[error("Role '{role}' does not support {operation}")]
    NotSupported {
        role: String,
        operation: &'static str,
    },
    #[error("Payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Operation timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    #[error("Link lost")]
    LinkLost,
    #[error(transparent)]
    Gatt(#[from] GattError),
}

/// Scanner failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Scan could not be started: {0}")]
    StartFailed(String),
    #[error("Scan could not be stopped: {0}")]
    StopFailed(String),
}

/// Invalid capability set configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Role '{0}' is declared more than once")]
    DuplicateRole(String),
    #[error("Role '{0}' requires no properties")]
    NoProperties(String),
}
