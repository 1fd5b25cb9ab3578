//! Bluetooth Service Module
//!
//! Main service that coordinates scanning and the per-device connections.
//! Exactly one [`Connection`] exists per device; it is created on first
//! use and reused for every later connect.

use crate::domain::error::{CapabilityError, ConnectError, ScanError};
use crate::domain::models::{ConnectionState, DeviceId, ScannedDevice};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{Connection, ConnectionConfig};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::transport::TransportAdapter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    adapter: Arc<dyn TransportAdapter>,
    config: ConnectionConfig,
    connections: Mutex<HashMap<DeviceId, Connection>>,
    scanner: tokio::sync::Mutex<BleScanner>,
    scan_service: Option<Uuid>,
    show_all_devices: bool,
}

impl BluetoothService {
    /// Create a new Bluetooth service
    pub fn new(adapter: Arc<dyn TransportAdapter>, config: ConnectionConfig) -> Self {
        Self {
            scanner: tokio::sync::Mutex::new(BleScanner::new(Arc::clone(&adapter))),
            adapter,
            config,
            connections: Mutex::new(HashMap::new()),
            scan_service: Some(protocol::service_control_uuid()),
            show_all_devices: false,
        }
    }

    pub fn from_settings(
        adapter: Arc<dyn TransportAdapter>,
        settings: &Settings,
    ) -> Result<Self, CapabilityError> {
        let config = ConnectionConfig::from_settings(settings)?;
        let scan_service = config.capabilities.iter().next().map(|r| r.service);
        Ok(Self {
            scan_service,
            show_all_devices: settings.debug_show_all_devices,
            ..Self::new(adapter, config)
        })
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<DeviceId, Connection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The connection of `device`, registering one if the device has none.
    ///
    /// A device keeps the same [`Connection`] for the life of the service,
    /// so every handle a caller holds refers to the one instance. An idle
    /// (`Disconnected` or `Failed`) connection is handed out again; any other
    /// state is `DuplicateDevice`.
    pub fn create_connection(&self, device: &DeviceId) -> Result<Connection, ConnectError> {
        let mut connections = self.connections();
        if let Some(existing) = connections.get(device) {
            if !existing.current_state().can_connect() {
                return Err(ConnectError::DuplicateDevice(device.clone()));
            }
            return Ok(existing.clone());
        }
        let connection = Connection::new(device.clone(), Arc::clone(&self.adapter), self.config.clone());
        connections.insert(device.clone(), connection.clone());
        Ok(connection)
    }

    /// Create a connection for `device` and bring it to `Ready`
    pub async fn connect(&self, device: &DeviceId) -> Result<Connection, ConnectError> {
        let connection = self.create_connection(device)?;
        connection.connect().await?;
        Ok(connection)
    }

    pub fn get(&self, device: &DeviceId) -> Option<Connection> {
        self.connections().get(device).cloned()
    }

    pub fn states(&self) -> Vec<(DeviceId, ConnectionState)> {
        let mut states: Vec<_> = self
            .connections()
            .iter()
            .map(|(id, c)| (id.clone(), c.current_state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Disconnect from `device`. The connection stays registered and is
    /// reused by the next connect.
    pub async fn disconnect(&self, device: &DeviceId) -> Result<(), ConnectError> {
        let connection = self.get(device);
        match connection {
            Some(connection) => connection.disconnect().await,
            None => Ok(()),
        }
    }

    pub async fn disconnect_all(&self) {
        let connections: Vec<Connection> = self.connections().values().cloned().collect();
        for connection in connections {
            if let Err(e) = connection.disconnect().await {
                warn!("Error disconnecting {}: {}", connection.device_id(), e);
            }
        }
        info!("All devices disconnected");
    }

    /// Start scanning for devices advertising the profile's primary service
    pub async fn start_scan(&self) -> Result<(), ScanError> {
        self.start_scan_for(self.scan_service, self.show_all_devices)
            .await
    }

    /// Start scanning with an explicit service filter
    pub async fn start_scan_for(
        &self,
        service_uuid: Option<Uuid>,
        show_all_devices: bool,
    ) -> Result<(), ScanError> {
        self.scanner
            .lock()
            .await
            .start(service_uuid, show_all_devices)
            .await
    }

    /// Stop scanning
    pub async fn stop_scan(&self) -> Result<(), ScanError> {
        self.scanner.lock().await.stop().await
    }

    pub async fn scanned_devices(&self) -> Vec<ScannedDevice> {
        self.scanner.lock().await.devices()
    }

    pub async fn watch_devices(&self) -> watch::Receiver<Vec<ScannedDevice>> {
        self.scanner.lock().await.subscribe()
    }
}
