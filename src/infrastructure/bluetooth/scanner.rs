//! BLE Scanner Module
//!
//! Collects advertising reports into a de-duplicated device list.

use crate::domain::error::ScanError;
use crate::domain::models::{Advertisement, DeviceId, ScanFilter, ScannedDevice};
use crate::infrastructure::bluetooth::transport::TransportAdapter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// BLE Scanner for discovering peripherals
pub struct BleScanner {
    adapter: Arc<dyn TransportAdapter>,
    devices_tx: watch::Sender<Vec<ScannedDevice>>,
    task: Option<JoinHandle<()>>,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(adapter: Arc<dyn TransportAdapter>) -> Self {
        let (devices_tx, _) = watch::channel(Vec::new());
        Self {
            adapter,
            devices_tx,
            task: None,
        }
    }

    /// Start scanning for BLE devices
    ///
    /// # Arguments
    /// * `service_uuid` - Only report devices advertising this service
    /// * `show_all_devices` - If true, report every device regardless of `service_uuid`
    pub async fn start(
        &mut self,
        service_uuid: Option<Uuid>,
        show_all_devices: bool,
    ) -> Result<(), ScanError> {
        // Stop any existing scan
        self.stop().await?;

        let filter = match service_uuid {
            Some(uuid) if !show_all_devices => {
                info!("Starting BLE scan for service UUID: {}", uuid);
                ScanFilter {
                    service_uuids: vec![uuid],
                }
            }
            _ => {
                info!("Starting BLE scan for all devices");
                ScanFilter::default()
            }
        };

        let mut reports = self.adapter.start_scan(filter.clone()).await?;
        self.devices_tx.send_replace(Vec::new());

        let devices_tx = self.devices_tx.clone();
        self.task = Some(tokio::spawn(async move {
            let mut seen: BTreeMap<DeviceId, ScannedDevice> = BTreeMap::new();
            while let Some(advertisement) = reports.recv().await {
                // Adapters may report devices outside the filter
                if !filter.matches(&advertisement) {
                    continue;
                }
                if merge(&mut seen, advertisement) {
                    devices_tx.send_replace(seen.values().cloned().collect());
                }
            }
            debug!("Advertisement stream ended");
        }));

        Ok(())
    }

    /// Stop scanning
    pub async fn stop(&mut self) -> Result<(), ScanError> {
        if let Some(task) = self.task.take() {
            info!("Stopping BLE scan...");
            task.abort();
            self.adapter.stop_scan().await?;
        }
        Ok(())
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.task.is_some()
    }

    /// Devices seen by the current (or last) scan, ordered by address
    pub fn devices(&self) -> Vec<ScannedDevice> {
        self.devices_tx.borrow().clone()
    }

    /// Observe the device list as it grows
    pub fn subscribe(&self) -> watch::Receiver<Vec<ScannedDevice>> {
        self.devices_tx.subscribe()
    }
}

/// Fold a report into the device table. Returns whether anything visible
/// changed.
fn merge(seen: &mut BTreeMap<DeviceId, ScannedDevice>, advertisement: Advertisement) -> bool {
    let Advertisement {
        address,
        local_name,
        rssi,
        ..
    } = advertisement;
    let local_name = local_name.filter(|n| !n.is_empty());

    match seen.get_mut(&address) {
        Some(device) => {
            let mut changed = false;
            if let Some(name) = local_name {
                if device.name != name {
                    device.name = name;
                    changed = true;
                }
            }
            if rssi.is_some() && device.signal_strength != rssi {
                device.signal_strength = rssi;
                changed = true;
            }
            changed
        }
        None => {
            debug!("Found device {} ({:?})", address, local_name);
            seen.insert(
                address.clone(),
                ScannedDevice {
                    name: local_name.unwrap_or_else(|| "Unknown".to_string()),
                    address,
                    signal_strength: rssi,
                },
            );
            true
        }
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let adapter = Arc::clone(&self.adapter);
                runtime.spawn(async move {
                    let _ = adapter.stop_scan().await;
                });
            }
        }
    }
}
