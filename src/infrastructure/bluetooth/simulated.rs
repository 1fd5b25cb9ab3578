//! Simulated Transport Adapter
//!
//! In-memory peripherals behind the [`TransportAdapter`] contract. Used by
//! the command line demo and by the test suites; faults (failed opens,
//! hanging operations, GATT errors, link loss) can be injected at runtime.

use crate::domain::error::{ConnectError, DiscoveryError, GattError, ScanError};
use crate::domain::models::{
    Advertisement, CharProperties, CharacteristicHandle, CharacteristicRef, DeviceId,
    DisconnectReason, DiscoveredCharacteristic, DiscoveredService, LinkEvent, LinkHandle,
    Property, ScanFilter, ServiceSet,
};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    AdapterNotifications, AdvertisementReceiver, OpenedLink, TransportAdapter,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Adapter primitives that can be observed or faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    /// Link teardown; only hanging applies
    Close,
    Discover,
    Mtu,
    Read,
    Write,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Begin,
    End,
}

/// One entry of the operation log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRecord {
    pub op: SimOp,
    pub phase: Phase,
    pub handle: Option<CharacteristicHandle>,
}

#[derive(Debug, Clone)]
struct SimCharacteristic {
    properties: CharProperties,
    value: Vec<u8>,
}

/// A fake device: its GATT table and advertising data
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub address: DeviceId,
    pub local_name: Option<String>,
    pub rssi: i16,
    services: ServiceSet,
    characteristics: HashMap<CharacteristicHandle, SimCharacteristic>,
}

impl SimulatedPeripheral {
    pub fn new(address: impl Into<DeviceId>) -> Self {
        Self {
            address: address.into(),
            local_name: None,
            rssi: -60,
            services: ServiceSet::default(),
            characteristics: HashMap::new(),
        }
    }

    /// A peripheral exposing the control service with a readable, writable
    /// and notifying control response characteristic
    pub fn control_device(address: impl Into<DeviceId>) -> Self {
        Self::new(address)
            .with_name("BLE Control")
            .with_characteristic(
                protocol::service_control_uuid(),
                protocol::control_response_uuid(),
                CharacteristicHandle(0x002a),
                [Property::Read, Property::Write, Property::Notify]
                    .into_iter()
                    .collect(),
                Vec::new(),
            )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_characteristic(
        mut self,
        service: Uuid,
        characteristic: Uuid,
        handle: CharacteristicHandle,
        properties: CharProperties,
        value: Vec<u8>,
    ) -> Self {
        let discovered = DiscoveredCharacteristic {
            uuid: characteristic,
            handle,
            properties,
        };
        match self.services.services.iter_mut().find(|s| s.uuid == service) {
            Some(existing) => existing.characteristics.push(discovered),
            None => self.services.services.push(DiscoveredService {
                uuid: service,
                characteristics: vec![discovered],
            }),
        }
        self.characteristics
            .insert(handle, SimCharacteristic { properties, value });
        self
    }

    pub fn services(&self) -> &ServiceSet {
        &self.services
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            address: self.address.clone(),
            local_name: self.local_name.clone(),
            rssi: Some(self.rssi),
            service_uuids: self.services.services.iter().map(|s| s.uuid).collect(),
        }
    }
}

struct SimLink {
    device: DeviceId,
    events: mpsc::UnboundedSender<LinkEvent>,
    notifications: HashMap<CharacteristicHandle, mpsc::UnboundedSender<Vec<u8>>>,
}

struct Scan {
    filter: ScanFilter,
    sender: mpsc::UnboundedSender<Advertisement>,
}

#[derive(Default)]
struct SimState {
    peripherals: HashMap<DeviceId, SimulatedPeripheral>,
    links: HashMap<LinkHandle, SimLink>,
    open_failures: HashMap<DeviceId, u32>,
    silent_connect: bool,
    hanging: HashSet<SimOp>,
    gatt_errors: HashMap<SimOp, GattError>,
    discovery_error: Option<DiscoveryError>,
    latency: Duration,
    mtu_limit: Option<u16>,
    attempts: HashMap<SimOp, u32>,
    log: Vec<OpRecord>,
    scan: Option<Scan>,
    opened: u32,
}

pub struct SimulatedAdapter {
    state: Mutex<SimState>,
    next_link: AtomicU64,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            next_link: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.lock()
            .peripherals
            .insert(peripheral.address.clone(), peripheral);
    }

    /// Fail the next `count` opens of `device`
    pub fn fail_next_opens(&self, device: &DeviceId, count: u32) {
        self.lock().open_failures.insert(device.clone(), count);
    }

    /// Open links without ever reporting `Connected`
    pub fn set_silent_connect(&self, silent: bool) {
        self.lock().silent_connect = silent;
    }

    /// Make `op` never complete
    pub fn set_hanging(&self, op: SimOp, hanging: bool) {
        let mut state = self.lock();
        if hanging {
            state.hanging.insert(op);
        } else {
            state.hanging.remove(&op);
        }
    }

    /// Make `op` fail with `error` (or clear the fault with `None`)
    pub fn set_gatt_error(&self, op: SimOp, error: Option<GattError>) {
        let mut state = self.lock();
        match error {
            Some(error) => state.gatt_errors.insert(op, error),
            None => state.gatt_errors.remove(&op),
        };
    }

    pub fn set_discovery_error(&self, error: Option<DiscoveryError>) {
        self.lock().discovery_error = error;
    }

    /// Delay applied to every GATT primitive
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_mtu_limit(&self, mtu: u16) {
        self.lock().mtu_limit = Some(mtu);
    }

    /// How many times `op` was started
    pub fn attempts(&self, op: SimOp) -> u32 {
        self.lock().attempts.get(&op).copied().unwrap_or(0)
    }

    /// How many links were opened successfully so far
    pub fn opened_links(&self) -> u32 {
        self.lock().opened
    }

    pub fn open_link_count(&self) -> usize {
        self.lock().links.len()
    }

    pub fn op_log(&self) -> Vec<OpRecord> {
        self.lock().log.clone()
    }

    pub fn value(&self, device: &DeviceId, handle: CharacteristicHandle) -> Option<Vec<u8>> {
        self.lock()
            .peripherals
            .get(device)
            .and_then(|p| p.characteristics.get(&handle))
            .map(|c| c.value.clone())
    }

    pub fn set_value(&self, device: &DeviceId, handle: CharacteristicHandle, value: Vec<u8>) {
        if let Some(c) = self
            .lock()
            .peripherals
            .get_mut(device)
            .and_then(|p| p.characteristics.get_mut(&handle))
        {
            c.value = value;
        }
    }

    /// Deliver a notification on every link to `device` subscribed to
    /// `handle`. Returns how many subscriptions received it.
    pub fn notify(&self, device: &DeviceId, handle: CharacteristicHandle, payload: &[u8]) -> usize {
        let state = self.lock();
        state
            .links
            .values()
            .filter(|link| &link.device == device)
            .filter_map(|link| link.notifications.get(&handle))
            .filter(|tx| tx.send(payload.to_vec()).is_ok())
            .count()
    }

    /// Drop every link to `device` as if the peer went away
    pub fn drop_link(&self, device: &DeviceId, reason: DisconnectReason) {
        let mut state = self.lock();
        let handles: Vec<LinkHandle> = state
            .links
            .iter()
            .filter(|(_, link)| &link.device == device)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in handles {
            if let Some(link) = state.links.remove(&handle) {
                debug!("Simulated link {:?} to {} dropped: {}", handle, device, reason);
                let _ = link.events.send(LinkEvent::Disconnected(reason));
            }
        }
    }

    /// Replace the GATT table of `device` and report `ServicesChanged`
    pub fn invalidate_services(&self, device: &DeviceId, replacement: SimulatedPeripheral) {
        let mut state = self.lock();
        state.peripherals.insert(device.clone(), replacement);
        for link in state.links.values_mut().filter(|l| &l.device == device) {
            link.notifications.clear();
            let _ = link.events.send(LinkEvent::ServicesChanged);
        }
    }

    /// Push an advertising report into a running scan
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        let state = self.lock();
        match &state.scan {
            Some(scan) => scan.sender.send(advertisement).is_ok(),
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan.is_some()
    }

    /// Record the start of `op` and return the configured latency and fault
    fn begin(
        &self,
        op: SimOp,
        handle: Option<CharacteristicHandle>,
    ) -> (Duration, bool, Option<GattError>) {
        let mut state = self.lock();
        *state.attempts.entry(op).or_insert(0) += 1;
        state.log.push(OpRecord {
            op,
            phase: Phase::Begin,
            handle,
        });
        (
            state.latency,
            state.hanging.contains(&op),
            state.gatt_errors.get(&op).cloned(),
        )
    }

    fn end(&self, op: SimOp, handle: Option<CharacteristicHandle>) {
        self.lock().log.push(OpRecord {
            op,
            phase: Phase::End,
            handle,
        });
    }

    /// Latency, hang and injected error handling shared by every primitive
    async fn enter(&self, op: SimOp, handle: Option<CharacteristicHandle>) -> Result<(), GattError> {
        let (latency, hanging, error) = self.begin(op, handle);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if hanging {
            std::future::pending::<()>().await;
        }
        match error {
            Some(error) => {
                self.end(op, handle);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn characteristic<'a>(
        state: &'a mut SimState,
        link: LinkHandle,
        handle: CharacteristicHandle,
    ) -> Result<&'a mut SimCharacteristic, GattError> {
        let device = state
            .links
            .get(&link)
            .map(|l| l.device.clone())
            .ok_or_else(|| GattError::Failure("link is not open".to_string()))?;
        state
            .peripherals
            .get_mut(&device)
            .and_then(|p| p.characteristics.get_mut(&handle))
            .ok_or(GattError::InvalidHandle)
    }
}

#[async_trait]
impl TransportAdapter for SimulatedAdapter {
    async fn open(&self, device: &DeviceId) -> Result<OpenedLink, ConnectError> {
        let mut state = self.lock();
        if !state.peripherals.contains_key(device) {
            return Err(ConnectError::Open(format!("device {} not in range", device)));
        }
        if let Some(remaining) = state.open_failures.get_mut(device) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ConnectError::Open("GATT_ERROR (133)".to_string()));
            }
        }

        let handle = LinkHandle(self.next_link.fetch_add(1, Ordering::Relaxed));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if !state.silent_connect {
            let _ = events_tx.send(LinkEvent::Connected);
        }
        state.links.insert(
            handle,
            SimLink {
                device: device.clone(),
                events: events_tx,
                notifications: HashMap::new(),
            },
        );
        state.opened += 1;
        Ok(OpenedLink {
            handle,
            events: events_rx,
        })
    }

    async fn close(&self, link: LinkHandle) -> Result<(), ConnectError> {
        if self.lock().hanging.contains(&SimOp::Close) {
            std::future::pending::<()>().await;
        }
        let removed = self.lock().links.remove(&link);
        match removed {
            Some(link) => {
                let _ = link
                    .events
                    .send(LinkEvent::Disconnected(DisconnectReason::LocalHost));
                Ok(())
            }
            None => Err(ConnectError::Close(format!("unknown link {:?}", link))),
        }
    }

    async fn request_mtu(&self, _link: LinkHandle, mtu: u16) -> Result<u16, GattError> {
        self.enter(SimOp::Mtu, None).await?;
        let limit = self.lock().mtu_limit.unwrap_or(protocol::MAX_ATT_MTU);
        self.end(SimOp::Mtu, None);
        Ok(mtu.min(limit))
    }

    /// Reports the table as it was when the request started, even if the
    /// peer replaced it while the request was in flight
    async fn discover_services(&self, link: LinkHandle) -> Result<ServiceSet, DiscoveryError> {
        let snapshot = {
            let state = self.lock();
            state
                .links
                .get(&link)
                .and_then(|l| state.peripherals.get(&l.device))
                .map(|p| p.services.clone())
        };
        self.enter(SimOp::Discover, None)
            .await
            .map_err(|e| DiscoveryError::Failed(e.to_string()))?;
        let state = self.lock();
        if let Some(error) = state.discovery_error.clone() {
            return Err(error);
        }
        let services = snapshot
            .filter(|_| state.links.contains_key(&link))
            .ok_or_else(|| DiscoveryError::Failed("link is not open".to_string()))?;
        drop(state);
        self.end(SimOp::Discover, None);
        Ok(services)
    }

    async fn read_characteristic(
        &self,
        link: LinkHandle,
        target: CharacteristicRef,
    ) -> Result<Vec<u8>, GattError> {
        self.enter(SimOp::Read, Some(target.handle)).await?;
        let value = {
            let mut state = self.lock();
            let characteristic = Self::characteristic(&mut state, link, target.handle)?;
            if !characteristic.properties.can_read() {
                return Err(GattError::NotPermitted);
            }
            characteristic.value.clone()
        };
        self.end(SimOp::Read, Some(target.handle));
        Ok(value)
    }

    async fn write_characteristic(
        &self,
        link: LinkHandle,
        target: CharacteristicRef,
        data: &[u8],
        ack_required: bool,
    ) -> Result<(), GattError> {
        self.enter(SimOp::Write, Some(target.handle)).await?;
        {
            let mut state = self.lock();
            let characteristic = Self::characteristic(&mut state, link, target.handle)?;
            let allowed = if ack_required {
                characteristic.properties.has(Property::Write)
            } else {
                characteristic.properties.can_write()
            };
            if !allowed {
                return Err(GattError::NotPermitted);
            }
            characteristic.value = data.to_vec();
        }
        self.end(SimOp::Write, Some(target.handle));
        Ok(())
    }

    async fn subscribe(
        &self,
        link: LinkHandle,
        target: CharacteristicRef,
    ) -> Result<AdapterNotifications, GattError> {
        self.enter(SimOp::Subscribe, Some(target.handle)).await?;
        let rx = {
            let mut state = self.lock();
            if !Self::characteristic(&mut state, link, target.handle)?
                .properties
                .can_notify()
            {
                return Err(GattError::NotPermitted);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state
                .links
                .get_mut(&link)
                .ok_or_else(|| GattError::Failure("link is not open".to_string()))?
                .notifications
                .insert(target.handle, tx);
            rx
        };
        self.end(SimOp::Subscribe, Some(target.handle));
        Ok(rx)
    }

    async fn unsubscribe(&self, link: LinkHandle, target: CharacteristicRef) -> Result<(), GattError> {
        self.enter(SimOp::Unsubscribe, Some(target.handle)).await?;
        if let Some(link) = self.lock().links.get_mut(&link) {
            link.notifications.remove(&target.handle);
        }
        self.end(SimOp::Unsubscribe, Some(target.handle));
        Ok(())
    }

    async fn start_scan(&self, filter: ScanFilter) -> Result<AdvertisementReceiver, ScanError> {
        let mut state = self.lock();
        if state.scan.is_some() {
            return Err(ScanError::StartFailed("scan already running".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        // Every peripheral in range advertises once when the scan starts
        let mut peripherals: Vec<&SimulatedPeripheral> = state.peripherals.values().collect();
        peripherals.sort_by(|a, b| a.address.cmp(&b.address));
        for advertisement in peripherals.iter().map(|p| p.advertisement()) {
            if filter.matches(&advertisement) {
                let _ = tx.send(advertisement);
            }
        }
        state.scan = Some(Scan { filter, sender: tx });
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), ScanError> {
        self.lock().scan = None;
        Ok(())
    }
}
