//! Transport Adapter Contract
//!
//! The platform Bluetooth stack is reached only through [`TransportAdapter`].
//! Every primitive is asynchronous; link-layer events for an open link are
//! delivered on the receiver returned by [`TransportAdapter::open`].

use crate::domain::error::{ConnectError, DiscoveryError, GattError, ScanError};
use crate::domain::models::{
    Advertisement, CharacteristicRef, DeviceId, LinkEvent, LinkHandle, ScanFilter, ServiceSet,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Raw notification payloads for one subscribed characteristic, in the
/// order the stack delivered them
pub type AdapterNotifications = mpsc::UnboundedReceiver<Vec<u8>>;

/// Advertising reports of a running scan
pub type AdvertisementReceiver = mpsc::UnboundedReceiver<Advertisement>;

/// A link the adapter has started to establish
pub struct OpenedLink {
    pub handle: LinkHandle,
    /// `Connected` once the link is up, then `Disconnected`/`ServicesChanged`
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Start establishing a link to `device`
    async fn open(&self, device: &DeviceId) -> Result<OpenedLink, ConnectError>;

    /// Tear the link down; the adapter follows up with `LinkEvent::Disconnected`
    async fn close(&self, link: LinkHandle) -> Result<(), ConnectError>;

    /// Ask for a larger ATT MTU, returning the negotiated value
    async fn request_mtu(&self, link: LinkHandle, mtu: u16) -> Result<u16, GattError>;

    async fn discover_services(&self, link: LinkHandle) -> Result<ServiceSet, DiscoveryError>;

    async fn read_characteristic(
        &self,
        link: LinkHandle,
        target: CharacteristicRef,
    ) -> Result<Vec<u8>, GattError>;

    /// With `ack_required` the call completes only after the peer
    /// acknowledged the write request
    async fn write_characteristic(
        &self,
        link: LinkHandle,
        target: CharacteristicRef,
        data: &[u8],
        ack_required: bool,
    ) -> Result<(), GattError>;

    /// Enable notifications (or indications) on the characteristic
    async fn subscribe(
        &self,
        link: LinkHandle,
        target: CharacteristicRef,
    ) -> Result<AdapterNotifications, GattError>;

    async fn unsubscribe(
        &self,
        link: LinkHandle,
        target: CharacteristicRef,
    ) -> Result<(), GattError>;

    async fn start_scan(&self, filter: ScanFilter) -> Result<AdvertisementReceiver, ScanError>;

    async fn stop_scan(&self) -> Result<(), ScanError>;
}
