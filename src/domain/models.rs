use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque device address, fixed for the lifetime of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for DeviceId {
    fn from(address: String) -> Self {
        Self(address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Discovering,
    Ready,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    /// `connect()` is only accepted from these states
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Discovering => "discovering",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Handle the transport adapter hands out for an open link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

/// ATT attribute handle of a characteristic value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicHandle(pub u16);

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// A single characteristic property, as written in settings files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Property {
    Read,
    Write,
    WriteWithoutResponse,
    Notify,
    Indicate,
}

impl Property {
    const ALL: [Property; 5] = [
        Property::Read,
        Property::Write,
        Property::WriteWithoutResponse,
        Property::Notify,
        Property::Indicate,
    ];

    fn bit(self) -> u8 {
        match self {
            Property::Read => CharProperties::READ,
            Property::WriteWithoutResponse => CharProperties::WRITE_WITHOUT_RESPONSE,
            Property::Write => CharProperties::WRITE,
            Property::Notify => CharProperties::NOTIFY,
            Property::Indicate => CharProperties::INDICATE,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Property::Read => "read",
            Property::Write => "write",
            Property::WriteWithoutResponse => "write-without-response",
            Property::Notify => "notify",
            Property::Indicate => "indicate",
        }
    }
}

/// Characteristic property bit set (Bluetooth Core Vol 3, Part G, 3.3.1.1 layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Property>", into = "Vec<Property>")]
pub struct CharProperties(pub u8);

impl CharProperties {
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(self, property: Property) -> Self {
        Self(self.0 | property.bit())
    }

    pub fn has(&self, property: Property) -> bool {
        self.0 & property.bit() != 0
    }

    /// True when every bit of `required` is also set here
    pub fn contains(&self, required: CharProperties) -> bool {
        self.0 & required.0 == required.0
    }

    /// Bits of `required` that are not set here
    pub fn missing(&self, required: CharProperties) -> CharProperties {
        CharProperties(required.0 & !self.0)
    }

    pub fn can_read(&self) -> bool {
        self.has(Property::Read)
    }

    pub fn can_write(&self) -> bool {
        self.has(Property::Write) || self.has(Property::WriteWithoutResponse)
    }

    /// Notifications and indications are both delivered as value updates
    pub fn can_notify(&self) -> bool {
        self.has(Property::Notify) || self.has(Property::Indicate)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Property> + '_ {
        Property::ALL.into_iter().filter(|p| self.has(*p))
    }
}

impl From<Vec<Property>> for CharProperties {
    fn from(properties: Vec<Property>) -> Self {
        properties
            .into_iter()
            .fold(CharProperties::empty(), CharProperties::with)
    }
}

impl From<CharProperties> for Vec<Property> {
    fn from(properties: CharProperties) -> Self {
        properties.iter().collect()
    }
}

impl FromIterator<Property> for CharProperties {
    fn from_iter<I: IntoIterator<Item = Property>>(iter: I) -> Self {
        iter.into_iter().fold(CharProperties::empty(), CharProperties::with)
    }
}

impl fmt::Display for CharProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.iter().map(Property::name).collect();
        f.write_str(&names.join("|"))
    }
}

/// Addresses a characteristic on an open link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub handle: CharacteristicHandle,
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.characteristic, self.handle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub handle: CharacteristicHandle,
    pub properties: CharProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Services and characteristics reported by one discovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSet {
    pub services: Vec<DiscoveredService>,
}

impl ServiceSet {
    pub fn new(services: Vec<DiscoveredService>) -> Self {
        Self { services }
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&DiscoveredService> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }
}

/// Why a link went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We asked for it
    LocalHost,
    RemoteUser,
    SupervisionTimeout,
    Other(u8),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHost => f.write_str("terminated by local host"),
            Self::RemoteUser => f.write_str("terminated by remote user"),
            Self::SupervisionTimeout => f.write_str("supervision timeout"),
            Self::Other(code) => write!(f, "reason {:#04x}", code),
        }
    }
}

/// Link-layer events delivered by the transport adapter for one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected(DisconnectReason),
    ServicesChanged,
}

/// Why a notification stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClosed {
    LinkLost,
    Unsubscribed,
    ServicesChanged,
}

/// Item of a per-role notification stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Payload(Vec<u8>),
    Closed(StreamClosed),
}

/// One advertising report from a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: DeviceId,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Empty means no filtering
    pub service_uuids: Vec<Uuid>,
}

impl ScanFilter {
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        self.service_uuids.is_empty()
            || advertisement
                .service_uuids
                .iter()
                .any(|uuid| self.service_uuids.contains(uuid))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    pub address: DeviceId,
    pub signal_strength: Option<i16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_superset() {
        let advertised: CharProperties = [Property::Read, Property::Notify].into_iter().collect();
        let wanted = CharProperties::empty().with(Property::Notify);
        assert!(advertised.contains(wanted));
        assert!(!wanted.contains(advertised));
        assert_eq!(wanted.missing(advertised), CharProperties(CharProperties::READ));
    }

    #[test]
    fn test_properties_serde_as_names() {
        let props: CharProperties = vec![Property::Read, Property::WriteWithoutResponse].into();
        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(json, r#"["read","write-without-response"]"#);
        let back: CharProperties = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn test_properties_display() {
        let props: CharProperties = vec![Property::Read, Property::Notify].into();
        assert_eq!(props.to_string(), "read|notify");
        assert_eq!(CharProperties::empty().to_string(), "none");
    }

    #[test]
    fn test_scan_filter() {
        let wanted = Uuid::from_u128(0x1234);
        let adv = Advertisement {
            address: DeviceId::from("AA:BB"),
            local_name: None,
            rssi: None,
            service_uuids: vec![wanted],
        };
        assert!(ScanFilter::default().matches(&adv));
        assert!(ScanFilter { service_uuids: vec![wanted] }.matches(&adv));
        assert!(!ScanFilter { service_uuids: vec![Uuid::from_u128(1)] }.matches(&adv));
    }

    #[test]
    fn test_can_connect_states() {
        assert!(ConnectionState::Disconnected.can_connect());
        assert!(ConnectionState::Failed.can_connect());
        assert!(!ConnectionState::Ready.can_connect());
        assert!(!ConnectionState::Connecting.can_connect());
    }
}
