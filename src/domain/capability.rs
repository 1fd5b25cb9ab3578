use crate::domain::error::CapabilityError;
use crate::domain::models::{CharProperties, Property};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Control service UUID (also used as the scan filter)
pub const SERVICE_CONTROL_UUID: &str = "6f59f19e-2f39-49de-8525-5d2045f4d999";

/// Control response characteristic UUID - where the device reports state
pub const CONTROL_RESPONSE_UUID: &str = "a9bf2905-ee69-4baa-8960-4358a9e3a558";

/// Role name the control response characteristic is bound to
pub const CONTROL_RESPONSE_ROLE: &str = "control-response";

pub fn service_control_uuid() -> Uuid {
    Uuid::from_u128(0x6f59f19e_2f39_49de_8525_5d2045f4d999)
}

pub fn control_response_uuid() -> Uuid {
    Uuid::from_u128(0xa9bf2905_ee69_4baa_8960_4358a9e3a558)
}

/// The default capability set: the control response characteristic must
/// be readable
pub fn control_profile() -> Vec<CapabilityRequirement> {
    vec![CapabilityRequirement::new(
        CONTROL_RESPONSE_ROLE,
        service_control_uuid(),
        control_response_uuid(),
        CharProperties::empty().with(Property::Read),
    )]
}

/// One entry of a device profile: a logical role bound to a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequirement {
    pub role: String,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub properties: CharProperties,
}

impl CapabilityRequirement {
    pub fn new(
        role: impl Into<String>,
        service: Uuid,
        characteristic: Uuid,
        properties: CharProperties,
    ) -> Self {
        Self {
            role: role.into(),
            service,
            characteristic,
            properties,
        }
    }
}

/// Ordered set of requirements a device must satisfy before it is `Ready`.
///
/// Declaration order is kept so that resolution failures always name the
/// same first unmet role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredCapabilitySet {
    requirements: Vec<CapabilityRequirement>,
}

impl RequiredCapabilitySet {
    pub fn new(requirements: Vec<CapabilityRequirement>) -> Result<Self, CapabilityError> {
        let mut set = Self::default();
        for requirement in requirements {
            set.push(requirement)?;
        }
        Ok(set)
    }

    pub fn push(&mut self, requirement: CapabilityRequirement) -> Result<(), CapabilityError> {
        if self.get(&requirement.role).is_some() {
            return Err(CapabilityError::DuplicateRole(requirement.role));
        }
        if requirement.properties.is_empty() {
            return Err(CapabilityError::NoProperties(requirement.role));
        }
        self.requirements.push(requirement);
        Ok(())
    }

    pub fn get(&self, role: &str) -> Option<&CapabilityRequirement> {
        self.requirements.iter().find(|r| r.role == role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityRequirement> {
        self.requirements.iter()
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}
