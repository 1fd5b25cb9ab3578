//! Service Resolver
//!
//! Matches a discovered [`ServiceSet`] against the required capability set.
//! Requirements are checked in declaration order and the first unmet one
//! is reported, so the outcome only depends on the two inputs.

use crate::domain::capability::{CapabilityRequirement, RequiredCapabilitySet};
use crate::domain::error::{MissingRequirement, UnsupportedDevice};
use crate::domain::models::{CharProperties, CharacteristicRef, DiscoveredCharacteristic, ServiceSet};
use std::collections::BTreeMap;

/// A role bound to a concrete characteristic on the current link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCharacteristic {
    pub target: CharacteristicRef,
    /// What the device advertises, which may exceed what the role requires
    pub properties: CharProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedHandles {
    by_role: BTreeMap<String, ResolvedCharacteristic>,
}

impl ResolvedHandles {
    pub fn get(&self, role: &str) -> Option<&ResolvedCharacteristic> {
        self.by_role.get(role)
    }

    pub fn len(&self) -> usize {
        self.by_role.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_role.is_empty()
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.by_role.keys().map(String::as_str)
    }
}

fn resolve_one(
    requirement: &CapabilityRequirement,
    services: &ServiceSet,
) -> Result<ResolvedCharacteristic, MissingRequirement> {
    let mut instances = services
        .services
        .iter()
        .filter(|s| s.uuid == requirement.service)
        .peekable();
    if instances.peek().is_none() {
        return Err(MissingRequirement::Service(requirement.service));
    }

    // A service may appear more than once; any instance carrying a
    // characteristic with the right properties satisfies the role
    let candidates: Vec<(&DiscoveredCharacteristic, uuid::Uuid)> = instances
        .flat_map(|s| s.characteristics.iter().map(move |c| (c, s.uuid)))
        .filter(|(c, _)| c.uuid == requirement.characteristic)
        .collect();

    let Some(&(first, _)) = candidates.first() else {
        return Err(MissingRequirement::Characteristic {
            service: requirement.service,
            characteristic: requirement.characteristic,
        });
    };

    candidates
        .iter()
        .find(|(c, _)| c.properties.contains(requirement.properties))
        .map(|&(c, service)| ResolvedCharacteristic {
            target: CharacteristicRef {
                service,
                characteristic: c.uuid,
                handle: c.handle,
            },
            properties: c.properties,
        })
        .ok_or(MissingRequirement::Properties {
            characteristic: requirement.characteristic,
            required: requirement.properties,
            advertised: first.properties,
        })
}

/// Resolve every role or name the first one that cannot be satisfied
pub fn resolve(
    required: &RequiredCapabilitySet,
    services: &ServiceSet,
) -> Result<ResolvedHandles, UnsupportedDevice> {
    let mut resolved = ResolvedHandles::default();
    for requirement in required.iter() {
        let characteristic =
            resolve_one(requirement, services).map_err(|missing| UnsupportedDevice {
                role: requirement.role.clone(),
                missing,
            })?;
        resolved
            .by_role
            .insert(requirement.role.clone(), characteristic);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{CharacteristicHandle, DiscoveredService, Property};
    use crate::infrastructure::bluetooth::protocol;
    use uuid::Uuid;

    fn props(list: &[Property]) -> CharProperties {
        list.iter().copied().collect()
    }

    fn control_set(required: CharProperties) -> RequiredCapabilitySet {
        RequiredCapabilitySet::new(vec![CapabilityRequirement::new(
            protocol::CONTROL_RESPONSE_ROLE,
            protocol::service_control_uuid(),
            protocol::control_response_uuid(),
            required,
        )])
        .unwrap()
    }

    fn control_services(advertised: CharProperties) -> ServiceSet {
        ServiceSet::new(vec![DiscoveredService {
            uuid: protocol::service_control_uuid(),
            characteristics: vec![DiscoveredCharacteristic {
                uuid: protocol::control_response_uuid(),
                handle: CharacteristicHandle(0x002a),
                properties: advertised,
            }],
        }])
    }

    #[test]
    fn test_resolves_present_characteristic() {
        let set = control_set(props(&[Property::Read]));
        let resolved = resolve(&set, &control_services(props(&[Property::Read, Property::Notify]))).unwrap();

        let control = resolved.get(protocol::CONTROL_RESPONSE_ROLE).unwrap();
        assert_eq!(control.target.handle, CharacteristicHandle(0x002a));
        assert!(control.properties.can_notify());
    }

    #[test]
    fn test_notify_requirement_unmet_by_read_only() {
        let set = control_set(props(&[Property::Notify]));
        let err = resolve(&set, &control_services(props(&[Property::Read]))).unwrap_err();

        assert_eq!(err.role, protocol::CONTROL_RESPONSE_ROLE);
        assert_eq!(
            err.missing,
            MissingRequirement::Properties {
                characteristic: protocol::control_response_uuid(),
                required: props(&[Property::Notify]),
                advertised: props(&[Property::Read]),
            }
        );
    }

    #[test]
    fn test_missing_service_and_characteristic() {
        let set = control_set(props(&[Property::Read]));

        let err = resolve(&set, &ServiceSet::default()).unwrap_err();
        assert_eq!(err.missing, MissingRequirement::Service(protocol::service_control_uuid()));

        let empty_service = ServiceSet::new(vec![DiscoveredService {
            uuid: protocol::service_control_uuid(),
            characteristics: Vec::new(),
        }]);
        let err = resolve(&set, &empty_service).unwrap_err();
        assert!(matches!(err.missing, MissingRequirement::Characteristic { .. }));
    }

    #[test]
    fn test_first_miss_in_declaration_order_is_stable() {
        let service = Uuid::from_u128(0x10);
        let set = RequiredCapabilitySet::new(vec![
            CapabilityRequirement::new("present", service, Uuid::from_u128(1), props(&[Property::Read])),
            CapabilityRequirement::new("second-miss", service, Uuid::from_u128(2), props(&[Property::Read])),
            CapabilityRequirement::new("third-miss", service, Uuid::from_u128(3), props(&[Property::Read])),
        ])
        .unwrap();
        let services = ServiceSet::new(vec![DiscoveredService {
            uuid: service,
            characteristics: vec![DiscoveredCharacteristic {
                uuid: Uuid::from_u128(1),
                handle: CharacteristicHandle(1),
                properties: props(&[Property::Read]),
            }],
        }]);

        let outcomes: Vec<_> = (0..10).map(|_| resolve(&set, &services)).collect();
        for outcome in &outcomes {
            assert_eq!(outcome.as_ref().unwrap_err().role, "second-miss");
        }
        assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_second_service_instance_can_satisfy() {
        let service = protocol::service_control_uuid();
        let characteristic = protocol::control_response_uuid();
        let services = ServiceSet::new(vec![
            DiscoveredService {
                uuid: service,
                characteristics: vec![DiscoveredCharacteristic {
                    uuid: characteristic,
                    handle: CharacteristicHandle(0x10),
                    properties: props(&[Property::Read]),
                }],
            },
            DiscoveredService {
                uuid: service,
                characteristics: vec![DiscoveredCharacteristic {
                    uuid: characteristic,
                    handle: CharacteristicHandle(0x20),
                    properties: props(&[Property::Read, Property::Notify]),
                }],
            },
        ]);

        let resolved = resolve(&control_set(props(&[Property::Notify])), &services).unwrap();
        assert_eq!(
            resolved.get(protocol::CONTROL_RESPONSE_ROLE).unwrap().target.handle,
            CharacteristicHandle(0x20)
        );
    }

    #[test]
    fn test_empty_capability_set_resolves() {
        let resolved = resolve(&RequiredCapabilitySet::default(), &ServiceSet::default()).unwrap();
        assert!(resolved.is_empty());
    }
}
