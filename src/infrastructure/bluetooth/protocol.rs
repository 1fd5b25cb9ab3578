//! Control Device Profile
//!
//! ATT constants and UUID helpers for the BLE control peripheral. The
//! default profile itself lives in the domain layer and is re-exported
//! here for the transport side.

use anyhow::Result;
use uuid::Uuid;

pub use crate::domain::capability::{
    control_profile, control_response_uuid, service_control_uuid, CONTROL_RESPONSE_ROLE,
    CONTROL_RESPONSE_UUID, SERVICE_CONTROL_UUID,
};

/// ATT MTU every link starts with
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest MTU a client may ask for
pub const MAX_ATT_MTU: u16 = 517;

/// Opcode + handle overhead of a write request
const ATT_WRITE_OVERHEAD: u16 = 3;

/// Largest single-operation write payload for a negotiated MTU
pub fn max_write_len(mtu: u16) -> usize {
    mtu.max(DEFAULT_ATT_MTU).saturating_sub(ATT_WRITE_OVERHEAD) as usize
}

/// Parse a UUID string from configuration or the command line
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID '{}': {}", uuid_str, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid(SERVICE_CONTROL_UUID).unwrap();
        assert_eq!(uuid, service_control_uuid());
        assert_eq!(parse_uuid(CONTROL_RESPONSE_UUID).unwrap(), control_response_uuid());
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_max_write_len() {
        assert_eq!(max_write_len(DEFAULT_ATT_MTU), 20);
        assert_eq!(max_write_len(247), 244);
        // Below the ATT minimum falls back to the default MTU
        assert_eq!(max_write_len(5), 20);
    }
}
