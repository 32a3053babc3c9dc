//! Saber Controller GATT Layout
//!
//! The controller exposes two characteristics: commands are written to the
//! request characteristic and replies arrive as notifications on the
//! response characteristic.

use crate::domain::error::TransportError;
use anyhow::Result;
use uuid::Uuid;

/// Request Characteristic UUID - where commands are written
pub const REQUEST_CHAR_UUID: &str = "4536a992-ab6b-4a07-9c71-cd6a1f86053d";

/// Response Characteristic UUID - where replies are notified
pub const RESPONSE_CHAR_UUID: &str = "ba9abf18-9561-416e-8958-b70f49d158eb";

pub const REQUEST_CHAR: Uuid = Uuid::from_u128(0x4536a992_ab6b_4a07_9c71_cd6a1f86053d);
pub const RESPONSE_CHAR: Uuid = Uuid::from_u128(0xba9abf18_9561_416e_8958_b70f49d158eb);

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format {:?}: {}", uuid_str, e))
}

/// Parse a `AA:BB:CC:DD:EE:FF` style address into its 48-bit value
pub fn parse_mac_address(address: &str) -> Result<u64, TransportError> {
    let invalid = || TransportError::InvalidAddress(address.to_string());

    let octets: Vec<&str> = address.split(|c: char| c == ':' || c == '-').collect();
    if octets.len() != 6 {
        return Err(invalid());
    }

    octets.iter().try_fold(0u64, |acc, octet| {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let byte = u8::from_str_radix(octet, 16).map_err(|_| invalid())?;
        Ok((acc << 8) | u64::from(byte))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_constants_agree() {
        assert_eq!(parse_uuid(REQUEST_CHAR_UUID).unwrap(), REQUEST_CHAR);
        assert_eq!(parse_uuid(RESPONSE_CHAR_UUID).unwrap(), RESPONSE_CHAR);
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_parse_mac_address() {
        assert_eq!(parse_mac_address("AA:BB:CC:DD:EE:FF").unwrap(), 0xAABB_CCDD_EEFF);
        assert_eq!(parse_mac_address("00-11-22-33-44-55").unwrap(), 0x0011_2233_4455);
        assert_eq!(
            parse_mac_address("AA:BB:CC"),
            Err(TransportError::InvalidAddress("AA:BB:CC".to_string()))
        );
        assert!(parse_mac_address("AA:BB:CC:DD:EE:GG").is_err());
    }
}
