//! Peer address handling
//!
//! A remote device is identified by a 48-bit address plus an address type.
//! The leftmost display byte is stored first, so `addr.0[0]` is the most
//! significant byte and carries the LE random sub-type bits.

use crate::DeviceError;

/// A 48-bit Bluetooth device address wrapper for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DeviceAddress(pub [u8; 6]);

/// Address type of the identity address of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format, serde::Serialize, serde::Deserialize)]
pub enum AddressType {
    /// BR/EDR public address
    BrEdr,
    /// LE public address
    LePublic,
    /// LE random address (static, resolvable private or non-resolvable)
    LeRandom,
}

impl AddressType {
    /// Whether this address type belongs to the LE bearer
    #[must_use]
    pub const fn is_le(&self) -> bool {
        matches!(self, Self::LePublic | Self::LeRandom)
    }
}

impl DeviceAddress {
    /// Create a new device address from bytes
    #[must_use]
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Get the raw address bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Format the address as a colon-separated hex string
    #[must_use]
    pub fn format_hex(&self) -> heapless::String<17> {
        let mut result = heapless::String::new();
        let hex_chars = [
            '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F',
        ];
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                result.push(':').ok();
            }
            result.push(hex_chars[(byte >> 4) as usize]).ok();
            result.push(hex_chars[(byte & 0x0F) as usize]).ok();
        }
        result
    }

    /// Parse a device address from a colon-separated hex string
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidArguments`] unless the string is exactly
    /// six colon-separated hex octets.
    pub fn from_hex(hex: &str) -> Result<Self, DeviceError> {
        if hex.len() != 17 || !hex.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return Err(DeviceError::InvalidArguments);
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in hex.split(':').enumerate() {
            if i >= 6 || byte.len() != 2 {
                return Err(DeviceError::InvalidArguments);
            }
            bytes[i] = u8::from_str_radix(byte, 16).map_err(|_| DeviceError::InvalidArguments)?;
        }
        Ok(Self(bytes))
    }

    /// Whether an LE random address of this value is private
    ///
    /// The top two bits of a random address select the sub-type: `0b01` is a
    /// resolvable private address, `0b00` non-resolvable, `0b11` static.
    /// Private addresses must never reach stable storage.
    #[must_use]
    pub const fn is_private(&self, addr_type: AddressType) -> bool {
        match addr_type {
            AddressType::BrEdr | AddressType::LePublic => false,
            AddressType::LeRandom => matches!(self.0[0] >> 6, 0b00 | 0b01),
        }
    }

    /// Whether an LE random address of this value is a resolvable private one
    #[must_use]
    pub const fn is_resolvable_private(&self, addr_type: AddressType) -> bool {
        matches!(addr_type, AddressType::LeRandom) && (self.0[0] >> 6) == 0b01
    }
}

impl From<[u8; 6]> for DeviceAddress {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<DeviceAddress> for [u8; 6] {
    fn from(addr: DeviceAddress) -> Self {
        addr.0
    }
}

impl From<DeviceAddress> for bt_hci::param::BdAddr {
    fn from(addr: DeviceAddress) -> Self {
        bt_hci::param::BdAddr::new(addr.0)
    }
}

impl From<DeviceAddress> for heapless::String<17> {
    fn from(addr: DeviceAddress) -> Self {
        addr.format_hex()
    }
}

impl TryFrom<&str> for DeviceAddress {
    type Error = DeviceError;

    fn try_from(hex: &str) -> Result<Self, Self::Error> {
        DeviceAddress::from_hex(hex)
    }
}

impl TryFrom<&[u8]> for DeviceAddress {
    type Error = DeviceError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() == 6 {
            let mut addr = [0u8; 6];
            addr.copy_from_slice(bytes);
            Ok(DeviceAddress(addr))
        } else {
            Err(DeviceError::InvalidArguments)
        }
    }
}

impl TryFrom<bt_hci::param::BdAddr> for DeviceAddress {
    type Error = DeviceError;

    fn try_from(bd_addr: bt_hci::param::BdAddr) -> Result<Self, Self::Error> {
        bd_addr.raw().try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_creation_and_bytes() {
        let addr = DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
        assert_eq!(addr.as_bytes(), &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
    }

    #[test]
    fn test_format_hex() {
        let addr = DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
        assert_eq!(addr.format_hex().as_str(), "AA:BB:CC:DD:EE:01");

        let zero = DeviceAddress::new([0; 6]);
        assert_eq!(zero.format_hex().as_str(), "00:00:00:00:00:00");
    }

    #[test]
    fn test_from_hex_round_trip() {
        let addr: DeviceAddress = "AA:BB:CC:DD:EE:01".try_into().unwrap();
        assert_eq!(addr.as_bytes(), &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
        assert_eq!(addr.format_hex().as_str(), "AA:BB:CC:DD:EE:01");

        let lower: DeviceAddress = "aa:bb:cc:dd:ee:01".try_into().unwrap();
        assert_eq!(lower, addr);
    }

    #[test]
    fn test_from_hex_rejects_malformed() {
        assert!(DeviceAddress::from_hex("AA:BB:CC:DD:EE").is_err());
        assert!(DeviceAddress::from_hex("AA:BB:CC:DD:EE:XY").is_err());
        assert!(DeviceAddress::from_hex("AABBCCDDEE01").is_err());
        assert!(DeviceAddress::from_hex("AA-BB-CC-DD-EE-01").is_err());
    }

    #[test]
    fn test_private_address_classification() {
        // 0b01xx_xxxx -> resolvable private
        let rpa = DeviceAddress::new([0x52, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert!(rpa.is_private(AddressType::LeRandom));
        assert!(rpa.is_resolvable_private(AddressType::LeRandom));

        // 0b00xx_xxxx -> non-resolvable private
        let nrpa = DeviceAddress::new([0x12, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert!(nrpa.is_private(AddressType::LeRandom));
        assert!(!nrpa.is_resolvable_private(AddressType::LeRandom));

        // 0b11xx_xxxx -> static random, not private
        let static_random = DeviceAddress::new([0xC2, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert!(!static_random.is_private(AddressType::LeRandom));

        // Public addresses are never private regardless of bit pattern
        assert!(!rpa.is_private(AddressType::LePublic));
        assert!(!rpa.is_private(AddressType::BrEdr));
    }

    #[test]
    fn test_bt_hci_conversions() {
        let bytes = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC];
        let addr = DeviceAddress::new(bytes);

        let bd_addr: bt_hci::param::BdAddr = addr.into();
        assert_eq!(bd_addr.raw(), bytes);

        let back = DeviceAddress::try_from(bd_addr).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_try_from_slice() {
        let bytes = &[0x12u8, 0x34, 0x56, 0x78, 0x9A, 0xBC][..];
        assert!(DeviceAddress::try_from(bytes).is_ok());
        assert!(DeviceAddress::try_from(&bytes[..3]).is_err());
    }

    #[test]
    fn test_address_type_bearers() {
        assert!(AddressType::LePublic.is_le());
        assert!(AddressType::LeRandom.is_le());
        assert!(!AddressType::BrEdr.is_le());
    }
}
