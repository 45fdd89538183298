//! Device identifiers and key material
//!
//! Identifiers are stored in the big-endian order they are written in by
//! people and backends (`260B1234`, `0004A30B001C0530`). The frame codec is
//! responsible for the little-endian wire order.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error returned when parsing a hex identifier or key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: expected {expected} hex characters, got {value:?}")]
pub struct ParseIdError {
    kind: &'static str,
    expected: usize,
    value: String,
}

fn parse_hex<const N: usize>(kind: &'static str, s: &str) -> Result<[u8; N], ParseIdError> {
    let err = || ParseIdError {
        kind,
        expected: N * 2,
        value: s.to_string(),
    };
    let bytes = hex::decode(s.trim()).map_err(|_| err())?;
    bytes.try_into().map_err(|_| err())
}

macro_rules! hex_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// EUI-64 (DevEUI, JoinEUI)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EUI64([u8; 8]);

impl EUI64 {
    /// Create from big-endian bytes
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Big-endian bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Wire (little-endian) representation
    pub fn to_le_bytes(&self) -> [u8; 8] {
        let mut b = self.0;
        b.reverse();
        b
    }

    /// Build from wire (little-endian) bytes
    pub fn from_le_bytes(mut bytes: [u8; 8]) -> Self {
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for EUI64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for EUI64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EUI64({self})")
    }
}

impl FromStr for EUI64 {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex::<8>("EUI64", s).map(Self)
    }
}

hex_serde!(EUI64);

/// Device Address (4 bytes), the on-air session address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevAddr([u8; 4]);

impl DevAddr {
    /// Create from big-endian bytes
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Create from the numeric address
    pub const fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    /// Numeric address
    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Big-endian bytes
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Wire (little-endian) representation
    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.as_u32().to_le_bytes()
    }

    /// Build from wire (little-endian) bytes
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self::from_u32(u32::from_le_bytes(bytes))
    }

    /// NwkID part of a type-0 address (top 7 bits)
    pub fn nwk_id(&self) -> u8 {
        (self.as_u32() >> 25) as u8
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevAddr({self})")
    }
}

impl FromStr for DevAddr {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex::<4>("DevAddr", s).map(Self)
    }
}

hex_serde!(DevAddr);

/// 24-bit network identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetId(u32);

impl NetId {
    /// Create from the numeric id; only the low 24 bits are kept
    pub const fn new(value: u32) -> Self {
        Self(value & 0x00FF_FFFF)
    }

    /// Numeric id
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// NwkID carried in the DevAddr of a type-0 network
    pub fn nwk_id(&self) -> u8 {
        (self.0 & 0x7F) as u8
    }

    /// Wire (little-endian, 3 bytes) representation
    pub fn to_le_bytes(&self) -> [u8; 3] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2]]
    }
}

impl fmt::Debug for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetId({:06X})", self.0)
    }
}

/// AES-128 key (16 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AESKey([u8; 16]);

impl AESKey {
    /// Create new key
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// Keys never show up in logs.
impl fmt::Debug for AESKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AESKey(..)")
    }
}

impl fmt::Display for AESKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl FromStr for AESKey {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex::<16>("AESKey", s).map(Self)
    }
}

hex_serde!(AESKey);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_addr_wire_order_is_little_endian() {
        let addr: DevAddr = "260B1234".parse().unwrap();
        assert_eq!(addr.to_le_bytes(), [0x34, 0x12, 0x0B, 0x26]);
        assert_eq!(DevAddr::from_le_bytes([0x34, 0x12, 0x0B, 0x26]), addr);
        assert_eq!(addr.nwk_id(), 0x13);
    }

    #[test]
    fn eui_round_trips_through_display() {
        let eui = EUI64::new([0x00, 0x04, 0xA3, 0x0B, 0x00, 0x1C, 0x05, 0x30]);
        assert_eq!(eui.to_string(), "0004A30B001C0530");
        assert_eq!("0004a30b001c0530".parse::<EUI64>().unwrap(), eui);
        assert!("0004".parse::<EUI64>().is_err());
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = AESKey::new([0xAB; 16]);
        assert_eq!(format!("{key:?}"), "AESKey(..)");
    }
}
