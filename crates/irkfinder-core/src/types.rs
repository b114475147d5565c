//! Shared types and OpenAPI schemas.
//!
//! Device addresses, bonded peers and capture provenance are used by every
//! layer of the engine, so they live here rather than in a component module.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::codec::IdentityKey;

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}):([0-9A-Fa-f]{2}):([0-9A-Fa-f]{2}):([0-9A-Fa-f]{2}):([0-9A-Fa-f]{2}):([0-9A-Fa-f]{2})$")
        .expect("MAC address regex is valid")
});

/// Returns `true` if `value` is a colon-separated six-octet address.
#[must_use]
pub fn is_valid_mac_address(value: &str) -> bool {
    MAC_ADDRESS_RE.is_match(value)
}

/// A 6-byte Bluetooth device address, most significant octet first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Create an address from its six octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether this is a valid static random address.
    ///
    /// The two most significant bits of a static random address are `11`.
    #[must_use]
    pub const fn is_static_random(&self) -> bool {
        self.0[0] & 0xC0 == 0xC0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// Error returned when parsing an [`Address`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid Bluetooth address '{0}'. Expected format XX:XX:XX:XX:XX:XX")]
pub struct InvalidAddress(pub String);

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = MAC_ADDRESS_RE
            .captures(s)
            .ok_or_else(|| InvalidAddress(s.to_string()))?;

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&caps[i + 1], 16)
                .map_err(|_| InvalidAddress(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A peer recorded in the BLE stack's persistent bond database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedPeer {
    /// The peer's identity address as recorded by the bond database.
    pub address: Address,

    /// The peer's Identity Resolving Key, if it distributed one while bonding.
    pub identity_key: Option<IdentityKey>,
}

/// Which protocol path produced a captured key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    /// The key arrived in a key-distribution event during pairing.
    KeyExchange,

    /// The key was read back from the bond database.
    BondEnumeration,
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyExchange => f.write_str("key_exchange"),
            Self::BondEnumeration => f.write_str("bond_enumeration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trips_through_display() {
        let addr: Address = "c0:01:02:03:04:0a".parse().unwrap();
        assert_eq!(addr.octets(), [0xC0, 0x01, 0x02, 0x03, 0x04, 0x0A]);
        assert_eq!(addr.to_string(), "C0:01:02:03:04:0A");
    }

    #[test]
    fn test_address_rejects_malformed_input() {
        assert!("C0:01:02:03:04".parse::<Address>().is_err());
        assert!("C0-01-02-03-04-05".parse::<Address>().is_err());
        assert!("G0:01:02:03:04:05".parse::<Address>().is_err());
        assert!(!is_valid_mac_address(""));
    }

    #[test]
    fn test_static_random_detection() {
        assert!(Address::new([0xC0, 1, 2, 3, 4, 5]).is_static_random());
        assert!(!Address::new([0x40, 1, 2, 3, 4, 5]).is_static_random());
    }

    #[test]
    fn test_address_serializes_as_string() {
        let addr = Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"AA:BB:CC:DD:EE:FF\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_capture_source_display() {
        assert_eq!(CaptureSource::KeyExchange.to_string(), "key_exchange");
        assert_eq!(
            serde_json::to_string(&CaptureSource::BondEnumeration).unwrap(),
            "\"bond_enumeration\""
        );
    }
}
