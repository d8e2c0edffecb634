//! Bluetooth MAC addresses and canonical sensor ids.
//!
//! Sensors are keyed by their address string in uppercase. Platforms that hide
//! the hardware address (CoreBluetooth hands out UUIDs) still produce a stable
//! id through [`canonical_id`], while [`MacAddress`] gives the compact form
//! used by the BlueZ backend and for generated names.

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth MAC address stored as a compact 6-byte array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Errors returned when parsing a MAC address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid MAC address: expected 6 parts, got {0}")]
    InvalidLength(usize),
    #[error("invalid MAC address: part {0} has wrong length")]
    InvalidPartLength(usize),
    #[error("invalid MAC address: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseMacError::InvalidLength(parts.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseMacError::InvalidPartLength(i));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseMacError::InvalidHex(part.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl MacAddress {
    /// Last three bytes as six hex digits, e.g. `DDEEFF`.
    pub fn tail(&self) -> String {
        format!("{:02X}{:02X}{:02X}", self.0[3], self.0[4], self.0[5])
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

/// Canonical sensor id for an advertised address: trimmed and uppercased.
pub fn canonical_id(address: &str) -> String {
    address.trim().to_uppercase()
}

/// Last six hex digits of an address with separators removed.
///
/// Used for generated sensor names (`ruuvi_DDEEFF`).
pub fn address_tail(address: &str) -> String {
    if let Ok(mac) = address.parse::<MacAddress>() {
        return mac.tail();
    }
    let hex: Vec<char> = canonical_id(address)
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();
    hex[hex.len().saturating_sub(6)..].iter().collect()
}
