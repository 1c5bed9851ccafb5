//! Stable device identity (EUI-64)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GatewayError;

/// Formatted length: "0x" + 16 hex digits.
pub const UID_STR_LEN: usize = 18;

/// Stable 64-bit device identity
///
/// Displayed as `0x` followed by 16 lowercase hex digits. Input is
/// accepted in either case; equality is numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceUid(u64);

impl DeviceUid {
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Build from the 8 IEEE address bytes as they arrive on the air
    /// (little-endian).
    #[must_use]
    pub fn from_ieee_le(ieee: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(ieee))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl FromStr for DeviceUid {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| GatewayError::invalid_args("uid missing 0x prefix"))?;
        if hex.len() != 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(GatewayError::invalid_args("uid must be 16 hex digits"));
        }
        let value = u64::from_str_radix(hex, 16)
            .map_err(|_| GatewayError::invalid_args("uid not parseable"))?;
        Ok(Self(value))
    }
}

impl Serialize for DeviceUid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceUid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        let uid = DeviceUid::new(0x0012_4B00_1234_5678);
        assert_eq!(uid.to_string(), "0x00124b0012345678");
        assert_eq!(uid.to_string().len(), UID_STR_LEN);
    }

    #[test]
    fn test_parse_either_case() {
        let lower: DeviceUid = "0x00124b0012345678".parse().unwrap();
        let upper: DeviceUid = "0x00124B0012345678".parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.as_u64(), 0x0012_4B00_1234_5678);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("00124b0012345678".parse::<DeviceUid>().is_err());
        assert!("0x00124b00123456".parse::<DeviceUid>().is_err());
        assert!("0x00124b00123456789".parse::<DeviceUid>().is_err());
        assert!("0x00124g0012345678".parse::<DeviceUid>().is_err());
        assert!("".parse::<DeviceUid>().is_err());
    }

    #[test]
    fn test_roundtrip_any_u64() {
        // deterministic xorshift sweep standing in for "for any u64"
        let mut x = 0x243F_6A88_85A3_08D3u64;
        for _ in 0..1000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let uid = DeviceUid::new(x);
            let parsed: DeviceUid = uid.to_string().parse().unwrap();
            assert_eq!(parsed, uid);
        }
        // edges
        for v in [0u64, u64::MAX, 1, 0x8000_0000_0000_0000] {
            let uid = DeviceUid::new(v);
            assert_eq!(uid.to_string().parse::<DeviceUid>().unwrap(), uid);
        }
    }

    #[test]
    fn test_ieee_le() {
        let uid = DeviceUid::from_ieee_le([0x78, 0x56, 0x34, 0x12, 0x00, 0x4B, 0x12, 0x00]);
        assert_eq!(uid.to_string(), "0x00124b0012345678");
    }
}
