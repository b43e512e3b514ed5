/// Bluetooth UUIDs
///
/// Every attribute and advertised service is identified by a 128-bit UUID.
/// SIG-assigned UUIDs live on the Bluetooth base UUID
/// `0000xxxx-0000-1000-8000-00805F9B34FB` and travel over the air in their
/// 16-bit form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Bluetooth base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

const SHORT_SHIFT: u32 = 96;
const SHORT_MASK: u128 = 0xFFFF_FFFF << SHORT_SHIFT;

/// Errors for UUID parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UuidError {
    #[error("Invalid UUID: {0}")]
    Invalid(String),
}

/// A Bluetooth UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BleUuid(Uuid);

impl BleUuid {
    /// Expand a 16-bit SIG UUID onto the base UUID
    pub const fn from_u16(short: u16) -> Self {
        Self::from_u32(short as u32)
    }

    /// Expand a 32-bit SIG UUID onto the base UUID
    pub const fn from_u32(short: u32) -> Self {
        Self(Uuid::from_u128(
            BLUETOOTH_BASE_UUID | ((short as u128) << SHORT_SHIFT),
        ))
    }

    /// Wrap a full 128-bit UUID
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// The 16-bit form, if this UUID is SIG-assigned
    pub fn as_u16(&self) -> Option<u16> {
        let value = self.0.as_u128();
        if value & !SHORT_MASK != BLUETOOTH_BASE_UUID {
            return None;
        }
        u16::try_from(value >> SHORT_SHIFT).ok()
    }

    /// 128-bit value
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    /// Little-endian wire form (as carried in AD structures and ATT PDUs)
    pub fn to_le_bytes(&self) -> [u8; 16] {
        self.0.as_u128().to_le_bytes()
    }

    /// Parse the little-endian wire form
    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_u128(u128::from_le_bytes(bytes)))
    }

    /// Underlying `uuid::Uuid`
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for BleUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for BleUuid {
    type Err = UuidError;

    /// Accepts `"F1"`, `"0x180D"`, `"0000fffa"` or a full hyphenated UUID
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if !digits.is_empty() && digits.len() <= 8 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
            let short = u32::from_str_radix(digits, 16)
                .map_err(|e| UuidError::Invalid(format!("{}: {}", s, e)))?;
            return Ok(Self::from_u32(short));
        }

        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|e| UuidError::Invalid(format!("{}: {}", s, e)))
    }
}

impl TryFrom<String> for BleUuid {
    type Error = UuidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BleUuid> for String {
    fn from(uuid: BleUuid) -> Self {
        uuid.to_string()
    }
}

impl fmt::Display for BleUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u16() {
            Some(short) => write!(f, "{:04x}", short),
            None => write!(f, "{}", self.0.hyphenated()),
        }
    }
}
