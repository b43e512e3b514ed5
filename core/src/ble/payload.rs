/// Advertising payload construction and parsing
///
/// An advertising payload is a sequence of AD structures
/// `[length: u8 | ad_type: u8 | data...]`. Legacy advertising PDUs carry at most
/// 31 bytes of AD data; the builder refuses to produce anything larger rather
/// than silently dropping fields.

use super::uuid::BleUuid;
use crate::config::hex_map;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Maximum AD data length of a legacy advertising PDU
pub const LEGACY_ADV_DATA_MAX_LEN: usize = 31;

/// Maximum AD data length we put in a single extended advertising PDU
pub const EXTENDED_ADV_DATA_MAX_LEN: usize = 254;

/// Flags bit: LE General Discoverable Mode
pub const FLAG_LE_GENERAL_DISCOVERABLE: u8 = 0x02;

/// Flags bit: BR/EDR Not Supported
pub const FLAG_BR_EDR_NOT_SUPPORTED: u8 = 0x04;

/// AD type codes from the Bluetooth Assigned Numbers
pub mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_SERVICE_UUIDS_16: u8 = 0x02;
    pub const COMPLETE_SERVICE_UUIDS_16: u8 = 0x03;
    pub const INCOMPLETE_SERVICE_UUIDS_128: u8 = 0x06;
    pub const COMPLETE_SERVICE_UUIDS_128: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    pub const SOLICIT_UUIDS_16: u8 = 0x14;
    pub const SOLICIT_UUIDS_128: u8 = 0x15;
    pub const SERVICE_DATA_16: u8 = 0x16;
    pub const SERVICE_DATA_128: u8 = 0x21;
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

/// Errors for payload operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Advertising payload too large: {needed} bytes exceeds {limit}")]
    PayloadTooLarge { needed: usize, limit: usize },
    #[error("Truncated AD structure at offset {0}")]
    Truncated(usize),
    #[error("Malformed AD structure 0x{ad_type:02x}: {reason}")]
    Malformed { ad_type: u8, reason: String },
}

/// Advertising mode, determines the payload capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvertisingMode {
    /// Legacy advertising PDUs (31 bytes)
    #[default]
    Legacy,
    /// Extended advertising (single PDU, 254 bytes)
    Extended,
}

impl AdvertisingMode {
    /// Maximum AD data length for this mode
    pub fn max_len(&self) -> usize {
        match self {
            AdvertisingMode::Legacy => LEGACY_ADV_DATA_MAX_LEN,
            AdvertisingMode::Extended => EXTENDED_ADV_DATA_MAX_LEN,
        }
    }
}

/// What to advertise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertisingData {
    /// Complete local name
    pub local_name: Option<String>,
    /// Advertised service UUIDs (treated as a set, first occurrence wins)
    pub service_uuids: Vec<BleUuid>,
    /// Solicited service UUIDs
    pub solicit_uuids: Vec<BleUuid>,
    /// Manufacturer specific data keyed by company identifier
    #[serde(with = "hex_map")]
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID
    #[serde(with = "hex_map")]
    pub service_data: BTreeMap<BleUuid, Vec<u8>>,
    /// TX power level in dBm, if it should be advertised
    pub tx_power_level: Option<i8>,
    /// Whether to emit the Flags structure at all
    pub include_flags: bool,
    /// Set LE General Discoverable in the Flags structure
    pub discoverable: bool,
    /// Legacy or extended advertising
    pub mode: AdvertisingMode,
}

impl Default for AdvertisingData {
    fn default() -> Self {
        Self {
            local_name: None,
            service_uuids: Vec::new(),
            solicit_uuids: Vec::new(),
            manufacturer_data: BTreeMap::new(),
            service_data: BTreeMap::new(),
            tx_power_level: None,
            include_flags: true,
            discoverable: true,
            mode: AdvertisingMode::Legacy,
        }
    }
}

/// A single typed AD structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdStructure {
    Flags(u8),
    ServiceUuids16(Vec<u16>),
    ServiceUuids128(Vec<BleUuid>),
    SolicitUuids16(Vec<u16>),
    SolicitUuids128(Vec<BleUuid>),
    TxPowerLevel(i8),
    ServiceData16 { uuid: u16, data: Vec<u8> },
    ServiceData128 { uuid: BleUuid, data: Vec<u8> },
    ManufacturerData { company_id: u16, data: Vec<u8> },
    CompleteLocalName(String),
}

impl AdStructure {
    /// AD type code
    pub fn ad_type(&self) -> u8 {
        match self {
            AdStructure::Flags(_) => ad_type::FLAGS,
            AdStructure::ServiceUuids16(_) => ad_type::COMPLETE_SERVICE_UUIDS_16,
            AdStructure::ServiceUuids128(_) => ad_type::COMPLETE_SERVICE_UUIDS_128,
            AdStructure::SolicitUuids16(_) => ad_type::SOLICIT_UUIDS_16,
            AdStructure::SolicitUuids128(_) => ad_type::SOLICIT_UUIDS_128,
            AdStructure::TxPowerLevel(_) => ad_type::TX_POWER_LEVEL,
            AdStructure::ServiceData16 { .. } => ad_type::SERVICE_DATA_16,
            AdStructure::ServiceData128 { .. } => ad_type::SERVICE_DATA_128,
            AdStructure::ManufacturerData { .. } => ad_type::MANUFACTURER_DATA,
            AdStructure::CompleteLocalName(_) => ad_type::COMPLETE_LOCAL_NAME,
        }
    }

    fn data(&self) -> Vec<u8> {
        match self {
            AdStructure::Flags(flags) => vec![*flags],
            AdStructure::ServiceUuids16(uuids) | AdStructure::SolicitUuids16(uuids) => {
                uuids.iter().flat_map(|u| u.to_le_bytes()).collect()
            }
            AdStructure::ServiceUuids128(uuids) | AdStructure::SolicitUuids128(uuids) => {
                uuids.iter().flat_map(|u| u.to_le_bytes()).collect()
            }
            AdStructure::TxPowerLevel(dbm) => vec![*dbm as u8],
            AdStructure::ServiceData16 { uuid, data } => {
                let mut out = uuid.to_le_bytes().to_vec();
                out.extend_from_slice(data);
                out
            }
            AdStructure::ServiceData128 { uuid, data } => {
                let mut out = uuid.to_le_bytes().to_vec();
                out.extend_from_slice(data);
                out
            }
            AdStructure::ManufacturerData { company_id, data } => {
                let mut out = company_id.to_le_bytes().to_vec();
                out.extend_from_slice(data);
                out
            }
            AdStructure::CompleteLocalName(name) => name.as_bytes().to_vec(),
        }
    }

    /// Encoded size including the length and type bytes
    pub fn encoded_len(&self) -> usize {
        2 + self.data().len()
    }
}

/// An encoded advertising payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingPayload {
    structures: Vec<AdStructure>,
    bytes: Vec<u8>,
    mode: AdvertisingMode,
}

impl AdvertisingPayload {
    /// Encode advertising data, failing if it does not fit the mode's capacity
    pub fn build(data: &AdvertisingData) -> Result<Self, PayloadError> {
        let structures = Self::structures_for(data);
        let limit = data.mode.max_len();

        let mut bytes = Vec::with_capacity(limit);
        for structure in &structures {
            let body = structure.data();
            // The length byte covers the type byte plus the data
            if body.len() + 1 > u8::MAX as usize {
                return Err(PayloadError::PayloadTooLarge {
                    needed: body.len() + 2,
                    limit: u8::MAX as usize + 1,
                });
            }
            bytes.push((body.len() + 1) as u8);
            bytes.push(structure.ad_type());
            bytes.extend_from_slice(&body);
        }

        if bytes.len() > limit {
            return Err(PayloadError::PayloadTooLarge {
                needed: bytes.len(),
                limit,
            });
        }

        Ok(Self {
            structures,
            bytes,
            mode: data.mode,
        })
    }

    fn structures_for(data: &AdvertisingData) -> Vec<AdStructure> {
        let mut structures = Vec::new();

        if data.include_flags {
            let mut flags = FLAG_BR_EDR_NOT_SUPPORTED;
            if data.discoverable {
                flags |= FLAG_LE_GENERAL_DISCOVERABLE;
            }
            structures.push(AdStructure::Flags(flags));
        }

        let (short, long) = split_uuids(&data.service_uuids);
        if !short.is_empty() {
            structures.push(AdStructure::ServiceUuids16(short));
        }
        if !long.is_empty() {
            structures.push(AdStructure::ServiceUuids128(long));
        }

        let (short, long) = split_uuids(&data.solicit_uuids);
        if !short.is_empty() {
            structures.push(AdStructure::SolicitUuids16(short));
        }
        if !long.is_empty() {
            structures.push(AdStructure::SolicitUuids128(long));
        }

        if let Some(dbm) = data.tx_power_level {
            structures.push(AdStructure::TxPowerLevel(dbm));
        }

        for (uuid, bytes) in &data.service_data {
            match uuid.as_u16() {
                Some(short) => structures.push(AdStructure::ServiceData16 {
                    uuid: short,
                    data: bytes.clone(),
                }),
                None => structures.push(AdStructure::ServiceData128 {
                    uuid: *uuid,
                    data: bytes.clone(),
                }),
            }
        }

        for (company_id, bytes) in &data.manufacturer_data {
            structures.push(AdStructure::ManufacturerData {
                company_id: *company_id,
                data: bytes.clone(),
            });
        }

        if let Some(name) = &data.local_name {
            structures.push(AdStructure::CompleteLocalName(name.clone()));
        }

        structures
    }

    /// Encoded AD data
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Typed structures in encoding order
    pub fn structures(&self) -> &[AdStructure] {
        &self.structures
    }

    /// Advertising mode this payload was built for
    pub fn mode(&self) -> AdvertisingMode {
        self.mode
    }
}

/// Split UUIDs into 16-bit and 128-bit lists, dropping duplicates
fn split_uuids(uuids: &[BleUuid]) -> (Vec<u16>, Vec<BleUuid>) {
    let mut seen = BTreeSet::new();
    let mut short = Vec::new();
    let mut long = Vec::new();
    for uuid in uuids {
        if !seen.insert(*uuid) {
            continue;
        }
        match uuid.as_u16() {
            Some(value) => short.push(value),
            None => long.push(*uuid),
        }
    }
    (short, long)
}

/// Fluent builder for advertising payloads
#[derive(Debug, Clone, Default)]
pub struct PayloadBuilder {
    data: AdvertisingData,
}

impl PayloadBuilder {
    /// Create a new builder (flags on, discoverable, legacy mode)
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing advertising data
    pub fn from_data(data: AdvertisingData) -> Self {
        Self { data }
    }

    /// Set the complete local name
    pub fn local_name(mut self, name: impl Into<String>) -> Self {
        self.data.local_name = Some(name.into());
        self
    }

    /// Advertise a service UUID
    pub fn service_uuid(mut self, uuid: BleUuid) -> Self {
        self.data.service_uuids.push(uuid);
        self
    }

    /// Solicit a service UUID
    pub fn solicit_uuid(mut self, uuid: BleUuid) -> Self {
        self.data.solicit_uuids.push(uuid);
        self
    }

    /// Add manufacturer specific data
    pub fn manufacturer_data(mut self, company_id: u16, data: impl Into<Vec<u8>>) -> Self {
        self.data.manufacturer_data.insert(company_id, data.into());
        self
    }

    /// Add service data
    pub fn service_data(mut self, uuid: BleUuid, data: impl Into<Vec<u8>>) -> Self {
        self.data.service_data.insert(uuid, data.into());
        self
    }

    /// Advertise a TX power level
    pub fn tx_power_level(mut self, dbm: i8) -> Self {
        self.data.tx_power_level = Some(dbm);
        self
    }

    /// Include or omit the Flags structure
    pub fn include_flags(mut self, include: bool) -> Self {
        self.data.include_flags = include;
        self
    }

    /// Set LE General Discoverable
    pub fn discoverable(mut self, discoverable: bool) -> Self {
        self.data.discoverable = discoverable;
        self
    }

    /// Choose legacy or extended advertising
    pub fn mode(mut self, mode: AdvertisingMode) -> Self {
        self.data.mode = mode;
        self
    }

    /// Encode the payload
    pub fn build(&self) -> Result<AdvertisingPayload, PayloadError> {
        AdvertisingPayload::build(&self.data)
    }
}

/// Advertising data recovered from raw AD structures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedAdvertisement {
    pub flags: Option<u8>,
    pub local_name: Option<String>,
    pub service_uuids: Vec<BleUuid>,
    pub solicit_uuids: Vec<BleUuid>,
    pub tx_power_level: Option<i8>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub service_data: BTreeMap<BleUuid, Vec<u8>>,
    /// AD structures of types we don't interpret
    pub unknown: Vec<(u8, Vec<u8>)>,
}

impl DecodedAdvertisement {
    /// Parse a sequence of AD structures
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut decoded = Self::default();
        let mut offset = 0usize;

        while offset < bytes.len() {
            let len = bytes[offset] as usize;
            // Zero length marks the start of padding
            if len == 0 {
                break;
            }
            if offset + 1 + len > bytes.len() {
                return Err(PayloadError::Truncated(offset));
            }
            let ad_type = bytes[offset + 1];
            let data = &bytes[offset + 2..offset + 1 + len];
            decoded.apply(ad_type, data)?;
            offset += 1 + len;
        }

        Ok(decoded)
    }

    fn apply(&mut self, ad_type: u8, data: &[u8]) -> Result<(), PayloadError> {
        let malformed = |reason: &str| PayloadError::Malformed {
            ad_type,
            reason: reason.to_string(),
        };

        match ad_type {
            ad_type::FLAGS => {
                let flags = *data.first().ok_or_else(|| malformed("empty flags"))?;
                self.flags = Some(flags);
            }
            ad_type::INCOMPLETE_SERVICE_UUIDS_16 | ad_type::COMPLETE_SERVICE_UUIDS_16 => {
                self.service_uuids.extend(parse_uuids_16(data).ok_or_else(|| malformed("odd length"))?);
            }
            ad_type::INCOMPLETE_SERVICE_UUIDS_128 | ad_type::COMPLETE_SERVICE_UUIDS_128 => {
                self.service_uuids
                    .extend(parse_uuids_128(data).ok_or_else(|| malformed("length not a multiple of 16"))?);
            }
            ad_type::SOLICIT_UUIDS_16 => {
                self.solicit_uuids.extend(parse_uuids_16(data).ok_or_else(|| malformed("odd length"))?);
            }
            ad_type::SOLICIT_UUIDS_128 => {
                self.solicit_uuids
                    .extend(parse_uuids_128(data).ok_or_else(|| malformed("length not a multiple of 16"))?);
            }
            ad_type::SHORTENED_LOCAL_NAME | ad_type::COMPLETE_LOCAL_NAME => {
                let name = std::str::from_utf8(data).map_err(|_| malformed("name is not UTF-8"))?;
                self.local_name = Some(name.to_string());
            }
            ad_type::TX_POWER_LEVEL => {
                let dbm = *data.first().ok_or_else(|| malformed("empty TX power"))?;
                self.tx_power_level = Some(dbm as i8);
            }
            ad_type::SERVICE_DATA_16 => {
                if data.len() < 2 {
                    return Err(malformed("missing service UUID"));
                }
                let uuid = BleUuid::from_u16(u16::from_le_bytes([data[0], data[1]]));
                self.service_data.insert(uuid, data[2..].to_vec());
            }
            ad_type::SERVICE_DATA_128 => {
                if data.len() < 16 {
                    return Err(malformed("missing service UUID"));
                }
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&data[..16]);
                self.service_data.insert(BleUuid::from_le_bytes(raw), data[16..].to_vec());
            }
            ad_type::MANUFACTURER_DATA => {
                if data.len() < 2 {
                    return Err(malformed("missing company identifier"));
                }
                let company_id = u16::from_le_bytes([data[0], data[1]]);
                self.manufacturer_data.insert(company_id, data[2..].to_vec());
            }
            other => self.unknown.push((other, data.to_vec())),
        }
        Ok(())
    }

    /// Check the LE General Discoverable flag
    pub fn is_discoverable(&self) -> bool {
        self.flags
            .map(|f| f & FLAG_LE_GENERAL_DISCOVERABLE != 0)
            .unwrap_or(false)
    }
}

fn parse_uuids_16(data: &[u8]) -> Option<Vec<BleUuid>> {
    if data.len() % 2 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(2)
            .map(|c| BleUuid::from_u16(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
    )
}

fn parse_uuids_128(data: &[u8]) -> Option<Vec<BleUuid>> {
    if data.len() % 16 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(16)
            .map(|c| {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(c);
                BleUuid::from_le_bytes(raw)
            })
            .collect(),
    )
}
