/// GATT attribute table
///
/// The table is built once from a declarative service description. Handles are
/// assigned contiguously in declaration order starting at
/// [`ATTRIBUTE_HANDLE_BASE`], which is also the order a central discovers them
/// in. Only attribute values change after construction.

use super::uuid::BleUuid;
use crate::config::hex_bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// First handle assigned by the table
pub const ATTRIBUTE_HANDLE_BASE: u16 = 0x0001;

/// Client Characteristic Configuration descriptor UUID (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIGURATION_UUID: BleUuid = BleUuid::from_u16(0x2902);

/// CCCD bit enabling notifications
pub const CCCD_NOTIFY: u16 = 0x0001;

/// CCCD bit enabling indications
pub const CCCD_INDICATE: u16 = 0x0002;

/// Attribute handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttHandle(pub u16);

impl fmt::Display for AttHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Attribute kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    Service,
    Characteristic,
    Descriptor,
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeKind::Service => write!(f, "service"),
            AttributeKind::Characteristic => write!(f, "characteristic"),
            AttributeKind::Descriptor => write!(f, "descriptor"),
        }
    }
}

/// A single access property, as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Property {
    Read,
    Write,
    Notify,
    Indicate,
}

/// Set of access properties, stored with the ATT characteristic property bits
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Property>", into = "Vec<Property>")]
pub struct Properties(u8);

impl Properties {
    pub const READ: Properties = Properties(0x02);
    pub const WRITE: Properties = Properties(0x08);
    pub const NOTIFY: Properties = Properties(0x10);
    pub const INDICATE: Properties = Properties(0x20);

    /// No properties
    pub const fn empty() -> Self {
        Properties(0)
    }

    /// Raw property bits
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Check if all bits of `other` are set
    pub fn contains(&self, other: Properties) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if a central may subscribe
    pub fn can_subscribe(&self) -> bool {
        self.contains(Properties::NOTIFY) || self.contains(Properties::INDICATE)
    }
}

impl std::ops::BitOr for Properties {
    type Output = Properties;

    fn bitor(self, rhs: Properties) -> Properties {
        Properties(self.0 | rhs.0)
    }
}

impl From<Property> for Properties {
    fn from(property: Property) -> Self {
        match property {
            Property::Read => Properties::READ,
            Property::Write => Properties::WRITE,
            Property::Notify => Properties::NOTIFY,
            Property::Indicate => Properties::INDICATE,
        }
    }
}

impl From<Vec<Property>> for Properties {
    fn from(list: Vec<Property>) -> Self {
        list.into_iter()
            .fold(Properties::empty(), |acc, p| acc | Properties::from(p))
    }
}

impl From<Properties> for Vec<Property> {
    fn from(props: Properties) -> Self {
        [Property::Read, Property::Write, Property::Notify, Property::Indicate]
            .into_iter()
            .filter(|p| props.contains(Properties::from(*p)))
            .collect()
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(Vec::<Property>::from(*self)).finish()
    }
}

/// Produces the current value of a characteristic on every read
pub type ValueGenerator = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Attribute value: fixed bytes or a generator
#[derive(Clone)]
pub enum AttributeValue {
    Static(Vec<u8>),
    Generated(ValueGenerator),
}

impl AttributeValue {
    /// Current bytes of this value
    pub fn current(&self) -> Vec<u8> {
        match self {
            AttributeValue::Static(bytes) => bytes.clone(),
            AttributeValue::Generated(generator) => generator(),
        }
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Static(bytes) => write!(f, "Static({})", hex::encode(bytes)),
            AttributeValue::Generated(_) => write!(f, "Generated(..)"),
        }
    }
}

/// ATT error codes reported back to the central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttErrorCode {
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    RequestNotSupported = 0x06,
    AttributeNotFound = 0x0A,
    InvalidAttributeValueLength = 0x0D,
    UnlikelyError = 0x0E,
    CccdImproperlyConfigured = 0xFD,
}

impl AttErrorCode {
    /// Wire value
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

/// Errors for GATT operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Unknown attribute handle {0}")]
    UnknownHandle(AttHandle),
    #[error("No {kind} with UUID {uuid}")]
    NotFound { uuid: BleUuid, kind: AttributeKind },
    #[error("Read not permitted on {0}")]
    ReadNotPermitted(AttHandle),
    #[error("Write not permitted on {0}")]
    WriteNotPermitted(AttHandle),
    #[error("Characteristic {0} does not support notifications or indications")]
    NotifySubscriptionUnsupported(AttHandle),
    #[error("{0} is not a Client Characteristic Configuration descriptor")]
    InvalidDescriptor(AttHandle),
    #[error("Invalid CCCD value written to {0}")]
    InvalidCccdValue(AttHandle),
    #[error("{0} is not a characteristic")]
    NotACharacteristic(AttHandle),
    #[error("Invalid attribute table definition: {0}")]
    InvalidDefinition(String),
}

impl GattError {
    /// ATT error code reported to the central for this error
    pub fn att_error_code(&self) -> AttErrorCode {
        match self {
            GattError::UnknownHandle(_) => AttErrorCode::InvalidHandle,
            GattError::NotFound { .. } => AttErrorCode::AttributeNotFound,
            GattError::ReadNotPermitted(_) => AttErrorCode::ReadNotPermitted,
            GattError::WriteNotPermitted(_) => AttErrorCode::WriteNotPermitted,
            GattError::NotifySubscriptionUnsupported(_) => AttErrorCode::CccdImproperlyConfigured,
            GattError::InvalidDescriptor(_) => AttErrorCode::RequestNotSupported,
            GattError::InvalidCccdValue(_) => AttErrorCode::InvalidAttributeValueLength,
            GattError::NotACharacteristic(_) | GattError::InvalidDefinition(_) => {
                AttErrorCode::UnlikelyError
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_descriptor_properties() -> Properties {
    Properties::READ
}

/// Declarative service description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: BleUuid,
    #[serde(default = "default_true")]
    pub primary: bool,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicDefinition>,
}

/// Declarative characteristic description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDefinition {
    pub uuid: BleUuid,
    pub properties: Properties,
    #[serde(default, with = "hex_bytes")]
    pub initial_value: Vec<u8>,
    #[serde(default)]
    pub descriptors: Vec<DescriptorDefinition>,
}

/// Declarative descriptor description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorDefinition {
    pub uuid: BleUuid,
    #[serde(default = "default_descriptor_properties")]
    pub properties: Properties,
    #[serde(default, with = "hex_bytes")]
    pub value: Vec<u8>,
}

/// A single attribute in the table
#[derive(Debug, Clone)]
pub struct Attribute {
    handle: AttHandle,
    uuid: BleUuid,
    kind: AttributeKind,
    properties: Properties,
    value: AttributeValue,
    parent: Option<AttHandle>,
    primary: bool,
}

impl Attribute {
    pub fn handle(&self) -> AttHandle {
        self.handle
    }

    pub fn uuid(&self) -> BleUuid {
        self.uuid
    }

    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    pub fn properties(&self) -> Properties {
        self.properties
    }

    pub fn value(&self) -> &AttributeValue {
        &self.value
    }

    /// Owning service (for characteristics) or characteristic (for descriptors)
    pub fn parent(&self) -> Option<AttHandle> {
        self.parent
    }

    /// Whether a service attribute is a primary service
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Check if this is a Client Characteristic Configuration descriptor
    pub fn is_cccd(&self) -> bool {
        self.kind == AttributeKind::Descriptor && self.uuid == CLIENT_CHARACTERISTIC_CONFIGURATION_UUID
    }
}

/// Handle range covered by one service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRange {
    pub start: AttHandle,
    pub end: AttHandle,
    pub uuid: BleUuid,
    pub primary: bool,
}

/// Immutable-structure attribute table
#[derive(Debug, Clone)]
pub struct AttributeTable {
    attributes: Vec<Attribute>,
}

impl AttributeTable {
    /// Build the table from service definitions
    pub fn build(services: &[ServiceDefinition]) -> Result<Self, GattError> {
        let mut attributes: Vec<Attribute> = Vec::new();

        let next_handle = |count: usize| -> Result<AttHandle, GattError> {
            let raw = ATTRIBUTE_HANDLE_BASE as usize + count;
            u16::try_from(raw)
                .map(AttHandle)
                .map_err(|_| GattError::InvalidDefinition("attribute handle space exhausted".to_string()))
        };

        for service in services {
            let service_handle = next_handle(attributes.len())?;
            attributes.push(Attribute {
                handle: service_handle,
                uuid: service.uuid,
                kind: AttributeKind::Service,
                properties: Properties::READ,
                value: AttributeValue::Static(service_declaration_value(service.uuid)),
                parent: None,
                primary: service.primary,
            });

            for characteristic in &service.characteristics {
                let char_handle = next_handle(attributes.len())?;
                attributes.push(Attribute {
                    handle: char_handle,
                    uuid: characteristic.uuid,
                    kind: AttributeKind::Characteristic,
                    properties: characteristic.properties,
                    value: AttributeValue::Static(characteristic.initial_value.clone()),
                    parent: Some(service_handle),
                    primary: false,
                });

                if characteristic.properties.can_subscribe() {
                    attributes.push(Attribute {
                        handle: next_handle(attributes.len())?,
                        uuid: CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
                        kind: AttributeKind::Descriptor,
                        properties: Properties::READ | Properties::WRITE,
                        value: AttributeValue::Static(vec![0x00, 0x00]),
                        parent: Some(char_handle),
                        primary: false,
                    });
                }

                for descriptor in &characteristic.descriptors {
                    if descriptor.uuid == CLIENT_CHARACTERISTIC_CONFIGURATION_UUID {
                        return Err(GattError::InvalidDefinition(format!(
                            "characteristic {} declares its own CCCD",
                            characteristic.uuid
                        )));
                    }
                    attributes.push(Attribute {
                        handle: next_handle(attributes.len())?,
                        uuid: descriptor.uuid,
                        kind: AttributeKind::Descriptor,
                        properties: descriptor.properties,
                        value: AttributeValue::Static(descriptor.value.clone()),
                        parent: Some(char_handle),
                        primary: false,
                    });
                }
            }
        }

        Ok(Self { attributes })
    }

    fn index(&self, handle: AttHandle) -> Result<usize, GattError> {
        let index = handle
            .0
            .checked_sub(ATTRIBUTE_HANDLE_BASE)
            .map(usize::from)
            .ok_or(GattError::UnknownHandle(handle))?;
        if index >= self.attributes.len() {
            return Err(GattError::UnknownHandle(handle));
        }
        Ok(index)
    }

    /// Look up an attribute by handle
    pub fn lookup(&self, handle: AttHandle) -> Result<&Attribute, GattError> {
        let index = self.index(handle)?;
        Ok(&self.attributes[index])
    }

    /// Find the first attribute of `kind` with `uuid`
    pub fn find_by_uuid(&self, uuid: BleUuid, kind: AttributeKind) -> Result<&Attribute, GattError> {
        self.attributes
            .iter()
            .find(|a| a.uuid == uuid && a.kind == kind)
            .ok_or(GattError::NotFound { uuid, kind })
    }

    /// Read an attribute value, enforcing the Read property
    pub fn read(&self, handle: AttHandle) -> Result<Vec<u8>, GattError> {
        let attribute = self.lookup(handle)?;
        if !attribute.properties.contains(Properties::READ) {
            return Err(GattError::ReadNotPermitted(handle));
        }
        Ok(attribute.value.current())
    }

    /// Client write to a characteristic or descriptor value
    pub fn write(&mut self, handle: AttHandle, value: Vec<u8>) -> Result<(), GattError> {
        let index = self.index(handle)?;
        let attribute = &mut self.attributes[index];
        if attribute.kind == AttributeKind::Service
            || attribute.is_cccd()
            || !attribute.properties.contains(Properties::WRITE)
        {
            return Err(GattError::WriteNotPermitted(handle));
        }
        attribute.value = AttributeValue::Static(value);
        Ok(())
    }

    /// Replace a characteristic value (local producer update)
    pub fn set_value(&mut self, handle: AttHandle, value: Vec<u8>) -> Result<(), GattError> {
        self.replace_value(handle, AttributeValue::Static(value))
    }

    /// Serve a characteristic from a generator instead of stored bytes
    pub fn bind_generator(&mut self, handle: AttHandle, generator: ValueGenerator) -> Result<(), GattError> {
        self.replace_value(handle, AttributeValue::Generated(generator))
    }

    fn replace_value(&mut self, handle: AttHandle, value: AttributeValue) -> Result<(), GattError> {
        let index = self.index(handle)?;
        let attribute = &mut self.attributes[index];
        if attribute.kind != AttributeKind::Characteristic {
            return Err(GattError::NotACharacteristic(handle));
        }
        attribute.value = value;
        Ok(())
    }

    /// CCCD handle belonging to a characteristic, if it has one
    pub fn cccd_for(&self, characteristic: AttHandle) -> Option<AttHandle> {
        self.attributes
            .iter()
            .find(|a| a.is_cccd() && a.parent == Some(characteristic))
            .map(|a| a.handle)
    }

    /// Resolve a subscription write target to its characteristic
    ///
    /// `handle` must name a CCCD. Naming a characteristic that cannot notify
    /// yields `NotifySubscriptionUnsupported`; anything else is an
    /// `InvalidDescriptor`.
    pub fn subscription_target(&self, handle: AttHandle) -> Result<&Attribute, GattError> {
        let attribute = self.lookup(handle)?;

        if attribute.is_cccd() {
            let parent = attribute.parent.ok_or(GattError::InvalidDescriptor(handle))?;
            let characteristic = self.lookup(parent)?;
            if !characteristic.properties.can_subscribe() {
                return Err(GattError::NotifySubscriptionUnsupported(parent));
            }
            return Ok(characteristic);
        }

        if attribute.kind == AttributeKind::Characteristic && !attribute.properties.can_subscribe() {
            return Err(GattError::NotifySubscriptionUnsupported(handle));
        }

        Err(GattError::InvalidDescriptor(handle))
    }

    /// Handle ranges of every service, in discovery order
    pub fn service_ranges(&self) -> Vec<ServiceRange> {
        let mut ranges: Vec<ServiceRange> = Vec::new();
        for attribute in &self.attributes {
            if attribute.kind == AttributeKind::Service {
                ranges.push(ServiceRange {
                    start: attribute.handle,
                    end: attribute.handle,
                    uuid: attribute.uuid,
                    primary: attribute.primary,
                });
            } else if let Some(current) = ranges.last_mut() {
                current.end = attribute.handle;
            }
        }
        ranges
    }

    /// Attributes in handle order
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter()
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// First assigned handle
    pub fn first_handle(&self) -> Option<AttHandle> {
        self.attributes.first().map(|a| a.handle)
    }

    /// Last assigned handle
    pub fn last_handle(&self) -> Option<AttHandle> {
        self.attributes.last().map(|a| a.handle)
    }
}

/// Service declaration value: the service UUID in its shortest wire form
fn service_declaration_value(uuid: BleUuid) -> Vec<u8> {
    match uuid.as_u16() {
        Some(short) => short.to_le_bytes().to_vec(),
        None => uuid.to_le_bytes().to_vec(),
    }
}
