/// BLE (Bluetooth Low Energy) Peripheral Module
///
/// Protocol-level building blocks of a Remote ID peripheral:
///
/// - **uuid**: Bluetooth UUIDs with 16-bit SIG short forms
/// - **payload**: Advertising payload (AD structure) encoding and decoding
/// - **advertiser**: Advertising state machine with retry backoff
/// - **gatt**: GATT attribute table with contiguous handles
/// - **connection**: Single-connection manager with CCCD subscriptions
///
/// The radio controller and link layer are reached through the
/// [`RadioController`] and [`LinkLayer`] traits, so the logic here is
/// testable without a Bluetooth adapter.

pub mod advertiser;
pub mod connection;
pub mod gatt;
pub mod payload;
pub mod uuid;

// Re-export commonly used types
pub use advertiser::{
    AdvertisingError, AdvertisingEvent, AdvertisingState, AdvertisingStateMachine,
    ControllerError, RadioController, RetryDecision, RetryPolicy, StopAction,
};

pub use connection::{
    Connection, ConnectionError, ConnectionId, ConnectionManager, ConnectionPolicy,
    ConnectionSettings, DisconnectOutcome, DisconnectReason, LinkError, LinkLayer, PeerAddress,
    PushKind, DEFAULT_ATT_MTU,
};

pub use gatt::{
    AttErrorCode, AttHandle, Attribute, AttributeKind, AttributeTable, AttributeValue,
    CharacteristicDefinition, DescriptorDefinition, GattError, Properties, Property,
    ServiceDefinition, ServiceRange, ValueGenerator, CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
};

pub use payload::{
    AdStructure, AdvertisingData, AdvertisingMode, AdvertisingPayload, DecodedAdvertisement,
    PayloadBuilder, PayloadError, EXTENDED_ADV_DATA_MAX_LEN, LEGACY_ADV_DATA_MAX_LEN,
};

pub use uuid::{BleUuid, UuidError};
