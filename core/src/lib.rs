// Remote ID Peripheral Core
//
// A BLE peripheral role built from scratch: advertise a Drone Remote ID
// service and serve a read/notify characteristic. The radio controller and
// the link layer are external collaborators reached through traits.

#![allow(clippy::empty_line_after_doc_comments)]

pub mod ble;
pub mod config;
pub mod peripheral;

use thiserror::Error;

pub use ble::{
    AdvertisingData, AdvertisingError, AdvertisingEvent, AdvertisingMode, AdvertisingPayload,
    AdvertisingState, AttErrorCode, AttHandle, AttributeTable, BleUuid, CharacteristicDefinition,
    ConnectionError, ConnectionId, ConnectionPolicy, ControllerError, DisconnectReason,
    GattError, LinkError, LinkLayer, PayloadBuilder, PayloadError, PeerAddress, Properties,
    PushKind, RadioController, RetryPolicy, ServiceDefinition,
};
pub use config::PeripheralConfig;
pub use peripheral::{
    start_peripheral, AttResult, ConnectionInfo, LinkEvent, LinkHandle, PeripheralEvent,
    PeripheralHandle, PeripheralStatus,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum PeripheralError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Advertising(#[from] AdvertisingError),
    #[error(transparent)]
    Gatt(#[from] GattError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("ATT error 0x{:02x}", .0.value())]
    Att(AttErrorCode),
    #[error("Peripheral task not running")]
    NotRunning,
}

/// Install the global tracing subscriber (idempotent)
///
/// Honors `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
}
