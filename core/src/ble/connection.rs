/// Connection & subscription management
///
/// Tracks the single live central connection, its negotiated MTU and the
/// characteristics it subscribed to, answers attribute requests from the
/// attribute table and pushes notifications to the link layer. A second
/// concurrent central is rejected or queued depending on policy, never
/// silently replacing the active link.

use super::gatt::{
    AttErrorCode, AttHandle, AttributeKind, AttributeTable, AttributeValue, GattError,
    Properties, ValueGenerator, CCCD_INDICATE, CCCD_NOTIFY,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Minimum ATT MTU every link supports
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest ATT MTU the protocol allows
pub const MAX_ATT_MTU: u16 = 517;

/// Default MTU offered by this peripheral
pub const DEFAULT_SERVER_MTU: u16 = 247;

/// Default bound on queued connection attempts
pub const DEFAULT_MAX_PENDING_CONNECTIONS: usize = 4;

/// Bluetooth device address of a central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(pub [u8; 6]);

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for PeerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("Invalid peer address: {}", s));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|e| format!("Invalid peer address {}: {}", s, e))?;
        }
        Ok(PeerAddress(bytes))
    }
}

/// Identifier of a link, assigned on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// What to do with a second concurrent central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPolicy {
    /// Refuse it with `AlreadyConnected`
    #[default]
    Reject,
    /// Hold it until the active link ends
    Queue,
}

/// How a value reaches a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushKind {
    Notification,
    Indication,
}

/// Why a link ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Central closed the link
    RemoteUserTerminated,
    /// Supervision timeout at the radio level
    ConnectionTimeout,
    /// We closed the link
    LocalHostTerminated,
    /// An attribute transaction missed its deadline
    TransactionTimeout,
}

impl DisconnectReason {
    /// HCI error code carried in the disconnect
    pub fn hci_code(&self) -> u8 {
        match self {
            DisconnectReason::RemoteUserTerminated => 0x13,
            DisconnectReason::ConnectionTimeout => 0x08,
            DisconnectReason::LocalHostTerminated => 0x16,
            DisconnectReason::TransactionTimeout => 0x22,
        }
    }
}

/// Errors reported by the link layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Link {0} is not connected")]
    NotConnected(ConnectionId),
    #[error("Link layer rejected request: {0}")]
    Rejected(String),
}

/// Errors for connection operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Already connected to {active}")]
    AlreadyConnected { active: PeerAddress },
    #[error("Connection from {peer} queued at position {position}")]
    Queued { peer: PeerAddress, position: usize },
    #[error("Connection queue full, rejected {peer}")]
    QueueFull { peer: PeerAddress },
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error(transparent)]
    Gatt(#[from] GattError),
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl ConnectionError {
    /// ATT error code for client-facing protocol errors
    pub fn att_error_code(&self) -> AttErrorCode {
        match self {
            ConnectionError::Gatt(e) => e.att_error_code(),
            _ => AttErrorCode::UnlikelyError,
        }
    }
}

/// Link-layer transaction interface
///
/// Handlers are called from the peripheral task and must not block.
#[cfg_attr(test, mockall::automock)]
pub trait LinkLayer: Send {
    /// Send a notification or indication to the central
    fn push(
        &mut self,
        connection: ConnectionId,
        handle: AttHandle,
        value: &[u8],
        kind: PushKind,
    ) -> Result<(), LinkError>;

    /// Tear down a link
    fn disconnect(&mut self, connection: ConnectionId, reason: DisconnectReason) -> Result<(), LinkError>;
}

/// The live link to a central
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: PeerAddress,
    mtu: u16,
    subscriptions: HashMap<AttHandle, PushKind>,
}

impl Connection {
    fn new(id: ConnectionId, peer: PeerAddress) -> Self {
        Self {
            id,
            peer,
            mtu: DEFAULT_ATT_MTU,
            subscriptions: HashMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    /// Negotiated ATT MTU
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Check if the central subscribed to a characteristic
    pub fn is_subscribed(&self, characteristic: AttHandle) -> bool {
        self.subscriptions.contains_key(&characteristic)
    }

    /// Subscribed characteristics
    pub fn subscriptions(&self) -> impl Iterator<Item = (&AttHandle, &PushKind)> {
        self.subscriptions.iter()
    }

    fn cccd_value(&self, characteristic: AttHandle) -> Vec<u8> {
        let bits = match self.subscriptions.get(&characteristic) {
            Some(PushKind::Notification) => CCCD_NOTIFY,
            Some(PushKind::Indication) => CCCD_INDICATE,
            None => 0,
        };
        bits.to_le_bytes().to_vec()
    }
}

/// Connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub policy: ConnectionPolicy,
    pub max_pending: usize,
    pub server_mtu: u16,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            policy: ConnectionPolicy::Reject,
            max_pending: DEFAULT_MAX_PENDING_CONNECTIONS,
            server_mtu: DEFAULT_SERVER_MTU,
        }
    }
}

/// Result of ending a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectOutcome {
    /// The link that ended
    pub connection: ConnectionId,
    /// Peer of the link that ended
    pub peer: PeerAddress,
    /// Subscriptions dropped with it
    pub cleared_subscriptions: usize,
    /// Queued peer that became the active connection
    pub promoted: Option<(ConnectionId, PeerAddress)>,
}

/// Owns the attribute table and the connection state
pub struct ConnectionManager<L: LinkLayer> {
    table: AttributeTable,
    link: L,
    settings: ConnectionSettings,
    active: Option<Connection>,
    pending: VecDeque<PeerAddress>,
    next_id: u64,
}

impl<L: LinkLayer> ConnectionManager<L> {
    /// Create a manager with no connection
    pub fn new(table: AttributeTable, link: L, settings: ConnectionSettings) -> Self {
        Self {
            table,
            link,
            settings,
            active: None,
            pending: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Attribute table
    pub fn table(&self) -> &AttributeTable {
        &self.table
    }

    /// Link layer
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Link layer (mutable)
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Active connection, if any
    pub fn active(&self) -> Option<&Connection> {
        self.active.as_ref()
    }

    /// Check if a central is connected
    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    /// Queued peers, oldest first
    pub fn pending(&self) -> impl Iterator<Item = &PeerAddress> {
        self.pending.iter()
    }

    fn allocate(&mut self, peer: PeerAddress) -> &Connection {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        info!("Central {} connected as {}", peer, id);
        self.active.insert(Connection::new(id, peer))
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, ConnectionError> {
        match self.active.as_mut() {
            Some(conn) if conn.id == id => Ok(conn),
            _ => Err(ConnectionError::UnknownConnection(id)),
        }
    }

    fn connection(&self, id: ConnectionId) -> Result<&Connection, ConnectionError> {
        match self.active.as_ref() {
            Some(conn) if conn.id == id => Ok(conn),
            _ => Err(ConnectionError::UnknownConnection(id)),
        }
    }

    /// A central established a link
    pub fn on_connect(&mut self, peer: PeerAddress) -> Result<&Connection, ConnectionError> {
        if let Some(active) = &self.active {
            let active_peer = active.peer;
            return match self.settings.policy {
                ConnectionPolicy::Reject => {
                    warn!("Rejecting {}: already connected to {}", peer, active_peer);
                    Err(ConnectionError::AlreadyConnected { active: active_peer })
                }
                ConnectionPolicy::Queue => {
                    if self.pending.len() >= self.settings.max_pending {
                        warn!("Connection queue full, rejecting {}", peer);
                        return Err(ConnectionError::QueueFull { peer });
                    }
                    self.pending.push_back(peer);
                    let position = self.pending.len();
                    info!("Queued {} at position {}", peer, position);
                    Err(ConnectionError::Queued { peer, position })
                }
            };
        }
        Ok(self.allocate(peer))
    }

    /// A queued central gave up before it was promoted
    pub fn cancel_pending(&mut self, peer: PeerAddress) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| *p != peer);
        before != self.pending.len()
    }

    /// ATT MTU exchange: settle on the smaller of both sides, never below 23
    pub fn on_mtu_exchange(&mut self, id: ConnectionId, client_mtu: u16) -> Result<u16, ConnectionError> {
        let server_mtu = self.settings.server_mtu;
        let conn = self.connection_mut(id)?;
        conn.mtu = client_mtu.min(server_mtu).clamp(DEFAULT_ATT_MTU, MAX_ATT_MTU);
        debug!("{} negotiated MTU {}", id, conn.mtu);
        Ok(conn.mtu)
    }

    /// Read request
    pub fn on_read(&self, id: ConnectionId, handle: AttHandle) -> Result<Vec<u8>, ConnectionError> {
        let conn = self.connection(id)?;
        let attribute = self.table.lookup(handle)?;

        let mut value = if attribute.is_cccd() {
            let parent = attribute.parent().ok_or(GattError::InvalidDescriptor(handle))?;
            conn.cccd_value(parent)
        } else {
            self.table.read(handle)?
        };

        // Read responses carry at most MTU - 1 bytes
        value.truncate(conn.mtu as usize - 1);
        Ok(value)
    }

    /// Write request
    pub fn on_write(&mut self, id: ConnectionId, handle: AttHandle, value: &[u8]) -> Result<(), ConnectionError> {
        self.connection(id)?;
        if self.table.lookup(handle)?.is_cccd() {
            return self.on_cccd_write(id, handle, value);
        }
        self.table.write(handle, value.to_vec())?;
        debug!("{} wrote {} bytes to {}", id, value.len(), handle);
        Ok(())
    }

    /// Raw write to a CCCD
    pub fn on_cccd_write(&mut self, id: ConnectionId, handle: AttHandle, raw: &[u8]) -> Result<(), ConnectionError> {
        if raw.len() != 2 {
            return Err(GattError::InvalidCccdValue(handle).into());
        }
        let bits = u16::from_le_bytes([raw[0], raw[1]]);
        let properties = self.table.subscription_target(handle)?.properties();

        let kind = if bits & CCCD_NOTIFY != 0 && properties.contains(Properties::NOTIFY) {
            Some(PushKind::Notification)
        } else if bits & CCCD_INDICATE != 0 && properties.contains(Properties::INDICATE) {
            Some(PushKind::Indication)
        } else if bits == 0 {
            None
        } else {
            return Err(GattError::InvalidCccdValue(handle).into());
        };

        self.apply_subscription(id, handle, kind)
    }

    /// Enable or disable notifications through a CCCD handle
    pub fn on_subscribe_write(&mut self, id: ConnectionId, handle: AttHandle, enable: bool) -> Result<(), ConnectionError> {
        let kind = if enable {
            let properties = self.table.subscription_target(handle)?.properties();
            if properties.contains(Properties::NOTIFY) {
                Some(PushKind::Notification)
            } else {
                Some(PushKind::Indication)
            }
        } else {
            None
        };
        self.apply_subscription(id, handle, kind)
    }

    fn apply_subscription(
        &mut self,
        id: ConnectionId,
        cccd: AttHandle,
        kind: Option<PushKind>,
    ) -> Result<(), ConnectionError> {
        self.connection(id)?;
        let characteristic = self.table.subscription_target(cccd)?.handle();
        let conn = self.connection_mut(id)?;
        match kind {
            Some(kind) => {
                conn.subscriptions.insert(characteristic, kind);
                info!("{} subscribed to {} ({:?})", id, characteristic, kind);
            }
            None => {
                conn.subscriptions.remove(&characteristic);
                info!("{} unsubscribed from {}", id, characteristic);
            }
        }
        Ok(())
    }

    /// Update a characteristic value and push it to subscribers
    ///
    /// Returns the number of deliveries. With no subscriber this is a no-op
    /// apart from storing the value.
    pub fn notify(&mut self, handle: AttHandle, value: &[u8]) -> Result<usize, ConnectionError> {
        let attribute = self.table.lookup(handle)?;
        if attribute.kind() != AttributeKind::Characteristic {
            return Err(GattError::NotACharacteristic(handle).into());
        }
        if matches!(attribute.value(), AttributeValue::Static(_)) {
            self.table.set_value(handle, value.to_vec())?;
        }

        let Some(conn) = self.active.as_ref() else {
            return Ok(0);
        };
        let Some(kind) = conn.subscriptions.get(&handle).copied() else {
            return Ok(0);
        };

        let id = conn.id;
        let max = conn.mtu as usize - 3;
        let payload = &value[..value.len().min(max)];
        if payload.len() < value.len() {
            debug!("Truncating {} byte value on {} to {} bytes", value.len(), handle, max);
        }

        match self.link.push(id, handle, payload, kind) {
            Ok(()) => Ok(1),
            Err(e) => {
                warn!("Push to {} on {} failed: {}", id, handle, e);
                Ok(0)
            }
        }
    }

    /// Replace a characteristic value without notifying
    pub fn set_value(&mut self, handle: AttHandle, value: Vec<u8>) -> Result<(), ConnectionError> {
        self.table.set_value(handle, value)?;
        Ok(())
    }

    /// Serve a characteristic from a generator
    pub fn bind_generator(&mut self, handle: AttHandle, generator: ValueGenerator) -> Result<(), ConnectionError> {
        self.table.bind_generator(handle, generator)?;
        Ok(())
    }

    /// The link ended; clears its subscriptions and promotes a queued peer
    pub fn on_disconnect(&mut self, id: ConnectionId) -> Result<DisconnectOutcome, ConnectionError> {
        self.connection(id)?;
        let conn = self.active.take().ok_or(ConnectionError::UnknownConnection(id))?;
        let cleared = conn.subscriptions.len();
        info!(
            "Central {} disconnected ({}), cleared {} subscriptions",
            conn.peer, id, cleared
        );

        let promoted = self.pending.pop_front().map(|peer| {
            let promoted = self.allocate(peer);
            (promoted.id, promoted.peer)
        });

        Ok(DisconnectOutcome {
            connection: id,
            peer: conn.peer,
            cleared_subscriptions: cleared,
            promoted,
        })
    }

    /// A transaction on `id` missed its deadline; drop that link only
    pub fn on_transaction_timeout(&mut self, id: ConnectionId) -> Result<DisconnectOutcome, ConnectionError> {
        self.connection(id)?;
        warn!("Transaction timeout on {}, disconnecting", id);
        if let Err(e) = self.link.disconnect(id, DisconnectReason::TransactionTimeout) {
            warn!("Link disconnect of {} failed: {}", id, e);
        }
        self.on_disconnect(id)
    }

    /// Close the active link from our side, if any
    pub fn disconnect_active(&mut self, reason: DisconnectReason) -> Option<DisconnectOutcome> {
        let id = self.active.as_ref()?.id;
        if let Err(e) = self.link.disconnect(id, reason) {
            warn!("Link disconnect of {} failed: {}", id, e);
        }
        self.pending.clear();
        self.on_disconnect(id).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{CharacteristicDefinition, ServiceDefinition};
    use crate::ble::uuid::BleUuid;
    use mockall::predicate::eq;

    const CHAR: AttHandle = AttHandle(2);
    const CCCD: AttHandle = AttHandle(3);
    const READ_ONLY: AttHandle = AttHandle(4);
    const WRITABLE: AttHandle = AttHandle(5);
    const INDICATE_ONLY: AttHandle = AttHandle(6);
    const INDICATE_CCCD: AttHandle = AttHandle(7);

    fn peer(last: u8) -> PeerAddress {
        PeerAddress([0xC0, 0xFF, 0xEE, 0x00, 0x00, last])
    }

    fn table() -> AttributeTable {
        let characteristic = |short: u16, properties: Properties, value: &[u8]| CharacteristicDefinition {
            uuid: BleUuid::from_u16(short),
            properties,
            initial_value: value.to_vec(),
            descriptors: Vec::new(),
        };
        AttributeTable::build(&[ServiceDefinition {
            uuid: BleUuid::from_u16(0x00F1),
            primary: true,
            characteristics: vec![
                characteristic(0x00F2, Properties::READ | Properties::NOTIFY, b"A"),
                characteristic(0x00F3, Properties::READ, b"fixed"),
                characteristic(0x00F4, Properties::WRITE, b""),
                characteristic(0x00F5, Properties::INDICATE, b""),
            ],
        }])
        .expect("Valid table")
    }

    fn manager(link: MockLinkLayer, settings: ConnectionSettings) -> ConnectionManager<MockLinkLayer> {
        ConnectionManager::new(table(), link, settings)
    }

    fn connect(mgr: &mut ConnectionManager<MockLinkLayer>) -> ConnectionId {
        mgr.on_connect(peer(1)).expect("First connection").id()
    }

    #[test]
    fn test_single_connection_reject_policy() {
        let mut mgr = manager(MockLinkLayer::new(), ConnectionSettings::default());
        connect(&mut mgr);

        let err = mgr.on_connect(peer(2)).unwrap_err();
        assert_eq!(err, ConnectionError::AlreadyConnected { active: peer(1) });
        assert_eq!(mgr.active().expect("Still connected").peer(), peer(1));
    }

    #[test]
    fn test_queue_policy_promotes_on_disconnect() {
        let settings = ConnectionSettings {
            policy: ConnectionPolicy::Queue,
            max_pending: 1,
            ..ConnectionSettings::default()
        };
        let mut mgr = manager(MockLinkLayer::new(), settings);
        let first = connect(&mut mgr);

        assert_eq!(
            mgr.on_connect(peer(2)).unwrap_err(),
            ConnectionError::Queued { peer: peer(2), position: 1 }
        );
        assert_eq!(
            mgr.on_connect(peer(3)).unwrap_err(),
            ConnectionError::QueueFull { peer: peer(3) }
        );

        let outcome = mgr.on_disconnect(first).expect("Active link");
        let (promoted_id, promoted_peer) = outcome.promoted.expect("Queued peer promoted");
        assert_eq!(promoted_peer, peer(2));
        assert_ne!(promoted_id, first);
        assert_eq!(mgr.active().expect("Promoted").id(), promoted_id);
    }

    #[test]
    fn test_cancel_pending() {
        let settings = ConnectionSettings {
            policy: ConnectionPolicy::Queue,
            ..ConnectionSettings::default()
        };
        let mut mgr = manager(MockLinkLayer::new(), settings);
        let first = connect(&mut mgr);
        let _ = mgr.on_connect(peer(2));
        assert!(mgr.cancel_pending(peer(2)));
        assert!(!mgr.cancel_pending(peer(2)));

        let outcome = mgr.on_disconnect(first).expect("Active link");
        assert!(outcome.promoted.is_none());
        assert!(!mgr.is_connected());
    }

    #[test]
    fn test_read_enforces_permissions() {
        let mut mgr = manager(MockLinkLayer::new(), ConnectionSettings::default());
        let id = connect(&mut mgr);

        assert_eq!(mgr.on_read(id, CHAR).expect("Readable"), b"A".to_vec());
        let err = mgr.on_read(id, WRITABLE).unwrap_err();
        assert_eq!(err, ConnectionError::Gatt(GattError::ReadNotPermitted(WRITABLE)));
        assert_eq!(err.att_error_code(), AttErrorCode::ReadNotPermitted);

        let err = mgr.on_read(id, AttHandle(99)).unwrap_err();
        assert_eq!(err.att_error_code(), AttErrorCode::InvalidHandle);
    }

    #[test]
    fn test_read_from_unknown_connection() {
        let mut mgr = manager(MockLinkLayer::new(), ConnectionSettings::default());
        let id = connect(&mut mgr);
        let stale = ConnectionId(id.0 + 10);
        assert_eq!(
            mgr.on_read(stale, CHAR).unwrap_err(),
            ConnectionError::UnknownConnection(stale)
        );
    }

    #[test]
    fn test_read_is_truncated_to_mtu() {
        let mut mgr = manager(MockLinkLayer::new(), ConnectionSettings::default());
        let id = connect(&mut mgr);
        mgr.set_value(CHAR, vec![7u8; 40]).expect("Characteristic");
        assert_eq!(mgr.on_read(id, CHAR).expect("Readable").len(), 22);

        mgr.on_mtu_exchange(id, 100).expect("Connected");
        assert_eq!(mgr.on_read(id, CHAR).expect("Readable").len(), 40);
    }

    #[test]
    fn test_mtu_exchange_bounds() {
        let mut mgr = manager(MockLinkLayer::new(), ConnectionSettings::default());
        let id = connect(&mut mgr);
        assert_eq!(mgr.on_mtu_exchange(id, 10).expect("Connected"), DEFAULT_ATT_MTU);
        assert_eq!(mgr.on_mtu_exchange(id, 1000).expect("Connected"), DEFAULT_SERVER_MTU);
        assert_eq!(mgr.on_mtu_exchange(id, 185).expect("Connected"), 185);
    }

    #[test]
    fn test_notify_without_subscribers_is_silent_noop() {
        let mut link = MockLinkLayer::new();
        link.expect_push().never();
        let mut mgr = manager(link, ConnectionSettings::default());

        assert_eq!(mgr.notify(CHAR, b"B").expect("Valid handle"), 0);
        connect(&mut mgr);
        assert_eq!(mgr.notify(CHAR, b"B").expect("Valid handle"), 0);
    }

    #[test]
    fn test_notify_delivers_to_subscriber_once() {
        let mut link = MockLinkLayer::new();
        link.expect_push()
            .withf(|_, handle, value, kind| {
                *handle == CHAR && value == b"B" && *kind == PushKind::Notification
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut mgr = manager(link, ConnectionSettings::default());
        let id = connect(&mut mgr);

        mgr.on_subscribe_write(id, CCCD, true).expect("Subscribe");
        assert!(mgr.active().expect("Connected").is_subscribed(CHAR));
        assert_eq!(mgr.notify(CHAR, b"B").expect("Valid handle"), 1);
        assert_eq!(mgr.on_read(id, CHAR).expect("Readable"), b"B".to_vec());
    }

    #[test]
    fn test_disconnect_clears_subscriptions() {
        let mut link = MockLinkLayer::new();
        link.expect_push().never();
        let mut mgr = manager(link, ConnectionSettings::default());
        let id = connect(&mut mgr);
        mgr.on_subscribe_write(id, CCCD, true).expect("Subscribe");

        let outcome = mgr.on_disconnect(id).expect("Active link");
        assert_eq!(outcome.cleared_subscriptions, 1);
        assert!(!mgr.is_connected());
        assert_eq!(mgr.notify(CHAR, b"C").expect("Valid handle"), 0);

        // A fresh connection starts unsubscribed
        let id = connect(&mut mgr);
        assert!(!mgr.active().expect("Connected").is_subscribed(CHAR));
        assert_eq!(mgr.on_read(id, CCCD).expect("Readable"), vec![0, 0]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut link = MockLinkLayer::new();
        link.expect_push().never();
        let mut mgr = manager(link, ConnectionSettings::default());
        let id = connect(&mut mgr);

        mgr.on_subscribe_write(id, CCCD, true).expect("Subscribe");
        mgr.on_subscribe_write(id, CCCD, false).expect("Unsubscribe");
        assert_eq!(mgr.notify(CHAR, b"B").expect("Valid handle"), 0);
    }

    #[test]
    fn test_subscribe_write_errors() {
        let mut mgr = manager(MockLinkLayer::new(), ConnectionSettings::default());
        let id = connect(&mut mgr);

        assert_eq!(
            mgr.on_subscribe_write(id, CHAR, true).unwrap_err(),
            ConnectionError::Gatt(GattError::InvalidDescriptor(CHAR))
        );
        assert_eq!(
            mgr.on_subscribe_write(id, READ_ONLY, true).unwrap_err(),
            ConnectionError::Gatt(GattError::NotifySubscriptionUnsupported(READ_ONLY))
        );
    }

    #[test]
    fn test_cccd_write_and_read_back() {
        let mut mgr = manager(MockLinkLayer::new(), ConnectionSettings::default());
        let id = connect(&mut mgr);

        mgr.on_write(id, CCCD, &CCCD_NOTIFY.to_le_bytes()).expect("Enable notify");
        assert_eq!(mgr.on_read(id, CCCD).expect("Readable"), vec![0x01, 0x00]);

        mgr.on_write(id, INDICATE_CCCD, &CCCD_INDICATE.to_le_bytes()).expect("Enable indicate");
        assert_eq!(mgr.on_read(id, INDICATE_CCCD).expect("Readable"), vec![0x02, 0x00]);

        // Indications requested on a notify-only characteristic
        assert_eq!(
            mgr.on_write(id, CCCD, &CCCD_INDICATE.to_le_bytes()).unwrap_err(),
            ConnectionError::Gatt(GattError::InvalidCccdValue(CCCD))
        );
        assert_eq!(
            mgr.on_write(id, CCCD, &[0x01]).unwrap_err(),
            ConnectionError::Gatt(GattError::InvalidCccdValue(CCCD))
        );
    }

    #[test]
    fn test_indication_subscription_uses_indications() {
        let mut link = MockLinkLayer::new();
        link.expect_push()
            .withf(|_, handle, _, kind| *handle == INDICATE_ONLY && *kind == PushKind::Indication)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut mgr = manager(link, ConnectionSettings::default());
        let id = connect(&mut mgr);

        mgr.on_subscribe_write(id, INDICATE_CCCD, true).expect("Subscribe");
        assert_eq!(mgr.notify(INDICATE_ONLY, b"x").expect("Valid handle"), 1);
    }

    #[test]
    fn test_write_to_writable_characteristic() {
        let mut mgr = manager(MockLinkLayer::new(), ConnectionSettings::default());
        let id = connect(&mut mgr);
        mgr.on_write(id, WRITABLE, b"cmd").expect("Writable");
        assert_eq!(
            mgr.on_write(id, READ_ONLY, b"cmd").unwrap_err(),
            ConnectionError::Gatt(GattError::WriteNotPermitted(READ_ONLY))
        );
    }

    #[test]
    fn test_notify_truncates_to_mtu() {
        let mut link = MockLinkLayer::new();
        link.expect_push()
            .withf(|_, _, value, _| value.len() == (DEFAULT_ATT_MTU - 3) as usize)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut mgr = manager(link, ConnectionSettings::default());
        let id = connect(&mut mgr);
        mgr.on_subscribe_write(id, CCCD, true).expect("Subscribe");
        assert_eq!(mgr.notify(CHAR, &[0u8; 64]).expect("Valid handle"), 1);
    }

    #[test]
    fn test_notify_link_failure_is_not_fatal() {
        let mut link = MockLinkLayer::new();
        link.expect_push()
            .returning(|id, _, _, _| Err(LinkError::NotConnected(id)));
        let mut mgr = manager(link, ConnectionSettings::default());
        let id = connect(&mut mgr);
        mgr.on_subscribe_write(id, CCCD, true).expect("Subscribe");
        assert_eq!(mgr.notify(CHAR, b"B").expect("Valid handle"), 0);
        assert!(mgr.is_connected());
    }

    #[test]
    fn test_notify_rejects_non_characteristic() {
        let mut mgr = manager(MockLinkLayer::new(), ConnectionSettings::default());
        assert_eq!(
            mgr.notify(CCCD, b"x").unwrap_err(),
            ConnectionError::Gatt(GattError::NotACharacteristic(CCCD))
        );
        assert!(matches!(
            mgr.notify(AttHandle(42), b"x").unwrap_err(),
            ConnectionError::Gatt(GattError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_transaction_timeout_disconnects_link() {
        let mut link = MockLinkLayer::new();
        link.expect_disconnect()
            .with(eq(ConnectionId(1)), eq(DisconnectReason::TransactionTimeout))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut mgr = manager(link, ConnectionSettings::default());
        let id = connect(&mut mgr);
        mgr.on_subscribe_write(id, CCCD, true).expect("Subscribe");

        let outcome = mgr.on_transaction_timeout(id).expect("Active link");
        assert_eq!(outcome.peer, peer(1));
        assert_eq!(outcome.cleared_subscriptions, 1);
        assert!(!mgr.is_connected());
    }

    #[test]
    fn test_disconnect_unknown_connection() {
        let mut mgr = manager(MockLinkLayer::new(), ConnectionSettings::default());
        assert_eq!(
            mgr.on_disconnect(ConnectionId(5)).unwrap_err(),
            ConnectionError::UnknownConnection(ConnectionId(5))
        );
    }

    #[test]
    fn test_peer_address_parse_and_display() {
        let addr: PeerAddress = "C0:FF:EE:00:00:01".parse().expect("Valid address");
        assert_eq!(addr, peer(1));
        assert_eq!(addr.to_string(), "C0:FF:EE:00:00:01");
        assert!("C0:FF".parse::<PeerAddress>().is_err());
    }
}
