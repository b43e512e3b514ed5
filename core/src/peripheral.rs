// Peripheral runtime: the running Remote ID peripheral
//
// One tokio task owns the advertising state machine, the attribute table and
// the connection manager. Application commands, link-layer events and
// controller replies arrive over channels and are handled one at a time:
// - Controller calls run in spawned tasks and report back over an internal queue;
//   a stop is never issued while a start is still unanswered
// - Retry backoff and the stop acknowledgement deadline are timers in the same loop
// - Advertising pauses while a central is connected unless configured otherwise

use crate::ble::advertiser::{
    AdvertisingEvent, AdvertisingState, AdvertisingStateMachine, ControllerError,
    RadioController, RetryDecision, StopAction,
};
use crate::ble::connection::{
    ConnectionError, ConnectionId, ConnectionManager, DisconnectOutcome, DisconnectReason,
    LinkLayer, PeerAddress,
};
use crate::ble::gatt::{AttErrorCode, AttHandle, ValueGenerator};
use crate::ble::payload::AdvertisingPayload;
use crate::config::PeripheralConfig;
use crate::PeripheralError;
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of an attribute transaction as seen by the central
pub type AttResult<T> = Result<T, AttErrorCode>;

/// Commands that can be sent to the peripheral task
enum PeripheralCommand {
    /// Begin an advertising cycle
    StartAdvertising {
        reply: mpsc::Sender<Result<(), PeripheralError>>,
    },
    /// Stop advertising; replies once the state settles
    StopAdvertising {
        reply: mpsc::Sender<AdvertisingState>,
    },
    /// Update a characteristic and push it to subscribers
    Notify {
        handle: AttHandle,
        value: Vec<u8>,
        reply: mpsc::Sender<Result<usize, PeripheralError>>,
    },
    /// Update a characteristic without notifying
    SetValue {
        handle: AttHandle,
        value: Vec<u8>,
        reply: mpsc::Sender<Result<(), PeripheralError>>,
    },
    /// Serve a characteristic from a generator
    BindGenerator {
        handle: AttHandle,
        generator: ValueGenerator,
        reply: mpsc::Sender<Result<(), PeripheralError>>,
    },
    /// Snapshot of the runtime state
    GetStatus { reply: mpsc::Sender<PeripheralStatus> },
    /// Stop advertising, drop the connection and end the task
    Shutdown { reply: mpsc::Sender<()> },
}

/// Events delivered by the link layer and the radio controller
#[derive(Debug)]
pub enum LinkEvent {
    /// A central established a link
    Connected {
        peer: PeerAddress,
        reply: mpsc::Sender<Result<ConnectionId, ConnectionError>>,
    },
    /// A queued central went away before it was promoted
    ConnectionCancelled { peer: PeerAddress },
    /// A link ended
    Disconnected {
        connection: ConnectionId,
        reason: DisconnectReason,
    },
    /// ATT MTU exchange request
    MtuExchange {
        connection: ConnectionId,
        client_mtu: u16,
        reply: mpsc::Sender<AttResult<u16>>,
    },
    /// Read request
    Read {
        connection: ConnectionId,
        handle: AttHandle,
        issued_at: Instant,
        reply: mpsc::Sender<AttResult<Vec<u8>>>,
    },
    /// Write request (a CCCD write changes the subscription)
    Write {
        connection: ConnectionId,
        handle: AttHandle,
        value: Vec<u8>,
        issued_at: Instant,
        reply: mpsc::Sender<AttResult<()>>,
    },
    /// Subscription change addressed to a CCCD
    SubscribeWrite {
        connection: ConnectionId,
        handle: AttHandle,
        enable: bool,
        issued_at: Instant,
        reply: mpsc::Sender<AttResult<()>>,
    },
    /// Unsolicited controller fault
    ControllerFault { reason: String },
    /// The controller dropped our advertisement
    AdvertisementReleased,
}

/// Events emitted by the peripheral to the application layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    /// Advertising state machine event
    Advertising(AdvertisingEvent),
    /// A central became the active connection
    Connected {
        connection: ConnectionId,
        peer: PeerAddress,
    },
    /// A central was queued behind the active connection
    ConnectionQueued { peer: PeerAddress, position: usize },
    /// A central was turned away
    ConnectionRejected { peer: PeerAddress, reason: String },
    /// The active connection ended
    Disconnected {
        connection: ConnectionId,
        peer: PeerAddress,
        reason: DisconnectReason,
    },
    /// A transaction missed its deadline and the link was dropped
    TransactionTimeout { connection: ConnectionId },
    /// The peripheral task ended
    Stopped,
}

/// Active connection summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: PeerAddress,
    pub mtu: u16,
    pub subscriptions: Vec<AttHandle>,
}

/// Snapshot of the runtime state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralStatus {
    pub advertising: AdvertisingState,
    pub failures: u32,
    pub connection: Option<ConnectionInfo>,
    /// Advertising was stopped for a connection and resumes on disconnect
    pub paused_for_connection: bool,
}

/// Handle to communicate with the running peripheral task
#[derive(Clone)]
pub struct PeripheralHandle {
    command_tx: mpsc::Sender<PeripheralCommand>,
    link_tx: mpsc::Sender<LinkEvent>,
}

impl PeripheralHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(mpsc::Sender<T>) -> PeripheralCommand,
    ) -> Result<T, PeripheralError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| PeripheralError::NotRunning)?;

        reply_rx.recv().await.ok_or(PeripheralError::NotRunning)
    }

    /// Submit the advertising payload to the controller
    ///
    /// Returns once the registration is in flight; the outcome arrives as
    /// [`PeripheralEvent::Advertising`] events.
    pub async fn start_advertising(&self) -> Result<(), PeripheralError> {
        self.request(|reply| PeripheralCommand::StartAdvertising { reply })
            .await?
    }

    /// Stop advertising and wait for the state to settle
    pub async fn stop_advertising(&self) -> Result<AdvertisingState, PeripheralError> {
        self.request(|reply| PeripheralCommand::StopAdvertising { reply })
            .await
    }

    /// Update a characteristic and notify subscribers; returns the delivery count
    pub async fn notify(&self, handle: AttHandle, value: Vec<u8>) -> Result<usize, PeripheralError> {
        self.request(|reply| PeripheralCommand::Notify { handle, value, reply })
            .await?
    }

    /// Update a characteristic without notifying
    pub async fn set_value(&self, handle: AttHandle, value: Vec<u8>) -> Result<(), PeripheralError> {
        self.request(|reply| PeripheralCommand::SetValue { handle, value, reply })
            .await?
    }

    /// Serve a characteristic from a generator
    pub async fn bind_generator(
        &self,
        handle: AttHandle,
        generator: ValueGenerator,
    ) -> Result<(), PeripheralError> {
        self.request(|reply| PeripheralCommand::BindGenerator {
            handle,
            generator,
            reply,
        })
        .await?
    }

    /// Current runtime state
    pub async fn status(&self) -> Result<PeripheralStatus, PeripheralError> {
        self.request(|reply| PeripheralCommand::GetStatus { reply })
            .await
    }

    /// Stop advertising, drop the connection and end the task
    pub async fn shutdown(&self) -> Result<(), PeripheralError> {
        self.request(|reply| PeripheralCommand::Shutdown { reply })
            .await
    }

    /// Handle for the link-layer side
    pub fn link(&self) -> LinkHandle {
        LinkHandle {
            link_tx: self.link_tx.clone(),
        }
    }
}

/// Link-layer side of the peripheral: feeds connection and ATT events in
#[derive(Clone)]
pub struct LinkHandle {
    link_tx: mpsc::Sender<LinkEvent>,
}

impl LinkHandle {
    /// Deliver a raw link event
    pub async fn send(&self, event: LinkEvent) -> Result<(), PeripheralError> {
        self.link_tx
            .send(event)
            .await
            .map_err(|_| PeripheralError::NotRunning)
    }

    async fn transaction<T>(
        &self,
        event: impl FnOnce(mpsc::Sender<T>) -> LinkEvent,
    ) -> Result<T, PeripheralError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.send(event(reply_tx)).await?;
        reply_rx.recv().await.ok_or(PeripheralError::NotRunning)
    }

    /// A central connected
    pub async fn connect(&self, peer: PeerAddress) -> Result<ConnectionId, PeripheralError> {
        Ok(self
            .transaction(|reply| LinkEvent::Connected { peer, reply })
            .await??)
    }

    /// A link ended
    pub async fn disconnect(
        &self,
        connection: ConnectionId,
        reason: DisconnectReason,
    ) -> Result<(), PeripheralError> {
        self.send(LinkEvent::Disconnected { connection, reason }).await
    }

    /// ATT MTU exchange
    pub async fn exchange_mtu(&self, connection: ConnectionId, client_mtu: u16) -> Result<u16, PeripheralError> {
        self.transaction(|reply| LinkEvent::MtuExchange {
            connection,
            client_mtu,
            reply,
        })
        .await?
        .map_err(PeripheralError::Att)
    }

    /// Read request issued now
    pub async fn read(&self, connection: ConnectionId, handle: AttHandle) -> Result<Vec<u8>, PeripheralError> {
        let issued_at = Instant::now();
        self.transaction(|reply| LinkEvent::Read {
            connection,
            handle,
            issued_at,
            reply,
        })
        .await?
        .map_err(PeripheralError::Att)
    }

    /// Write request issued now
    pub async fn write(
        &self,
        connection: ConnectionId,
        handle: AttHandle,
        value: Vec<u8>,
    ) -> Result<(), PeripheralError> {
        let issued_at = Instant::now();
        self.transaction(|reply| LinkEvent::Write {
            connection,
            handle,
            value,
            issued_at,
            reply,
        })
        .await?
        .map_err(PeripheralError::Att)
    }

    /// Enable or disable notifications through a CCCD
    pub async fn subscribe(
        &self,
        connection: ConnectionId,
        cccd: AttHandle,
        enable: bool,
    ) -> Result<(), PeripheralError> {
        let issued_at = Instant::now();
        self.transaction(|reply| LinkEvent::SubscribeWrite {
            connection,
            handle: cccd,
            enable,
            issued_at,
            reply,
        })
        .await?
        .map_err(PeripheralError::Att)
    }

    /// Report an unsolicited controller fault
    pub async fn controller_fault(&self, reason: impl Into<String>) -> Result<(), PeripheralError> {
        self.send(LinkEvent::ControllerFault {
            reason: reason.into(),
        })
        .await
    }

    /// Report that the controller released the advertisement
    pub async fn advertisement_released(&self) -> Result<(), PeripheralError> {
        self.send(LinkEvent::AdvertisementReleased).await
    }
}

/// Replies from spawned controller calls
enum ControllerReply {
    Started {
        cycle: u64,
        result: Result<(), ControllerError>,
    },
    Stopped {
        result: Result<(), ControllerError>,
    },
}

/// Validate `config`, build the attribute table and payload, and spawn the
/// peripheral task.
///
/// Fails if the configuration is invalid or the advertising payload does
/// not fit. Must be called from within a tokio runtime.
///
/// Events are delivered with backpressure: the task waits for room on
/// `event_tx`, so the receiver has to be drained.
pub fn start_peripheral<L>(
    config: PeripheralConfig,
    controller: Arc<dyn RadioController>,
    link: L,
    event_tx: mpsc::Sender<PeripheralEvent>,
) -> Result<PeripheralHandle>
where
    L: LinkLayer + 'static,
{
    config.validate()?;
    let table = config.attribute_table()?;
    let payload = config.advertising_payload()?;
    info!(
        "Starting peripheral: {} attributes, {} byte advertising payload",
        table.len(),
        payload.len()
    );

    let (command_tx, command_rx) = mpsc::channel::<PeripheralCommand>(64);
    let (link_tx, link_rx) = mpsc::channel::<LinkEvent>(256);
    let (controller_tx, controller_rx) = mpsc::channel::<ControllerReply>(16);

    let runtime = Runtime {
        advertiser: AdvertisingStateMachine::new(config.retry.clone()),
        connections: ConnectionManager::new(table, link, config.connection_settings()),
        controller,
        payload,
        advertise_while_connected: config.advertise_while_connected,
        transaction_timeout: config.transaction_timeout(),
        stop_timeout: config.stop_timeout(),
        paused_for_connection: false,
        resume_when_idle: false,
        cycle: 0,
        retry_at: None,
        retry_deferred: false,
        stop_in_flight: false,
        stop_deadline: None,
        stop_waiters: Vec::new(),
        shutting_down: false,
        shutdown_replies: Vec::new(),
        controller_tx,
        event_tx,
        pending_events: VecDeque::new(),
    };

    // Spawn the peripheral event loop
    tokio::spawn(runtime.run(command_rx, link_rx, controller_rx));

    Ok(PeripheralHandle { command_tx, link_tx })
}

struct Runtime<L: LinkLayer> {
    advertiser: AdvertisingStateMachine,
    connections: ConnectionManager<L>,
    controller: Arc<dyn RadioController>,
    payload: AdvertisingPayload,
    advertise_while_connected: bool,
    transaction_timeout: Duration,
    stop_timeout: Duration,
    paused_for_connection: bool,
    resume_when_idle: bool,
    /// Incremented per submitted registration; stale replies are dropped
    cycle: u64,
    retry_at: Option<Instant>,
    /// Retry timer fired while a controller call was outstanding
    retry_deferred: bool,
    stop_in_flight: bool,
    stop_deadline: Option<Instant>,
    stop_waiters: Vec<mpsc::Sender<AdvertisingState>>,
    shutting_down: bool,
    shutdown_replies: Vec<mpsc::Sender<()>>,
    controller_tx: mpsc::Sender<ControllerReply>,
    event_tx: mpsc::Sender<PeripheralEvent>,
    pending_events: VecDeque<PeripheralEvent>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<L: LinkLayer + 'static> Runtime<L> {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<PeripheralCommand>,
        mut link_rx: mpsc::Receiver<LinkEvent>,
        mut controller_rx: mpsc::Receiver<ControllerReply>,
    ) {
        let mut commands_open = true;
        let mut links_open = true;
        debug!("Peripheral task running");

        loop {
            tokio::select! {
                command = command_rx.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All peripheral handles dropped, shutting down");
                        commands_open = false;
                        self.begin_shutdown();
                    }
                },
                event = link_rx.recv(), if links_open => match event {
                    Some(event) => self.handle_link_event(event),
                    None => links_open = false,
                },
                Some(reply) = controller_rx.recv() => self.handle_controller_reply(reply),
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.fire_retry();
                }
                _ = sleep_until_opt(self.stop_deadline) => {
                    self.stop_deadline = None;
                    self.stop_in_flight = false;
                    self.advertiser.on_stop_timeout();
                    self.settle_stop();
                }
            }

            self.flush_advertising_events();
            self.deliver_events().await;

            if self.shutting_down && self.advertiser.state() != AdvertisingState::Stopping {
                for reply in self.shutdown_replies.drain(..) {
                    let _ = reply.try_send(());
                }
                break;
            }
        }

        info!("Peripheral task stopped");
        self.emit(PeripheralEvent::Stopped);
        self.deliver_events().await;
    }

    fn emit(&mut self, event: PeripheralEvent) {
        self.pending_events.push_back(event);
    }

    async fn deliver_events(&mut self) {
        while let Some(event) = self.pending_events.pop_front() {
            if self.event_tx.send(event).await.is_err() {
                debug!("Event receiver dropped, discarding {} events", self.pending_events.len() + 1);
                self.pending_events.clear();
            }
        }
    }

    fn flush_advertising_events(&mut self) {
        for event in self.advertiser.drain_events() {
            self.emit(PeripheralEvent::Advertising(event));
        }
    }

    fn handle_command(&mut self, command: PeripheralCommand) {
        match command {
            PeripheralCommand::StartAdvertising { reply } => {
                let result = if self.connections.is_connected() && !self.advertise_while_connected {
                    debug!("Central connected, advertising deferred until disconnect");
                    self.paused_for_connection = true;
                    self.resume_when_idle = false;
                    Ok(())
                } else {
                    self.begin_advertising()
                };
                let _ = reply.try_send(result);
            }
            PeripheralCommand::StopAdvertising { reply } => {
                self.paused_for_connection = false;
                self.resume_when_idle = false;
                self.request_stop();
                if self.advertiser.state() == AdvertisingState::Stopping {
                    self.stop_waiters.push(reply);
                } else {
                    let _ = reply.try_send(self.advertiser.state());
                }
            }
            PeripheralCommand::Notify { handle, value, reply } => {
                let result = self
                    .connections
                    .notify(handle, &value)
                    .map_err(PeripheralError::from);
                let _ = reply.try_send(result);
            }
            PeripheralCommand::SetValue { handle, value, reply } => {
                let result = self
                    .connections
                    .set_value(handle, value)
                    .map_err(PeripheralError::from);
                let _ = reply.try_send(result);
            }
            PeripheralCommand::BindGenerator {
                handle,
                generator,
                reply,
            } => {
                let result = self
                    .connections
                    .bind_generator(handle, generator)
                    .map_err(PeripheralError::from);
                let _ = reply.try_send(result);
            }
            PeripheralCommand::GetStatus { reply } => {
                let _ = reply.try_send(self.status());
            }
            PeripheralCommand::Shutdown { reply } => {
                self.shutdown_replies.push(reply);
                self.begin_shutdown();
            }
        }
    }

    fn status(&self) -> PeripheralStatus {
        PeripheralStatus {
            advertising: self.advertiser.state(),
            failures: self.advertiser.failures(),
            connection: self.connections.active().map(|conn| {
                let mut subscriptions: Vec<AttHandle> =
                    conn.subscriptions().map(|(handle, _)| *handle).collect();
                subscriptions.sort();
                ConnectionInfo {
                    id: conn.id(),
                    peer: conn.peer(),
                    mtu: conn.mtu(),
                    subscriptions,
                }
            }),
            paused_for_connection: self.paused_for_connection,
        }
    }

    fn begin_advertising(&mut self) -> Result<(), PeripheralError> {
        let payload = self.advertiser.start(self.payload.clone())?.clone();
        self.retry_at = None;
        self.retry_deferred = false;
        self.submit(payload);
        Ok(())
    }

    fn submit(&mut self, payload: AdvertisingPayload) {
        self.cycle += 1;
        let cycle = self.cycle;
        let controller = Arc::clone(&self.controller);
        let tx = self.controller_tx.clone();
        tokio::spawn(async move {
            let result = controller.start_advertising(&payload).await;
            let _ = tx.send(ControllerReply::Started { cycle, result }).await;
        });
    }

    fn request_stop(&mut self) {
        match self.advertiser.stop() {
            StopAction::SendStop => {
                self.stop_deadline = Some(Instant::now() + self.stop_timeout);
                self.send_stop();
            }
            StopAction::AwaitStart => {
                debug!("Registration in flight, stop deferred until the controller answers");
                self.stop_deadline = Some(Instant::now() + self.stop_timeout);
            }
            StopAction::CancelRetry => {
                debug!("Cancelled pending advertising retry");
                self.retry_at = None;
                self.retry_deferred = false;
            }
            StopAction::Nothing => {}
        }
    }

    fn send_stop(&mut self) {
        self.stop_in_flight = true;
        let controller = Arc::clone(&self.controller);
        let tx = self.controller_tx.clone();
        tokio::spawn(async move {
            let result = controller.stop_advertising().await;
            let _ = tx.send(ControllerReply::Stopped { result }).await;
        });
    }

    /// A controller call is outstanding; a new start must wait for it
    fn controller_busy(&self) -> bool {
        self.stop_in_flight || self.advertiser.start_in_flight()
    }

    /// Answer stop waiters once the stop has settled, then resume if a
    /// disconnect asked for it
    fn settle_stop(&mut self) {
        let state = self.advertiser.state();
        if state == AdvertisingState::Stopping {
            return;
        }
        self.stop_deadline = None;
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.try_send(state);
        }
        self.try_resume();
    }

    fn try_resume(&mut self) {
        if !self.resume_when_idle || self.shutting_down || self.connections.is_connected() {
            return;
        }
        if self.advertiser.state() != AdvertisingState::Idle {
            return;
        }
        self.resume_when_idle = false;
        self.paused_for_connection = false;
        info!("Re-arming advertising after disconnect");
        if let Err(e) = self.begin_advertising() {
            warn!("Failed to re-arm advertising: {}", e);
        }
    }

    fn fire_retry(&mut self) {
        if self.controller_busy() {
            debug!("Controller call outstanding, retry deferred");
            self.retry_deferred = true;
            return;
        }
        self.retry_deferred = false;
        match self.advertiser.retry() {
            Ok(payload) => {
                let payload = payload.clone();
                self.submit(payload);
            }
            Err(e) => debug!("Retry timer fired with nothing to retry: {}", e),
        }
    }

    fn apply_decision(&mut self, decision: RetryDecision) {
        match decision {
            RetryDecision::RetryAfter(delay) => {
                debug!("Next advertising attempt in {:?}", delay);
                self.retry_at = Some(Instant::now() + delay);
            }
            RetryDecision::GiveUp { .. } => self.retry_at = None,
            RetryDecision::Ignored => {}
        }
    }

    fn handle_controller_reply(&mut self, reply: ControllerReply) {
        match reply {
            ControllerReply::Started { cycle, result } => {
                if cycle != self.cycle {
                    debug!("Ignoring stale controller reply for cycle {}", cycle);
                    return;
                }
                match result {
                    Ok(()) => match self.advertiser.on_start_ack() {
                        Ok(StopAction::SendStop) => self.send_stop(),
                        Ok(_) => {}
                        Err(e) => debug!("Unexpected start ack: {}", e),
                    },
                    Err(e) => {
                        let decision = self.advertiser.on_start_nack(&e.to_string());
                        self.apply_decision(decision);
                        self.settle_stop();
                    }
                }
            }
            ControllerReply::Stopped { result } => {
                self.stop_in_flight = false;
                if let Err(e) = result {
                    warn!("Controller failed to stop advertising: {}", e);
                }
                self.advertiser.on_stop_ack();
                self.settle_stop();
            }
        }

        if self.retry_deferred && !self.controller_busy() {
            self.fire_retry();
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer, reply } => {
                let result = self.connections.on_connect(peer).map(|conn| conn.id());
                match &result {
                    Ok(connection) => {
                        self.emit(PeripheralEvent::Connected {
                            connection: *connection,
                            peer,
                        });
                        self.pause_for_connection();
                    }
                    Err(ConnectionError::Queued { peer, position }) => {
                        self.emit(PeripheralEvent::ConnectionQueued {
                            peer: *peer,
                            position: *position,
                        });
                    }
                    Err(e) => {
                        self.emit(PeripheralEvent::ConnectionRejected {
                            peer,
                            reason: e.to_string(),
                        });
                    }
                }
                let _ = reply.try_send(result);
            }
            LinkEvent::ConnectionCancelled { peer } => {
                if self.connections.cancel_pending(peer) {
                    debug!("Queued central {} went away", peer);
                }
            }
            LinkEvent::Disconnected { connection, reason } => {
                match self.connections.on_disconnect(connection) {
                    Ok(outcome) => self.link_down(connection, reason, outcome),
                    Err(e) => debug!("Disconnect for {}: {}", connection, e),
                }
            }
            LinkEvent::MtuExchange {
                connection,
                client_mtu,
                reply,
            } => {
                let result = self
                    .connections
                    .on_mtu_exchange(connection, client_mtu)
                    .map_err(|e| e.att_error_code());
                let _ = reply.try_send(result);
            }
            LinkEvent::Read {
                connection,
                handle,
                issued_at,
                reply,
            } => {
                let result = if self.expired(connection, issued_at) {
                    Err(AttErrorCode::UnlikelyError)
                } else {
                    self.connections.on_read(connection, handle).map_err(|e| {
                        debug!("Read of {} by {} failed: {}", handle, connection, e);
                        e.att_error_code()
                    })
                };
                let _ = reply.try_send(result);
            }
            LinkEvent::Write {
                connection,
                handle,
                value,
                issued_at,
                reply,
            } => {
                let result = if self.expired(connection, issued_at) {
                    Err(AttErrorCode::UnlikelyError)
                } else {
                    self.connections
                        .on_write(connection, handle, &value)
                        .map_err(|e| {
                            debug!("Write to {} by {} failed: {}", handle, connection, e);
                            e.att_error_code()
                        })
                };
                let _ = reply.try_send(result);
            }
            LinkEvent::SubscribeWrite {
                connection,
                handle,
                enable,
                issued_at,
                reply,
            } => {
                let result = if self.expired(connection, issued_at) {
                    Err(AttErrorCode::UnlikelyError)
                } else {
                    self.connections
                        .on_subscribe_write(connection, handle, enable)
                        .map_err(|e| {
                            debug!("Subscription write to {} by {} failed: {}", handle, connection, e);
                            e.att_error_code()
                        })
                };
                let _ = reply.try_send(result);
            }
            LinkEvent::ControllerFault { reason } => {
                let decision = self.advertiser.on_fault(&reason);
                self.apply_decision(decision);
            }
            LinkEvent::AdvertisementReleased => {
                self.advertiser.on_released();
                self.retry_at = None;
                self.retry_deferred = false;
                self.settle_stop();
            }
        }
    }

    /// Drop the connection if a request waited past the transaction timeout
    fn expired(&mut self, connection: ConnectionId, issued_at: Instant) -> bool {
        if issued_at.elapsed() <= self.transaction_timeout {
            return false;
        }
        match self.connections.on_transaction_timeout(connection) {
            Ok(outcome) => {
                self.emit(PeripheralEvent::TransactionTimeout { connection });
                self.link_down(connection, DisconnectReason::TransactionTimeout, outcome);
            }
            Err(e) => debug!("Expired request for {}: {}", connection, e),
        }
        true
    }

    fn pause_for_connection(&mut self) {
        if self.advertise_while_connected {
            return;
        }
        match self.advertiser.state() {
            AdvertisingState::Advertising
            | AdvertisingState::Starting
            | AdvertisingState::Error { fatal: false } => {
                info!("Central connected, pausing advertising");
                self.paused_for_connection = true;
                self.resume_when_idle = false;
                self.request_stop();
            }
            _ => {}
        }
    }

    fn link_down(&mut self, connection: ConnectionId, reason: DisconnectReason, outcome: DisconnectOutcome) {
        self.emit(PeripheralEvent::Disconnected {
            connection,
            peer: outcome.peer,
            reason,
        });

        if let Some((promoted, peer)) = outcome.promoted {
            self.emit(PeripheralEvent::Connected {
                connection: promoted,
                peer,
            });
            return;
        }

        if self.paused_for_connection {
            self.resume_when_idle = true;
            self.try_resume();
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("Shutting down peripheral");
        self.shutting_down = true;
        self.paused_for_connection = false;
        self.resume_when_idle = false;
        self.retry_at = None;
        self.retry_deferred = false;

        if let Some(outcome) = self
            .connections
            .disconnect_active(DisconnectReason::LocalHostTerminated)
        {
            self.emit(PeripheralEvent::Disconnected {
                connection: outcome.connection,
                peer: outcome.peer,
                reason: DisconnectReason::LocalHostTerminated,
            });
        }

        self.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertiser::MockRadioController;
    use crate::ble::connection::MockLinkLayer;
    use mockall::predicate::eq;

    const WAIT: Duration = Duration::from_secs(5);

    fn controller(starts: usize) -> Arc<dyn RadioController> {
        let mut controller = MockRadioController::new();
        controller
            .expect_start_advertising()
            .times(starts)
            .returning(|_| Ok(()));
        controller.expect_stop_advertising().returning(|| Ok(()));
        Arc::new(controller)
    }

    fn peer() -> PeerAddress {
        PeerAddress([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01])
    }

    async fn wait_for(
        events: &mut mpsc::Receiver<PeripheralEvent>,
        wanted: impl Fn(&PeripheralEvent) -> bool,
    ) -> PeripheralEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("Event channel open");
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("Timed out waiting for peripheral event")
    }

    fn connectable(event: &PeripheralEvent) -> bool {
        *event == PeripheralEvent::Advertising(AdvertisingEvent::Connectable)
    }

    #[tokio::test]
    async fn test_start_advertising_becomes_connectable() {
        let (event_tx, mut events) = mpsc::channel(64);
        let handle = start_peripheral(
            PeripheralConfig::default(),
            controller(1),
            MockLinkLayer::new(),
            event_tx,
        )
        .expect("Valid config");

        handle.start_advertising().await.expect("Start accepted");
        wait_for(&mut events, connectable).await;

        let status = handle.status().await.expect("Running");
        assert_eq!(status.advertising, AdvertisingState::Advertising);
        assert!(status.connection.is_none());
    }

    #[tokio::test]
    async fn test_full_event_channel_does_not_lose_connectable() {
        let (event_tx, mut events) = mpsc::channel(1);
        let handle = start_peripheral(
            PeripheralConfig::default(),
            controller(1),
            MockLinkLayer::new(),
            event_tx,
        )
        .expect("Valid config");

        handle.start_advertising().await.expect("Start accepted");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen = Vec::new();
        while !seen.iter().any(connectable) {
            let event = tokio::time::timeout(WAIT, events.recv())
                .await
                .expect("Timed out waiting for peripheral event")
                .expect("Event channel open");
            seen.push(event);
        }
        assert_eq!(
            seen[0],
            PeripheralEvent::Advertising(AdvertisingEvent::StateChanged {
                from: AdvertisingState::Idle,
                to: AdvertisingState::Starting,
            })
        );
    }

    #[tokio::test]
    async fn test_connection_pauses_and_disconnect_rearms() {
        let (event_tx, mut events) = mpsc::channel(64);
        let handle = start_peripheral(
            PeripheralConfig::default(),
            controller(2),
            MockLinkLayer::new(),
            event_tx,
        )
        .expect("Valid config");
        let link = handle.link();

        handle.start_advertising().await.expect("Start accepted");
        wait_for(&mut events, connectable).await;

        let connection = link.connect(peer()).await.expect("First central accepted");
        wait_for(&mut events, |e| {
            *e == PeripheralEvent::Advertising(AdvertisingEvent::StateChanged {
                from: AdvertisingState::Stopping,
                to: AdvertisingState::Idle,
            })
        })
        .await;
        let status = handle.status().await.expect("Running");
        assert!(status.paused_for_connection);
        assert_eq!(status.connection.expect("Connected").id, connection);

        link.disconnect(connection, DisconnectReason::RemoteUserTerminated)
            .await
            .expect("Running");
        wait_for(&mut events, connectable).await;
        assert!(!handle.status().await.expect("Running").paused_for_connection);
    }

    #[tokio::test]
    async fn test_second_central_rejected() {
        let config = PeripheralConfig {
            advertise_while_connected: true,
            ..PeripheralConfig::default()
        };
        let (event_tx, mut events) = mpsc::channel(64);
        let handle =
            start_peripheral(config, controller(1), MockLinkLayer::new(), event_tx).expect("Valid config");
        let link = handle.link();

        handle.start_advertising().await.expect("Start accepted");
        wait_for(&mut events, connectable).await;
        link.connect(peer()).await.expect("First central accepted");

        let err = link
            .connect(PeerAddress([1, 2, 3, 4, 5, 6]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PeripheralError::Connection(ConnectionError::AlreadyConnected { active }) if active == peer()
        ));
        assert_eq!(
            handle.status().await.expect("Running").advertising,
            AdvertisingState::Advertising
        );
    }

    #[tokio::test]
    async fn test_read_errors_map_to_att_codes() {
        let (event_tx, _events) = mpsc::channel(64);
        let handle = start_peripheral(
            PeripheralConfig::default(),
            controller(0),
            MockLinkLayer::new(),
            event_tx,
        )
        .expect("Valid config");
        let link = handle.link();
        let connection = link.connect(peer()).await.expect("Accepted");

        assert_eq!(link.read(connection, AttHandle(2)).await.expect("Readable"), b"Drone1".to_vec());
        assert!(matches!(
            link.read(connection, AttHandle(0x0100)).await.unwrap_err(),
            PeripheralError::Att(AttErrorCode::InvalidHandle)
        ));
        assert!(matches!(
            link.subscribe(connection, AttHandle(2), true).await.unwrap_err(),
            PeripheralError::Att(AttErrorCode::RequestNotSupported)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_and_stops_task() {
        let mut link_layer = MockLinkLayer::new();
        link_layer
            .expect_disconnect()
            .with(eq(ConnectionId(1)), eq(DisconnectReason::LocalHostTerminated))
            .times(1)
            .returning(|_, _| Ok(()));
        let (event_tx, mut events) = mpsc::channel(64);
        let handle = start_peripheral(PeripheralConfig::default(), controller(0), link_layer, event_tx)
            .expect("Valid config");

        handle.link().connect(peer()).await.expect("Accepted");
        handle.shutdown().await.expect("Shutdown acknowledged");
        wait_for(&mut events, |e| *e == PeripheralEvent::Stopped).await;

        assert!(matches!(handle.status().await, Err(PeripheralError::NotRunning)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_at_startup() {
        let mut config = PeripheralConfig::default();
        config.advertising.local_name = Some("a name far too long for a legacy payload".into());
        let (event_tx, _events) = mpsc::channel(1);
        let result = start_peripheral(config, controller(0), MockLinkLayer::new(), event_tx);
        assert!(result.is_err());
    }
}
