/// Advertising lifecycle
///
/// `Idle → Starting → Advertising → Stopping → Idle`, with `Error` reachable
/// when the controller rejects a registration or reports a fault while
/// advertising. Rejections are retried with exponential backoff until the
/// attempt cap is reached, after which the machine stays in a fatal `Error`
/// until it is explicitly stopped or restarted.
///
/// The machine itself performs no I/O. Callers submit payloads to a
/// [`RadioController`] and feed the outcome back; transitions are reported
/// through an internal event queue.

use super::payload::AdvertisingPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default number of registration attempts before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff base interval in milliseconds
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;

/// Default backoff ceiling in milliseconds
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Advertising states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisingState {
    /// Not advertising
    Idle,
    /// Payload submitted, waiting for the controller
    Starting,
    /// Controller confirmed, peripheral is connectable
    Advertising,
    /// Stop requested, waiting for the controller
    Stopping,
    /// Registration failed or the controller faulted
    Error { fatal: bool },
}

impl fmt::Display for AdvertisingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertisingState::Idle => write!(f, "Idle"),
            AdvertisingState::Starting => write!(f, "Starting"),
            AdvertisingState::Advertising => write!(f, "Advertising"),
            AdvertisingState::Stopping => write!(f, "Stopping"),
            AdvertisingState::Error { fatal: false } => write!(f, "Error"),
            AdvertisingState::Error { fatal: true } => write!(f, "Error(fatal)"),
        }
    }
}

/// Retry policy for rejected registrations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before the failure becomes fatal
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub backoff_base_ms: u64,
    /// Upper bound on any single delay in milliseconds
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failure: base, 2×base, 4×base, ...
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let millis = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }
}

/// Events emitted by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisingEvent {
    /// State changed
    StateChanged {
        from: AdvertisingState,
        to: AdvertisingState,
    },
    /// The peripheral became connectable
    Connectable,
    /// A retry was scheduled after a failure
    RetryScheduled { attempt: u32, delay: Duration },
    /// Retries exhausted
    Fatal { attempts: u32, reason: String },
    /// The controller released the advertisement on its own
    Released,
}

/// What the caller should do after a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Call [`AdvertisingStateMachine::retry`] after the delay
    RetryAfter(Duration),
    /// Attempt cap reached
    GiveUp { attempts: u32, reason: String },
    /// Nothing to do in the current state
    Ignored,
}

/// What the caller should do after a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// Ask the controller to stop and wait (bounded) for the ack
    SendStop,
    /// A registration is still in flight; stop once the controller answers it
    AwaitStart,
    /// Drop the pending retry timer, nothing is registered
    CancelRetry,
    /// Already idle or stopping
    Nothing,
}

/// Errors reported by the radio controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Controller rejected advertisement: {0}")]
    Rejected(String),
    #[error("Controller busy")]
    Busy,
    #[error("Controller unavailable: {0}")]
    Unavailable(String),
}

/// Errors for advertising operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertisingError {
    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        state: AdvertisingState,
        action: &'static str,
    },
    #[error("Controller rejected advertisement {attempts} times: {reason}")]
    ControllerRejected { attempts: u32, reason: String },
    #[error("No payload to submit")]
    NoPayload,
}

/// Radio / advertising controller
///
/// `Ok` is the controller's ack, `Err` its nack. Unsolicited faults and
/// releases are delivered separately as link events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioController: Send + Sync {
    /// Register an advertisement and start advertising
    async fn start_advertising(&self, payload: &AdvertisingPayload) -> Result<(), ControllerError>;

    /// Stop advertising
    async fn stop_advertising(&self) -> Result<(), ControllerError>;
}

/// Advertising state machine
#[derive(Debug)]
pub struct AdvertisingStateMachine {
    state: AdvertisingState,
    policy: RetryPolicy,
    payload: Option<AdvertisingPayload>,
    failures: u32,
    /// A start request has been submitted and not yet answered
    start_in_flight: bool,
    events: VecDeque<AdvertisingEvent>,
}

impl AdvertisingStateMachine {
    /// Create an idle state machine
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: AdvertisingState::Idle,
            policy,
            payload: None,
            failures: 0,
            start_in_flight: false,
            events: VecDeque::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> AdvertisingState {
        self.state
    }

    /// Check if the peripheral is currently connectable
    pub fn is_connectable(&self) -> bool {
        self.state == AdvertisingState::Advertising
    }

    /// Check if retries are exhausted
    pub fn is_fatal(&self) -> bool {
        self.state == AdvertisingState::Error { fatal: true }
    }

    /// Consecutive failures in the current cycle
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Payload of the current cycle
    pub fn payload(&self) -> Option<&AdvertisingPayload> {
        self.payload.as_ref()
    }

    /// Check if the controller still owes an answer to a start request
    pub fn start_in_flight(&self) -> bool {
        self.start_in_flight
    }

    /// Retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Take the next pending event
    pub fn poll_event(&mut self) -> Option<AdvertisingEvent> {
        self.events.pop_front()
    }

    /// Take all pending events
    pub fn drain_events(&mut self) -> Vec<AdvertisingEvent> {
        self.events.drain(..).collect()
    }

    fn transition(&mut self, to: AdvertisingState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!("Advertising state {} -> {}", from, to);
        self.events.push_back(AdvertisingEvent::StateChanged { from, to });
        if to == AdvertisingState::Advertising {
            self.events.push_back(AdvertisingEvent::Connectable);
        }
    }

    /// Begin a new advertising cycle with `payload`
    ///
    /// Valid from `Idle` or `Error`. Returns the payload to submit.
    pub fn start(&mut self, payload: AdvertisingPayload) -> Result<&AdvertisingPayload, AdvertisingError> {
        match self.state {
            AdvertisingState::Idle | AdvertisingState::Error { .. } => {
                self.failures = 0;
                self.payload = Some(payload);
                self.start_in_flight = true;
                self.transition(AdvertisingState::Starting);
                self.payload.as_ref().ok_or(AdvertisingError::NoPayload)
            }
            state => Err(AdvertisingError::InvalidTransition {
                state,
                action: "start",
            }),
        }
    }

    /// Re-submit the current payload after a backoff delay
    pub fn retry(&mut self) -> Result<&AdvertisingPayload, AdvertisingError> {
        match self.state {
            AdvertisingState::Error { fatal: false } => {
                if self.payload.is_none() {
                    return Err(AdvertisingError::NoPayload);
                }
                info!("Retrying advertisement registration (attempt {})", self.failures + 1);
                self.start_in_flight = true;
                self.transition(AdvertisingState::Starting);
                self.payload.as_ref().ok_or(AdvertisingError::NoPayload)
            }
            state => Err(AdvertisingError::InvalidTransition {
                state,
                action: "retry",
            }),
        }
    }

    /// Controller acknowledged the registration
    ///
    /// Returns [`StopAction::SendStop`] when the registration landed after a
    /// stop, fault or forced idle: the advertisement is on air but nothing
    /// tracks it any more, so it has to be withdrawn.
    pub fn on_start_ack(&mut self) -> Result<StopAction, AdvertisingError> {
        if !self.start_in_flight {
            return Err(AdvertisingError::InvalidTransition {
                state: self.state,
                action: "acknowledge start",
            });
        }
        self.start_in_flight = false;

        match self.state {
            AdvertisingState::Starting => {
                self.failures = 0;
                self.transition(AdvertisingState::Advertising);
                info!("Advertising registered, peripheral is connectable");
                Ok(StopAction::Nothing)
            }
            state => {
                info!("Registration acknowledged while {}, withdrawing it", state);
                Ok(StopAction::SendStop)
            }
        }
    }

    /// Controller rejected the registration
    pub fn on_start_nack(&mut self, reason: &str) -> RetryDecision {
        self.start_in_flight = false;
        match self.state {
            AdvertisingState::Starting => {
                warn!("Advertisement registration rejected: {}", reason);
                self.fail(reason)
            }
            // Stop was waiting on this registration; nothing reached the air
            AdvertisingState::Stopping => {
                debug!("Registration rejected during stop: {}", reason);
                self.transition(AdvertisingState::Idle);
                RetryDecision::Ignored
            }
            state => {
                debug!("Ignoring start nack while {}", state);
                RetryDecision::Ignored
            }
        }
    }

    /// Unsolicited controller fault
    pub fn on_fault(&mut self, reason: &str) -> RetryDecision {
        match self.state {
            AdvertisingState::Advertising | AdvertisingState::Starting => {
                warn!("Controller fault while {}: {}", self.state, reason);
                self.fail(reason)
            }
            state => {
                debug!("Ignoring controller fault while {}: {}", state, reason);
                RetryDecision::Ignored
            }
        }
    }

    fn fail(&mut self, reason: &str) -> RetryDecision {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            self.transition(AdvertisingState::Error { fatal: true });
            error!(
                "Advertising failed after {} attempts: {}",
                self.failures, reason
            );
            self.events.push_back(AdvertisingEvent::Fatal {
                attempts: self.failures,
                reason: reason.to_string(),
            });
            return RetryDecision::GiveUp {
                attempts: self.failures,
                reason: reason.to_string(),
            };
        }

        let delay = self.policy.delay_for(self.failures);
        self.transition(AdvertisingState::Error { fatal: false });
        self.events.push_back(AdvertisingEvent::RetryScheduled {
            attempt: self.failures + 1,
            delay,
        });
        RetryDecision::RetryAfter(delay)
    }

    /// Request a stop; valid in every state
    ///
    /// From `Starting` the machine enters `Stopping` but the controller is
    /// only asked to stop once the pending registration has been answered.
    pub fn stop(&mut self) -> StopAction {
        match self.state {
            AdvertisingState::Advertising => {
                self.transition(AdvertisingState::Stopping);
                StopAction::SendStop
            }
            AdvertisingState::Starting => {
                self.transition(AdvertisingState::Stopping);
                StopAction::AwaitStart
            }
            AdvertisingState::Error { .. } => {
                self.failures = 0;
                self.transition(AdvertisingState::Idle);
                StopAction::CancelRetry
            }
            AdvertisingState::Idle | AdvertisingState::Stopping => StopAction::Nothing,
        }
    }

    /// Controller acknowledged the stop
    pub fn on_stop_ack(&mut self) {
        if self.state == AdvertisingState::Stopping {
            self.transition(AdvertisingState::Idle);
        }
    }

    /// The stop acknowledgement did not arrive in time
    pub fn on_stop_timeout(&mut self) {
        if self.state == AdvertisingState::Stopping {
            warn!("Controller did not acknowledge stop, forcing idle");
            self.transition(AdvertisingState::Idle);
        }
    }

    /// The controller dropped our advertisement
    pub fn on_released(&mut self) {
        if self.state != AdvertisingState::Idle {
            info!("Advertisement released by controller");
            self.failures = 0;
            self.transition(AdvertisingState::Idle);
            self.events.push_back(AdvertisingEvent::Released);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::payload::PayloadBuilder;

    fn payload() -> AdvertisingPayload {
        PayloadBuilder::new().local_name("RID").build().expect("Valid payload")
    }

    fn machine(max_attempts: u32) -> AdvertisingStateMachine {
        AdvertisingStateMachine::new(RetryPolicy {
            max_attempts,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        })
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut sm = machine(5);
        assert_eq!(sm.state(), AdvertisingState::Idle);

        sm.start(payload()).expect("Start from idle");
        assert_eq!(sm.state(), AdvertisingState::Starting);
        assert!(!sm.is_connectable());

        sm.on_start_ack().expect("Ack while starting");
        assert_eq!(sm.state(), AdvertisingState::Advertising);
        assert!(sm.is_connectable());

        assert_eq!(sm.stop(), StopAction::SendStop);
        assert_eq!(sm.state(), AdvertisingState::Stopping);
        sm.on_stop_ack();
        assert_eq!(sm.state(), AdvertisingState::Idle);
    }

    #[test]
    fn test_connectable_event_emitted_on_advertising() {
        let mut sm = machine(5);
        sm.start(payload()).expect("Start");
        sm.on_start_ack().expect("Ack");

        let events = sm.drain_events();
        assert!(events.contains(&AdvertisingEvent::Connectable));
        assert_eq!(
            events.iter().filter(|e| **e == AdvertisingEvent::Connectable).count(),
            1
        );
        assert!(sm.poll_event().is_none());
    }

    #[test]
    fn test_nack_cap_ends_in_fatal_error() {
        let mut sm = machine(5);
        sm.start(payload()).expect("Start");

        for attempt in 1..5 {
            match sm.on_start_nack("adapter busy") {
                RetryDecision::RetryAfter(_) => {}
                other => panic!("attempt {} should retry, got {:?}", attempt, other),
            }
            assert_eq!(sm.state(), AdvertisingState::Error { fatal: false });
            sm.retry().expect("Retry after non-fatal error");
        }

        let decision = sm.on_start_nack("adapter busy");
        assert_eq!(
            decision,
            RetryDecision::GiveUp {
                attempts: 5,
                reason: "adapter busy".to_string()
            }
        );
        assert!(sm.is_fatal());
        assert!(sm.retry().is_err());
        assert!(sm.on_start_ack().is_err());
        assert_ne!(sm.state(), AdvertisingState::Advertising);
        assert!(sm
            .drain_events()
            .iter()
            .any(|e| matches!(e, AdvertisingEvent::Fatal { attempts: 5, .. })));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_delays_follow_policy() {
        let mut sm = machine(5);
        sm.start(payload()).expect("Start");
        assert_eq!(sm.on_start_nack("busy"), RetryDecision::RetryAfter(Duration::from_millis(100)));
        sm.retry().expect("Retry");
        assert_eq!(sm.on_start_nack("busy"), RetryDecision::RetryAfter(Duration::from_millis(200)));
    }

    #[test]
    fn test_ack_resets_failures() {
        let mut sm = machine(3);
        sm.start(payload()).expect("Start");
        sm.on_start_nack("busy");
        sm.retry().expect("Retry");
        sm.on_start_ack().expect("Ack");
        assert_eq!(sm.failures(), 0);
    }

    #[test]
    fn test_fault_while_advertising_uses_retry_policy() {
        let mut sm = machine(2);
        sm.start(payload()).expect("Start");
        sm.on_start_ack().expect("Ack");

        assert_eq!(sm.on_fault("radio reset"), RetryDecision::RetryAfter(Duration::from_millis(100)));
        assert_eq!(sm.state(), AdvertisingState::Error { fatal: false });

        sm.retry().expect("Retry");
        assert!(matches!(sm.on_fault("radio reset"), RetryDecision::GiveUp { .. }));
        assert!(sm.is_fatal());
    }

    #[test]
    fn test_fault_while_idle_is_ignored() {
        let mut sm = machine(5);
        assert_eq!(sm.on_fault("spurious"), RetryDecision::Ignored);
        assert_eq!(sm.state(), AdvertisingState::Idle);
    }

    #[test]
    fn test_start_rejected_while_active() {
        let mut sm = machine(5);
        sm.start(payload()).expect("Start");
        assert!(matches!(
            sm.start(payload()),
            Err(AdvertisingError::InvalidTransition { state: AdvertisingState::Starting, .. })
        ));
    }

    #[test]
    fn test_stop_is_valid_in_every_state() {
        let mut sm = machine(5);
        assert_eq!(sm.stop(), StopAction::Nothing);

        sm.start(payload()).expect("Start");
        assert_eq!(sm.stop(), StopAction::AwaitStart);
        assert_eq!(sm.stop(), StopAction::Nothing);
        assert_eq!(sm.on_start_ack(), Ok(StopAction::SendStop));
        sm.on_stop_ack();
        assert_eq!(sm.state(), AdvertisingState::Idle);

        sm.start(payload()).expect("Start");
        sm.on_start_ack().expect("Ack");
        assert_eq!(sm.stop(), StopAction::SendStop);
        sm.on_stop_ack();

        sm.start(payload()).expect("Start");
        sm.on_start_nack("busy");
        assert_eq!(sm.stop(), StopAction::CancelRetry);
        assert_eq!(sm.state(), AdvertisingState::Idle);
    }

    #[test]
    fn test_stop_timeout_forces_idle() {
        let mut sm = machine(5);
        sm.start(payload()).expect("Start");
        sm.on_start_ack().expect("Ack");
        sm.stop();
        sm.on_stop_timeout();
        assert_eq!(sm.state(), AdvertisingState::Idle);
    }

    #[test]
    fn test_stop_during_start_waits_for_registration() {
        let mut sm = machine(5);
        sm.start(payload()).expect("Start");
        assert_eq!(sm.stop(), StopAction::AwaitStart);
        assert_eq!(sm.state(), AdvertisingState::Stopping);

        // The registration landed, so the controller must now be told to stop
        assert_eq!(sm.on_start_ack(), Ok(StopAction::SendStop));
        assert_eq!(sm.state(), AdvertisingState::Stopping);
        assert!(!sm.start_in_flight());
        sm.on_stop_ack();
        assert_eq!(sm.state(), AdvertisingState::Idle);
    }

    #[test]
    fn test_rejected_registration_completes_pending_stop() {
        let mut sm = machine(5);
        sm.start(payload()).expect("Start");
        sm.stop();
        assert_eq!(sm.on_start_nack("busy"), RetryDecision::Ignored);
        assert_eq!(sm.state(), AdvertisingState::Idle);
        assert_eq!(sm.failures(), 0);
    }

    #[test]
    fn test_late_ack_after_forced_idle_is_withdrawn() {
        let mut sm = machine(5);
        sm.start(payload()).expect("Start");
        sm.stop();
        sm.on_stop_timeout();
        assert_eq!(sm.state(), AdvertisingState::Idle);
        assert!(sm.start_in_flight());

        assert_eq!(sm.on_start_ack(), Ok(StopAction::SendStop));
        assert_eq!(sm.state(), AdvertisingState::Idle);
    }

    #[test]
    fn test_late_ack_after_fault_during_start_is_withdrawn() {
        let mut sm = machine(5);
        sm.start(payload()).expect("Start");
        assert!(matches!(sm.on_fault("radio reset"), RetryDecision::RetryAfter(_)));
        assert_eq!(sm.state(), AdvertisingState::Error { fatal: false });

        assert_eq!(sm.on_start_ack(), Ok(StopAction::SendStop));
        assert_eq!(sm.state(), AdvertisingState::Error { fatal: false });
        assert_eq!(sm.failures(), 1);
    }

    #[test]
    fn test_unsolicited_ack_is_rejected() {
        let mut sm = machine(5);
        assert!(sm.on_start_ack().is_err());
        sm.start(payload()).expect("Start");
        sm.on_start_ack().expect("Ack");
        assert!(sm.on_start_ack().is_err());
        assert_eq!(sm.state(), AdvertisingState::Advertising);
    }

    #[test]
    fn test_restart_after_fatal_error() {
        let mut sm = machine(1);
        sm.start(payload()).expect("Start");
        sm.on_start_nack("busy");
        assert!(sm.is_fatal());

        sm.start(payload()).expect("Explicit restart");
        assert_eq!(sm.state(), AdvertisingState::Starting);
        assert_eq!(sm.failures(), 0);
    }

    #[test]
    fn test_release_returns_to_idle() {
        let mut sm = machine(5);
        sm.start(payload()).expect("Start");
        sm.on_start_ack().expect("Ack");
        sm.drain_events();

        sm.on_released();
        assert_eq!(sm.state(), AdvertisingState::Idle);
        assert!(sm.drain_events().contains(&AdvertisingEvent::Released));
    }

    #[tokio::test]
    async fn test_mock_controller_nack_reason_feeds_machine() {
        let mut controller = MockRadioController::new();
        controller
            .expect_start_advertising()
            .times(1)
            .returning(|_| Err(ControllerError::Busy));

        let mut sm = machine(5);
        let submitted = sm.start(payload()).expect("Start").clone();
        let result = controller.start_advertising(&submitted).await;

        let decision = match result {
            Ok(()) => panic!("mock should nack"),
            Err(e) => sm.on_start_nack(&e.to_string()),
        };
        assert!(matches!(decision, RetryDecision::RetryAfter(_)));
    }
}
