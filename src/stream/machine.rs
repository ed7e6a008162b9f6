//! Connection state machine for the event stream client.
//!
//! `StreamMachine` is synchronous and does no I/O. Each input (caller
//! request, transport event, timer firing) returns the [`Effect`]s the driver
//! must carry out. Every transport event and timer firing is tagged with the
//! [`Generation`] it was started under; events from any other generation are
//! discarded, so a superseded attempt can never touch the current one.
//!
//! Invariants:
//! - at most one transport is open or opening;
//! - at most one reconnect timer is pending;
//! - a timer is never pending while a transport is open or opening;
//! - once released, nothing changes.

use std::time::Duration;

use thiserror::Error;

use crate::retry::ReconnectPolicy;
use crate::stream::frame::{decode_payload, Payload};
use crate::stream::transport::{Subscription, TransportError};

/// Identity of one connection attempt.
pub type Generation = u64;

/// Connectivity of a stream client.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Errored,
    Closed,
}

/// Work the driver performs on behalf of the machine.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    OpenTransport {
        generation: Generation,
        subscription: Subscription,
    },
    CloseTransport {
        generation: Generation,
    },
    ScheduleReconnect {
        generation: Generation,
        delay: Duration,
    },
    CancelReconnect {
        generation: Generation,
    },
}

/// Returned by [`StreamMachine::connect`] after `disconnect`.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("stream client has been disconnected")]
pub struct Released;

#[derive(Debug)]
pub struct StreamMachine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    subscription: Option<Subscription>,
    generation: Generation,
    transport: Option<Generation>,
    reconnect: Option<Generation>,
    latest: Option<Payload>,
    last_error: Option<TransportError>,
    failures: usize,
    released: bool,
}

impl StreamMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            subscription: None,
            generation: 0,
            transport: None,
            reconnect: None,
            latest: None,
            last_error: None,
            failures: 0,
            released: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn latest_payload(&self) -> Option<&Payload> {
        self.latest.as_ref()
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Generation of the transport that is open or opening, if any.
    pub fn active_transport(&self) -> Option<Generation> {
        self.transport
    }

    /// Generation the pending reconnect timer belongs to, if any.
    pub fn pending_reconnect(&self) -> Option<Generation> {
        self.reconnect
    }

    /// Failures since the last successful open.
    pub fn consecutive_failures(&self) -> usize {
        self.failures
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Starts (or keeps) a subscription.
    ///
    /// The same subscription while connecting, open or waiting to reconnect
    /// is a no-op. A different subscription supersedes the current one.
    pub fn connect(&mut self, subscription: Subscription) -> Result<Vec<Effect>, Released> {
        if self.released {
            return Err(Released);
        }

        let live = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Errored
        );
        if live && self.subscription.as_ref() == Some(&subscription) {
            return Ok(Vec::new());
        }

        let mut effects = self.release_current();
        if self.subscription.as_ref() != Some(&subscription) {
            self.latest = None;
            self.last_error = None;
            self.subscription = Some(subscription);
        }
        self.failures = 0;
        self.state = ConnectionState::Idle;
        self.start_attempt(&mut effects);
        Ok(effects)
    }

    /// The transport for `generation` is open.
    pub fn on_open(&mut self, generation: Generation) -> Vec<Effect> {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::Open;
        self.last_error = None;
        self.failures = 0;
        Vec::new()
    }

    /// A text frame arrived on `generation`.
    ///
    /// Returns `false` when the frame was discarded because the generation
    /// is stale.
    pub fn on_message(&mut self, generation: Generation, frame: &str) -> bool {
        if !self.is_current(generation) || self.state != ConnectionState::Open {
            return false;
        }
        self.latest = Some(decode_payload(frame));
        true
    }

    /// The transport for `generation` failed or dropped.
    pub fn on_error(&mut self, generation: Generation, error: TransportError) -> Vec<Effect> {
        if !self.is_current(generation) {
            return Vec::new();
        }

        let mut effects = vec![Effect::CloseTransport { generation }];
        self.transport = None;
        self.failures += 1;

        let terminal = error.is_terminal();
        self.last_error = Some(error);

        if terminal || !self.policy.allows_retry_after(self.failures) {
            self.state = ConnectionState::Closed;
            return effects;
        }

        self.state = ConnectionState::Errored;
        self.reconnect = Some(generation);
        effects.push(Effect::ScheduleReconnect {
            generation,
            delay: self.policy.delay,
        });
        effects
    }

    /// The reconnect timer scheduled for `generation` fired.
    pub fn on_reconnect_timer(&mut self, generation: Generation) -> Vec<Effect> {
        if self.released || self.reconnect != Some(generation) {
            return Vec::new();
        }
        self.reconnect = None;

        let mut effects = Vec::new();
        self.start_attempt(&mut effects);
        effects
    }

    /// Releases everything. Terminal for this machine.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        if self.released {
            return Vec::new();
        }
        let effects = self.release_current();
        self.released = true;
        self.generation += 1;
        self.state = ConnectionState::Closed;
        self.last_error = None;
        effects
    }

    fn is_current(&self, generation: Generation) -> bool {
        !self.released && self.transport == Some(generation)
    }

    fn release_current(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(generation) = self.transport.take() {
            effects.push(Effect::CloseTransport { generation });
        }
        if let Some(generation) = self.reconnect.take() {
            effects.push(Effect::CancelReconnect { generation });
        }
        effects
    }

    fn start_attempt(&mut self, effects: &mut Vec<Effect>) {
        let Some(subscription) = self.subscription.clone() else {
            return;
        };
        debug_assert!(self.transport.is_none() && self.reconnect.is_none());

        self.generation += 1;
        self.transport = Some(self.generation);
        self.state = ConnectionState::Connecting;
        effects.push(Effect::OpenTransport {
            generation: self.generation,
            subscription,
        });
    }
}
