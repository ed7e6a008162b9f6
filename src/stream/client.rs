//! Resilient event stream client.
//!
//! The client owns one subscription to a server-push endpoint and keeps it
//! connected across drops with a fixed-delay reconnect. Observers read the
//! latest decoded payload, the connection state and the last transport error,
//! either directly or through `tokio::sync::watch` receivers.
//!
//! State transitions are made by [`StreamMachine`] under a mutex that is
//! never held across an `.await`; this module only runs the effects it
//! returns: one task per connection attempt and one task per reconnect timer.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::retry::ReconnectPolicy;
use crate::stream::frame::Payload;
use crate::stream::machine::{ConnectionState, Effect, Generation, Released, StreamMachine};
use crate::stream::transport::{
    FrameStream, Subscription, SubscriptionOptions, Transport, TransportError,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Errors returned to callers of [`StreamClient::connect`].
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// `disconnect` was called; the client cannot be reused.
    #[error(transparent)]
    Released(#[from] Released),

    /// `connect` was called outside a tokio runtime.
    #[error("no tokio runtime available to drive the stream")]
    NoRuntime,

    /// Subscription address could not be parsed.
    #[error("invalid stream address: {0}")]
    InvalidAddress(#[from] url::ParseError),
}

/// Handle to one event stream subscription.
///
/// Dropping the handle disconnects it.
pub struct StreamClient {
    shared: Arc<Shared>,
}

impl StreamClient {
    /// Creates an idle client with the default reconnect policy.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_policy(transport, ReconnectPolicy::default())
    }

    pub fn with_policy<T: Transport>(transport: T, policy: ReconnectPolicy) -> Self {
        let (payload_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (error_tx, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                transport: Arc::new(transport),
                inner: Mutex::new(Inner {
                    machine: StreamMachine::new(policy),
                    runtime: None,
                    connection: None,
                    reconnect: None,
                }),
                payload_tx,
                state_tx,
                error_tx,
            }),
        }
    }

    /// Subscribes to `address`.
    ///
    /// Calling this again for the same address and options while connected,
    /// connecting or waiting to reconnect has no effect. A different
    /// subscription replaces the current one. Must be called from within a
    /// tokio runtime.
    pub fn connect(
        &self,
        address: &str,
        options: SubscriptionOptions,
    ) -> Result<(), StreamClientError> {
        let address = Url::parse(address)?;
        self.subscribe(Subscription::new(address, options))
    }

    /// Same as [`connect`](Self::connect) with an already built subscription.
    pub fn subscribe(&self, subscription: Subscription) -> Result<(), StreamClientError> {
        let mut inner = self.shared.lock();
        if inner.runtime.is_none() {
            let handle = Handle::try_current().map_err(|_| StreamClientError::NoRuntime)?;
            inner.runtime = Some(handle);
        }

        let effects = inner.machine.connect(subscription)?;
        self.shared.execute(&mut inner, effects);
        self.shared.publish(&inner.machine);
        Ok(())
    }

    /// Stops the stream for good.
    ///
    /// Closes the transport, cancels a pending reconnect and moves to
    /// [`ConnectionState::Closed`]. Events still in flight from earlier
    /// attempts are ignored.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if inner.machine.is_released() {
            return;
        }
        let subscribed = inner.machine.subscription().is_some();
        let effects = inner.machine.disconnect();
        self.shared.execute(&mut inner, effects);
        self.shared.publish(&inner.machine);
        if subscribed {
            info!(event = "stream_disconnected");
        }
    }

    /// Latest decoded payload; `None` until the first message.
    pub fn latest_payload(&self) -> Option<Payload> {
        self.shared.payload_tx.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    /// Most recent transport error; cleared on the next open.
    pub fn last_error(&self) -> Option<TransportError> {
        self.shared.error_tx.borrow().clone()
    }

    /// Current subscription, if any.
    pub fn subscription(&self) -> Option<Subscription> {
        self.shared.lock().machine.subscription().cloned()
    }

    pub fn watch_payload(&self) -> watch::Receiver<Option<Payload>> {
        self.shared.payload_tx.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn watch_error(&self) -> watch::Receiver<Option<TransportError>> {
        self.shared.error_tx.subscribe()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
    payload_tx: watch::Sender<Option<Payload>>,
    state_tx: watch::Sender<ConnectionState>,
    error_tx: watch::Sender<Option<TransportError>>,
}

struct Inner {
    machine: StreamMachine,
    runtime: Option<Handle>,
    connection: Option<(Generation, JoinHandle<()>)>,
    reconnect: Option<(Generation, JoinHandle<()>)>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn execute(self: &Arc<Self>, inner: &mut Inner, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::OpenTransport {
                    generation,
                    subscription,
                } => {
                    let Some(runtime) = inner.runtime.clone() else {
                        continue;
                    };
                    info!(
                        event = "stream_connecting",
                        url = %subscription.address,
                        generation
                    );
                    let open = self.transport.open(&subscription);
                    let task = runtime.spawn(run_connection(Arc::downgrade(self), generation, open));
                    inner.connection = Some((generation, task));
                }
                Effect::CloseTransport { generation } => {
                    if matches!(&inner.connection, Some((current, _)) if *current == generation) {
                        if let Some((_, task)) = inner.connection.take() {
                            task.abort();
                        }
                    }
                }
                Effect::ScheduleReconnect { generation, delay } => {
                    let Some(runtime) = inner.runtime.clone() else {
                        continue;
                    };
                    debug!(
                        event = "stream_reconnect_scheduled",
                        generation,
                        delay_ms = delay.as_millis() as u64
                    );
                    let task = runtime.spawn(run_reconnect_timer(Arc::downgrade(self), generation, delay));
                    inner.reconnect = Some((generation, task));
                }
                Effect::CancelReconnect { generation } => {
                    if matches!(&inner.reconnect, Some((current, _)) if *current == generation) {
                        if let Some((_, task)) = inner.reconnect.take() {
                            task.abort();
                        }
                    }
                }
            }
        }
    }

    fn publish(&self, machine: &StreamMachine) {
        let latest = machine.latest_payload();
        self.payload_tx.send_if_modified(|current| {
            if current.as_ref() == latest {
                return false;
            }
            *current = latest.cloned();
            true
        });

        let state = machine.state();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });

        let error = machine.last_error();
        self.error_tx.send_if_modified(|current| {
            if current.as_ref() == error {
                return false;
            }
            *current = error.cloned();
            true
        });
    }

    fn opened(self: &Arc<Self>, generation: Generation) -> bool {
        let mut inner = self.lock();
        let effects = inner.machine.on_open(generation);
        let current = inner.machine.active_transport() == Some(generation);
        if current {
            info!(event = "stream_open", generation);
        }
        self.execute(&mut inner, effects);
        self.publish(&inner.machine);
        current
    }

    /// Returns `false` once `generation` is no longer the live attempt.
    fn message(&self, generation: Generation, frame: &str) -> bool {
        let mut inner = self.lock();
        if inner.machine.on_message(generation, frame) {
            self.payload_tx
                .send_replace(inner.machine.latest_payload().cloned());
        }
        inner.machine.active_transport() == Some(generation)
    }

    fn failed(self: &Arc<Self>, generation: Generation, error: TransportError) {
        let mut inner = self.lock();
        if inner.machine.active_transport() != Some(generation) {
            return;
        }

        let was_open = inner.machine.state() == ConnectionState::Open;
        let terminal = error.is_terminal();
        if was_open || terminal {
            warn!(event = "stream_error", generation, terminal, error = %error);
        } else {
            debug!(
                event = "stream_error",
                generation,
                terminal,
                failures = inner.machine.consecutive_failures() + 1,
                error = %error
            );
        }

        let effects = inner.machine.on_error(generation, error);
        if !terminal && inner.machine.state() == ConnectionState::Closed {
            warn!(
                event = "stream_reconnect_limit",
                failures = inner.machine.consecutive_failures()
            );
        }
        self.execute(&mut inner, effects);
        self.publish(&inner.machine);
    }

    fn reconnect_due(self: &Arc<Self>, generation: Generation) {
        let mut inner = self.lock();
        if matches!(&inner.reconnect, Some((current, _)) if *current == generation) {
            inner.reconnect = None;
        }
        let effects = inner.machine.on_reconnect_timer(generation);
        self.execute(&mut inner, effects);
        self.publish(&inner.machine);
    }
}

async fn run_connection(
    shared: Weak<Shared>,
    generation: Generation,
    open: BoxFuture<'static, Result<FrameStream, TransportError>>,
) {
    let mut frames = match open.await {
        Ok(frames) => frames,
        Err(error) => {
            if let Some(shared) = shared.upgrade() {
                shared.failed(generation, error);
            }
            return;
        }
    };

    match shared.upgrade() {
        Some(client) if client.opened(generation) => {}
        _ => return,
    }

    while let Some(item) = frames.next().await {
        let Some(client) = shared.upgrade() else {
            return;
        };
        match item {
            Ok(frame) => {
                if !client.message(generation, &frame) {
                    return;
                }
            }
            Err(error) => {
                drop(frames);
                client.failed(generation, error);
                return;
            }
        }
    }

    drop(frames);
    if let Some(shared) = shared.upgrade() {
        shared.failed(generation, TransportError::Ended);
    }
}

async fn run_reconnect_timer(shared: Weak<Shared>, generation: Generation, delay: Duration) {
    tokio::time::sleep(delay).await;
    if let Some(shared) = shared.upgrade() {
        shared.reconnect_due(generation);
    }
}
