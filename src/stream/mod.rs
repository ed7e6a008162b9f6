//! Event stream modules.
//!
//! - `frame`: SSE line parsing and payload decoding.
//! - `transport`: subscription types and the reqwest event-stream transport.
//! - `machine`: connection state machine with generation tagging.
//! - `client`: the runtime driver that owns transports and reconnect timers.

/// Resilient stream client.
pub mod client;
/// SSE framing and JSON-or-text payloads.
pub mod frame;
/// Connection state machine.
pub mod machine;
/// Transport seam and HTTP implementation.
pub mod transport;

pub use client::{StreamClient, StreamClientError, StreamDefaults};
pub use frame::Payload;
pub use machine::ConnectionState;
pub use transport::{Credentials, Subscription, SubscriptionOptions, Transport, TransportError};
