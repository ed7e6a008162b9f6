//! Rust client for the proxy panel control API and its live event streams.
//!
//! The crate is organized by surface:
//! - `stream`: resilient server-sent-events client with fixed-delay reconnect.
//! - `session`: login state, cookie jar, and CSRF request signing.
//! - `panel_api`: HTTP client for proxy management calls.
//! - `retry`: retry and reconnect policies.

/// Panel REST client and request/response types.
pub mod panel_api;
/// Retry and reconnect policies shared across the crate.
pub mod retry;
/// Authenticated session shared by REST calls and streams.
pub mod session;
/// Event stream client, transport, and state machine.
pub mod stream;
