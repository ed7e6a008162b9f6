//! Event-stream transport seam and its reqwest implementation.
//!
//! A [`Transport`] opens one [`Subscription`] and yields its text frames. The
//! stream client owns at most one open frame stream at a time and drops it to
//! release the underlying HTTP connection.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use crate::stream::frame::{SseError, SseParser};

/// Whether ambient session credentials (cookies) go with the request.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Credentials {
    #[default]
    Include,
    Omit,
}

/// Transport options for a subscription.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscriptionOptions {
    pub credentials: Credentials,
    /// Extra request headers sent with every connection attempt.
    pub headers: Vec<(String, String)>,
}

impl SubscriptionOptions {
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// One logical subscription: a target address plus transport options.
///
/// Two subscriptions are the same logical subscription when they compare
/// equal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subscription {
    pub address: Url,
    pub options: SubscriptionOptions,
}

impl Subscription {
    pub fn new(address: Url, options: SubscriptionOptions) -> Self {
        Self { address, options }
    }
}

/// Frames from one open connection. Ends with `Err` or `None` when the
/// connection fails or drops.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Opens event-stream connections.
pub trait Transport: Send + Sync + 'static {
    /// Resolves once the connection is open, or fails before opening.
    fn open(&self, subscription: &Subscription) -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}

/// Connection failures reported by a transport.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("unexpected content type: {0}")]
    ContentType(String),

    #[error("invalid utf-8 in event stream")]
    InvalidUtf8,

    #[error("event stream line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("stream ended")]
    Ended,
}

impl TransportError {
    /// Whether the server has ended this subscription for good.
    ///
    /// Terminal errors stop automatic reconnection; everything else is
    /// retried after the reconnect delay.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::HttpStatus(code) => {
                let status = StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status == StatusCode::NO_CONTENT {
                    return true;
                }
                status.is_client_error()
                    && status != StatusCode::REQUEST_TIMEOUT
                    && status != StatusCode::TOO_MANY_REQUESTS
            }
            Self::ContentType(_) | Self::InvalidRequest(_) => true,
            Self::Connect(_)
            | Self::Read(_)
            | Self::InvalidUtf8
            | Self::LineTooLong(_)
            | Self::Ended => false,
        }
    }
}

/// SSE transport over reqwest.
///
/// Credentialed subscriptions use the session client (and its cookie jar);
/// the others use a client without a cookie store.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    with_credentials: Client,
    without_credentials: Client,
}

impl HttpTransport {
    /// Builds a transport that attaches cookies from `session_client`.
    pub fn new(session_client: Client, connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let without_credentials = Client::builder()
            .no_proxy()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            with_credentials: session_client,
            without_credentials,
        })
    }

    /// Builds a transport with no ambient credentials at all.
    pub fn anonymous(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .no_proxy()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            with_credentials: client.clone(),
            without_credentials: client,
        })
    }

    fn client_for(&self, credentials: Credentials) -> &Client {
        match credentials {
            Credentials::Include => &self.with_credentials,
            Credentials::Omit => &self.without_credentials,
        }
    }
}

impl Transport for HttpTransport {
    fn open(&self, subscription: &Subscription) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let client = self.client_for(subscription.options.credentials).clone();
        let address = subscription.address.clone();
        let headers = build_headers(&subscription.options.headers);

        Box::pin(async move {
            let headers = headers?;
            let response = client
                .get(address)
                .headers(headers)
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache")
                .send()
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;

            let status = response.status();
            if status != StatusCode::OK {
                return Err(TransportError::HttpStatus(status.as_u16()));
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if !is_event_stream(&content_type) {
                return Err(TransportError::ContentType(content_type));
            }

            Ok(sse_frames(response.bytes_stream()))
        })
    }
}

fn build_headers(pairs: &[(String, String)]) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| TransportError::InvalidRequest(format!("header {name}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| TransportError::InvalidRequest(format!("header {name}: {err}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
}

/// Turns a byte stream into SSE data frames.
///
/// Only message events are forwarded; named events and events without a
/// `data:` line never reach the subscriber.
///
/// The frame stream ends with [`TransportError::Ended`] when the body ends,
/// so a dropped connection is always reported as an error.
pub(crate) fn sse_frames<S, B, E>(bytes: S) -> FrameStream
where
    S: futures_util::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        parser: SseParser,
        done: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        parser: SseParser::new(),
        done: false,
    };

    let events = stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let item = match state.bytes.next().await {
            Some(Ok(chunk)) => state.parser.feed(chunk.as_ref()).map_err(|err| match err {
                SseError::InvalidUtf8(_) => TransportError::InvalidUtf8,
                SseError::LineTooLong { limit } => TransportError::LineTooLong(limit),
            }),
            Some(Err(err)) => Err(TransportError::Read(err.to_string())),
            None => Err(TransportError::Ended),
        };
        if item.is_err() {
            state.done = true;
        }
        Some((item, state))
    });

    events
        .flat_map(|item| match item {
            Ok(events) => stream::iter(
                events
                    .into_iter()
                    .filter(|event| event.is_message())
                    .map(|event| Ok(event.data))
                    .collect::<Vec<_>>(),
            ),
            Err(err) => stream::iter(vec![Err(err)]),
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use futures_util::StreamExt;

    use super::{is_event_stream, sse_frames, TransportError};
    use crate::stream::frame::MAX_LINE_LEN;

    #[test]
    fn classifies_terminal_statuses() {
        assert!(TransportError::HttpStatus(204).is_terminal());
        assert!(TransportError::HttpStatus(401).is_terminal());
        assert!(TransportError::HttpStatus(404).is_terminal());
        assert!(!TransportError::HttpStatus(408).is_terminal());
        assert!(!TransportError::HttpStatus(429).is_terminal());
        assert!(!TransportError::HttpStatus(502).is_terminal());
    }

    #[test]
    fn classifies_network_failures_as_transient() {
        assert!(!TransportError::Connect("refused".to_string()).is_terminal());
        assert!(!TransportError::Read("reset".to_string()).is_terminal());
        assert!(!TransportError::Ended.is_terminal());
        assert!(!TransportError::InvalidUtf8.is_terminal());
        assert!(!TransportError::LineTooLong(1024).is_terminal());
        assert!(TransportError::ContentType("text/html".to_string()).is_terminal());
    }

    #[test]
    fn accepts_event_stream_with_charset() {
        assert!(is_event_stream("text/event-stream"));
        assert!(is_event_stream("text/event-stream; charset=utf-8"));
        assert!(!is_event_stream("application/json"));
        assert!(!is_event_stream(""));
    }

    #[tokio::test]
    async fn frames_end_with_error_when_body_ends() {
        let chunks: Vec<Result<&'static [u8], std::io::Error>> = vec![
            Ok(&b"data: {\"status\":\"ok\"}\n\n: ping\n\n"[..]),
            Ok(&b"data: second\n"[..]),
            Ok(&b"\n"[..]),
        ];
        let frames: Vec<_> = sse_frames(stream::iter(chunks)).collect().await;

        assert_eq!(
            frames,
            vec![
                Ok(r#"{"status":"ok"}"#.to_string()),
                Ok("second".to_string()),
                Err(TransportError::Ended),
            ]
        );
    }

    #[tokio::test]
    async fn frames_stop_after_read_error() {
        let chunks: Vec<Result<&'static [u8], std::io::Error>> = vec![
            Ok(&b"data: one\n\n"[..]),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(&b"data: never\n\n"[..]),
        ];
        let frames: Vec<_> = sse_frames(stream::iter(chunks)).collect().await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Ok("one".to_string()));
        assert!(matches!(frames[1], Err(TransportError::Read(_))));
    }

    #[tokio::test]
    async fn forwards_only_message_events_with_data() {
        let chunks: Vec<Result<&'static [u8], std::io::Error>> = vec![
            Ok(&b"data: {\"a\":1}\n\nevent: ping\n\nevent: log\ndata: other\n\n"[..]),
            Ok(&b"event: message\ndata: named\n\ndata:\n\n"[..]),
        ];
        let frames: Vec<_> = sse_frames(stream::iter(chunks)).collect().await;

        assert_eq!(
            frames,
            vec![
                Ok(r#"{"a":1}"#.to_string()),
                Ok("named".to_string()),
                Ok(String::new()),
                Err(TransportError::Ended),
            ]
        );
    }

    #[tokio::test]
    async fn unterminated_line_past_limit_fails_connection() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
            vec![Ok(vec![b'a'; MAX_LINE_LEN + 1]), Ok(b"\n\n".to_vec())];
        let frames: Vec<_> = sse_frames(stream::iter(chunks)).collect().await;

        assert_eq!(frames, vec![Err(TransportError::LineTooLong(MAX_LINE_LEN))]);
        assert!(!TransportError::LineTooLong(MAX_LINE_LEN).is_terminal());
    }
}
