//! REST client for the proxy panel backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

use crate::retry::{retry_async, RetryPolicy};
use crate::session::PanelSession;
use crate::stream::transport::{Subscription, SubscriptionOptions};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

const PROXIES_PATH: &str = "/api/proxies";
const PROXIES_STREAM_PATH: &str = "/api/proxies/stream";
const PROXY_CONTROL_PATH: &str = "/api/proxies/control";
const LOGS_STREAM_PATH: &str = "/api/logs/stream";
const WEB_PORT_PATH: &str = "/api/config/webport";
const STATUS_PATH: &str = "/api/status";
const RESTART_PATH: &str = "/api/system/restart";
const SETUP_PATH: &str = "/api/setup";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PanelDefaults;

impl PanelDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(100);
    pub const JITTER: Duration = Duration::from_millis(50);
}

#[derive(Clone, Debug)]
pub struct PanelClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for PanelClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: PanelDefaults::CONNECT_TIMEOUT,
            attempt_timeout: PanelDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: PanelDefaults::MAX_ATTEMPTS,
                initial_backoff: PanelDefaults::BACKOFF,
                max_backoff: PanelDefaults::BACKOFF * 4,
                jitter: PanelDefaults::JITTER,
            },
        }
    }
}

/// Proxy definition as stored by the panel.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub listen_addr: String,
    pub target_addr: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub paused: bool,
    /// Seconds; 0 lets the backend pick its default.
    #[serde(default)]
    pub connection_timeout: u32,
    #[serde(default)]
    pub read_timeout: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub description: String,
    /// Registers per read; 0 means unlimited.
    #[serde(default)]
    pub max_read_size: u32,
}

/// Live view of one proxy, as listed by `/api/proxies` and pushed on the
/// proxies stream.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ProxyStatus {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub uptime_s: f64,
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ProxyStatus {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PanelStatus {
    #[serde(default)]
    pub setup_required: bool,
    #[serde(default)]
    pub proxies: Vec<ProxyStatus>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyAction {
    Start,
    Stop,
    Restart,
    Pause,
    Resume,
    StartAll,
    StopAll,
}

impl ProxyAction {
    /// Whether the action targets every proxy rather than one id.
    pub fn is_global(self) -> bool {
        matches!(self, Self::StartAll | Self::StopAll)
    }
}

#[derive(Debug, Error)]
pub enum PanelApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] url::ParseError),
}

impl PanelApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) | Self::InvalidAddress(_) => false,
        }
    }

    /// The session is missing, expired, or lacks a valid CSRF token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

#[derive(Clone, Debug)]
pub struct PanelApiClient {
    session: Arc<PanelSession>,
    retry_policy: RetryPolicy,
}

impl PanelApiClient {
    pub fn new(session: Arc<PanelSession>) -> Self {
        Self::with_retry_policy(session, PanelClientOptions::default().retry_policy)
    }

    pub fn with_retry_policy(session: Arc<PanelSession>, retry_policy: RetryPolicy) -> Self {
        Self {
            session,
            retry_policy,
        }
    }

    pub fn session(&self) -> &Arc<PanelSession> {
        &self.session
    }

    pub async fn fetch_proxies(&self) -> Result<Vec<ProxyStatus>, PanelApiError> {
        self.get_json(PROXIES_PATH).await
    }

    pub async fn add_proxy(&self, proxy: &ProxyConfig) -> Result<(), PanelApiError> {
        let url = self.session.endpoint(PROXIES_PATH)?;
        self.mutate(Method::POST, url, Some(proxy)).await.map(drop)
    }

    pub async fn update_proxy(&self, proxy: &ProxyConfig) -> Result<(), PanelApiError> {
        let url = self.session.endpoint(PROXIES_PATH)?;
        self.mutate(Method::PUT, url, Some(proxy)).await.map(drop)
    }

    pub async fn delete_proxy(&self, id: &str) -> Result<(), PanelApiError> {
        let url = proxy_delete_url(self.session.endpoint(PROXIES_PATH)?, id);
        self.mutate::<()>(Method::DELETE, url, None).await.map(drop)
    }

    /// Sends a lifecycle action. `id` is ignored for global actions.
    pub async fn control_proxy(&self, id: &str, action: ProxyAction) -> Result<(), PanelApiError> {
        let url = self.session.endpoint(PROXY_CONTROL_PATH)?;
        let id = if action.is_global() { "" } else { id };
        let body = json!({ "id": id, "action": action });
        self.mutate(Method::POST, url, Some(&body)).await.map(drop)
    }

    pub async fn fetch_web_port(&self) -> Result<String, PanelApiError> {
        #[derive(Deserialize)]
        struct WebPort {
            #[serde(default)]
            web_port: String,
        }

        Ok(self.get_json::<WebPort>(WEB_PORT_PATH).await?.web_port)
    }

    /// Stores a new web port. The backend applies it after a restart.
    pub async fn save_web_port(&self, port: &str) -> Result<(), PanelApiError> {
        let url = self.session.endpoint(WEB_PORT_PATH)?;
        let body = json!({ "web_port": port });
        self.mutate(Method::PUT, url, Some(&body)).await.map(drop)
    }

    /// Public status. A non-success response yields the default status.
    pub async fn fetch_status(&self) -> Result<PanelStatus, PanelApiError> {
        match self.get_json(STATUS_PATH).await {
            Err(PanelApiError::HttpStatus { .. }) => Ok(PanelStatus::default()),
            other => other,
        }
    }

    pub async fn restart_system(&self) -> Result<(), PanelApiError> {
        let url = self.session.endpoint(RESTART_PATH)?;
        self.mutate::<()>(Method::POST, url, None).await.map(drop)
    }

    /// Sets the admin password on first run.
    pub async fn setup(&self, password: &secrecy::SecretString) -> Result<(), PanelApiError> {
        use secrecy::ExposeSecret;

        let url = self.session.endpoint(SETUP_PATH)?;
        let body = json!({ "password": password.expose_secret() });
        self.mutate(Method::POST, url, Some(&body)).await.map(drop)
    }

    pub fn proxies_stream(&self) -> Result<Subscription, PanelApiError> {
        self.stream_subscription(PROXIES_STREAM_PATH)
    }

    pub fn logs_stream(&self) -> Result<Subscription, PanelApiError> {
        self.stream_subscription(LOGS_STREAM_PATH)
    }

    fn stream_subscription(&self, path: &str) -> Result<Subscription, PanelApiError> {
        Ok(Subscription::new(
            self.session.endpoint(path)?,
            SubscriptionOptions::default(),
        ))
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, PanelApiError>
    where
        T: DeserializeOwned,
    {
        let endpoint = self.session.endpoint(path)?;

        retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    let body = self.send(Method::GET, endpoint, None::<&()>).await?;
                    serde_json::from_str(&body).map_err(|err| PanelApiError::Parse(err.to_string()))
                }
            },
            PanelApiError::is_retryable,
        )
        .await
    }

    /// Signed, single-attempt request.
    async fn mutate<B>(&self, method: Method, url: Url, body: Option<&B>) -> Result<String, PanelApiError>
    where
        B: Serialize + ?Sized,
    {
        self.send(method, url, body).await
    }

    async fn send<B>(&self, method: Method, url: Url, body: Option<&B>) -> Result<String, PanelApiError>
    where
        B: Serialize + ?Sized,
    {
        let signed = method != Method::GET;
        let mut request = self
            .session
            .http()
            .request(method, url)
            .timeout(self.session.attempt_timeout());
        if let Some(body) = body {
            request = request.json(body);
        }
        if signed {
            request = self.session.sign(request);
        }

        let response = request.send().await.map_err(PanelApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(PanelApiError::Transport)?;
        if !status.is_success() {
            return Err(PanelApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }
        Ok(body)
    }
}

fn proxy_delete_url(mut url: Url, id: &str) -> Url {
    url.query_pairs_mut().append_pair("id", id);
    url
}

pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.trim().chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
