//! Panel session: authentication state, cookie jar and request signing.
//!
//! A [`PanelSession`] is the single owner of "are we logged in". It holds the
//! HTTP client whose cookie jar receives the `session_token` and
//! `csrf_token` cookies set by `/api/login`, and signs state-changing
//! requests with the CSRF header the backend expects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::panel_api::{summarize_error_body, PanelApiError, PanelClientOptions};
use crate::retry::ReconnectPolicy;
use crate::stream::client::{StreamClient, StreamDefaults};
use crate::stream::transport::HttpTransport;

pub const SESSION_COOKIE: &str = "session_token";
pub const CSRF_COOKIE: &str = "csrf_token";
pub const CSRF_HEADER: &str = "X-CSRF-Token";

const LOGIN_PATH: &str = "/api/login";
const AUTH_PROBE_PATH: &str = "/api/proxies";

pub struct PanelSession {
    base_url: Url,
    http: Client,
    jar: Arc<Jar>,
    attempt_timeout: Duration,
    authenticated: AtomicBool,
    checking: tokio::sync::Mutex<()>,
}

impl PanelSession {
    pub fn new(base_url: &str) -> Result<Self, PanelApiError> {
        Self::with_options(base_url, PanelClientOptions::default())
    }

    pub fn with_options(base_url: &str, options: PanelClientOptions) -> Result<Self, PanelApiError> {
        let base_url = Url::parse(base_url.trim_end())?;
        let jar = Arc::new(Jar::default());
        let http = Client::builder()
            .no_proxy()
            .cookie_provider(Arc::clone(&jar))
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(PanelApiError::Transport)?;

        Ok(Self {
            base_url,
            http,
            jar,
            attempt_timeout: options.attempt_timeout,
            authenticated: AtomicBool::new(false),
            checking: tokio::sync::Mutex::new(()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves an API path against the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, PanelApiError> {
        Ok(self.base_url.join(path)?)
    }

    /// HTTP client carrying the session cookies.
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Last known authentication result. Does not touch the network.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Probes a protected endpoint to find out whether the session is valid.
    ///
    /// While a probe is already running, concurrent callers get the cached
    /// result instead of starting another one.
    pub async fn check_auth(&self) -> bool {
        let Ok(_probe) = self.checking.try_lock() else {
            return self.is_authenticated();
        };

        let valid = match self.probe().await {
            Ok(()) => true,
            Err(err) => {
                match &err {
                    PanelApiError::HttpStatus { status, .. } => {
                        debug!(event = "auth_check_failed", status = status.as_u16());
                    }
                    other => warn!(event = "auth_check_failed", error = %other),
                }
                false
            }
        };
        self.authenticated.store(valid, Ordering::SeqCst);
        valid
    }

    /// Exchanges the admin password for a session.
    ///
    /// On success the server's cookies land in this session's jar.
    pub async fn login(&self, password: &SecretString) -> bool {
        match self.try_login(password).await {
            Ok(()) => true,
            Err(err) => {
                warn!(event = "login_failed", error = %err);
                false
            }
        }
    }

    /// Like [`login`](Self::login) but keeps the failure.
    pub async fn try_login(&self, password: &SecretString) -> Result<(), PanelApiError> {
        let result = self.post_login(password).await;
        self.authenticated.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    /// Forgets the session locally. The backend has no logout endpoint; the
    /// session cookie expires on its own.
    pub fn logout(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
    }

    /// CSRF token from the `csrf_token` cookie, if the server has set one.
    pub fn csrf_token(&self) -> Option<String> {
        let header = self.jar.cookies(&self.base_url)?;
        cookie_value(header.to_str().ok()?, CSRF_COOKIE)
    }

    /// Attaches the CSRF header to a state-changing request.
    pub fn sign(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.csrf_token() {
            Some(token) => builder.header(CSRF_HEADER, token),
            None => builder,
        }
    }

    /// Event-stream transport that sends this session's cookies with
    /// credentialed subscriptions.
    pub fn stream_transport(&self) -> Result<HttpTransport, PanelApiError> {
        HttpTransport::new(self.http.clone(), StreamDefaults::CONNECT_TIMEOUT)
            .map_err(PanelApiError::Transport)
    }

    /// Idle stream client bound to this session.
    pub fn stream_client(&self, policy: ReconnectPolicy) -> Result<StreamClient, PanelApiError> {
        Ok(StreamClient::with_policy(self.stream_transport()?, policy))
    }

    async fn probe(&self) -> Result<(), PanelApiError> {
        let response = self
            .http
            .get(self.endpoint(AUTH_PROBE_PATH)?)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(PanelApiError::Transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(PanelApiError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        })
    }

    async fn post_login(&self, password: &SecretString) -> Result<(), PanelApiError> {
        let response = self
            .http
            .post(self.endpoint(LOGIN_PATH)?)
            .timeout(self.attempt_timeout)
            .json(&json!({ "password": password.expose_secret() }))
            .send()
            .await
            .map_err(PanelApiError::Transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(PanelApiError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        })
    }
}

impl std::fmt::Debug for PanelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelSession")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

/// Finds `name` in a `Cookie` header value (`a=b; c=d`).
fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use reqwest::cookie::CookieStore;
    use reqwest::header::HeaderValue;

    use super::{cookie_value, PanelSession, CSRF_COOKIE};

    #[test]
    fn finds_cookie_among_others() {
        let header = "session_token=abc; csrf_token=xyz==; theme=dark";
        assert_eq!(cookie_value(header, CSRF_COOKIE).as_deref(), Some("xyz=="));
        assert_eq!(cookie_value(header, "missing"), None);
        assert_eq!(cookie_value("", CSRF_COOKIE), None);
    }

    #[test]
    fn does_not_match_cookie_name_prefix() {
        assert_eq!(cookie_value("xcsrf_token=1", CSRF_COOKIE), None);
    }

    #[test]
    fn endpoint_joins_api_paths() {
        let session = PanelSession::new("http://panel.local:8080/\n").expect("session");
        assert_eq!(
            session.endpoint("/api/proxies/stream").expect("join").as_str(),
            "http://panel.local:8080/api/proxies/stream"
        );
    }

    #[test]
    fn reads_csrf_token_from_jar_and_starts_unauthenticated() {
        let session = PanelSession::new("http://panel.local").expect("session");
        assert!(session.csrf_token().is_none());
        assert!(!session.is_authenticated());

        let cookies = [
            HeaderValue::from_static("session_token=s1; Path=/; HttpOnly"),
            HeaderValue::from_static("csrf_token=t1; Path=/"),
        ];
        session
            .jar
            .set_cookies(&mut cookies.iter(), session.base_url());
        assert_eq!(session.csrf_token().as_deref(), Some("t1"));
    }

    #[test]
    fn logout_clears_flag() {
        let session = PanelSession::new("http://panel.local").expect("session");
        session
            .authenticated
            .store(true, std::sync::atomic::Ordering::SeqCst);
        session.logout();
        assert!(!session.is_authenticated());
    }
}
