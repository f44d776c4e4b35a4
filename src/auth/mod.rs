//! Nexus Mods single sign-on
//!
//! The handshake exchanges a browser login for a durable API key over a
//! WebSocket. [`Handshake`] is the pure state machine driven by incoming
//! frames; [`AuthenticationSession`] owns the transport, the browser launch
//! and the persisted key.

mod transport;

pub use transport::{CommandOpener, SsoFrame, SsoTransport, UrlOpener, WsTransport};

use crate::downloaders::{NexusClient, API_BASE_URL};
use crate::error::{AuthError, FetchError};
use crate::settings::SettingsFile;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SSO_URL: &str = "wss://sso.nexusmods.com";
pub const AUTHORIZE_URL: &str = "https://www.nexusmods.com/sso";

/// Field names a key may arrive under, in lookup order
const KEY_FIELDS: &[&str] = &["api_key", "apikey", "apiKey", "token", "Token", "key"];

/// Anything this short is not an API key
const MIN_KEY_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingToken,
    AwaitingKey,
    Authenticated,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Failed)
    }
}

/// What the caller should do after feeding a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Send(String),
    Done(Result<String, AuthError>),
}

#[derive(Serialize)]
struct SsoRequest<'a> {
    id: &'a str,
    appid: &'a str,
    token: Option<&'a str>,
    protocol: u8,
}

/// One SSO attempt. States only move forward.
#[derive(Debug)]
pub struct Handshake {
    session_id: String,
    app_id: String,
    state: SessionState,
    connection_token: Option<String>,
    key: Option<String>,
}

impl Handshake {
    pub fn new(app_id: &str) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            state: SessionState::Idle,
            connection_token: None,
            key: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Page where the user approves this session
    pub fn authorization_url(&self, authorize_url: &str, application: &str) -> String {
        format!("{}?id={}&application={}", authorize_url, self.session_id, application)
    }

    fn request(&self, token: Option<&str>) -> String {
        let request = SsoRequest {
            id: &self.session_id,
            appid: &self.app_id,
            token,
            protocol: 2,
        };
        // Serializing borrowed strings and an integer cannot fail
        serde_json::to_string(&request).unwrap_or_default()
    }

    /// The opening frame
    pub fn start(&mut self) -> String {
        self.state = SessionState::AwaitingToken;
        self.request(None)
    }

    fn succeed(&mut self, key: String) -> Step {
        self.key = Some(key.clone());
        self.state = SessionState::Authenticated;
        Step::Done(Ok(key))
    }

    fn fail(&mut self, error: AuthError) -> Step {
        self.state = SessionState::Failed;
        Step::Done(Err(error))
    }

    /// Feed one text frame
    pub fn on_text(&mut self, text: &str) -> Step {
        if self.state.is_terminal() {
            return Step::Continue;
        }

        let json: Value = match serde_json::from_str(text) {
            Ok(json) => json,
            Err(e) => {
                let trimmed = text.trim();
                if trimmed.len() > MIN_KEY_LEN && !trimmed.contains('{') && !trimmed.contains("error")
                {
                    debug!("Accepting plain-text frame as API key");
                    return self.succeed(trimmed.to_string());
                }
                warn!("Ignoring unparseable SSO frame: {}", e);
                return Step::Continue;
            }
        };

        if let Some(key) = key_like(&json, &["api_key"]) {
            return self.succeed(key);
        }

        match json.get("success").and_then(Value::as_bool) {
            Some(false) => {
                let error = json
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");
                self.fail(AuthError::Failed(error.to_string()))
            }
            Some(true) => {
                let data = json.get("data").unwrap_or(&Value::Null);
                if let Some(key) = key_like(data, KEY_FIELDS) {
                    return self.succeed(key);
                }
                let token = data.get("connection_token").and_then(Value::as_str);
                match token {
                    Some(token) if self.connection_token.is_none() => {
                        debug!("Received connection token");
                        self.connection_token = Some(token.to_string());
                        self.state = SessionState::AwaitingKey;
                        Step::Send(self.request(Some(token)))
                    }
                    _ => Step::Continue,
                }
            }
            None => {
                debug!("SSO frame without success flag: {}", text);
                Step::Continue
            }
        }
    }

    /// The socket closed
    pub fn on_close(&mut self) -> Step {
        match self.key.clone() {
            Some(key) => Step::Done(Ok(key)),
            None => self.fail(AuthError::ConnectionClosed),
        }
    }

    pub fn on_timeout(&mut self) -> AuthError {
        self.state = SessionState::Failed;
        AuthError::TimedOut
    }
}

/// First string longer than the minimum under one of `fields`
fn key_like(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| {
        value
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| s.len() > MIN_KEY_LEN)
            .map(str::to_string)
    })
}

/// Drive a handshake over `transport` until it finishes or `timeout` passes.
///
/// `after_request` runs once the opening frame is sent.
pub async fn run_handshake<T, F>(
    handshake: &mut Handshake,
    transport: &mut T,
    timeout: Duration,
    after_request: F,
) -> Result<String, AuthError>
where
    T: SsoTransport + ?Sized,
    F: FnOnce(),
{
    let exchange = async {
        transport.send(handshake.start()).await?;
        after_request();
        loop {
            let step = match transport.recv().await {
                Some(Ok(SsoFrame::Text(text))) => handshake.on_text(&text),
                Some(Ok(SsoFrame::Close)) | None => handshake.on_close(),
                Some(Err(e)) => return Err(e),
            };
            match step {
                Step::Continue => {}
                Step::Send(frame) => transport.send(frame).await?,
                Step::Done(result) => return result,
            }
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(handshake.on_timeout()),
    }
}

/// Endpoints and identity used for SSO
#[derive(Debug, Clone)]
pub struct SsoConfig {
    pub sso_url: String,
    pub authorize_url: String,
    /// Application id sent in socket frames
    pub app_id: String,
    /// Application slug in the authorization URL
    pub application: String,
    pub timeout: Duration,
    /// REST root used to validate a stored key
    pub api_base: String,
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            sso_url: SSO_URL.to_string(),
            authorize_url: AUTHORIZE_URL.to_string(),
            app_id: "Vortex".to_string(),
            application: "vortex".to_string(),
            timeout: Duration::from_secs(5 * 60),
            api_base: API_BASE_URL.to_string(),
        }
    }
}

/// Holds the API key for the process
pub struct AuthenticationSession {
    config: SsoConfig,
    store: SettingsFile,
    opener: Arc<dyn UrlOpener>,
    key: Option<String>,
    /// Whether `key` is the one persisted in `store`
    key_is_stored: bool,
}

impl AuthenticationSession {
    /// Session seeded with the key persisted in `store`, not yet validated
    pub fn new(config: SsoConfig, store: SettingsFile, opener: Arc<dyn UrlOpener>) -> Self {
        let key = store.api_key();
        Self {
            config,
            store,
            opener,
            key_is_stored: key.is_some(),
            key,
        }
    }

    pub fn config(&self) -> &SsoConfig {
        &self.config
    }

    pub fn is_authenticated(&self) -> bool {
        self.key.is_some()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Use a key supplied out of band (environment, flag) for this process only
    pub fn use_key(&mut self, key: &str) {
        self.key = Some(key.to_string());
        self.key_is_stored = false;
    }

    /// Validate the current key. A rejected stored key is cleared; a
    /// rejected out-of-band key is dropped in favor of the stored one. On
    /// network errors the key is kept unvalidated.
    pub async fn restore(&mut self) {
        while let Some(key) = self.key.clone() {
            if self.key_accepted(&key).await {
                return;
            }
            if self.key_is_stored {
                self.clear_silently();
                return;
            }
            info!("Supplied API key rejected, falling back to the stored key");
            self.key = self.store.api_key();
            self.key_is_stored = true;
        }
    }

    /// False only when the API rejects the key
    async fn key_accepted(&self, key: &str) -> bool {
        let client = match NexusClient::with_base_url(key, &self.config.api_base) {
            Ok(client) => client,
            Err(e) => {
                warn!("API key is unusable: {:#}", e);
                return false;
            }
        };

        match client.validate().await {
            Ok(_) => {
                debug!("API key is valid");
                true
            }
            Err(FetchError::Network(e)) | Err(FetchError::Timeout(e)) => {
                debug!("Could not validate API key ({}), keeping it", e);
                true
            }
            Err(e) => {
                info!("API key rejected ({})", e);
                false
            }
        }
    }

    fn clear_silently(&mut self) {
        self.key = None;
        if let Err(e) = self.store.clear_api_key() {
            warn!("Could not clear stored API key: {:#}", e);
        }
    }

    /// Run a fresh handshake against the configured SSO server
    pub async fn authenticate(&mut self) -> Result<String, AuthError> {
        let mut transport = WsTransport::connect(&self.config.sso_url).await?;
        self.authenticate_with(&mut transport).await
    }

    /// Run a fresh handshake over an existing transport
    pub async fn authenticate_with<T: SsoTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<String, AuthError> {
        let mut handshake = Handshake::new(&self.config.app_id);
        let url = handshake.authorization_url(&self.config.authorize_url, &self.config.application);

        let opener = self.opener.clone();
        let result = run_handshake(&mut handshake, transport, self.config.timeout, || {
            info!("Authorize soulsfetch in your browser: {}", url);
            if let Err(e) = opener.open(&url) {
                warn!("Could not open browser ({}); open the URL above manually", e);
            }
        })
        .await;

        let key = result?;
        self.store
            .save_api_key(&key)
            .map_err(|e| AuthError::Store(format!("{:#}", e)))?;
        self.key = Some(key.clone());
        self.key_is_stored = true;
        info!("Authenticated with Nexus Mods");
        Ok(key)
    }

    /// Forget the key, in memory and on disk
    pub fn logout(&mut self) -> Result<(), AuthError> {
        self.key = None;
        self.key_is_stored = false;
        self.store
            .clear_api_key()
            .map_err(|e| AuthError::Store(format!("{:#}", e)))
    }
}
