//! SSO socket transport and browser launching

use crate::error::AuthError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// A frame received from the SSO server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsoFrame {
    Text(String),
    Close,
}

/// Bidirectional text-frame channel to the SSO server
#[async_trait]
pub trait SsoTransport: Send {
    async fn send(&mut self, text: String) -> Result<(), AuthError>;

    /// Next frame, or `None` once the stream has ended
    async fn recv(&mut self) -> Option<Result<SsoFrame, AuthError>>;
}

/// WebSocket transport over tokio-tungstenite
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, AuthError> {
        info!(url = %url, "Connecting to SSO server");

        let uri: tungstenite::http::Uri = url
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| AuthError::Transport(e.to_string()))?;
        let request = ClientRequestBuilder::new(uri)
            .with_header("User-Agent", concat!("soulsfetch/", env!("CARGO_PKG_VERSION")));

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        debug!("SSO socket connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl SsoTransport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), AuthError> {
        self.stream
            .send(tungstenite::Message::text(text))
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<SsoFrame, AuthError>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(SsoFrame::Text(text.to_string())));
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    if let Some(ref cf) = frame {
                        debug!(code = %cf.code, reason = %cf.reason, "SSO close frame received");
                    }
                    return Some(Ok(SsoFrame::Close));
                }
                Ok(_) => {
                    // Binary, Ping, Pong -- tungstenite answers pings itself
                }
                Err(e) => return Some(Err(AuthError::Transport(e.to_string()))),
            }
        }
    }
}

/// Opens a URL for the user
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Opens URLs with a desktop command (`xdg-open` by default)
#[derive(Debug, Clone)]
pub struct CommandOpener {
    command: String,
}

impl CommandOpener {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for CommandOpener {
    fn default() -> Self {
        Self::new("xdg-open")
    }
}

impl UrlOpener for CommandOpener {
    fn open(&self, url: &str) -> std::io::Result<()> {
        debug!("Opening {} with {}", url, self.command);
        std::process::Command::new(&self.command)
            .arg(url)
            .spawn()
            .map(|_| ())
    }
}
