//! Error taxonomy for the acquisition pipeline.
//!
//! Per-asset errors ([`FetchError`], [`ArchiveError`]) are converted into
//! report entries by the orchestrator. Only [`OrchestratorError`] aborts a
//! whole pass.

use std::path::PathBuf;

/// SSO handshake failures. Each retry must start a fresh session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication failed: {0}")]
    Failed(String),

    #[error("Authentication failed: connection closed")]
    ConnectionClosed,

    #[error("Authentication timed out - please try again")]
    TimedOut,

    #[error("SSO transport error: {0}")]
    Transport(String),

    #[error("Could not persist API key: {0}")]
    Store(String),
}

/// Failure to fetch a single asset.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// HTTP 403 from the mod host. Never retried; the user has to download
    /// the file by hand.
    #[error(
        "Download requires Nexus Mods Premium membership. Please download manually:\n\
         • File: {file_name}\n\
         • URL: {mod_url}\n\
         • Save to: {}",
        target.display()
    )]
    PremiumRequired {
        mod_url: String,
        file_name: String,
        target: PathBuf,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Nexus API rate limit hit (429)")]
    RateLimited,

    #[error("Not authenticated with Nexus Mods. Please authenticate first.")]
    NotAuthenticated,

    #[error("HTTP {status} - {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("Browser automation failed: {0}")]
    Browser(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_premium_required(&self) -> bool {
        matches!(self, FetchError::PremiumRequired { .. })
    }

    /// Only transient network failures are worth retrying, and this layer
    /// never does so itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout("HTTP request".to_string())
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive format error: {0}")]
    Format(#[from] zip::result::ZipError),

    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal errors that abort a whole acquisition pass.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Cannot create or write output folder {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown game: {0}")]
    UnknownGame(String),
}
