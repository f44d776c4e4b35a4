//! Download handlers for each asset source
//!
//! Supports the Nexus Mods API, plain HTTP links and locker pages that need a
//! browser. Dispatch is a match over [`AssetSource`].

pub mod browser;
mod http;
mod nexus;

pub use browser::{BrowserDownloader, BrowserHost, BrowserTimings, PageBrowser};
pub use http::{download_file, stream_to_file, HttpClient, ProgressCallback};
pub use nexus::{
    select_file, FileQuery, NexusClient, NexusFile, NexusRateLimits, NexusUserInfo, API_BASE_URL,
};

use crate::catalog::{AssetDescriptor, AssetSource};
use crate::error::FetchError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// A file that landed on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub path: PathBuf,
    pub bytes: u64,
    /// Size announced by the server, if any
    pub total: Option<u64>,
}

/// The downloader for every source kind
pub struct Downloaders {
    http: HttpClient,
    browser: BrowserDownloader,
}

impl Downloaders {
    /// Downloaders with the HTTP page host for browser sources
    pub fn new() -> anyhow::Result<Self> {
        let host: Arc<dyn BrowserHost> = Arc::new(PageBrowser::new()?);
        Ok(Self::with_browser(HttpClient::new()?, BrowserDownloader::new(host)?))
    }

    pub fn with_browser(http: HttpClient, browser: BrowserDownloader) -> Self {
        Self { http, browser }
    }

    /// Fetch one asset into `output_dir`.
    ///
    /// API sources need a `nexus` client; without one they fail with
    /// [`FetchError::NotAuthenticated`].
    pub async fn fetch(
        &self,
        descriptor: &AssetDescriptor,
        output_dir: &Path,
        nexus: Option<&NexusClient>,
        progress: Option<ProgressCallback>,
    ) -> Result<Fetched, FetchError> {
        info!("Fetching {} ({})", descriptor.key, descriptor.source.kind());
        match &descriptor.source {
            AssetSource::Api {
                domain,
                mod_id,
                name_pattern,
                category,
            } => {
                let client = nexus.ok_or(FetchError::NotAuthenticated)?;
                let query = FileQuery {
                    domain,
                    mod_id: *mod_id,
                    name_pattern: name_pattern.as_deref(),
                    category: *category,
                };
                client
                    .fetch(&self.http, query, &descriptor.file_name, output_dir, progress.as_ref())
                    .await
            }
            AssetSource::Direct { url } => {
                let target = output_dir.join(&descriptor.file_name);
                download_file(&self.http, url, &target, progress.as_ref()).await
            }
            AssetSource::Browser { url } => {
                self.browser
                    .fetch(url, &descriptor.file_name, output_dir, progress)
                    .await
            }
        }
    }
}
