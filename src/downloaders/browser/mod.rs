//! Browser-driven downloads for file lockers without an API
//!
//! A [`BrowserHost`] opens one page per download. Its callbacks arrive as
//! [`BrowserEvent`]s on an mpsc channel and are handled by a per-call
//! session. Navigation to the direct file link is intercepted the first time
//! it is seen and the file is fetched with a plain HTTP request instead;
//! meanwhile a UI step tries to click the page's download control.

mod page;

pub use page::PageBrowser;

use crate::error::FetchError;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::http::{check_status, stream_to_file, ProgressCallback};
use super::Fetched;

pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8";

/// Host marker of the locker this downloader targets
pub const MEDIAFIRE_HOST: &str = "mediafire.com";

/// Selector guesses for the download control, tried in order
pub const DOWNLOAD_SELECTORS: &[&str] = &[
    "#downloadButton",
    "a.input[aria-label='Download file']",
    "a.input[href*='download']",
    ".download_link a.input",
    "a.input[download]",
    "a[class*='download']",
    ".popsok",
    "a.retry",
    "#download_link",
    ".download-button",
    "[data-testid='download-button']",
];

/// Callbacks a browser host reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEvent {
    NavigationStarting { url: String },
    DomContentLoaded { url: String },
    NewWindowRequested { url: String },
    DownloadStarting { url: String, path: PathBuf },
    DownloadProgress { received: u64, total: Option<u64> },
    DownloadCompleted { path: PathBuf },
    DownloadInterrupted { reason: String },
}

/// Answer of the navigation handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Proceed,
    Cancel,
}

/// Called synchronously by the host before every navigation
pub type NavigationHandler = Arc<dyn Fn(&str) -> Navigation + Send + Sync>;

/// Something that can open pages
#[async_trait]
pub trait BrowserHost: Send + Sync {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<BrowserEvent>,
        on_navigate: NavigationHandler,
    ) -> Result<Arc<dyn BrowserPage>, FetchError>;
}

/// One open page
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), FetchError>;

    /// Whether the current document shows a countdown or waiting screen
    async fn is_waiting_page(&self) -> bool;

    /// Click the first element matching `selector`. False if nothing was clicked.
    async fn click(&self, selector: &str) -> bool;

    /// Click the first clickable element mentioning `needle` in its text,
    /// href, class or id. Returns a description of what was clicked.
    async fn click_matching(&self, needle: &str) -> Option<String>;

    async fn close(&self);
}

/// Delays of the scripted UI step
#[derive(Debug, Clone, Copy)]
pub struct BrowserTimings {
    /// Wait after DOM load before touching the page
    pub dom_settle: Duration,
    /// Extra wait when a countdown page is detected
    pub waiting_page: Duration,
    /// Wait after a successful click
    pub after_click: Duration,
    /// Overall budget for one download
    pub overall: Duration,
}

impl Default for BrowserTimings {
    fn default() -> Self {
        Self {
            dom_settle: Duration::from_secs(2),
            waiting_page: Duration::from_secs(10),
            after_click: Duration::from_secs(3),
            overall: Duration::from_secs(10 * 60),
        }
    }
}

/// Recognizes the direct file link and fires at most once per session
struct Interceptor {
    host_marker: String,
    expected_name: String,
    latch: AtomicBool,
    fetch_tx: mpsc::UnboundedSender<String>,
}

impl Interceptor {
    fn is_file_link(&self, url: &str) -> bool {
        let url = url.to_lowercase();
        url.contains("download")
            && url.contains(&self.host_marker)
            && (url.contains(&self.expected_name)
                || url.ends_with(".exe")
                || url.ends_with(".zip"))
    }

    fn on_navigate(&self, url: &str) -> Navigation {
        if !self.is_file_link(url) {
            return Navigation::Proceed;
        }
        if self.latch.swap(true, Ordering::SeqCst) {
            debug!("Ignoring repeated file navigation: {}", url);
        } else {
            info!("Intercepted file link: {}", url);
            let _ = self.fetch_tx.send(url.to_string());
        }
        Navigation::Cancel
    }

    fn fired(&self) -> bool {
        self.latch.load(Ordering::SeqCst)
    }
}

type Completion = Arc<Mutex<Option<oneshot::Sender<Result<Fetched, FetchError>>>>>;

fn complete(completion: &Completion, result: Result<Fetched, FetchError>) {
    let sender = completion.lock().ok().and_then(|mut slot| slot.take());
    if let Some(tx) = sender {
        let _ = tx.send(result);
    }
}

/// Downloads from locker pages through a [`BrowserHost`]
pub struct BrowserDownloader {
    host: Arc<dyn BrowserHost>,
    client: reqwest::Client,
    host_marker: String,
    timings: BrowserTimings,
}

impl BrowserDownloader {
    pub fn new(host: Arc<dyn BrowserHost>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));

        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(headers)
            .cookie_store(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            host,
            client,
            host_marker: MEDIAFIRE_HOST.to_string(),
            timings: BrowserTimings::default(),
        })
    }

    /// Match direct links on another host
    pub fn with_host_marker(mut self, marker: &str) -> Self {
        self.host_marker = marker.to_lowercase();
        self
    }

    pub fn with_timings(mut self, timings: BrowserTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Drive one page until the file lands at `output_dir/expected_name`.
    pub async fn fetch(
        &self,
        url: &str,
        expected_name: &str,
        output_dir: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<Fetched, FetchError> {
        let target = output_dir.join(expected_name);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let interceptor = Arc::new(Interceptor {
            host_marker: self.host_marker.clone(),
            expected_name: expected_name.to_lowercase(),
            latch: AtomicBool::new(false),
            fetch_tx,
        });
        let handler: NavigationHandler = {
            let interceptor = interceptor.clone();
            Arc::new(move |url: &str| interceptor.on_navigate(url))
        };

        let page = self.host.open(events_tx, handler).await?;
        let session = BrowserSession {
            page: page.clone(),
            client: self.client.clone(),
            interceptor,
            completion: Arc::new(Mutex::new(Some(done_tx))),
            target: target.clone(),
            timings: self.timings,
            progress,
        };

        info!("Opening {} in browser session", url);
        let pump = tokio::spawn(session.run(url.to_string(), events_rx, fetch_rx));

        let result = match tokio::time::timeout(self.timings.overall, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FetchError::Browser("session ended without a result".into())),
            Err(_) => {
                if let Ok(meta) = tokio::fs::metadata(&target).await {
                    info!("Timed out, but {} is on disk", target.display());
                    Ok(Fetched {
                        path: target.clone(),
                        bytes: meta.len(),
                        total: Some(meta.len()),
                    })
                } else {
                    Err(FetchError::Timeout("Browser download".into()))
                }
            }
        };

        pump.abort();
        page.close().await;
        result
    }
}

/// State of one browser download
struct BrowserSession {
    page: Arc<dyn BrowserPage>,
    client: reqwest::Client,
    interceptor: Arc<Interceptor>,
    completion: Completion,
    target: PathBuf,
    timings: BrowserTimings,
    progress: Option<ProgressCallback>,
}

impl BrowserSession {
    async fn run(
        self,
        start_url: String,
        mut events: mpsc::UnboundedReceiver<BrowserEvent>,
        mut fetches: mpsc::UnboundedReceiver<String>,
    ) {
        // Dropping the set on abort cancels everything this session started
        let mut tasks = JoinSet::new();
        let mut native_target: Option<PathBuf> = None;

        {
            let page = self.page.clone();
            let completion = self.completion.clone();
            tasks.spawn(async move {
                if let Err(e) = page.navigate(&start_url).await {
                    complete(&completion, Err(e));
                }
            });
        }

        loop {
            tokio::select! {
                Some(url) = fetches.recv() => {
                    let client = self.client.clone();
                    let target = self.target.clone();
                    let progress = self.progress.clone();
                    let completion = self.completion.clone();
                    tasks.spawn(async move {
                        let result = fallback_fetch(&client, &url, &target, progress.as_ref()).await;
                        complete(&completion, result);
                    });
                }
                Some(event) = events.recv() => match event {
                    BrowserEvent::NavigationStarting { url } => debug!("Navigating: {}", url),
                    BrowserEvent::DomContentLoaded { url } => {
                        debug!("DOM loaded: {}", url);
                        if !self.interceptor.fired() {
                            tasks.spawn(ui_step(
                                self.page.clone(),
                                self.interceptor.clone(),
                                self.completion.clone(),
                                self.timings,
                            ));
                        }
                    }
                    BrowserEvent::NewWindowRequested { url } => {
                        debug!("Redirecting new window into the same page: {}", url);
                        let page = self.page.clone();
                        tasks.spawn(async move {
                            if let Err(e) = page.navigate(&url).await {
                                warn!("Redirected navigation failed: {}", e);
                            }
                        });
                    }
                    BrowserEvent::DownloadStarting { url, path } => {
                        debug!("Native download of {} to {}", url, path.display());
                        native_target = Some(path);
                    }
                    BrowserEvent::DownloadProgress { received, total } => {
                        if let Some(callback) = &self.progress {
                            callback(received, total);
                        }
                    }
                    BrowserEvent::DownloadCompleted { path } => {
                        let path = native_target.take().unwrap_or(path);
                        let bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                        complete(&self.completion, Ok(Fetched { path, bytes, total: Some(bytes) }));
                    }
                    BrowserEvent::DownloadInterrupted { reason } => {
                        debug!("Native download interrupted ({}), ignoring", reason);
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                else => break,
            }
        }
    }
}

/// Fetch the intercepted link directly with browser-like headers
async fn fallback_fetch(
    client: &reqwest::Client,
    url: &str,
    target: &Path,
    progress: Option<&ProgressCallback>,
) -> Result<Fetched, FetchError> {
    info!("Fetching intercepted link over HTTP");
    let response = client.get(url).send().await?;
    let response = check_status(response, url).await?;
    stream_to_file(response, target, progress).await
}

/// Find and click the download control once the page has settled
async fn ui_step(
    page: Arc<dyn BrowserPage>,
    interceptor: Arc<Interceptor>,
    completion: Completion,
    timings: BrowserTimings,
) {
    tokio::time::sleep(timings.dom_settle).await;
    if interceptor.fired() {
        return;
    }

    if page.is_waiting_page().await {
        info!("Waiting page detected, giving it {:?}", timings.waiting_page);
        tokio::time::sleep(timings.waiting_page).await;
    }

    for selector in DOWNLOAD_SELECTORS {
        if interceptor.fired() {
            return;
        }
        if page.click(selector).await {
            debug!("Clicked download control via '{}'", selector);
            tokio::time::sleep(timings.after_click).await;
            return;
        }
    }

    if let Some(clicked) = page.click_matching("download").await {
        debug!("Clicked {} found by text scan", clicked);
        tokio::time::sleep(timings.after_click).await;
        return;
    }

    if !interceptor.fired() {
        complete(
            &completion,
            Err(FetchError::Browser("Could not find a download button".into())),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Host that replays navigations into the handler without any page content
    struct ScriptedHost {
        /// URLs pushed through the navigation handler on the first navigate
        navigations: Vec<String>,
        events: Vec<BrowserEvent>,
    }

    struct ScriptedPage {
        navigations: Vec<String>,
        events: Vec<BrowserEvent>,
        tx: mpsc::UnboundedSender<BrowserEvent>,
        handler: NavigationHandler,
    }

    #[async_trait]
    impl BrowserHost for ScriptedHost {
        async fn open(
            &self,
            events: mpsc::UnboundedSender<BrowserEvent>,
            on_navigate: NavigationHandler,
        ) -> Result<Arc<dyn BrowserPage>, FetchError> {
            Ok(Arc::new(ScriptedPage {
                navigations: self.navigations.clone(),
                events: self.events.clone(),
                tx: events,
                handler: on_navigate,
            }))
        }
    }

    #[async_trait]
    impl BrowserPage for ScriptedPage {
        async fn navigate(&self, url: &str) -> Result<(), FetchError> {
            let _ = self.tx.send(BrowserEvent::NavigationStarting { url: url.into() });
            for nav in &self.navigations {
                (self.handler)(nav);
            }
            for event in &self.events {
                let _ = self.tx.send(event.clone());
            }
            Ok(())
        }

        async fn is_waiting_page(&self) -> bool {
            false
        }

        async fn click(&self, _selector: &str) -> bool {
            false
        }

        async fn click_matching(&self, _needle: &str) -> Option<String> {
            None
        }

        async fn close(&self) {}
    }

    fn fast() -> BrowserTimings {
        BrowserTimings {
            dom_settle: Duration::from_millis(10),
            waiting_page: Duration::from_millis(10),
            after_click: Duration::from_millis(10),
            overall: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_interceptor_recognizes_file_links() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let interceptor = Interceptor {
            host_marker: "mediafire.com".into(),
            expected_name: "darksoulsiii.exe".into(),
            latch: AtomicBool::new(false),
            fetch_tx: tx,
        };

        let page = "https://www.mediafire.com/file/2popj38c55nbhx2/DarkSoulsIII.exe/file";
        assert_eq!(interceptor.on_navigate(page), Navigation::Proceed);

        let file = "https://download1234.mediafire.com/abc/DarkSoulsIII.exe";
        assert_eq!(interceptor.on_navigate(file), Navigation::Cancel);
        assert_eq!(interceptor.on_navigate(file), Navigation::Cancel);
        assert_eq!(rx.try_recv().unwrap(), file);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeated_navigation_fetches_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/download/fix/DarkSoulsIII.exe"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"MZ-binary".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let file_url = format!("{}/download/fix/DarkSoulsIII.exe", server.uri());
        let host = ScriptedHost {
            navigations: vec![file_url.clone(), file_url],
            events: vec![],
        };
        let downloader = BrowserDownloader::new(Arc::new(host))
            .unwrap()
            .with_host_marker("127.0.0.1")
            .with_timings(fast());

        let dir = tempfile::tempdir().unwrap();
        let fetched = downloader
            .fetch("https://locker.test/file/DarkSoulsIII.exe/file", "DarkSoulsIII.exe", dir.path(), None)
            .await
            .unwrap();

        assert_eq!(fetched.path, dir.path().join("DarkSoulsIII.exe"));
        assert_eq!(std::fs::read(&fetched.path).unwrap(), b"MZ-binary");
        // Drop verifies expect(1)
        drop(server);
    }

    #[tokio::test]
    async fn test_no_download_control_fails() {
        let host = ScriptedHost {
            navigations: vec![],
            events: vec![BrowserEvent::DomContentLoaded { url: "https://locker.test/".into() }],
        };
        let downloader = BrowserDownloader::new(Arc::new(host))
            .unwrap()
            .with_timings(fast());

        let dir = tempfile::tempdir().unwrap();
        let err = downloader
            .fetch("https://locker.test/", "fix.exe", dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Browser(_)));
    }

    #[tokio::test]
    async fn test_native_download_completes_session() {
        let dir = tempfile::tempdir().unwrap();
        let saved = dir.path().join("fix.exe");
        std::fs::write(&saved, b"native").unwrap();

        let host = ScriptedHost {
            navigations: vec![],
            events: vec![
                BrowserEvent::DownloadInterrupted { reason: "network".into() },
                BrowserEvent::DownloadCompleted { path: saved.clone() },
            ],
        };
        let downloader = BrowserDownloader::new(Arc::new(host))
            .unwrap()
            .with_timings(fast());

        let fetched = downloader
            .fetch("https://locker.test/", "fix.exe", dir.path(), None)
            .await
            .unwrap();
        assert_eq!(fetched.path, saved);
        assert_eq!(fetched.bytes, 6);
    }

    #[tokio::test]
    async fn test_timeout_during_fallback_fetch_is_not_success() {
        // Announces 1000 bytes, sends 10, then stalls
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n0123456789")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let host = ScriptedHost {
            navigations: vec![format!("http://{}/download/fix.exe", addr)],
            events: vec![],
        };
        let downloader = BrowserDownloader::new(Arc::new(host))
            .unwrap()
            .with_host_marker("127.0.0.1")
            .with_timings(BrowserTimings {
                overall: Duration::from_millis(500),
                ..fast()
            });

        let dir = tempfile::tempdir().unwrap();
        let err = downloader
            .fetch("https://locker.test/", "fix.exe", dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
        assert!(!dir.path().join("fix.exe").exists());

        // The aborted writer drops its part file
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_deleted_locker_file_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file/abc/fix.exe/file"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<p>This file is no longer available.</p>",
                "text/html",
            ))
            .mount(&server)
            .await;

        let host = PageBrowser::new().unwrap();
        let downloader = BrowserDownloader::new(Arc::new(host))
            .unwrap()
            .with_host_marker("127.0.0.1")
            .with_timings(fast());

        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = downloader
            .fetch(&format!("{}/file/abc/fix.exe/file", server.uri()), "fix.exe", dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_with_file_on_disk_is_success() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fix.exe"), b"already").unwrap();

        let host = ScriptedHost { navigations: vec![], events: vec![] };
        let downloader = BrowserDownloader::new(Arc::new(host))
            .unwrap()
            .with_timings(BrowserTimings {
                overall: Duration::from_millis(50),
                ..fast()
            });

        let fetched = downloader
            .fetch("https://locker.test/", "fix.exe", dir.path(), None)
            .await
            .unwrap();
        assert_eq!(fetched.bytes, 7);
    }
}
