//! HTTP + HTML page host
//!
//! Loads documents with reqwest and inspects them with scraper. Scripts are
//! not executed: a click follows the element's `href`, and the common
//! `window.location.href = '...'` redirect is recognized in inline scripts.
//! Elements without a link cannot be clicked.

use crate::error::FetchError;
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::{redirect, Url};
use scraper::{ElementRef, Html, Selector};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{
    BrowserEvent, BrowserHost, BrowserPage, Navigation, NavigationHandler, BROWSER_USER_AGENT,
};

const MAX_REDIRECTS: usize = 10;

const WAITING_SELECTORS: &str =
    ".countdown, #countdown, [class*='countdown'], .waiting, #waiting, .timer, #timer, [class*='timer']";

/// Locker pages shown for removed files
const DEAD_FILE_MARKERS: &[&str] = &["Invalid or Deleted File", "This file is no longer available"];

const CLICKABLE_SELECTOR: &str = "a, button, input[type=button], input[type=submit]";

static LOCATION_RE: OnceLock<Regex> = OnceLock::new();

/// Page host backed by plain HTTP requests
pub struct PageBrowser {
    client: reqwest::Client,
}

impl PageBrowser {
    pub fn new() -> anyhow::Result<Self> {
        // Redirects are walked by hand so every hop passes the navigation handler
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .cookie_store(true)
            .redirect(redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BrowserHost for PageBrowser {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<BrowserEvent>,
        on_navigate: NavigationHandler,
    ) -> Result<Arc<dyn BrowserPage>, FetchError> {
        Ok(Arc::new(HtmlPage {
            client: self.client.clone(),
            events,
            on_navigate,
            document: Mutex::new(None),
        }))
    }
}

struct LoadedDocument {
    url: Url,
    html: String,
}

struct HtmlPage {
    client: reqwest::Client,
    events: mpsc::UnboundedSender<BrowserEvent>,
    on_navigate: NavigationHandler,
    document: Mutex<Option<LoadedDocument>>,
}

impl HtmlPage {
    fn emit(&self, event: BrowserEvent) {
        let _ = self.events.send(event);
    }

    /// Returns false when the handler cancelled the navigation
    fn start_navigation(&self, url: &str) -> bool {
        self.emit(BrowserEvent::NavigationStarting { url: url.to_string() });
        (self.on_navigate)(url) == Navigation::Proceed
    }

    /// Current URL and HTML, if a document is loaded
    async fn snapshot(&self) -> Option<(Url, String)> {
        self.document
            .lock()
            .await
            .as_ref()
            .map(|d| (d.url.clone(), d.html.clone()))
    }

    /// Follow a link found on the current document
    async fn follow(&self, base: &Url, link: Link) -> bool {
        let Ok(url) = base.join(&link.href) else {
            debug!("Unusable link: {}", link.href);
            return false;
        };
        if link.new_window {
            self.emit(BrowserEvent::NewWindowRequested { url: url.to_string() });
            return true;
        }
        if let Err(e) = self.navigate(url.as_str()).await {
            debug!("Navigation after click failed: {}", e);
        }
        true
    }
}

#[async_trait]
impl BrowserPage for HtmlPage {
    async fn navigate(&self, url: &str) -> Result<(), FetchError> {
        let mut current =
            Url::parse(url).map_err(|e| FetchError::Browser(format!("Bad URL {}: {}", url, e)))?;

        for _ in 0..=MAX_REDIRECTS {
            if !self.start_navigation(current.as_str()) {
                return Ok(());
            }

            let response = self.client.get(current.clone()).send().await?;

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|loc| current.join(loc).ok());
                match location {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => return Err(FetchError::Browser("Redirect without location".into())),
                }
            }

            let is_html = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.contains("text/html"));
            if !is_html {
                // No native downloads here; the interceptor's fetch takes over
                self.emit(BrowserEvent::DownloadInterrupted {
                    reason: format!("{} is not a page", current),
                });
                return Ok(());
            }

            let html = response.text().await?;
            if let Some(marker) = dead_file_marker(&html) {
                return Err(FetchError::NotFound(format!("{} ({})", current, marker)));
            }
            *self.document.lock().await = Some(LoadedDocument {
                url: current.clone(),
                html,
            });
            self.emit(BrowserEvent::DomContentLoaded { url: current.to_string() });
            return Ok(());
        }

        Err(FetchError::Browser(format!("Too many redirects from {}", url)))
    }

    async fn is_waiting_page(&self) -> bool {
        match self.snapshot().await {
            Some((_, html)) => has_waiting_marker(&html),
            None => false,
        }
    }

    async fn click(&self, selector: &str) -> bool {
        let Some((base, html)) = self.snapshot().await else {
            return false;
        };
        match link_for_selector(&html, selector) {
            Some(link) => self.follow(&base, link).await,
            None => false,
        }
    }

    async fn click_matching(&self, needle: &str) -> Option<String> {
        let (base, html) = self.snapshot().await?;
        let (description, link) = scan_for_link(&html, needle)?;
        self.follow(&base, link).await.then_some(description)
    }

    async fn close(&self) {
        *self.document.lock().await = None;
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Link {
    href: String,
    new_window: bool,
}

fn link_of(element: ElementRef<'_>) -> Option<Link> {
    let value = element.value();
    let href = value.attr("href")?.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    Some(Link {
        href: href.to_string(),
        new_window: value.attr("target") == Some("_blank"),
    })
}

fn dead_file_marker(html: &str) -> Option<&'static str> {
    DEAD_FILE_MARKERS.iter().copied().find(|m| html.contains(m))
}

fn has_waiting_marker(html: &str) -> bool {
    let document = Html::parse_document(html);
    Selector::parse(WAITING_SELECTORS)
        .map(|sel| document.select(&sel).next().is_some())
        .unwrap_or(false)
}

fn link_for_selector(html: &str, selector: &str) -> Option<Link> {
    let selector = Selector::parse(selector).ok()?;
    let document = Html::parse_document(html);
    document.select(&selector).find_map(link_of)
}

/// Free-text scan of clickable elements, then script redirects
fn scan_for_link(html: &str, needle: &str) -> Option<(String, Link)> {
    let needle = needle.to_lowercase();
    let document = Html::parse_document(html);

    if let Ok(selector) = Selector::parse(CLICKABLE_SELECTOR) {
        for element in document.select(&selector) {
            let value = element.value();
            let text = element.text().collect::<String>();
            let mentions = |attr: &str| {
                value
                    .attr(attr)
                    .is_some_and(|v| v.to_lowercase().contains(&needle))
            };
            let matches = text.to_lowercase().contains(&needle)
                || mentions("href")
                || mentions("class")
                || mentions("id")
                || value.attr("download").is_some();
            if !matches {
                continue;
            }
            if let Some(link) = link_of(element) {
                let description = format!("<{}> '{}'", value.name(), text.trim());
                return Some((description, link));
            }
        }
    }

    let location_re = LOCATION_RE.get_or_init(|| {
        Regex::new(r#"window\.location\.href\s*=\s*['"]([^'"]+)['"]"#).unwrap()
    });
    location_re.captures(html).map(|caps| {
        (
            "script redirect".to_string(),
            Link {
                href: caps[1].to_string(),
                new_window: false,
            },
        )
    })
}
