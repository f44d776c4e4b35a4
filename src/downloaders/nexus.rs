//! Nexus Mods REST client: file listing, file selection and download links

use crate::catalog::{nexus_mod_url, FileCategory};
use crate::error::FetchError;
use crate::paths;
use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, warn};

use super::http::{stream_to_file, truncate_url, HttpClient, ProgressCallback};
use super::Fetched;

pub const API_BASE_URL: &str = "https://api.nexusmods.com";
const AUTH_HEADER: &str = "apikey";

/// Nexus API rate limits (tracked from response headers)
#[derive(Debug, Clone)]
pub struct NexusRateLimits {
    pub hourly_limit: usize,
    pub hourly_remaining: usize,
    pub daily_limit: usize,
    pub daily_remaining: usize,
}

impl Default for NexusRateLimits {
    fn default() -> Self {
        Self {
            hourly_limit: 100,
            hourly_remaining: 100,
            daily_limit: 2500,
            daily_remaining: 2500,
        }
    }
}

impl NexusRateLimits {
    fn from_response(response: &Response) -> Option<Self> {
        let headers = response.headers();

        fn get_header<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
            headers.get(name)?.to_str().ok()?.parse().ok()
        }

        Some(Self {
            hourly_limit: get_header(headers, "X-RL-Hourly-Limit")?,
            hourly_remaining: get_header(headers, "X-RL-Hourly-Remaining")?,
            daily_limit: get_header(headers, "X-RL-Daily-Limit")?,
            daily_remaining: get_header(headers, "X-RL-Daily-Remaining")?,
        })
    }

    pub fn is_low(&self) -> bool {
        self.hourly_remaining < 10 || self.daily_remaining < 50
    }
}

/// User info from key validation
#[derive(Debug, Clone, Deserialize)]
pub struct NexusUserInfo {
    pub name: String,
    #[serde(rename = "is_premium?", default)]
    pub is_premium: bool,
    #[serde(default)]
    pub user_id: u64,
}

/// One entry of `files.json`
#[derive(Debug, Clone, Deserialize)]
pub struct NexusFile {
    pub file_id: u64,
    /// Display name shown on the files tab
    pub name: String,
    #[serde(default = "unknown_category")]
    pub category_id: FileCategory,
    #[serde(default)]
    pub uploaded_timestamp: i64,
    /// Name of the file on disk, when the API sends one
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub size_in_bytes: Option<u64>,
}

fn unknown_category() -> FileCategory {
    FileCategory::Other(0)
}

impl NexusFile {
    pub fn uploaded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.uploaded_timestamp, 0)
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<NexusFile>,
}

#[derive(Debug, Deserialize, Serialize)]
struct DownloadLink {
    #[serde(rename = "URI")]
    uri: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    short_name: String,
}

/// Which file of a mod to fetch
#[derive(Debug, Clone, Copy)]
pub struct FileQuery<'a> {
    pub domain: &'a str,
    pub mod_id: u64,
    pub name_pattern: Option<&'a str>,
    pub category: Option<FileCategory>,
}

/// Pick a file from a listing.
///
/// Without a pattern: the newest file of the category filter (Main by default).
/// With a pattern: the newest file whose display name contains it, ignoring
/// case, within the category filter if one is set.
pub fn select_file<'a>(
    files: &'a [NexusFile],
    name_pattern: Option<&str>,
    category: Option<FileCategory>,
) -> Option<&'a NexusFile> {
    match name_pattern {
        None => {
            let wanted = category.unwrap_or(FileCategory::Main);
            files
                .iter()
                .filter(|f| f.category_id == wanted)
                .max_by_key(|f| f.uploaded_timestamp)
        }
        Some(pattern) => {
            let pattern = pattern.to_lowercase();
            files
                .iter()
                .filter(|f| f.name.to_lowercase().contains(&pattern))
                .filter(|f| category.map_or(true, |c| f.category_id == c))
                .max_by_key(|f| f.uploaded_timestamp)
        }
    }
}

/// Nexus Mods API client bound to one key
pub struct NexusClient {
    client: Client,
    base_url: String,
    rate_limits: RwLock<NexusRateLimits>,
    request_count: AtomicUsize,
}

impl NexusClient {
    pub fn new(api_key: &str) -> anyhow::Result<Self> {
        Self::with_base_url(api_key, API_BASE_URL)
    }

    /// Client against another API root (mirrors, tests)
    pub fn with_base_url(api_key: &str, base_url: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTH_HEADER,
            HeaderValue::from_str(api_key).context("Invalid API key format")?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("soulsfetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limits: RwLock::new(NexusRateLimits::default()),
            request_count: AtomicUsize::new(0),
        })
    }

    pub fn rate_limits(&self) -> NexusRateLimits {
        self.rate_limits
            .read()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    /// Requests made by this client
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        self.request_count.fetch_add(1, Ordering::Relaxed);

        if let Some(limits) = NexusRateLimits::from_response(&response) {
            if limits.is_low() {
                warn!(
                    "Nexus rate limits low: hourly {}/{}, daily {}/{}",
                    limits.hourly_remaining,
                    limits.hourly_limit,
                    limits.daily_remaining,
                    limits.daily_limit
                );
            }
            if let Ok(mut current) = self.rate_limits.write() {
                *current = limits;
            }
        }

        let response = super::http::check_status(response, url).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Http {
            status: 200,
            body: format!("Unexpected response from {}: {}", truncate_url(url), e),
        })
    }

    /// Check the key. Non-success statuses surface as [`FetchError::Http`].
    pub async fn validate(&self) -> Result<NexusUserInfo, FetchError> {
        let url = format!("{}/v1/users/validate.json", self.base_url);
        let info: NexusUserInfo = self.get_json(&url).await?;
        info!("Nexus user '{}' validated (Premium: {})", info.name, info.is_premium);
        Ok(info)
    }

    pub async fn list_files(&self, domain: &str, mod_id: u64) -> Result<Vec<NexusFile>, FetchError> {
        let url = format!(
            "{}/v1/games/{}/mods/{}/files.json",
            self.base_url, domain, mod_id
        );
        let list: FileList = self.get_json(&url).await.map_err(|e| match e {
            FetchError::NotFound(_) => FetchError::NotFound(format!("Mod {} not found", mod_id)),
            other => other,
        })?;
        Ok(list.files)
    }

    pub async fn download_link(
        &self,
        domain: &str,
        mod_id: u64,
        file_id: u64,
    ) -> Result<String, FetchError> {
        let url = format!(
            "{}/v1/games/{}/mods/{}/files/{}/download_link.json",
            self.base_url, domain, mod_id, file_id
        );
        let links: Vec<DownloadLink> = self.get_json(&url).await?;
        links
            .into_iter()
            .next()
            .map(|link| {
                debug!("Using download server {} ({})", link.name, link.short_name);
                link.uri
            })
            .ok_or_else(|| FetchError::NotFound(format!("No download links for file {}", file_id)))
    }

    /// List, select, resolve the link and stream the file into `output_dir`.
    ///
    /// The file keeps the name the API reports, falling back to
    /// `expected_name`. A 403 anywhere becomes [`FetchError::PremiumRequired`].
    pub async fn fetch(
        &self,
        http: &HttpClient,
        query: FileQuery<'_>,
        expected_name: &str,
        output_dir: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<Fetched, FetchError> {
        let premium = |e: FetchError| match e {
            FetchError::Http { status: 403, .. } => FetchError::PremiumRequired {
                mod_url: nexus_mod_url(query.domain, query.mod_id),
                file_name: expected_name.to_string(),
                target: output_dir.to_path_buf(),
            },
            other => other,
        };

        let files = self
            .list_files(query.domain, query.mod_id)
            .await
            .map_err(premium)?;
        if files.is_empty() {
            return Err(FetchError::NotFound(format!(
                "No files available for mod {}",
                query.mod_id
            )));
        }

        let file = select_file(&files, query.name_pattern, query.category).ok_or_else(|| {
            FetchError::NotFound(match query.name_pattern {
                Some(p) => format!("No file matching '{}' in mod {}", p, query.mod_id),
                None => format!("No main file in mod {}", query.mod_id),
            })
        })?;
        debug!(
            "Selected file {} '{}' uploaded {:?}",
            file.file_id,
            file.name,
            file.uploaded_at()
        );

        let link = self
            .download_link(query.domain, query.mod_id, file.file_id)
            .await
            .map_err(premium)?;

        let file_name = file
            .file_name
            .as_deref()
            .and_then(|n| paths::segments(n).last())
            .unwrap_or(expected_name);
        let target = output_dir.join(file_name);

        info!("Downloading {} from Nexus", file_name);
        let response = http.inner().get(&link).send().await?;
        let response = super::http::check_status(response, &link)
            .await
            .map_err(premium)?;
        stream_to_file(response, &target, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn file(id: u64, name: &str, category: u32, uploaded: i64) -> NexusFile {
        NexusFile {
            file_id: id,
            name: name.into(),
            category_id: FileCategory::from(category),
            uploaded_timestamp: uploaded,
            file_name: None,
            size_in_bytes: None,
        }
    }

    #[test]
    fn test_select_newest_main_file() {
        let files = vec![
            file(1, "Randomizer v1", 1, 100),
            file(2, "Randomizer v2", 1, 200),
            file(3, "Old", 4, 300),
            file(4, "Patch", 2, 400),
        ];
        assert_eq!(select_file(&files, None, None).unwrap().file_id, 2);
    }

    #[test]
    fn test_select_by_pattern_and_category() {
        let files = vec![
            file(1, "Randomizer", 1, 100),
            file(2, "combined sfx", 3, 150),
            file(3, "Combined SFX (old)", 4, 500),
            file(4, "Divine Dragon textures", 3, 200),
        ];
        let sfx = select_file(&files, Some("Combined SFX"), Some(FileCategory::Optional));
        assert_eq!(sfx.unwrap().file_id, 2);
        // Without the category filter the newer archived upload wins
        assert_eq!(select_file(&files, Some("combined sfx"), None).unwrap().file_id, 3);
        assert!(select_file(&files, Some("missing"), None).is_none());
    }

    #[test]
    fn test_unknown_category_kept() {
        let parsed: NexusFile = serde_json::from_value(json!({
            "file_id": 9, "name": "x", "category_id": 42, "uploaded_timestamp": 1
        }))
        .unwrap();
        assert_eq!(parsed.category_id, FileCategory::Other(42));
    }

    #[tokio::test]
    async fn test_fetch_main_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/games/darksouls2/mods/1317/files.json"))
            .and(header("apikey", "secret-key-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [
                    {"file_id": 10, "name": "Randomizer", "category_id": 1,
                     "uploaded_timestamp": 100, "file_name": "DS2 Randomizer v3.zip"},
                    {"file_id": 11, "name": "Randomizer", "category_id": 4,
                     "uploaded_timestamp": 50}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/games/darksouls2/mods/1317/files/10/download_link.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"URI": format!("{}/cdn/ds2.zip", server.uri()), "name": "CDN", "short_name": "cdn"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/ds2.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK-bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = NexusClient::with_base_url("secret-key-123", &server.uri()).unwrap();
        let http = HttpClient::new().unwrap();
        let query = FileQuery {
            domain: "darksouls2",
            mod_id: 1317,
            name_pattern: None,
            category: None,
        };
        let fetched = client
            .fetch(&http, query, "DS2_Randomizer.zip", dir.path(), None)
            .await
            .unwrap();

        assert_eq!(fetched.path, dir.path().join("DS2 Randomizer v3.zip"));
        assert_eq!(fetched.bytes, 8);
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn test_forbidden_link_is_premium_required() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/games/sekiro/mods/543/files.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{"file_id": 5, "name": "Combined SFX", "category_id": 3,
                           "uploaded_timestamp": 1}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/games/sekiro/mods/543/files/5/download_link.json"))
            .respond_with(ResponseTemplate::new(403).set_body_string("premium only"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = NexusClient::with_base_url("secret-key-123", &server.uri()).unwrap();
        let query = FileQuery {
            domain: "sekiro",
            mod_id: 543,
            name_pattern: Some("Combined SFX"),
            category: Some(FileCategory::Optional),
        };
        let err = client
            .fetch(&HttpClient::new().unwrap(), query, "Combined_SFX.zip", dir.path(), None)
            .await
            .unwrap_err();

        match err {
            FetchError::PremiumRequired { mod_url, file_name, .. } => {
                assert_eq!(mod_url, "https://www.nexusmods.com/sekiro/mods/543");
                assert_eq!(file_name, "Combined_SFX.zip");
            }
            other => panic!("expected premium error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_mod_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = NexusClient::with_base_url("secret-key-123", &server.uri()).unwrap();
        let err = client.list_files("darksouls3", 9999).await.unwrap_err();
        assert_eq!(err.to_string(), "Not found: Mod 9999 not found");
    }
}
