//! Streamed HTTP downloads with throttled progress reporting

use crate::error::FetchError;
use anyhow::{Context, Result};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::Fetched;

/// Callback cadence when the total size is known
const CALLBACK_INTERVAL: Duration = Duration::from_millis(250);

/// Callback cadence when the server sent no length
const CALLBACK_INTERVAL_UNKNOWN: Duration = Duration::from_secs(2);

/// Connection timeout: time to establish TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout: maximum time to wait for data between chunks
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Progress callback: (bytes so far, total if known)
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Shared HTTP client for direct links
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("soulsfetch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Get the underlying reqwest client
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

/// Download `url` to `output_path` with a single GET
pub async fn download_file(
    client: &HttpClient,
    url: &str,
    output_path: &Path,
    progress: Option<&ProgressCallback>,
) -> Result<Fetched, FetchError> {
    debug!("GET {}", truncate_url(url));
    let response = client.inner().get(url).send().await?;
    let response = check_status(response, url).await?;
    stream_to_file(response, output_path, progress).await
}

/// Map non-success statuses onto the fetch taxonomy
pub(crate) async fn check_status(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound(truncate_url(what)));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::RateLimited);
    }
    let body = response.text().await.unwrap_or_default();
    Err(FetchError::Http {
        status: status.as_u16(),
        body: truncate_error(&body),
    })
}

/// Stream a response body to disk.
///
/// The body goes to a hidden `.part` file beside `output_path` that is renamed
/// into place only once the stream has ended, so `output_path` never holds a
/// partial download. The part file is removed when the stream fails or the
/// future is dropped. The callback fires at most once per interval and always
/// once at the end.
pub async fn stream_to_file(
    response: reqwest::Response,
    output_path: &Path,
    progress: Option<&ProgressCallback>,
) -> Result<Fetched, FetchError> {
    let dir = match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::create_dir_all(dir).await?;

    let total = response.content_length();
    let interval = if total.is_some() {
        CALLBACK_INTERVAL
    } else {
        CALLBACK_INTERVAL_UNKNOWN
    };

    let part = tempfile::Builder::new()
        .prefix(".")
        .suffix(".part")
        .tempfile_in(dir)?;
    let (std_file, part_path) = part.into_parts();
    let mut file = File::from_std(std_file);
    let mut downloaded = 0u64;
    let mut last_callback = Instant::now();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if let Some(callback) = progress {
            if last_callback.elapsed() >= interval {
                callback(downloaded, total);
                last_callback = Instant::now();
            }
        }
    }
    file.flush().await?;
    drop(file);

    part_path.persist(output_path).map_err(|e| {
        warn!("Could not move download into {}: {}", output_path.display(), e.error);
        FetchError::Io(e.error)
    })?;

    if let Some(callback) = progress {
        callback(downloaded, total);
    }

    debug!("Wrote {} bytes to {}", downloaded, output_path.display());
    Ok(Fetched {
        path: output_path.to_path_buf(),
        bytes: downloaded,
        total,
    })
}

/// Truncate URL for log and error messages
pub(crate) fn truncate_url(url: &str) -> String {
    if url.chars().count() > 80 {
        format!("{}...", url.chars().take(77).collect::<String>())
    } else {
        url.to_string()
    }
}

fn truncate_error(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "No details".to_string()
    } else if trimmed.chars().count() > 100 {
        format!("{}...", trimmed.chars().take(97).collect::<String>())
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_http_client_creation() {
        assert!(HttpClient::new().is_ok());
    }

    #[tokio::test]
    async fn test_download_reports_final_progress() {
        let server = MockServer::start().await;
        let body = vec![7u8; 4096];
        Mock::given(method("GET"))
            .and(path("/files/tool.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out/tool.zip");
        let calls: Arc<Mutex<Vec<(u64, Option<u64>)>>> = Arc::default();
        let sink = calls.clone();
        let callback: ProgressCallback = Arc::new(move |done, total| {
            sink.lock().unwrap().push((done, total));
        });

        let client = HttpClient::new().unwrap();
        let url = format!("{}/files/tool.zip", server.uri());
        let fetched = download_file(&client, &url, &target, Some(&callback))
            .await
            .unwrap();

        assert_eq!(fetched.bytes, 4096);
        assert_eq!(std::fs::read(&target).unwrap(), body);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.last(), Some(&(4096, Some(4096))));
    }

    #[tokio::test]
    async fn test_missing_file_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("gone.zip");
        let client = HttpClient::new().unwrap();
        let err = download_file(&client, &format!("{}/gone.zip", server.uri()), &target, None)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NotFound(_)));
        assert!(!target.exists());
    }

    /// Serve one response over raw TCP: headers announcing `announced` bytes,
    /// then `chunks` written `gap` apart. Stalls afterwards if short.
    async fn serve_chunks(announced: usize, chunks: Vec<Vec<u8>>, gap: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
                announced
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            for chunk in chunks {
                socket.write_all(&chunk).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(gap).await;
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        format!("http://{}/file.zip", addr)
    }

    #[tokio::test]
    async fn test_progress_is_throttled() {
        let chunks = vec![vec![1u8; 100]; 20];
        let url = serve_chunks(2000, chunks, Duration::from_millis(50)).await;

        let dir = tempfile::tempdir().unwrap();
        let calls: Arc<Mutex<Vec<(u64, Option<u64>)>>> = Arc::default();
        let sink = calls.clone();
        let callback: ProgressCallback = Arc::new(move |done, total| {
            sink.lock().unwrap().push((done, total));
        });

        let client = HttpClient::new().unwrap();
        let fetched = download_file(&client, &url, &dir.path().join("file.zip"), Some(&callback))
            .await
            .unwrap();

        assert_eq!(fetched.bytes, 2000);
        let calls = calls.lock().unwrap();
        // About one callback per 250ms over a one second stream, not one per chunk
        assert!(calls.len() > 1, "{:?}", calls);
        assert!(calls.len() < 20, "{:?}", calls);
        assert_eq!(calls.last(), Some(&(2000, Some(2000))));
    }

    #[tokio::test]
    async fn test_abandoned_stream_leaves_no_file() {
        let url = serve_chunks(1000, vec![vec![0u8; 10]], Duration::ZERO).await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("DarkSoulsIII.exe");
        let client = HttpClient::new().unwrap();
        let attempt = tokio::time::timeout(
            Duration::from_millis(300),
            download_file(&client, &url, &target, None),
        )
        .await;

        assert!(attempt.is_err());
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_truncate_error() {
        assert_eq!(truncate_error("   "), "No details");
        assert_eq!(truncate_error(&"x".repeat(150)).len(), 100);
    }
}
