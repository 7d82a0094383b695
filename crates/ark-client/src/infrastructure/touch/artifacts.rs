//! Local cache of the files pushed to devices: the touch daemon binary
//! (one per CPU architecture) and the helper service package.
//!
//! A cache miss downloads the file over HTTP, trying each configured source
//! in order.  Downloads are written to a temporary file and renamed into
//! place, so an interrupted download never poisons the cache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

/// Daemon download sources; `{arch}` is replaced by the ABI directory name.
pub const DEFAULT_DAEMON_URLS: &[&str] = &[
    "https://github.com/openatx/stf-binaries/raw/master/prebuilt/{arch}/bin/minitouch",
    "https://unpkg.com/@devicefarmer/minitouch-prebuilt@1.3.0/prebuilt/{arch}/bin/minitouch",
];

/// Helper service package download source.
pub const DEFAULT_HELPER_URL: &str =
    "https://github.com/openstf/stf/releases/download/v2.3/STFService.apk";

const HELPER_FILE: &str = "STFService.apk";

/// Errors produced while resolving an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Every source failed; `detail` lists the individual failures.
    #[error("could not download {name}: {detail}")]
    Unavailable { name: String, detail: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Provides local paths to device artifacts.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Daemon binary for the given ABI directory (e.g. `arm64-v8a`).
    async fn daemon_binary(&self, arch: &str) -> Result<PathBuf, ArtifactError>;

    /// Helper service package.
    async fn helper_package(&self) -> Result<PathBuf, ArtifactError>;
}

/// [`ArtifactSource`] backed by a directory and HTTP downloads.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
    client: reqwest::Client,
    daemon_urls: Vec<String>,
    helper_url: String,
}

impl ArtifactCache {
    /// Creates a cache in `dir` using the default download sources.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            dir: dir.into(),
            client,
            daemon_urls: DEFAULT_DAEMON_URLS.iter().map(|s| s.to_string()).collect(),
            helper_url: DEFAULT_HELPER_URL.to_string(),
        })
    }

    /// Replaces the download sources.
    pub fn with_sources(mut self, daemon_urls: Vec<String>, helper_url: impl Into<String>) -> Self {
        self.daemon_urls = daemon_urls;
        self.helper_url = helper_url.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn daemon_path(&self, arch: &str) -> PathBuf {
        self.dir.join(format!("minitouch-{arch}"))
    }

    pub fn helper_path(&self) -> PathBuf {
        self.dir.join(HELPER_FILE)
    }

    async fn ensure(&self, name: &str, dest: PathBuf, urls: Vec<String>) -> Result<PathBuf, ArtifactError> {
        if is_cached(&dest).await {
            return Ok(dest);
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| ArtifactError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let mut failures = Vec::new();
        for url in urls {
            info!(%url, "downloading {name}");
            match self.download(&url).await {
                Ok(bytes) => {
                    let tmp = dest.with_extension("part");
                    tokio::fs::write(&tmp, &bytes)
                        .await
                        .map_err(|source| ArtifactError::Io {
                            path: tmp.clone(),
                            source,
                        })?;
                    tokio::fs::rename(&tmp, &dest)
                        .await
                        .map_err(|source| ArtifactError::Io {
                            path: dest.clone(),
                            source,
                        })?;
                    info!(path = %dest.display(), size = bytes.len(), "{name} cached");
                    return Ok(dest);
                }
                Err(e) => {
                    warn!(%url, error = %e, "download failed");
                    failures.push(format!("{url}: {e}"));
                }
            }
        }
        Err(ArtifactError::Unavailable {
            name: name.to_string(),
            detail: failures.join("; "),
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?;
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        if bytes.is_empty() {
            return Err("empty response body".into());
        }
        Ok(bytes.to_vec())
    }
}

async fn is_cached(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

#[async_trait]
impl ArtifactSource for ArtifactCache {
    async fn daemon_binary(&self, arch: &str) -> Result<PathBuf, ArtifactError> {
        let urls = self
            .daemon_urls
            .iter()
            .map(|u| u.replace("{arch}", arch))
            .collect();
        self.ensure(&format!("touch daemon ({arch})"), self.daemon_path(arch), urls)
            .await
    }

    async fn helper_package(&self) -> Result<PathBuf, ArtifactError> {
        self.ensure("helper package", self.helper_path(), vec![self.helper_url.clone()])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server: paths containing "missing" get 404, others get `body`.
    async fn serve(body: &'static [u8]) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 4096];
                let mut len = 0;
                while !buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = sock.read(&mut buf[len..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    len += n;
                }
                let request = String::from_utf8_lossy(&buf[..len]).to_string();
                let reply = if request.contains("missing") {
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
                } else {
                    let mut r = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    )
                    .into_bytes();
                    r.extend_from_slice(body);
                    r
                };
                let _ = sock.write_all(&reply).await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn test_cached_file_is_returned_without_download() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("minitouch-x86"), b"ELF").unwrap();
        let cache = ArtifactCache::new(dir.path())
            .unwrap()
            .with_sources(vec!["http://127.0.0.1:1/{arch}".into()], "http://127.0.0.1:1/apk");

        // Act
        let path = cache.daemon_binary("x86").await.unwrap();

        // Assert
        assert_eq!(path, dir.path().join("minitouch-x86"));
    }

    #[tokio::test]
    async fn test_download_falls_back_to_next_source() {
        // Arrange
        let (base, hits) = serve(b"\x7fELF-binary").await;
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path()).unwrap().with_sources(
            vec![
                format!("{base}/missing/{{arch}}/minitouch"),
                format!("{base}/ok/{{arch}}/minitouch"),
            ],
            format!("{base}/apk"),
        );

        // Act
        let path = cache.daemon_binary("arm64-v8a").await.unwrap();
        let again = cache.daemon_binary("arm64-v8a").await.unwrap();

        // Assert
        assert_eq!(std::fs::read(&path).unwrap(), b"\x7fELF-binary");
        assert_eq!(path, again);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!dir.path().join("minitouch-arm64-v8a.part").exists());
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_unavailable() {
        let (base, _) = serve(b"").await;
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path())
            .unwrap()
            .with_sources(vec![], format!("{base}/missing.apk"));

        let result = cache.helper_package().await;

        assert!(matches!(result, Err(ArtifactError::Unavailable { .. })));
        assert!(!cache.helper_path().exists());
    }
}
