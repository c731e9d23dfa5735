/*============================================================
  Synavera Project: Syn-Pkg
  Module: synpkg_core::fetch
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Resolve bundle locations and stream their bytes from the
    local filesystem or over HTTPS, chunk by chunk.

  Security / Safety Notes:
    Bearer tokens are attached to the request only and never
    formatted into errors. Only file, http and https schemes
    are accepted.

  Dependencies:
    reqwest for HTTP, tokio::fs for local reads.

  Operational Scope:
    Used by the installer worker to stage bundles under the
    applications directory.

  Revision History:
    2026-10-17 COD  Implemented bundle fetcher.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Configurable timeouts and chunking
    - Structured status mapping for every failure path
============================================================*/

use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::config::InstallerConfig;
use crate::error::{PackagerError, Result};
use crate::logger::redact_url;
use crate::packager::Status;

const DIGEST_MARKER: &str = "sha256=";
const FALLBACK_FILE_NAME: &str = "bundle";

/// Failure while staging a bundle, carrying the status reported to clients.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct FetchError {
    pub status: Status,
    pub message: String,
}

impl FetchError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Where bundle bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSource {
    Local(PathBuf),
    Remote(String),
}

/// A parsed bundle URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLocation {
    pub source: BundleSource,
    /// Lowercase hex digest from a `#sha256=` fragment.
    pub expected_sha256: Option<String>,
    pub file_name: String,
}

impl BundleLocation {
    pub fn parse(url: &str) -> std::result::Result<Self, FetchError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(FetchError::new(Status::INCORRECT_URL, "empty bundle URL"));
        }

        let (locator, fragment) = match url.split_once('#') {
            Some((locator, fragment)) => (locator, Some(fragment)),
            None => (url, None),
        };
        let expected_sha256 = match fragment {
            Some(fragment) => Some(parse_digest(fragment)?),
            None => None,
        };

        let source = if let Some(path) = locator.strip_prefix("file://") {
            BundleSource::Local(PathBuf::from(path))
        } else if locator.starts_with("http://") || locator.starts_with("https://") {
            BundleSource::Remote(locator.to_string())
        } else if locator.contains("://") {
            return Err(FetchError::new(
                Status::INCORRECT_URL,
                format!("unsupported scheme in {}", redact_url(locator)),
            ));
        } else {
            BundleSource::Local(PathBuf::from(locator))
        };

        let path_part = locator.split('?').next().unwrap_or(locator);
        let file_name = path_part
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty() && !name.contains("://") && *name != "..")
            .unwrap_or(FALLBACK_FILE_NAME)
            .to_string();

        Ok(Self {
            source,
            expected_sha256,
            file_name,
        })
    }
}

fn parse_digest(fragment: &str) -> std::result::Result<String, FetchError> {
    let digest = fragment.strip_prefix(DIGEST_MARKER).ok_or_else(|| {
        FetchError::new(
            Status::INCORRECT_URL,
            format!("unsupported URL fragment `{fragment}`"),
        )
    })?;
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(FetchError::new(
            Status::INCORRECT_URL,
            "sha256 fragment must be 64 hex characters",
        ));
    }
    Ok(digest.to_ascii_lowercase())
}

/// An open stream of bundle bytes.
pub enum BundleReader {
    Local { file: File, total: Option<u64> },
    Remote { response: reqwest::Response },
}

impl BundleReader {
    /// Total size when the source announces one.
    pub fn total(&self) -> Option<u64> {
        match self {
            BundleReader::Local { total, .. } => *total,
            BundleReader::Remote { response } => response.content_length(),
        }
    }

    /// Next chunk of at most `chunk_size` bytes (remote chunks follow the wire).
    pub async fn next_chunk(
        &mut self,
        chunk_size: usize,
    ) -> std::result::Result<Option<Vec<u8>>, FetchError> {
        match self {
            BundleReader::Local { file, .. } => {
                let mut buffer = vec![0u8; chunk_size];
                let read = file.read(&mut buffer).await.map_err(|err| {
                    FetchError::new(Status::UNAVAILABLE, format!("bundle read failed: {err}"))
                })?;
                if read == 0 {
                    return Ok(None);
                }
                buffer.truncate(read);
                Ok(Some(buffer))
            }
            BundleReader::Remote { response } => {
                let chunk = response.chunk().await.map_err(map_reqwest_error)?;
                Ok(chunk.map(|bytes| bytes.to_vec()))
            }
        }
    }
}

/// Opens bundle sources with a shared HTTP client.
#[derive(Clone)]
pub struct BundleFetcher {
    client: reqwest::Client,
}

impl BundleFetcher {
    pub fn new(config: &InstallerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|err| PackagerError::Network(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }

    pub async fn open(
        &self,
        location: &BundleLocation,
        token: &str,
    ) -> std::result::Result<BundleReader, FetchError> {
        match &location.source {
            BundleSource::Local(path) => {
                let file = File::open(path).await.map_err(|err| {
                    FetchError::new(
                        Status::UNAVAILABLE,
                        format!("cannot open bundle {}: {err}", path.display()),
                    )
                })?;
                let total = file.metadata().await.ok().map(|meta| meta.len());
                Ok(BundleReader::Local { file, total })
            }
            BundleSource::Remote(url) => {
                let mut request = self.client.get(url);
                if !token.is_empty() {
                    request = request.bearer_auth(token);
                }
                let response = request.send().await.map_err(map_reqwest_error)?;
                let status = response.status();
                if status != StatusCode::OK {
                    return Err(FetchError::new(
                        Status::UNAVAILABLE,
                        format!("{} answered {status}", redact_url(url)),
                    ));
                }
                Ok(BundleReader::Remote { response })
            }
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    let status = if err.is_timeout() {
        Status::TIMEDOUT
    } else {
        Status::UNAVAILABLE
    };
    // Drop the URL from the message; it may carry credentials.
    FetchError::new(status, format!("download failed: {}", err.without_url()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "9F86D081884C7D659A2FEAA0C55AD015A3BF4F1B2B0B822CD15D6C15B0F00A08";

    #[test]
    fn plain_and_file_paths_are_local() {
        let plain = BundleLocation::parse("/srv/bundles/app.tar.gz").unwrap();
        assert_eq!(plain.source, BundleSource::Local("/srv/bundles/app.tar.gz".into()));
        assert_eq!(plain.file_name, "app.tar.gz");

        let file = BundleLocation::parse("file:///srv/bundles/app.ipk").unwrap();
        assert_eq!(file.source, BundleSource::Local("/srv/bundles/app.ipk".into()));
        assert!(file.expected_sha256.is_none());
    }

    #[test]
    fn https_urls_are_remote_and_strip_queries_from_names() {
        let location =
            BundleLocation::parse("https://cdn.example.com/apps/weather.tar?sig=1").unwrap();
        assert_eq!(
            location.source,
            BundleSource::Remote("https://cdn.example.com/apps/weather.tar?sig=1".into())
        );
        assert_eq!(location.file_name, "weather.tar");
    }

    #[test]
    fn digest_fragment_is_normalised() {
        let location = BundleLocation::parse(&format!("/tmp/app.tar#sha256={DIGEST}")).unwrap();
        assert_eq!(location.expected_sha256, Some(DIGEST.to_ascii_lowercase()));
        assert_eq!(location.source, BundleSource::Local("/tmp/app.tar".into()));
    }

    #[test]
    fn bad_inputs_map_to_incorrect_url() {
        for url in ["", "ftp://host/app.tar", "/tmp/app.tar#md5=00", "/tmp/app.tar#sha256=abc"] {
            let err = BundleLocation::parse(url).unwrap_err();
            assert_eq!(err.status, Status::INCORRECT_URL, "{url}");
        }
    }

    #[test]
    fn bare_host_falls_back_to_default_name() {
        let location = BundleLocation::parse("https://cdn.example.com/").unwrap();
        assert_eq!(location.file_name, FALLBACK_FILE_NAME);
    }

    #[tokio::test]
    async fn local_reader_streams_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        std::fs::write(&path, vec![7u8; 10]).unwrap();

        let fetcher = BundleFetcher::new(&InstallerConfig::default()).unwrap();
        let location = BundleLocation::parse(path.to_str().unwrap()).unwrap();
        let mut reader = fetcher.open(&location, "").await.unwrap();
        assert_eq!(reader.total(), Some(10));

        let mut sizes = Vec::new();
        while let Some(chunk) = reader.next_chunk(4).await.unwrap() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn missing_local_bundle_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = BundleFetcher::new(&InstallerConfig::default()).unwrap();
        let location =
            BundleLocation::parse(dir.path().join("absent.tar").to_str().unwrap()).unwrap();
        let err = fetcher.open(&location, "").await.err().unwrap();
        assert_eq!(err.status, Status::UNAVAILABLE);
    }
}
