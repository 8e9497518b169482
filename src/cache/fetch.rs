/// Remote fetchers used by the cache
use crate::config::settings::FetchSettings;
use crate::config::types::{FetchError, LauncherError, Result};
use std::io::Write;
use std::time::Duration;
use url::Url;

/// Streams the bytes behind a URI into `sink`.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &Url, sink: &mut dyn Write) -> std::result::Result<u64, FetchError>;
}

/// Blocking HTTP(S) fetcher; `file:` URIs are read from disk.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| LauncherError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &Url, sink: &mut dyn Write) -> std::result::Result<u64, FetchError> {
        match url.scheme() {
            "http" | "https" => {
                let mut response =
                    self.client
                        .get(url.clone())
                        .send()
                        .map_err(|e| FetchError::Unreachable {
                            uri: url.to_string(),
                            reason: e.to_string(),
                        })?;
                let status = response.status();
                if !status.is_success() {
                    return Err(FetchError::Status {
                        uri: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                response
                    .copy_to(sink)
                    .map_err(|e| FetchError::Unreachable {
                        uri: url.to_string(),
                        reason: e.to_string(),
                    })
            }
            "file" => copy_local(url, sink),
            _ => Err(FetchError::UnsupportedScheme(url.to_string())),
        }
    }
}

/// Copy a `file:` URI into `sink`. A missing file counts as unreachable.
pub fn copy_local(url: &Url, sink: &mut dyn Write) -> std::result::Result<u64, FetchError> {
    let path = url
        .to_file_path()
        .map_err(|_| FetchError::UnsupportedScheme(url.to_string()))?;
    let mut file = std::fs::File::open(&path).map_err(|e| FetchError::Unreachable {
        uri: url.to_string(),
        reason: e.to_string(),
    })?;
    Ok(std::io::copy(&mut file, sink)?)
}
