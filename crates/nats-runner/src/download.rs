use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DownloadError {
    /// The server has nothing at this URL
    #[error("Nothing published at {url}")]
    NotFound { url: String },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Download failed: {0}")]
    Transport(String),
}

/// Fetches release archives.
///
/// Injectable so that callers can route downloads through proxies,
/// authentication or their own retry policy.
#[async_trait]
pub trait DownloadTransport: Send + Sync {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Bytes, DownloadError>;
}

/// Default transport backed by `reqwest`
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_inner(&self, url: &str) -> Result<Bytes, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(DownloadError::Transport(format!(
                "GET {url} returned {status}"
            )));
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::Transport(e.to_string()))?;
            body.extend_from_slice(&chunk);
        }

        debug!(url, bytes = body.len(), "Downloaded archive");
        Ok(body.freeze())
    }
}

#[async_trait]
impl DownloadTransport for ReqwestTransport {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Bytes, DownloadError> {
        info!(url, "Downloading nats-server");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            result = self.fetch_inner(url) => result,
        }
    }
}
