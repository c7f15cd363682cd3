use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::{StreamExt, TryStreamExt};

use crate::errors::{HarmonyError, Result};

/// Inclusive byte range of an HTTP `Range: bytes=start-end` request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub struct FetchResponse {
    /// Body length as reported by the origin, for the requested window.
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

/// The transport seam. Everything downstream of here only sees a stream of
/// body bytes, which keeps the decrypt pipeline testable without a network.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<FetchResponse>;
}

/// Production fetcher over a shared reqwest client.
///
/// Timeouts mirror the transport contract: 6 s to connect, 30 s between
/// bytes, 300 s for the whole resource.
pub struct HttpRangeFetcher {
    client: reqwest::Client,
}

impl HttpRangeFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(6))
            .read_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpRangeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<FetchResponse> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", range.start, range.end),
            );
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HarmonyError::Http(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map_err(HarmonyError::from)
            .boxed();

        Ok(FetchResponse {
            content_length,
            stream,
        })
    }
}
