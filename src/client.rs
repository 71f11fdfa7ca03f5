//! Conditional HTTP fetch of range buckets from the upstream API.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tracing::debug;

use crate::error::Error;

/// Additional application-level attempts per range
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Additional attempts for transient failures (connection errors, 5xx)
const DEFAULT_TRANSIENT_RETRIES: u32 = 10;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY_MS: u64 = 100;

pub(crate) struct RangeClient {
    endpoint: String,
    http: reqwest::Client,
    max_retries: u32,
    transient_retries: u32,
}

#[derive(Debug)]
pub(crate) struct RangeResponse {
    /// The stored bucket is still current; etag and body carry no data.
    pub(crate) not_modified: bool,
    pub(crate) etag: String,
    pub(crate) body: Bytes,
}

impl RangeClient {
    pub(crate) fn new(endpoint: &str) -> Result<Self, Error> {
        let http = reqwest::Client::builder().build().map_err(Error::ClientBuild)?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            http,
            max_retries: DEFAULT_MAX_RETRIES,
            transient_retries: DEFAULT_TRANSIENT_RETRIES,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_retries(
        endpoint: &str,
        max_retries: u32,
        transient_retries: u32,
    ) -> Result<Self, Error> {
        let mut client = Self::new(endpoint)?;
        client.max_retries = max_retries;
        client.transient_retries = transient_retries;
        Ok(client)
    }

    /// Fetches one range, conditionally when a prior etag is known.
    ///
    /// A `304 Not Modified` answer short-circuits as `not_modified`. All
    /// other failures are retried; the error returned after the final
    /// attempt aggregates every attempt's error.
    pub(crate) async fn request_range(&self, range: &str, etag: &str) -> Result<RangeResponse, Error> {
        let url = format!("{}{}", self.endpoint, range);

        let mut failures = Vec::new();

        for attempt in 0..=self.max_retries {
            match self.fetch(range, &url, etag).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!(range, attempt, error = %err, "range fetch attempt failed");
                    failures.push(err);
                }
            }
        }

        Err(Error::UpstreamExhausted { range: range.to_string(), errors: failures })
    }

    async fn fetch(&self, range: &str, url: &str, etag: &str) -> Result<RangeResponse, Error> {
        let response = self.send_with_backoff(range, url, etag).await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(RangeResponse { not_modified: true, etag: String::new(), body: Bytes::new() });
        }

        if response.status() != StatusCode::OK {
            return Err(Error::HttpStatus {
                range: range.to_string(),
                status: response.status().as_u16(),
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(|source| Error::HttpRequest { range: range.to_string(), source })?;

        if body.is_empty() {
            return Err(Error::EmptyBody { range: range.to_string() });
        }

        Ok(RangeResponse { not_modified: false, etag, body })
    }

    /// Retries transport errors and server errors with exponential backoff
    /// before handing the response to the caller. This absorbs the long tail
    /// of transient failures a million-request sync inevitably hits.
    async fn send_with_backoff(&self, range: &str, url: &str, etag: &str) -> Result<reqwest::Response, Error> {
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY_MS * (1 << attempt.min(10));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let mut request = self.http.get(url);
            if !etag.is_empty() {
                request = request.header(IF_NONE_MATCH, etag);
            }

            match request.send().await {
                Ok(response)
                    if response.status().is_server_error() && attempt < self.transient_retries =>
                {
                    debug!(range, status = response.status().as_u16(), attempt, "server error, backing off");
                }
                Ok(response) => return Ok(response),
                Err(err) if attempt < self.transient_retries => {
                    debug!(range, error = %err, attempt, "transport error, backing off");
                }
                Err(source) => {
                    return Err(Error::HttpRequest { range: range.to_string(), source });
                }
            }

            attempt += 1;
        }
    }
}
