//! Quota-aware JSON fetching used by the Data API extractor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

/// Doubling delay between attempts at one request, never above `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRetry {
    pub max_retries: u32,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for RequestRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RequestRetry {
    pub fn delay(&self, retry: u32) -> Duration {
        (0..retry.min(32))
            .fold(self.initial, |delay, _| delay.saturating_mul(2))
            .min(self.ceiling)
    }
}

/// Spaces request starts at least `interval` apart across all callers.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_scope: usize,
    pub retry: RequestRetry,
    /// Minimum spacing between requests; `None` disables pacing.
    pub min_interval: Option<Duration>,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 8,
            max_in_flight_per_scope: 5,
            retry: RequestRetry::default(),
            min_interval: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Throttling, server errors and connection-level failures may clear up on
    /// a later attempt. Quota and auth rejections (403, 401) will not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Decode { .. } => false,
        }
    }
}

/// Seconds form of `Retry-After`; the HTTP-date form is ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Shared client. A request holds a per-scope permit and a global permit for
/// its whole retry sequence.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_scope: DashMap<String, Arc<Semaphore>>,
    per_scope_limit: usize,
    pacer: Option<RequestPacer>,
    retry: RequestRetry,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_scope: DashMap::new(),
            per_scope_limit: config.max_in_flight_per_scope.max(1),
            pacer: config.min_interval.map(RequestPacer::new),
            retry: config.retry,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        scope: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let scope_limit = self
            .per_scope
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone();
        let _scope_permit = scope_limit
            .acquire()
            .await
            .expect("fetcher semaphores are never closed");
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("fetcher semaphores are never closed");

        let body = self
            .get_with_retries(url, query)
            .instrument(info_span!("http_get", scope, url))
            .await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    async fn get_with_retries(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>, FetchError> {
        let mut retry = 0;
        loop {
            let err = match self.get_once(url, query).await {
                Ok(body) => return Ok(body),
                Err(err) => err,
            };
            if !err.is_transient() || retry >= self.retry.max_retries {
                return Err(err);
            }
            let delay = match &err {
                FetchError::HttpStatus {
                    retry_after: Some(wait),
                    ..
                } => (*wait).min(self.retry.ceiling),
                _ => self.retry.delay(retry),
            };
            debug!(retry, delay_ms = delay.as_millis() as u64, error = %err, "transient http failure, backing off");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    async fn get_once(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>, FetchError> {
        if let Some(pacer) = &self.pacer {
            pacer.wait_turn().await;
        }
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
                retry_after: retry_after(response.headers()),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn status(code: u16) -> FetchError {
        FetchError::HttpStatus {
            status: code,
            url: "https://api.test/videos".into(),
            retry_after: None,
        }
    }

    #[test]
    fn retry_delay_doubles_up_to_the_ceiling() {
        let retry = RequestRetry {
            max_retries: 4,
            initial: Duration::from_millis(250),
            ceiling: Duration::from_secs(1),
        };
        let delays: Vec<_> = (0..4).map(|n| retry.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 1000]);
        assert_eq!(retry.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn quota_rejections_are_final_but_throttling_is_not() {
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(!status(403).is_transient());
        assert!(!status(404).is_transient());

        let decode = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(!FetchError::Decode {
            url: "u".into(),
            source: decode,
        }
        .is_transient());
    }

    #[test]
    fn retry_after_reads_delay_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 7 "));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_requests() {
        let pacer = RequestPacer::new(Duration::from_millis(100));
        let started = Instant::now();
        pacer.wait_turn().await;
        assert!(started.elapsed() < Duration::from_millis(100));
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(300));
    }

    #[test]
    fn unpaced_config_builds_a_client() {
        let fetcher = HttpFetcher::new(HttpFetcherConfig {
            user_agent: Some("tubecrawl-test".into()),
            ..HttpFetcherConfig::default()
        })
        .unwrap();
        assert!(fetcher.pacer.is_none());
        assert_eq!(fetcher.per_scope_limit, 5);
    }
}
