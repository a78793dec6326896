//! Rate-limited HTTP client for the enrichment endpoints.
//!
//! Wraps `reqwest::Client` with a `governor` quota so that rapid track
//! changes cannot flood the lookup APIs, and attaches the bearer token and
//! `User-Agent` expected by the Evict API.

use std::{num::NonZeroU32, time::Duration};

use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use url::Url;

use crate::{config::Config, error::Result};

/// HTTP client with built-in rate limiting and bearer authentication.
pub struct Client {
    inner: reqwest::Client,
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window over which lookup calls are counted.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum lookup calls per interval.
    ///
    /// The enrichment endpoints are cosmetic; a modest budget is plenty and
    /// keeps bursts under rapid track skipping bounded.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 20;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Overall timeout per lookup request.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a new client from the session configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the bearer token is not a valid header value or the
    /// HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token.as_str()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let inner = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .timeout(Self::REQUEST_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent)
            .build()?;

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            inner,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Executes a GET request with rate limiting.
    ///
    /// Waits until the quota admits the call, so bursts are delayed rather
    /// than rejected.
    pub async fn get(&self, url: Url) -> Result<reqwest::Response> {
        self.rate_limiter.until_ready().await;
        self.inner.get(url).send().await.map_err(Into::into)
    }
}
