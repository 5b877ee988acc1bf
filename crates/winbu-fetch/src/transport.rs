//! Shared outbound HTTP client.
//!
//! One reqwest client serves both primary fetches and side-channel
//! resolutions, so connections to the same host are reused across sessions.
//! The pool imposes no concurrency cap of its own; callers bound their work
//! through admission (primary) and the resolver width (secondary).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigSnapshot, PoolSettings};
use crate::error::{FetchError, FetchResult};
use crate::types::FetchTarget;

/// Response from the transport pool.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Requested URL.
    pub url: String,
    /// Final URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Counters of outbound requests, shared by every clone of the pool.
#[derive(Debug, Default)]
pub struct TransportStats {
    primary_requests: AtomicU64,
    side_channel_requests: AtomicU64,
}

impl TransportStats {
    /// Primary fetch attempts issued, retries included.
    pub fn primary_requests(&self) -> u64 {
        self.primary_requests.load(Ordering::Relaxed)
    }

    pub fn side_channel_requests(&self) -> u64 {
        self.side_channel_requests.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.primary_requests() + self.side_channel_requests()
    }
}

/// Reusable connection pool with per-phase timeouts.
#[derive(Clone)]
pub struct TransportPool {
    client: reqwest::Client,
    response_header_timeout: Duration,
    stats: Arc<TransportStats>,
}

impl TransportPool {
    /// Build the pool.
    ///
    /// reqwest's connect timeout covers both the TCP dial and the TLS
    /// handshake, so it is given the sum of the two phase budgets. The idle
    /// bound is per host; the total bound caps it when smaller.
    pub fn new(settings: &PoolSettings) -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(settings.max_idle_per_host.min(settings.max_idle_total))
            .pool_idle_timeout(settings.idle_timeout)
            .connect_timeout(settings.connect_timeout + settings.tls_handshake_timeout)
            .timeout(settings.request_timeout)
            .tcp_keepalive(settings.tcp_keepalive)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            client,
            response_header_timeout: settings.response_header_timeout,
            stats: Arc::new(TransportStats::default()),
        })
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Fetch the raw bytes of a primary document.
    ///
    /// Retries transport failures, 5xx and 429 up to `cfg.max_retries` times.
    /// The first attempt goes out immediately; retry `n` waits
    /// `cfg.rate_limit_delay + n * backoff_step`. Pacing is local to this
    /// call, so concurrent sessions never wait on each other here. The caller
    /// bounds the whole call by the session deadline.
    pub async fn fetch_document(
        &self,
        target: &FetchTarget,
        cfg: &ConfigSnapshot,
        backoff_step: Duration,
    ) -> FetchResult<HttpResponse> {
        let mut retries = 0u32;

        loop {
            match self.get_once(target, cfg).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && retries < cfg.max_retries => {
                    retries += 1;
                    let delay = retry_delay(cfg.rate_limit_delay, backoff_step, retries);
                    tracing::warn!(
                        "primary fetch of {target} failed ({e}); retry {retries}/{} in {delay:?}",
                        cfg.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, target: &FetchTarget, cfg: &ConfigSnapshot) -> FetchResult<HttpResponse> {
        self.stats.primary_requests.fetch_add(1, Ordering::Relaxed);

        let request = self
            .client
            .get(target.as_str())
            .header(reqwest::header::USER_AGENT, cfg.user_agent.as_str())
            .timeout(cfg.fetch_timeout);

        let resp = self.send_with_header_timeout(request).await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();

        if !(200..300).contains(&status) {
            return Err(FetchError::Status {
                status,
                url: target.to_string(),
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(HttpResponse {
            url: target.to_string(),
            final_url,
            status,
            body,
        })
    }

    /// POST url-encoded form fields to a side-channel endpoint.
    ///
    /// Any status is returned as-is; interpreting it is the caller's job.
    pub async fn post_form(
        &self,
        url: &str,
        form_fields: &[(String, String)],
        extra_headers: &[(&str, &str)],
        cfg: &ConfigSnapshot,
    ) -> FetchResult<HttpResponse> {
        self.stats
            .side_channel_requests
            .fetch_add(1, Ordering::Relaxed);

        let mut builder = self
            .client
            .post(url)
            .header(reqwest::header::USER_AGENT, cfg.user_agent.as_str());

        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }

        let resp = self
            .send_with_header_timeout(builder.form(form_fields))
            .await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();

        Ok(HttpResponse {
            url: url.to_string(),
            final_url,
            status,
            body,
        })
    }

    /// `send()` resolves once response headers arrive, so bounding it bounds
    /// the header wait independently of the overall request timeout.
    async fn send_with_header_timeout(
        &self,
        request: reqwest::RequestBuilder,
    ) -> FetchResult<reqwest::Response> {
        match tokio::time::timeout(self.response_header_timeout, request.send()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(FetchError::Timeout {
                phase: "response headers",
                after: self.response_header_timeout,
            }),
        }
    }
}

/// Wait before retry `attempt` (1-based) of one fetch.
fn retry_delay(rate_limit: Duration, backoff_step: Duration, attempt: u32) -> Duration {
    rate_limit + backoff_step * attempt
}
