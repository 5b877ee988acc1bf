//! Request coordinator: one fetch session per call.
//!
//! ```text
//! CacheCheck ── hit ──────────────────────────────────────────────▶ Done
//!     │ miss
//!     ▼
//! Admission ─▶ Fetching ─▶ Extracting ─▶ Resolving ─▶ CacheWrite ─▶ Done
//!     └────────────┴────────────┴──── error ─▶ Failed (no cache mutation)
//! ```
//!
//! The [`Engine`] is built once at start-up and shared by reference (it is a
//! cheap clone). Each session captures one configuration snapshot and keeps
//! it for its whole lifetime.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::admission::{AdmissionController, AdmissionStats};
use crate::cache::{CacheStats, ContentCache};
use crate::config::{ConfigProvider, ConfigSnapshot, EngineSettings};
use crate::error::{FetchError, FetchResult};
use crate::extract::DocumentExtractor;
use crate::maintenance;
use crate::resolver::{SecondaryResolver, WarningSummary};
use crate::transport::{TransportPool, TransportStats};
use crate::types::{Document, FetchTarget, Fingerprint};

/// Where a session's document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Network,
}

/// Successful result of a fetch session.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub document: Arc<Document>,
    pub warnings: WarningSummary,
    pub source: FetchSource,
}

impl Fetched {
    pub fn from_cache(&self) -> bool {
        self.source == FetchSource::Cache
    }
}

/// Outcome of a bulk warm-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WarmUpReport {
    pub succeeded: usize,
    pub failed: usize,
}

struct EngineInner {
    config: Arc<dyn ConfigProvider>,
    extractor: Arc<dyn DocumentExtractor>,
    settings: EngineSettings,
    transport: TransportPool,
    cache: Arc<ContentCache>,
    admission: AdmissionController,
    resolver: SecondaryResolver,
}

/// The fetch-cache-resolve engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine with its own transport pool.
    pub fn new(
        config: impl ConfigProvider + 'static,
        extractor: impl DocumentExtractor + 'static,
        settings: EngineSettings,
    ) -> FetchResult<Self> {
        let transport = TransportPool::new(&settings.pool)?;
        Ok(Self::with_transport(
            Arc::new(config),
            Arc::new(extractor),
            settings,
            transport,
        ))
    }

    /// Build an engine around an existing transport pool.
    pub fn with_transport(
        config: Arc<dyn ConfigProvider>,
        extractor: Arc<dyn DocumentExtractor>,
        settings: EngineSettings,
        transport: TransportPool,
    ) -> Self {
        let admission = AdmissionController::new(settings.max_concurrent_fetches);
        let resolver = SecondaryResolver::new(
            transport.clone(),
            settings.side_channel.clone(),
            settings.max_concurrent_resolutions,
            settings.warning_cap,
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                extractor,
                settings,
                transport,
                cache: Arc::new(ContentCache::new()),
                admission,
                resolver,
            }),
        }
    }

    /// Fetch `target` within the default session deadline.
    pub async fn fetch(&self, target: &str) -> FetchResult<Fetched> {
        let deadline = Instant::now() + self.inner.settings.default_deadline;
        self.fetch_with_deadline(target, deadline).await
    }

    /// Fetch `target`, returning by `deadline`.
    ///
    /// If the deadline fires while sub-resources are still resolving, the
    /// document is returned with the remaining slots `Unavailable` and
    /// `warnings.deadline_hit` set; such a document is not cached.
    pub async fn fetch_with_deadline(
        &self,
        target: &str,
        deadline: Instant,
    ) -> FetchResult<Fetched> {
        let cfg = self.inner.config.snapshot();
        let target = FetchTarget::resolve(target, &cfg.base_url)?;
        let key = target.fingerprint();

        if cfg.cache_enabled {
            if let Some(document) = self.inner.cache.get(&key) {
                return Ok(Fetched {
                    document,
                    warnings: WarningSummary::default(),
                    source: FetchSource::Cache,
                });
            }
            tracing::debug!("cache miss: {target}");
        }

        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let span = tracing::info_span!(
            "fetch_session",
            session = &session_id[..8],
            target = %target
        );
        self.run_session(target, key, cfg, deadline)
            .instrument(span)
            .await
    }

    async fn run_session(
        &self,
        target: FetchTarget,
        key: Fingerprint,
        cfg: Arc<ConfigSnapshot>,
        deadline: Instant,
    ) -> FetchResult<Fetched> {
        let inner = &self.inner;
        tracing::info!("fetching {target}");

        let ticket = inner.admission.acquire(deadline).await?;

        let fetch = inner
            .transport
            .fetch_document(&target, &cfg, inner.settings.retry_backoff);
        let response = match tokio::time::timeout_at(deadline, fetch).await {
            Ok(result) => result?,
            Err(_) => return Err(FetchError::DeadlineExceeded { stage: "fetch" }),
        };

        let mut document = inner.extractor.extract(&response.body, &target)?;
        if document.url.is_empty() {
            document.url = target.to_string();
        }

        let warnings = inner.resolver.resolve_all(&mut document, &cfg, deadline).await;
        tracing::info!(
            "resolved {}/{} sub-resources ({} failed)",
            document.resolved_count(),
            document.sub_resource_count(),
            warnings.total_failures
        );

        if warnings.deadline_hit {
            inner.admission.release(ticket);
            return Ok(Fetched {
                document: Arc::new(document),
                warnings,
                source: FetchSource::Network,
            });
        }

        let document = if cfg.cache_enabled {
            document.cached_at = Some(Utc::now());
            let document = Arc::new(document);
            inner
                .cache
                .put(key, target.as_str(), Arc::clone(&document), cfg.cache_ttl);
            document
        } else {
            Arc::new(document)
        };
        inner.admission.release(ticket);

        Ok(Fetched {
            document,
            warnings,
            source: FetchSource::Network,
        })
    }

    /// Fetch every target concurrently and wait for all of them.
    ///
    /// Individual failures are logged and counted, never returned.
    pub async fn warm_up<I, S>(&self, targets: I) -> WarmUpReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets: Vec<S> = targets.into_iter().collect();
        let attempts = targets.iter().map(|target| async move {
            let target = target.as_ref();
            match self.fetch(target).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("warm-up of {target} failed: {e}");
                    false
                }
            }
        });

        let mut report = WarmUpReport::default();
        for ok in join_all(attempts).await {
            if ok {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }
        tracing::info!(
            "warm-up finished: {} succeeded, {} failed",
            report.succeeded,
            report.failed
        );
        report
    }

    /// Detached warm-up for the outermost caller.
    pub fn spawn_warm_up(&self, targets: Vec<String>) -> JoinHandle<WarmUpReport> {
        let engine = self.clone();
        tokio::spawn(async move { engine.warm_up(targets).await })
    }

    /// Start the periodic cache sweep.
    pub fn spawn_sweeper(&self, shutdown: Arc<Notify>) -> JoinHandle<()> {
        maintenance::spawn(
            &self.inner.cache,
            self.inner.settings.sweep_interval,
            shutdown,
        )
    }

    /// Drop every cached document.
    pub fn flush(&self) {
        self.inner.cache.flush();
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Remove one cached document. Returns whether it was cached.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.cache.invalidate(fingerprint)
    }

    /// Cache key `target` would use under the current configuration.
    pub fn fingerprint_of(&self, target: &str) -> FetchResult<Fingerprint> {
        let cfg = self.inner.config.snapshot();
        Ok(FetchTarget::resolve(target, &cfg.base_url)?.fingerprint())
    }

    pub fn admission(&self) -> AdmissionStats {
        self.inner.admission.stats()
    }

    pub fn transport_stats(&self) -> &TransportStats {
        self.inner.transport.stats()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }
}
