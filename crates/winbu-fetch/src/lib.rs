//! winbu-fetch: fetch-cache-resolve engine with admission-controlled fetching,
//! bounded secondary resolution, and a TTL content cache.

pub mod admission;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod extract;
pub mod maintenance;
pub mod resolver;
pub mod transport;
pub mod types;

pub use admission::{AdmissionController, AdmissionStats, AdmissionTicket};
pub use cache::{CacheEntryInfo, CacheStats, ContentCache};
pub use config::{
    ConfigProvider, ConfigSnapshot, EngineSettings, PoolSettings, ReloadableConfig,
    SideChannelSettings, StaticConfig,
};
pub use coordinator::{Engine, FetchSource, Fetched, WarmUpReport};
pub use error::{ExtractionError, FetchError, FetchResult, ResolveFailure};
pub use extract::{DocumentExtractor, ExtractorRegistry, JsonExtractor, PageFamily};
pub use resolver::{SecondaryResolver, WarningCollector, WarningSummary};
pub use transport::{HttpResponse, TransportPool, TransportStats};
pub use types::*;
