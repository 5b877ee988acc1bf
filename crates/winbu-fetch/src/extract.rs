//! Document extraction seam.
//!
//! Extractors turn raw fetched bytes into a [`Document`]. They are pure: no
//! I/O and no shared state. The engine only ever sees the
//! [`DocumentExtractor`] trait; markup-specific extractors live with the
//! caller and are plugged in through an [`ExtractorRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::ExtractionError;
use crate::types::{Document, FetchTarget};

/// Kind of page a target points at, derived from its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageFamily {
    Listing,
    Detail,
    Episode,
}

impl PageFamily {
    /// Classify a target by path.
    ///
    /// `/anime/`, `/film/` and `/series/` prefixes are detail pages; any path
    /// segment mentioning `episode` is an episode page; the rest are listings.
    pub fn classify(target: &FetchTarget) -> Self {
        let path = target.path().to_ascii_lowercase();
        let mut segments = path.split('/').filter(|s| !s.is_empty());

        if let Some(first) = segments.clone().next() {
            if matches!(first, "anime" | "film" | "series") {
                return PageFamily::Detail;
            }
        }
        if segments.any(|s| s.contains("episode")) {
            return PageFamily::Episode;
        }
        PageFamily::Listing
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PageFamily::Listing => "listing",
            PageFamily::Detail => "detail",
            PageFamily::Episode => "episode",
        }
    }
}

impl fmt::Display for PageFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turns raw bytes into a structured document.
///
/// A structurally malformed body is an error. Missing optional fields are
/// not: they stay empty in the returned document. Every sub-resource must
/// come back `Unresolved`.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, raw: &[u8], target: &FetchTarget) -> Result<Document, ExtractionError>;
}

/// Routes extraction by page family.
#[derive(Default, Clone)]
pub struct ExtractorRegistry {
    by_family: HashMap<PageFamily, Arc<dyn DocumentExtractor>>,
    fallback: Option<Arc<dyn DocumentExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that sends every family to `extractor`.
    pub fn with_fallback(extractor: impl DocumentExtractor + 'static) -> Self {
        Self {
            by_family: HashMap::new(),
            fallback: Some(Arc::new(extractor)),
        }
    }

    pub fn register(
        mut self,
        family: PageFamily,
        extractor: impl DocumentExtractor + 'static,
    ) -> Self {
        self.by_family.insert(family, Arc::new(extractor));
        self
    }

    pub fn set_fallback(mut self, extractor: impl DocumentExtractor + 'static) -> Self {
        self.fallback = Some(Arc::new(extractor));
        self
    }
}

impl DocumentExtractor for ExtractorRegistry {
    fn extract(&self, raw: &[u8], target: &FetchTarget) -> Result<Document, ExtractionError> {
        let family = PageFamily::classify(target);
        let extractor = self
            .by_family
            .get(&family)
            .or(self.fallback.as_ref())
            .ok_or(ExtractionError::UnsupportedFamily(family))?;
        extractor.extract(raw, target)
    }
}

/// Reads bodies that are already document-shaped JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonExtractor;

impl DocumentExtractor for JsonExtractor {
    fn extract(&self, raw: &[u8], target: &FetchTarget) -> Result<Document, ExtractionError> {
        let value: serde_json::Value = serde_json::from_slice(raw)?;
        if !value.is_object() {
            return Err(ExtractionError::Malformed(format!(
                "expected a JSON object from {target}"
            )));
        }

        let mut doc: Document = serde_json::from_value(value)
            .map_err(|e| ExtractionError::Malformed(format!("{target}: {e}")))?;
        if doc.url.is_empty() {
            doc.url = target.to_string();
        }
        // Slot state from upstream is reset to `Unresolved`.
        for slot in doc.sub_resources_mut() {
            slot.state = Default::default();
        }
        doc.cached_at = None;
        Ok(doc)
    }
}
