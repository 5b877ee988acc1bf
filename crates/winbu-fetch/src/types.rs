//! Core data types: fetch targets, fingerprints, and the assembled document.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{FetchError, FetchResult};

/// A canonical absolute URL; the addressable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchTarget {
    url: Url,
}

impl FetchTarget {
    /// Resolve a caller-supplied target against the configured base URL.
    ///
    /// Absolute `http(s)` URLs are taken as-is. Anything else is treated as a
    /// slug or path below `base_url`.
    pub fn resolve(raw: &str, base_url: &str) -> FetchResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FetchError::InvalidTarget("empty target".into()));
        }

        let mut url = match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
                    .map_err(|e| FetchError::InvalidTarget(format!("base url {base_url}: {e}")))?;
                base.join(raw.trim_start_matches('/'))
                    .map_err(|e| FetchError::InvalidTarget(format!("{raw}: {e}")))?
            }
            Err(e) => return Err(FetchError::InvalidTarget(format!("{raw}: {e}"))),
        };

        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidTarget(format!(
                "{raw}: unsupported scheme {}",
                url.scheme()
            )));
        }

        url.set_fragment(None);
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Cache key for this target.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.url.as_str())
    }
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Hex SHA-256 of a normalized URL.
///
/// Normalization happens when the [`FetchTarget`] is built: `url` lowercases
/// scheme and host and drops default ports; the fragment is removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(normalized_url: &str) -> Self {
        let digest = Sha256::digest(normalized_url.as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The structured result of one fetch session.
///
/// Serialized as camelCase JSON; empty strings, empty sequences and absent
/// options are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub episode_title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub series_title: String,
    #[serde(default, skip_serializing_if = "Navigation::is_empty")]
    pub episode_nav: Navigation,
    #[serde(default, skip_serializing_if = "SeriesInfo::is_empty")]
    pub series_info: SeriesInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_groups: Vec<QualityGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub download_groups: Vec<DownloadGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Iterate every sub-resource slot across all quality groups, in order.
    pub fn sub_resources(&self) -> impl Iterator<Item = &SubResource> {
        self.stream_groups.iter().flat_map(|g| g.servers.iter())
    }

    /// Mutable access to every sub-resource slot. Each yielded reference is a
    /// distinct slot.
    pub fn sub_resources_mut(&mut self) -> impl Iterator<Item = &mut SubResource> {
        self.stream_groups.iter_mut().flat_map(|g| g.servers.iter_mut())
    }

    pub fn sub_resource_count(&self) -> usize {
        self.stream_groups.iter().map(|g| g.servers.len()).sum()
    }

    /// Number of slots in `Resolved` state.
    pub fn resolved_count(&self) -> usize {
        self.sub_resources().filter(|s| s.state.is_resolved()).count()
    }

    /// Number of slots in `Unavailable` state.
    pub fn unavailable_count(&self) -> usize {
        self.sub_resources()
            .filter(|s| matches!(s.state, ResolutionState::Unavailable { .. }))
            .count()
    }
}

/// Links to neighbouring pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Navigation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_episode_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_episodes_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_episode_url: Option<String>,
}

impl Navigation {
    pub fn is_empty(&self) -> bool {
        self.previous_episode_url.is_none()
            && self.all_episodes_url.is_none()
            && self.next_episode_url.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub poster_image_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rating: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub synopsis: String,
}

impl SeriesInfo {
    pub fn is_empty(&self) -> bool {
        self.poster_image_url.is_empty()
            && self.rating.is_empty()
            && self.genres.is_empty()
            && self.synopsis.is_empty()
    }
}

/// Records representing the same content at one quality tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityGroup {
    #[serde(rename = "quality")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<SubResource>,
}

/// One record whose playable URL needs a secondary resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SubResourceWire", into = "SubResourceWire")]
pub struct SubResource {
    pub display_name: String,
    /// Opaque form fields sent to the side channel. Never serialized outward.
    pub tokens: CorrelationTokens,
    pub state: ResolutionState,
}

impl SubResource {
    pub fn new(display_name: impl Into<String>, tokens: CorrelationTokens) -> Self {
        Self {
            display_name: display_name.into(),
            tokens,
            state: ResolutionState::Unresolved,
        }
    }
}

/// Flat JSON shape of a [`SubResource`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubResourceWire {
    name: String,
    #[serde(default, skip_serializing)]
    tokens: CorrelationTokens,
    #[serde(default)]
    status: SlotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
enum SlotStatus {
    #[default]
    Unresolved,
    Resolved,
    Unavailable,
}

impl From<SubResourceWire> for SubResource {
    fn from(wire: SubResourceWire) -> Self {
        let state = match wire.status {
            SlotStatus::Unresolved => ResolutionState::Unresolved,
            SlotStatus::Resolved => ResolutionState::Resolved {
                url: wire.stream_url.unwrap_or_default(),
            },
            SlotStatus::Unavailable => ResolutionState::Unavailable {
                reason: wire.reason.unwrap_or_default(),
            },
        };
        Self {
            display_name: wire.name,
            tokens: wire.tokens,
            state,
        }
    }
}

impl From<SubResource> for SubResourceWire {
    fn from(slot: SubResource) -> Self {
        let (status, stream_url, reason) = match slot.state {
            ResolutionState::Unresolved => (SlotStatus::Unresolved, None, None),
            ResolutionState::Resolved { url } => (SlotStatus::Resolved, Some(url), None),
            ResolutionState::Unavailable { reason } => {
                (SlotStatus::Unavailable, None, Some(reason))
            }
        };
        Self {
            name: slot.display_name,
            tokens: slot.tokens,
            status,
            stream_url,
            reason,
        }
    }
}

/// Opaque per-record token set, sent as form fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationTokens(BTreeMap<String, String>);

impl CorrelationTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CorrelationTokens {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Lifecycle of a sub-resource slot: `Unresolved` until the resolver writes
/// it exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResolutionState {
    #[default]
    Unresolved,
    Resolved { url: String },
    Unavailable { reason: String },
}

impl ResolutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResolutionState::Unresolved)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ResolutionState::Resolved { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadGroup {
    pub quality: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub download_links: Vec<DownloadLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLink {
    pub provider: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rating: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://winbu.tv";

    #[test]
    fn test_resolve_slug_against_base() {
        let target = FetchTarget::resolve("page/alpha", BASE).unwrap();
        assert_eq!(target.as_str(), "https://winbu.tv/page/alpha");

        let target = FetchTarget::resolve("/page/alpha", "https://winbu.tv/").unwrap();
        assert_eq!(target.as_str(), "https://winbu.tv/page/alpha");
    }

    #[test]
    fn test_resolve_absolute_url_kept() {
        let target = FetchTarget::resolve("https://other.example/ep-1/", BASE).unwrap();
        assert_eq!(target.as_str(), "https://other.example/ep-1/");
    }

    #[test]
    fn test_resolve_rejects_empty_and_foreign_schemes() {
        assert!(matches!(
            FetchTarget::resolve("   ", BASE),
            Err(FetchError::InvalidTarget(_))
        ));
        assert!(matches!(
            FetchTarget::resolve("ftp://winbu.tv/a", BASE),
            Err(FetchError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_fingerprint_normalizes() {
        let a = FetchTarget::resolve("HTTPS://WinBu.TV:443/ep-6/#player", BASE).unwrap();
        let b = FetchTarget::resolve("https://winbu.tv/ep-6/", BASE).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);

        let c = FetchTarget::resolve("https://winbu.tv/ep-7/", BASE).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_document_omits_empty_fields() {
        let doc = Document {
            url: "https://winbu.tv/ep-1/".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json, serde_json::json!({ "url": "https://winbu.tv/ep-1/" }));
    }

    #[test]
    fn test_sub_resource_wire_format() {
        let mut slot = SubResource::new(
            "Server 1",
            CorrelationTokens::new().with("post", "42").with("nume", "1"),
        );
        slot.state = ResolutionState::Resolved {
            url: "https://cdn.example/embed/1".into(),
        };
        let json = serde_json::to_value(&slot).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "Server 1",
                "status": "resolved",
                "streamUrl": "https://cdn.example/embed/1"
            })
        );
    }

    #[test]
    fn test_sub_resource_reads_tokens_and_defaults_state() {
        let slot: SubResource = serde_json::from_value(serde_json::json!({
            "name": "Server 2",
            "tokens": { "post": "7", "nume": "2", "type": "schtml" }
        }))
        .unwrap();
        assert_eq!(slot.state, ResolutionState::Unresolved);
        assert_eq!(slot.tokens.iter().count(), 3);
    }

    #[test]
    fn test_slot_counters() {
        let mut doc = Document::default();
        doc.stream_groups.push(QualityGroup {
            label: "720p".into(),
            servers: vec![
                SubResource::new("a", CorrelationTokens::new()),
                SubResource::new("b", CorrelationTokens::new()),
            ],
        });
        doc.stream_groups[0].servers[0].state = ResolutionState::Resolved { url: "u".into() };
        doc.stream_groups[0].servers[1].state = ResolutionState::Unavailable {
            reason: "r".into(),
        };
        assert_eq!(doc.sub_resource_count(), 2);
        assert_eq!(doc.resolved_count(), 1);
        assert_eq!(doc.unavailable_count(), 1);
    }
}
