//! Secondary resolution of sub-resource slots.
//!
//! Every `Unresolved` slot of a document is posted to the side channel with
//! its correlation tokens. At most M requests are outstanding at once. Each
//! in-flight future owns a unique `&mut` to its slot, so completions never
//! touch each other's state and no lock is needed.
//!
//! A failed slot becomes `Unavailable` and is recorded in a
//! [`WarningCollector`]; it never fails the session. When the session
//! deadline fires, outstanding requests are dropped and every slot still
//! `Unresolved` is marked `Unavailable`.

use std::sync::LazyLock;

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{ConfigSnapshot, SideChannelSettings};
use crate::error::ResolveFailure;
use crate::transport::TransportPool;
use crate::types::{CorrelationTokens, Document, ResolutionState, SubResource};

static SRC_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"src='([^']*)'|src="([^"]*)""#).expect("src regex is valid")
});

/// First `src='..'` or `src=".."` attribute value in a side-channel body.
pub fn extract_src(body: &str) -> Option<String> {
    let caps = SRC_ATTR.captures(body)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

/// Failures reported alongside an otherwise successful document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningSummary {
    /// At most `warning_cap` individual messages, in completion order.
    pub messages: Vec<String>,
    /// Every failed slot, including those not listed in `messages`.
    pub total_failures: usize,
    /// The session deadline fired before every slot finished.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deadline_hit: bool,
}

impl WarningSummary {
    pub fn is_empty(&self) -> bool {
        self.total_failures == 0 && !self.deadline_hit
    }

    /// Failures counted but not listed individually.
    pub fn suppressed(&self) -> usize {
        self.total_failures.saturating_sub(self.messages.len())
    }
}

/// Bounded warning sink for one session.
#[derive(Debug)]
pub struct WarningCollector {
    cap: usize,
    summary: WarningSummary,
}

impl WarningCollector {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            summary: WarningSummary::default(),
        }
    }

    pub fn record(&mut self, slot_name: &str, failure: &ResolveFailure) {
        self.summary.total_failures += 1;
        if self.summary.messages.len() < self.cap {
            self.summary.messages.push(format!("{slot_name}: {failure}"));
        }
    }

    pub fn mark_deadline_hit(&mut self) {
        self.summary.deadline_hit = true;
    }

    pub fn finish(self) -> WarningSummary {
        if self.summary.suppressed() > 0 {
            tracing::warn!(
                "{} resolution failures, {} not listed individually",
                self.summary.total_failures,
                self.summary.suppressed()
            );
        }
        self.summary
    }
}

/// Bounded fan-out over the side channel.
#[derive(Clone)]
pub struct SecondaryResolver {
    transport: TransportPool,
    side_channel: SideChannelSettings,
    width: usize,
    warning_cap: usize,
}

impl SecondaryResolver {
    pub fn new(
        transport: TransportPool,
        side_channel: SideChannelSettings,
        width: usize,
        warning_cap: usize,
    ) -> Self {
        Self {
            transport,
            side_channel,
            width: width.max(1),
            warning_cap,
        }
    }

    /// Resolve every `Unresolved` slot of `doc`, returning by `deadline`.
    ///
    /// On return every slot is terminal.
    pub async fn resolve_all(
        &self,
        doc: &mut Document,
        cfg: &ConfigSnapshot,
        deadline: Instant,
    ) -> WarningSummary {
        let endpoint = format!(
            "{}{}",
            cfg.base_url.trim_end_matches('/'),
            self.side_channel.path
        );
        let endpoint = endpoint.as_str();
        let mut collector = WarningCollector::new(self.warning_cap);

        let slots: Vec<&mut SubResource> = doc
            .sub_resources_mut()
            .filter(|s| !s.state.is_terminal())
            .collect();
        let futs: Vec<_> = slots
            .into_iter()
            .map(|slot| self.resolve_slot(endpoint, cfg, slot))
            .collect();
        let mut pending = stream::iter(futs).buffer_unordered(self.width);

        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(outcome) = pending.next().await {
                if let Some((name, failure)) = outcome {
                    collector.record(&name, &failure);
                }
            }
        })
        .await;
        drop(pending);

        if drained.is_err() {
            collector.mark_deadline_hit();
            let cancelled = ResolveFailure::Cancelled;
            for slot in doc.sub_resources_mut().filter(|s| !s.state.is_terminal()) {
                slot.state = ResolutionState::Unavailable {
                    reason: cancelled.to_string(),
                };
                collector.record(&slot.display_name, &cancelled);
            }
            tracing::warn!("deadline reached while resolving {}", doc.url);
        }

        collector.finish()
    }

    /// Resolve one slot and write its terminal state. Returns the failure to
    /// record, if any.
    async fn resolve_slot(
        &self,
        endpoint: &str,
        cfg: &ConfigSnapshot,
        slot: &mut SubResource,
    ) -> Option<(String, ResolveFailure)> {
        match self.resolve_one(endpoint, &slot.tokens, cfg).await {
            Ok(url) => {
                tracing::debug!("slot '{}' resolved: {url}", slot.display_name);
                slot.state = ResolutionState::Resolved { url };
                None
            }
            Err(failure) => {
                tracing::debug!("slot '{}' unavailable: {failure}", slot.display_name);
                slot.state = ResolutionState::Unavailable {
                    reason: failure.to_string(),
                };
                Some((slot.display_name.clone(), failure))
            }
        }
    }

    async fn resolve_one(
        &self,
        endpoint: &str,
        tokens: &CorrelationTokens,
        cfg: &ConfigSnapshot,
    ) -> Result<String, ResolveFailure> {
        let fields: Vec<(String, String)> = self
            .side_channel
            .fixed_fields
            .iter()
            .cloned()
            .chain(tokens.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect();
        let headers = [
            ("X-Requested-With", "XMLHttpRequest"),
            ("Referer", cfg.base_url.as_str()),
        ];

        let resp = self
            .transport
            .post_form(endpoint, &fields, &headers, cfg)
            .await
            .map_err(|e| ResolveFailure::Request(e.to_string()))?;

        if !resp.is_success() {
            return Err(ResolveFailure::Status(resp.status));
        }
        extract_src(&resp.text()).ok_or(ResolveFailure::NoMatch)
    }
}
