//! Background cache sweep.
//!
//! Lookups already drop the expired entries they touch; this loop removes the
//! ones nobody asks for again.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;

use crate::cache::ContentCache;

/// Spawn the sweep loop. It runs until `shutdown` is notified or the cache
/// is dropped.
pub fn spawn(
    cache: &Arc<ContentCache>,
    every: Duration,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    let cache: Weak<ContentCache> = Arc::downgrade(cache);
    tokio::spawn(async move {
        tracing::info!(
            "cache sweep started: every={}",
            humantime::format_duration(every)
        );
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!("cache sweep stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(cache) = cache.upgrade() else {
                        tracing::debug!("cache dropped, sweep exiting");
                        break;
                    };
                    run_sweep(&cache);
                }
            }
        }
    })
}

/// One sweep pass. Returns the number of entries removed.
pub fn run_sweep(cache: &ContentCache) -> usize {
    let removed = cache.remove_expired();
    if removed > 0 {
        tracing::info!(
            "cache sweep removed {removed} expired entr{} ({} remaining)",
            if removed == 1 { "y" } else { "ies" },
            cache.len()
        );
    }
    removed
}
