//! Admission control for primary fetches.
//!
//! A fixed pool of K permits. Cache hits never come here; every miss holds
//! one [`AdmissionTicket`] from before its fetch until after its cache write
//! (or until it fails). Waiters are not served in any guaranteed order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::{FetchError, FetchResult};

#[derive(Debug, Default)]
struct Counters {
    held: AtomicUsize,
    peak: AtomicUsize,
}

/// Bounded counting permit of capacity K.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    permits: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

/// Proof of admission. Dropping it returns the permit.
#[derive(Debug)]
pub struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.counters.held.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time admission figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub capacity: usize,
    pub held: usize,
    /// Highest number of tickets held at once since start.
    pub peak: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for a permit until `deadline`.
    ///
    /// On timeout nothing is held and there is nothing to release.
    pub async fn acquire(&self, deadline: Instant) -> FetchResult<AdmissionTicket> {
        let started = Instant::now();
        let waiting = Arc::clone(&self.permits).acquire_owned();
        let permit = match tokio::time::timeout_at(deadline, waiting).await {
            Ok(Ok(permit)) => permit,
            // The semaphore is never closed; treat it like running out of time.
            Ok(Err(_)) | Err(_) => {
                return Err(FetchError::AdmissionTimeout {
                    waited: started.elapsed(),
                })
            }
        };

        let held = self.counters.held.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak.fetch_max(held, Ordering::AcqRel);
        Ok(AdmissionTicket {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Return a ticket. Equivalent to dropping it.
    pub fn release(&self, ticket: AdmissionTicket) {
        drop(ticket);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tickets currently held.
    pub fn in_flight(&self) -> usize {
        self.counters.held.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            capacity: self.capacity,
            held: self.in_flight(),
            peak: self.peak(),
        }
    }
}
