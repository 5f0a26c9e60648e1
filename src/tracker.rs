//! Visit tracking and dwell attribution.
//!
//! The tracker consumes raw navigation events. Dwell time is attributed to
//! the page being *left*: when the location changes, the elapsed time since
//! the previous event is charged to the previous location's publisher.
//! Internal `about:` pages never receive attribution. The tracker also keeps
//! an observational publisher-to-locations index, recorded once per distinct
//! raw location.

use crate::remote::PublisherResolver;
use crate::synopsis::{trim_expired, RETENTION_MS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// One sighting of a raw location under a publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationEntry {
    /// Epoch milliseconds.
    pub when: i64,
    pub location: String,
}

/// Publisher-to-locations mapping aid. Purely observational; the
/// reconciliation path never consults it.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LocationIndex {
    #[serde(default)]
    publishers: BTreeMap<String, Vec<LocationEntry>>,
}

/// Read-only view of one publisher's recent locations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublisherLocations {
    pub publisher: String,
    pub locations: Vec<String>,
}

impl LocationIndex {
    pub fn record(&mut self, publisher: &str, location: &str, now_ms: i64) {
        self.publishers
            .entry(publisher.to_string())
            .or_default()
            .push(LocationEntry {
                when: now_ms,
                location: location.to_string(),
            });
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    /// Per-publisher locations within the retention window, publishers in
    /// identity order.
    pub fn normalized(&self, now_ms: i64) -> Vec<PublisherLocations> {
        let cutoff = now_ms - RETENTION_MS;
        self.publishers
            .iter()
            .map(|(publisher, entries)| {
                let mut entries = entries.clone();
                trim_expired(&mut entries, |e| e.when > cutoff);
                PublisherLocations {
                    publisher: publisher.clone(),
                    locations: entries.into_iter().map(|e| e.location).collect(),
                }
            })
            .collect()
    }
}

/// A dwell span ready to be charged to a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    /// The location being left.
    pub location: String,
    pub elapsed_ms: u64,
}

/// Navigation state between visit events.
#[derive(Debug, Default)]
pub struct VisitTracker {
    current_location: Option<String>,
    current_stamp: Option<i64>,
    seen: HashSet<String>,
    index: LocationIndex,
}

impl VisitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self) -> &LocationIndex {
        &self.index
    }

    pub fn current_location(&self) -> Option<&str> {
        self.current_location.as_deref()
    }

    /// First-sighting bookkeeping for a raw location. Each location is
    /// resolved at most once per session; returns whether the index
    /// changed. Resolution failures are logged and skipped.
    pub fn note_location(
        &mut self,
        location: &str,
        resolver: &dyn PublisherResolver,
        now_ms: i64,
    ) -> bool {
        if !self.seen.insert(location.to_string()) {
            return false;
        }
        match resolver.resolve(location) {
            Ok(Some(publisher)) => {
                debug!(location, publisher, "new location sighted");
                self.index.record(&publisher, location, now_ms);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(location, error = %e, "publisher resolution failed");
                false
            }
        }
    }

    /// The dwell span to attribute before moving to `new_location`, if any.
    /// Nothing is attributed on the first visit of a session, when the
    /// location did not change, or when leaving an internal page.
    pub fn pending_attribution(&self, new_location: &str, now_ms: i64) -> Option<Attribution> {
        let previous = self.current_location.as_deref()?;
        let stamp = self.current_stamp?;
        if new_location == previous || previous.starts_with("about") {
            return None;
        }
        Some(Attribution {
            location: previous.to_string(),
            elapsed_ms: (now_ms - stamp).max(0) as u64,
        })
    }

    /// Record the new current location and timestamp. Always runs, even
    /// when no attribution happened.
    pub fn advance(&mut self, location: &str, now_ms: i64) {
        self.current_location = Some(location.to_string());
        self.current_stamp = Some(now_ms);
    }
}
