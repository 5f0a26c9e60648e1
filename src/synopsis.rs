//! Per-publisher attention state.
//!
//! The synopsis maps each publisher to its accumulated attention: a concave
//! dwell-time score, visit and duration counters, and a trailing window of
//! visit timestamps. It owns the two payout algorithms: deterministic top-N
//! selection and score-to-percentage normalization with an exact-100
//! guarantee.

use crate::remote::PublisherResolver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub const MSECS_SECOND: u64 = 1000;
pub const MSECS_MINUTE: u64 = 60 * MSECS_SECOND;
pub const MSECS_HOUR: u64 = 60 * MSECS_MINUTE;
pub const MSECS_DAY: u64 = 24 * MSECS_HOUR;

/// Retention window for all chronological history kept by the engine.
pub(crate) const RETENTION_MS: i64 = 7 * MSECS_DAY as i64;

// a 24x24 transparent PNG
pub(crate) const PLACEHOLDER_FAVICON: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAABgAAAAYCAYAAADgdz34AAAAKElEQVR42uzNQQEAAAQEMPTvfErw2wqsk9SnqWcCgUAgEAgEN1aAAQALugMtNIZ41gAAAABJRU5ErkJggg==";

/// Favicon resolution state for a publisher.
///
/// Absent on the wire means never requested; `null` means a fetch is
/// pending; a string is the resolved data URI. Transitions only move
/// forward. Variant order matters: untagged deserialization must map
/// `null` to `Pending`, never back to `Unset`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Favicon {
    Pending,
    #[default]
    Unset,
    Resolved(String),
}

impl Favicon {
    pub fn is_unset(&self) -> bool {
        matches!(self, Favicon::Unset)
    }

    pub fn as_resolved(&self) -> Option<&str> {
        match self {
            Favicon::Resolved(uri) => Some(uri),
            _ => None,
        }
    }
}

/// Attention statistics for one publisher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherRecord {
    /// Attention weight; only ever grows.
    pub score: f64,

    /// Attributed visit count.
    pub visits: u64,

    /// Cumulative attributed milliseconds.
    pub duration: u64,

    /// URL scheme of the publisher's own pages, first-write-wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, rename = "faviconURL", skip_serializing_if = "Favicon::is_unset")]
    pub favicon: Favicon,

    /// Chronological visit timestamps (epoch ms) within the retention
    /// window, oldest first.
    #[serde(default)]
    pub window: Vec<i64>,
}

/// One publisher as handed to the remote client for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopPublisher {
    pub publisher: String,
    pub score: f64,
    pub visits: u64,
    pub duration: u64,
}

/// One row of the normalized payout view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEntry {
    pub rank: u32,
    pub site: String,
    pub views: u64,
    pub duration: u64,
    pub days_spent: u64,
    pub hours_spent: u64,
    pub minutes_spent: u64,
    pub seconds_spent: u64,
    #[serde(rename = "faviconURL")]
    pub favicon_url: String,
    #[serde(rename = "publisherURL", skip_serializing_if = "Option::is_none")]
    pub publisher_url: Option<String>,
    pub percentage: i64,
}

/// A duration split into its largest sensible units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationSplit {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

/// The per-publisher attention store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Synopsis {
    #[serde(default)]
    publishers: BTreeMap<String, PublisherRecord>,
}

impl Synopsis {
    /// Rehydrate from a persisted snapshot.
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn publishers(&self) -> &BTreeMap<String, PublisherRecord> {
        &self.publishers
    }

    pub fn record(&self, publisher: &str) -> Option<&PublisherRecord> {
        self.publishers.get(publisher)
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    /// Attribute one visit of `elapsed_ms` to the publisher of `location`.
    ///
    /// Returns the publisher identity so the caller can perform its
    /// one-time side effects, or `None` when resolution declined or failed
    /// (failures are logged here, never propagated).
    pub fn add_visit(
        &mut self,
        location: &str,
        elapsed_ms: u64,
        resolver: &dyn PublisherResolver,
        now_ms: i64,
    ) -> Option<String> {
        let publisher = match resolver.resolve(location) {
            Ok(Some(publisher)) => publisher,
            Ok(None) => return None,
            Err(e) => {
                warn!(location, error = %e, "publisher resolution failed");
                return None;
            }
        };

        let record = self.publishers.entry(publisher.clone()).or_default();
        record.visits += 1;
        record.duration += elapsed_ms;
        record.score += (elapsed_ms as f64 / MSECS_SECOND as f64).sqrt();
        record.window.push(now_ms);
        let cutoff = now_ms - RETENTION_MS;
        trim_expired(&mut record.window, |ts| *ts > cutoff);
        Some(publisher)
    }

    /// Capture the URL scheme for a publisher, first-write-wins.
    pub fn set_method(&mut self, publisher: &str, method: &str) {
        if let Some(record) = self.publishers.get_mut(publisher) {
            if record.method.is_none() {
                record.method = Some(method.to_string());
            }
        }
    }

    /// Mark a favicon fetch as started. Only an unset favicon can move to
    /// pending; returns whether the marker was placed.
    pub fn mark_favicon_pending(&mut self, publisher: &str) -> bool {
        match self.publishers.get_mut(publisher) {
            Some(record) if record.favicon.is_unset() => {
                record.favicon = Favicon::Pending;
                true
            }
            _ => false,
        }
    }

    /// Store a fetched favicon. A resolved favicon is never replaced;
    /// returns whether the record changed.
    pub fn resolve_favicon(&mut self, publisher: &str, data_uri: String) -> bool {
        match self.publishers.get_mut(publisher) {
            Some(record) if record.favicon.as_resolved().is_none() => {
                record.favicon = Favicon::Resolved(data_uri);
                true
            }
            _ => false,
        }
    }

    /// Publishers by descending score, ties broken by identity so the
    /// output is deterministic. Truncated to `n` entries when `n > 0`.
    pub fn top_n(&self, n: usize) -> Vec<TopPublisher> {
        let mut top: Vec<TopPublisher> = self
            .publishers
            .iter()
            .map(|(publisher, record)| TopPublisher {
                publisher: publisher.clone(),
                score: record.score,
                visits: record.visits,
                duration: record.duration,
            })
            .collect();
        // BTreeMap iteration is identity-ascending; the stable sort keeps
        // that order within equal scores.
        top.sort_by(|a, b| b.score.total_cmp(&a.score));
        if n > 0 {
            top.truncate(n);
        }
        top
    }

    /// The normalized payout view over `top_n(n)`.
    ///
    /// Percentages always sum to exactly 100 via the largest-remainder
    /// correction. The view is truncated at the first 0% entry: entries are
    /// score-sorted, so everything after it is equally negligible.
    pub fn normalize(&self, n: usize) -> Vec<NormalizedEntry> {
        let top = self.top_n(n);
        let total: f64 = top.iter().map(|t| t.score).sum();
        if total == 0.0 {
            return Vec::new();
        }

        let raw: Vec<f64> = top.iter().map(|t| t.score * 100.0 / total).collect();
        let pct = apportion(&raw, 100);

        let mut data = Vec::with_capacity(top.len());
        for (i, entry) in top.iter().enumerate() {
            if pct[i] == 0 {
                break;
            }
            let record = &self.publishers[&entry.publisher];
            let split = split_duration(entry.duration);
            data.push(NormalizedEntry {
                rank: (i + 1) as u32,
                site: entry.publisher.clone(),
                views: entry.visits,
                duration: entry.duration,
                days_spent: split.days,
                hours_spent: split.hours,
                minutes_spent: split.minutes,
                seconds_spent: split.seconds,
                favicon_url: record
                    .favicon
                    .as_resolved()
                    .unwrap_or(PLACEHOLDER_FAVICON)
                    .to_string(),
                publisher_url: record
                    .method
                    .as_ref()
                    .map(|method| format!("{}://{}", method, entry.publisher)),
                percentage: pct[i],
            });
        }
        data
    }

    /// Oldest visit timestamp across all publisher windows, or `now_ms`
    /// when there is no history.
    pub fn oldest_window_stamp(&self, now_ms: i64) -> i64 {
        let mut oldest = now_ms;
        for record in self.publishers.values() {
            if let Some(first) = record.window.first() {
                if *first < oldest {
                    oldest = *first;
                }
            }
        }
        oldest
    }
}

/// Drop leading entries that fell out of the retention window. Entries are
/// chronological, so a single forward scan finds the first retained index.
pub(crate) fn trim_expired<T>(entries: &mut Vec<T>, fresh: impl Fn(&T) -> bool) {
    let first_fresh = entries.iter().position(fresh).unwrap_or(entries.len());
    if first_fresh > 0 {
        entries.drain(..first_fresh);
    }
}

/// Largest-remainder correction: integer percentages for `values` summing
/// to exactly `target`. Entries with the largest rounding-down remainders
/// absorb the leftover; the ones rounded up the most give it back.
fn apportion(values: &[f64], target: i64) -> Vec<i64> {
    let rounded: Vec<i64> = values.iter().map(|v| v.round() as i64).collect();
    let off = target - rounded.iter().sum::<i64>();

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        (rounded[a] as f64 - values[a]).total_cmp(&(rounded[b] as f64 - values[b]))
    });

    let count = values.len() as i64;
    let mut out = vec![0i64; values.len()];
    for (position, &index) in order.iter().enumerate() {
        let position = position as i64;
        out[index] =
            rounded[index] + i64::from(off > position) - i64::from(position >= count + off);
    }
    out
}

/// Split a duration into its largest sensible units: a day or more shows
/// days only; an hour or more shows hours and minutes; a minute or more
/// shows minutes and whatever seconds remain after the rounded minutes;
/// anything else shows seconds. The leading unit is never zero.
pub fn split_duration(duration_ms: u64) -> DurationSplit {
    let mut split = DurationSplit::default();
    if duration_ms >= MSECS_DAY {
        split.days = round_div(duration_ms, MSECS_DAY).max(1);
    } else if duration_ms >= MSECS_HOUR {
        split.hours = (duration_ms / MSECS_HOUR).max(1);
        split.minutes = round_div(duration_ms % MSECS_HOUR, MSECS_MINUTE);
    } else if duration_ms >= MSECS_MINUTE {
        split.minutes = round_div(duration_ms, MSECS_MINUTE).max(1);
        split.seconds = round_div(
            duration_ms.saturating_sub(split.minutes * MSECS_MINUTE),
            MSECS_SECOND,
        );
    } else {
        split.seconds = round_div(duration_ms, MSECS_SECOND).max(1);
    }
    split
}

fn round_div(numerator: u64, denominator: u64) -> u64 {
    (numerator as f64 / denominator as f64).round() as u64
}
