//! Read-only status projection.
//!
//! Assembles the snapshot handed back to callers. The two expensive views
//! (normalized synopsis, publisher locations) are cached until a mutation
//! explicitly invalidates them; everything else is derived fresh per query.
//! Projection never mutates a store, with one deliberate exception: the
//! payment notice flag is consume-on-read.

use crate::scheduler::Scheduler;
use crate::synopsis::{NormalizedEntry, Synopsis, MSECS_DAY, MSECS_HOUR, MSECS_MINUTE};
use crate::tracker::{LocationIndex, PublisherLocations};
use serde::Serialize;
use tracing::info;

/// Snapshot of the engine as seen by the external caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub button_label: Option<String>,

    #[serde(rename = "buttonURL", skip_serializing_if = "Option::is_none")]
    pub button_url: Option<String>,

    pub payment_notice: bool,

    pub synopsis: Vec<NormalizedEntry>,

    pub publishers: Vec<PublisherLocations>,
}

/// Cached projection fields, cleared by mutations.
#[derive(Debug, Default)]
pub struct Projections {
    synopsis: Option<Vec<NormalizedEntry>>,
    publishers: Option<Vec<PublisherLocations>>,
}

impl Projections {
    pub(crate) fn invalidate_synopsis(&mut self) {
        self.synopsis = None;
    }

    pub(crate) fn invalidate_publishers(&mut self) {
        self.publishers = None;
    }
}

pub(crate) fn project(
    projections: &mut Projections,
    synopsis: &Synopsis,
    index: &LocationIndex,
    scheduler: &mut Scheduler,
    top_count: usize,
    now_ms: i64,
) -> StatusSnapshot {
    let normalized = projections
        .synopsis
        .get_or_insert_with(|| synopsis.normalize(top_count))
        .clone();
    let publishers = projections
        .publishers
        .get_or_insert_with(|| index.normalized(now_ms))
        .clone();

    let mut status_text = scheduler.status_text.clone();
    if let Some(stamp) = scheduler.reconcile_stamp {
        let oldest = synopsis.oldest_window_stamp(now_ms);
        let mut text = format!("Publisher history as of {}", relative_time(now_ms, oldest));
        if scheduler.button_url.is_none() {
            text.push_str(&format!(", reconciliation {}", relative_time(now_ms, stamp)));
        }
        info!(status = %text);
        status_text = Some(text);
    }

    StatusSnapshot {
        enabled: scheduler.enabled,
        status_text,
        button_label: scheduler.button_label.clone(),
        button_url: scheduler.button_url.clone(),
        payment_notice: scheduler.take_payment_notice(),
        synopsis: normalized,
        publishers,
    }
}

/// "3 hours ago" / "in 2 days" style phrasing for status lines.
fn relative_time(now_ms: i64, then_ms: i64) -> String {
    if then_ms <= now_ms {
        format!("{} ago", span((now_ms - then_ms) as u64))
    } else {
        format!("in {}", span((then_ms - now_ms) as u64))
    }
}

fn span(ms: u64) -> String {
    let unit = |n: u64, name: &str| {
        if n == 1 {
            format!("1 {}", name)
        } else {
            format!("{} {}s", n, name)
        }
    };
    if ms >= MSECS_DAY {
        unit(ms / MSECS_DAY, "day")
    } else if ms >= MSECS_HOUR {
        unit(ms / MSECS_HOUR, "hour")
    } else if ms >= MSECS_MINUTE {
        unit(ms / MSECS_MINUTE, "minute")
    } else {
        "a few seconds".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::DomainResolver;
    use crate::tracker::VisitTracker;
    use crate::EngineConfig;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn fixtures() -> (TempDir, Scheduler, Synopsis, VisitTracker, Projections) {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(&EngineConfig::new(dir.path().to_path_buf()), None);
        (
            dir,
            scheduler,
            Synopsis::default(),
            VisitTracker::new(),
            Projections::default(),
        )
    }

    #[test]
    fn test_span_phrasing() {
        assert_eq!(span(2 * MSECS_DAY), "2 days");
        assert_eq!(span(MSECS_HOUR), "1 hour");
        assert_eq!(span(5 * MSECS_MINUTE), "5 minutes");
        assert_eq!(span(900), "a few seconds");
    }

    #[test]
    fn test_relative_time_directions() {
        assert_eq!(relative_time(10_000, 10_000 - MSECS_HOUR as i64), "1 hour ago");
        assert_eq!(
            relative_time(10_000, 10_000 + 2 * MSECS_DAY as i64),
            "in 2 days"
        );
    }

    #[test]
    fn test_disabled_empty_snapshot() {
        let (_dir, mut scheduler, synopsis, tracker, mut projections) = fixtures();
        let snapshot = project(
            &mut projections,
            &synopsis,
            tracker.index(),
            &mut scheduler,
            25,
            1_000,
        );
        assert!(!snapshot.enabled);
        assert_eq!(snapshot.status_text, None);
        assert!(snapshot.synopsis.is_empty());
        assert!(snapshot.publishers.is_empty());
    }

    #[test]
    fn test_status_line_mentions_history_and_due_time() {
        let (_dir, mut scheduler, mut synopsis, tracker, mut projections) = fixtures();
        let resolver = DomainResolver;
        let now = 10 * MSECS_DAY as i64;
        synopsis.add_visit("http://a.com/", 1_000, &resolver, now - MSECS_HOUR as i64);
        scheduler.enabled = true;
        scheduler.reconcile_stamp = Some(now + 2 * MSECS_DAY as i64);

        let snapshot = project(
            &mut projections,
            &synopsis,
            tracker.index(),
            &mut scheduler,
            25,
            now,
        );
        assert_eq!(
            snapshot.status_text.as_deref(),
            Some("Publisher history as of 1 hour ago, reconciliation in 2 days")
        );
    }

    #[test]
    fn test_due_time_suppressed_while_payment_button_shows() {
        let (_dir, mut scheduler, synopsis, tracker, mut projections) = fixtures();
        scheduler.reconcile_stamp = Some(500);
        scheduler.button_label = Some("Reconcile".to_string());
        scheduler.button_url = Some("https://pay.example/x".to_string());

        let snapshot = project(
            &mut projections,
            &synopsis,
            tracker.index(),
            &mut scheduler,
            25,
            1_000,
        );
        let text = snapshot.status_text.unwrap();
        assert!(text.starts_with("Publisher history as of"));
        assert!(!text.contains("reconciliation"));
        assert_eq!(snapshot.button_url.as_deref(), Some("https://pay.example/x"));
    }

    #[test]
    fn test_projection_cached_until_invalidated() {
        let (_dir, mut scheduler, mut synopsis, tracker, mut projections) = fixtures();
        let resolver = DomainResolver;
        synopsis.add_visit("http://a.com/", 4_000, &resolver, 1_000);

        let first = project(
            &mut projections,
            &synopsis,
            tracker.index(),
            &mut scheduler,
            25,
            1_000,
        );
        assert_eq!(first.synopsis.len(), 1);

        // A mutation without invalidation is not yet visible.
        synopsis.add_visit("http://b.com/", 9_000, &resolver, 2_000);
        let stale = project(
            &mut projections,
            &synopsis,
            tracker.index(),
            &mut scheduler,
            25,
            2_000,
        );
        assert_eq!(stale.synopsis.len(), 1);

        projections.invalidate_synopsis();
        let fresh = project(
            &mut projections,
            &synopsis,
            tracker.index(),
            &mut scheduler,
            25,
            2_000,
        );
        assert_eq!(fresh.synopsis.len(), 2);
    }

    #[test]
    fn test_payment_notice_consumed_by_query() {
        let (_dir, mut scheduler, synopsis, tracker, mut projections) = fixtures();
        scheduler.raise_payment_notice();

        let first = project(
            &mut projections,
            &synopsis,
            tracker.index(),
            &mut scheduler,
            25,
            1_000,
        );
        assert!(first.payment_notice);

        let second = project(
            &mut projections,
            &synopsis,
            tracker.index(),
            &mut scheduler,
            25,
            1_000,
        );
        assert!(!second.payment_notice);
    }
}
