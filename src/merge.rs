//! Combines per-source lists into one feed: provenance tagging, dedup by
//! event id, upcoming-only filtering and per-feed ordering.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{EventItem, Reason};
use crate::sources::SourceBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Random order per load, for the all-sources feed.
    Shuffled,
    /// Earliest first; unparsable dates last.
    Chronological,
    /// As returned by the sources.
    FetchOrder,
}

pub fn merge_sources(batch: SourceBatch, policy: OrderingPolicy, tz: Tz) -> Vec<EventItem> {
    let today = start_of_day(Utc::now(), tz);
    merge_sources_with(batch, policy, tz, today, &mut rand::thread_rng())
}

/// Deterministic form of [`merge_sources`]: `today` is the start of the
/// current day and `rng` drives the shuffle.
pub fn merge_sources_with<R: Rng + ?Sized>(
    batch: SourceBatch,
    policy: OrderingPolicy,
    tz: Tz,
    today: DateTime<Utc>,
    rng: &mut R,
) -> Vec<EventItem> {
    let SourceBatch {
        recommended,
        trending,
        network_first,
        network_second,
        following,
        ..
    } = batch;

    // Priority order: earlier lists win duplicate ids.
    let prioritized = [
        (Reason::Recommended, recommended),
        (Reason::Trending, trending),
        (Reason::FriendInterested, network_first),
        (Reason::FriendInterested, network_second),
        (Reason::Following, following),
    ];

    let mut seen: HashSet<String> = HashSet::new();
    let mut merged = Vec::new();
    let mut duplicates = 0usize;
    for (reason, events) in prioritized {
        for event in events {
            if event.event_id.is_empty() {
                continue;
            }
            if !seen.insert(event.event_id.clone()) {
                duplicates += 1;
                continue;
            }
            merged.push(event.with_reason(reason));
        }
    }

    let before = merged.len();
    retain_upcoming(&mut merged, tz, today);
    debug!(
        kept = merged.len(),
        duplicates,
        past = before - merged.len(),
        "merged sources"
    );

    order(&mut merged, policy, tz, rng);
    merged
}

/// Keeps events starting on or after `today`. Events without a parsable
/// date cannot be shown to be upcoming and are dropped.
pub fn retain_upcoming(events: &mut Vec<EventItem>, tz: Tz, today: DateTime<Utc>) {
    events.retain(|event| event.starts_at(tz).is_some_and(|start| start >= today));
}

pub fn order<R: Rng + ?Sized>(
    events: &mut [EventItem],
    policy: OrderingPolicy,
    tz: Tz,
    rng: &mut R,
) {
    match policy {
        OrderingPolicy::Shuffled => events.shuffle(rng),
        OrderingPolicy::Chronological => sort_chronological(events, tz),
        OrderingPolicy::FetchOrder => {}
    }
}

/// Stable sort by start time; unparsable dates sort as the latest possible.
pub fn sort_chronological(events: &mut [EventItem], tz: Tz) {
    events.sort_by_key(|event| sort_key(event, tz));
}

pub(crate) fn sort_key(event: &EventItem, tz: Tz) -> DateTime<Utc> {
    event.starts_at(tz).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Midnight of `now`'s calendar day in `tz`, as UTC.
pub fn start_of_day(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    use chrono::TimeZone;

    now.with_timezone(&tz)
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| tz.from_local_datetime(&midnight).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::{rngs::StdRng, SeedableRng};

    fn event(id: &str, date: &str) -> EventItem {
        EventItem {
            event_id: id.to_string(),
            title: id.to_string(),
            event_date: date.to_string(),
            ..Default::default()
        }
    }

    fn today() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap()
    }

    fn merge(batch: SourceBatch, policy: OrderingPolicy) -> Vec<EventItem> {
        let mut rng = StdRng::seed_from_u64(7);
        merge_sources_with(batch, policy, Tz::UTC, today(), &mut rng)
    }

    #[test]
    fn duplicates_keep_highest_priority_source() {
        let batch = SourceBatch {
            recommended: vec![event("a", "2026-10-20")],
            trending: vec![event("a", "2026-10-20"), event("b", "2026-10-21")],
            network_first: vec![event("b", "2026-10-21"), event("c", "2026-10-22")],
            network_second: vec![event("c", "2026-10-22"), event("d", "2026-10-23")],
            following: vec![event("d", "2026-10-23"), event("e", "2026-10-24")],
            failures: Vec::new(),
        };
        let merged = merge(batch, OrderingPolicy::FetchOrder);
        let tagged: Vec<(&str, Reason)> = merged
            .iter()
            .map(|e| (e.event_id.as_str(), e.reason.unwrap()))
            .collect();
        assert_eq!(
            tagged,
            vec![
                ("a", Reason::Recommended),
                ("b", Reason::Trending),
                ("c", Reason::FriendInterested),
                ("d", Reason::FriendInterested),
                ("e", Reason::Following),
            ]
        );
    }

    #[test]
    fn past_and_undated_events_are_dropped() {
        let batch = SourceBatch {
            recommended: vec![
                event("yesterday", "2026-10-15T23:59:00Z"),
                event("earlier-today", "2026-10-16T01:00:00Z"),
                event("undated", "soon"),
                event("future", "2026-12-01"),
            ],
            ..Default::default()
        };
        let merged = merge(batch, OrderingPolicy::FetchOrder);
        let ids: Vec<&str> = merged.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["earlier-today", "future"]);
        assert!(merged
            .iter()
            .all(|e| e.starts_at(Tz::UTC).unwrap() >= today()));
    }

    #[test]
    fn chronological_puts_unparsable_last() {
        let mut events = vec![
            event("late", "2026-12-01"),
            event("bad", "tbd"),
            event("early", "2026-10-20"),
        ];
        sort_chronological(&mut events, Tz::UTC);
        let ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late", "bad"]);
    }

    #[test]
    fn shuffle_is_a_seeded_permutation() {
        let ids: Vec<String> = (0..20).map(|i| format!("e{i}")).collect();
        let batch = || SourceBatch {
            recommended: ids.iter().map(|id| event(id, "2026-11-01")).collect(),
            ..Default::default()
        };
        let first = merge(batch(), OrderingPolicy::Shuffled);
        let second = merge(batch(), OrderingPolicy::Shuffled);
        assert_eq!(first, second);

        let mut sorted: Vec<String> = first.iter().map(|e| e.event_id.clone()).collect();
        assert_ne!(sorted, ids);
        sorted.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn start_of_day_uses_feed_timezone() {
        let chicago: Tz = "America/Chicago".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap();
        let start = start_of_day(now, chicago);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 10, 15, 5, 0, 0).unwrap());
    }
}
