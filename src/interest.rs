//! The user's interested-event set and the optimistic toggle around it.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::EventItem;
use crate::sources::FeedBackend;

/// Short message for the caller to show as a toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum Notice {
    Info { title: String, description: String },
    Error { title: String, description: String },
}

impl Notice {
    pub fn title(&self) -> &str {
        match self {
            Notice::Info { title, .. } | Notice::Error { title, .. } => title,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Notice::Error { .. })
    }

    fn toggled(interested: bool) -> Self {
        if interested {
            Notice::Info {
                title: "You're interested!".to_string(),
                description: "We'll notify you about this event".to_string(),
            }
        } else {
            Notice::Info {
                title: "Interest removed".to_string(),
                description: "You'll no longer receive notifications for this event".to_string(),
            }
        }
    }

    fn failed() -> Self {
        Notice::Error {
            title: "Error".to_string(),
            description: "Failed to update interest".to_string(),
        }
    }
}

/// A pending flip of one event's interest flag. Remembers the event's
/// flag and count from before the flip so a rollback restores them exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestChange {
    pub event_id: String,
    pub interested: bool,
    before: Option<(bool, u32)>,
}

impl InterestChange {
    pub fn new(event_id: impl Into<String>, interested: bool) -> Self {
        Self {
            event_id: event_id.into(),
            interested,
            before: None,
        }
    }

    /// Applies the change to an event record. Counts never go below zero.
    pub fn apply(&mut self, event: &mut EventItem) {
        self.before
            .get_or_insert((event.user_is_interested, event.interested_count));
        shift(event, self.interested);
    }

    pub fn revert(&self, event: &mut EventItem) {
        match self.before {
            Some((interested, count)) => {
                event.user_is_interested = interested;
                event.interested_count = count;
            }
            None => shift(event, !self.interested),
        }
    }
}

fn shift(event: &mut EventItem, interested: bool) {
    if event.user_is_interested == interested {
        return;
    }
    event.user_is_interested = interested;
    event.interested_count = if interested {
        event.interested_count.saturating_add(1)
    } else {
        event.interested_count.saturating_sub(1)
    };
}

#[derive(Debug, Clone, Default)]
pub struct InterestTracker {
    interested: HashSet<String>,
}

impl InterestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: HashSet<String>) -> Self {
        Self { interested: ids }
    }

    pub async fn load(backend: &dyn FeedBackend, user_id: &str) -> Result<Self> {
        let ids = backend.get_user_interested_event_ids(user_id).await?;
        info!(user_id, count = ids.len(), "loaded interested events");
        Ok(Self::from_ids(ids))
    }

    /// Adds every id tracked by `other`.
    pub fn merge(&mut self, other: InterestTracker) {
        self.interested.extend(other.interested);
    }

    pub fn is_interested(&self, event_id: &str) -> bool {
        self.interested.contains(event_id)
    }

    pub fn len(&self) -> usize {
        self.interested.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interested.is_empty()
    }

    /// Flags events in the tracked set as interested. Flags already set by
    /// the backend are left alone.
    pub fn mark(&self, events: &mut [EventItem]) {
        for event in events.iter_mut() {
            if self.interested.contains(&event.event_id) {
                event.user_is_interested = true;
            }
        }
    }

    /// Picks up interest flags the backend already set on `events`.
    pub fn absorb(&mut self, events: &[EventItem]) {
        let flagged = events
            .iter()
            .filter(|e| e.user_is_interested)
            .map(|e| e.event_id.clone());
        self.interested.extend(flagged);
    }

    /// Flips `event_id` in the set and returns the change, to be persisted
    /// and, if that fails, passed to [`InterestTracker::rollback`].
    pub fn begin_toggle(&mut self, event_id: &str) -> InterestChange {
        let interested = !self.interested.contains(event_id);
        self.set(event_id, interested);
        InterestChange::new(event_id, interested)
    }

    pub fn rollback(&mut self, change: &InterestChange) {
        self.set(&change.event_id, !change.interested);
    }

    fn set(&mut self, event_id: &str, interested: bool) {
        if interested {
            self.interested.insert(event_id.to_string());
        } else {
            self.interested.remove(event_id);
        }
    }

    /// Toggles interest for `event_id` over `events`: optimistic update
    /// first, then the backend write, undone if the write fails.
    pub async fn toggle(
        &mut self,
        backend: &dyn FeedBackend,
        user_id: &str,
        event_id: &str,
        events: &mut [EventItem],
    ) -> Notice {
        let mut change = self.begin_toggle(event_id);
        for event in events.iter_mut().filter(|e| e.event_id == event_id) {
            change.apply(event);
        }

        match persist(backend, user_id, &change).await {
            Ok(notice) => notice,
            Err(notice) => {
                self.rollback(&change);
                for event in events.iter_mut().filter(|e| e.event_id == event_id) {
                    change.revert(event);
                }
                notice
            }
        }
    }
}

/// Writes `change` to the backend and picks the notice for either outcome.
pub(crate) async fn persist(
    backend: &dyn FeedBackend,
    user_id: &str,
    change: &InterestChange,
) -> std::result::Result<Notice, Notice> {
    match backend
        .set_event_interest(user_id, &change.event_id, change.interested)
        .await
    {
        Ok(()) => Ok(Notice::toggled(change.interested)),
        Err(err) => {
            warn!(user_id, event_id = %change.event_id, "interest update failed: {err}");
            Err(Notice::failed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testing::StubBackend;

    fn event(id: &str, count: u32) -> EventItem {
        EventItem {
            event_id: id.to_string(),
            interested_count: count,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn toggle_on_then_off() {
        let backend = StubBackend::default();
        let mut tracker = InterestTracker::new();
        let mut events = vec![event("a", 4), event("b", 1)];

        let notice = tracker.toggle(&backend, "u1", "a", &mut events).await;
        assert_eq!(notice.title(), "You're interested!");
        assert!(tracker.is_interested("a"));
        assert_eq!(events[0].interested_count, 5);
        assert!(events[0].user_is_interested);
        assert_eq!(events[1].interested_count, 1);

        let notice = tracker.toggle(&backend, "u1", "a", &mut events).await;
        assert_eq!(notice.title(), "Interest removed");
        assert!(!tracker.is_interested("a"));
        assert_eq!(events[0].interested_count, 4);

        let calls = backend.interest_calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("a".to_string(), true), ("a".to_string(), false)]);
    }

    #[tokio::test]
    async fn failed_write_rolls_back() {
        let backend = StubBackend {
            reject_interest: true,
            ..Default::default()
        };
        let mut tracker = InterestTracker::new();
        let mut events = vec![event("a", 4)];

        let notice = tracker.toggle(&backend, "u1", "a", &mut events).await;
        assert!(notice.is_error());
        assert!(!tracker.is_interested("a"));
        assert_eq!(events[0].interested_count, 4);
        assert!(!events[0].user_is_interested);
    }

    #[test]
    fn count_never_goes_negative() {
        let mut item = event("a", 0);
        item.user_is_interested = true;
        let mut change = InterestChange::new("a", false);
        change.apply(&mut item);
        assert_eq!(item.interested_count, 0);
        assert!(!item.user_is_interested);
    }

    #[test]
    fn revert_restores_values_from_before_the_flip() {
        let mut item = event("a", 0);
        item.user_is_interested = true;
        let mut change = InterestChange::new("a", false);
        change.apply(&mut item);
        change.revert(&mut item);
        assert!(item.user_is_interested);
        assert_eq!(item.interested_count, 0);
    }

    #[tokio::test]
    async fn failed_write_restores_flagged_event_with_zero_count() {
        let backend = StubBackend {
            reject_interest: true,
            ..Default::default()
        };
        let mut item = event("a", 0);
        item.user_is_interested = true;
        let mut events = vec![item];
        let mut tracker = InterestTracker::new();
        tracker.absorb(&events);

        let notice = tracker.toggle(&backend, "u1", "a", &mut events).await;
        assert!(notice.is_error());
        assert!(tracker.is_interested("a"));
        assert!(events[0].user_is_interested);
        assert_eq!(events[0].interested_count, 0);
    }

    #[test]
    fn merge_keeps_ids_from_both_trackers() {
        let mut tracker = InterestTracker::from_ids(["a".to_string()].into_iter().collect());
        tracker.merge(InterestTracker::from_ids(["b".to_string()].into_iter().collect()));
        assert!(tracker.is_interested("a"));
        assert!(tracker.is_interested("b"));
        assert_eq!(tracker.len(), 2);
    }

    #[tokio::test]
    async fn load_marks_events() {
        let backend = StubBackend {
            interested: ["b".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let tracker = InterestTracker::load(&backend, "u1").await.unwrap();
        let mut events = vec![event("a", 0), event("b", 3)];
        tracker.mark(&mut events);
        assert!(!events[0].user_is_interested);
        assert!(events[1].user_is_interested);
    }
}
