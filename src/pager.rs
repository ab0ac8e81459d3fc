//! Pagination state for one feed section.
//!
//! `PagerState` only tracks page numbers and flags; the events themselves
//! live in a [`DisplayWindow`]. Every fetch is issued against a
//! [`PageTicket`], and a ticket from before the latest reset is stale: its
//! result is discarded instead of overwriting newer data.

use std::collections::HashSet;

use chrono_tz::Tz;
use serde::Serialize;
use tracing::debug;

use crate::merge::sort_key;
use crate::models::EventItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Resetting,
    LoadingInitial,
    LoadingMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    Initial,
    More,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTicket {
    pub page: usize,
    pub generation: u64,
    pub kind: TicketKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Applied,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PagerState {
    pub page: usize,
    pub has_more: bool,
    pub loading: bool,
    pub loading_more: bool,
    pub generation: u64,
    pub phase: Phase,
}

impl Default for PagerState {
    fn default() -> Self {
        Self {
            page: 0,
            has_more: true,
            loading: false,
            loading_more: false,
            generation: 0,
            phase: Phase::Idle,
        }
    }
}

impl PagerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.loading || self.loading_more
    }

    /// Back to page 0 for a refresh or filter change. Any fetch still in
    /// flight becomes stale.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.page = 0;
        self.has_more = true;
        self.loading = false;
        self.loading_more = false;
        self.phase = Phase::Resetting;
    }

    pub fn begin_reset(&mut self) -> PageTicket {
        self.reset();
        self.begin_initial()
    }

    /// Starts the page-0 fetch for the current generation.
    pub fn begin_initial(&mut self) -> PageTicket {
        self.loading = true;
        self.loading_more = false;
        self.phase = Phase::LoadingInitial;
        PageTicket {
            page: 0,
            generation: self.generation,
            kind: TicketKind::Initial,
        }
    }

    /// Starts the next-page fetch, unless a fetch is already running or the
    /// source is exhausted.
    pub fn begin_load_more(&mut self) -> Option<PageTicket> {
        if self.is_busy() || !self.has_more {
            return None;
        }
        self.loading_more = true;
        self.phase = Phase::LoadingMore;
        Some(PageTicket {
            page: self.page + 1,
            generation: self.generation,
            kind: TicketKind::More,
        })
    }

    pub fn is_current(&self, ticket: &PageTicket) -> bool {
        ticket.generation == self.generation
    }

    /// Records a successful fetch. `has_more` holds only if the page came
    /// back full.
    pub fn complete(&mut self, ticket: PageTicket, returned: usize, requested: usize) -> PageOutcome {
        self.complete_with(ticket, requested > 0 && returned == requested)
    }

    /// Like [`PagerState::complete`], for fetches that decide `has_more`
    /// themselves, such as a fan-out over several sources.
    pub fn complete_with(&mut self, ticket: PageTicket, has_more: bool) -> PageOutcome {
        if !self.is_current(&ticket) {
            debug!(
                ticket_generation = ticket.generation,
                generation = self.generation,
                "discarding stale page"
            );
            return PageOutcome::Stale;
        }
        self.page = ticket.page;
        self.has_more = has_more;
        self.finish();
        PageOutcome::Applied
    }

    /// Records a failed fetch; the page stays where it was.
    pub fn fail(&mut self, ticket: PageTicket) -> PageOutcome {
        if !self.is_current(&ticket) {
            return PageOutcome::Stale;
        }
        self.finish();
        PageOutcome::Applied
    }

    fn finish(&mut self) {
        self.loading = false;
        self.loading_more = false;
        self.phase = Phase::Idle;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendPolicy {
    /// New events go before the first existing event that starts later.
    Chronological,
    /// New events go after everything already there.
    AppendAtEnd,
}

/// Merges a freshly fetched page into `existing`. Ids already present are
/// skipped and existing events keep their relative order. Returns how many
/// events were added.
pub fn merge_page(
    existing: &mut Vec<EventItem>,
    incoming: Vec<EventItem>,
    policy: AppendPolicy,
    tz: Tz,
) -> usize {
    let mut seen: HashSet<String> = existing.iter().map(|e| e.event_id.clone()).collect();
    let mut added = 0;
    for event in incoming {
        if !seen.insert(event.event_id.clone()) {
            continue;
        }
        match policy {
            AppendPolicy::AppendAtEnd => existing.push(event),
            AppendPolicy::Chronological => {
                let key = sort_key(&event, tz);
                let at = existing
                    .iter()
                    .position(|current| sort_key(current, tz) > key)
                    .unwrap_or(existing.len());
                existing.insert(at, event);
            }
        }
        added += 1;
    }
    added
}

/// Events fetched for a section and how many of them are on screen. A
/// fetch may bring in more than one page; the rest stays buffered until
/// the user scrolls to it.
#[derive(Debug, Clone)]
pub struct DisplayWindow {
    buffer: Vec<EventItem>,
    display_count: usize,
    page_size: usize,
}

impl DisplayWindow {
    pub fn new(page_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            display_count: page_size.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn visible(&self) -> &[EventItem] {
        let end = self.display_count.min(self.buffer.len());
        &self.buffer[..end]
    }

    pub fn buffered(&self) -> &[EventItem] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn has_hidden(&self) -> bool {
        self.display_count < self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.replace(Vec::new());
    }

    /// Swaps in a fresh first batch and shows its first page.
    pub fn replace(&mut self, events: Vec<EventItem>) {
        self.buffer = events;
        self.display_count = self.page_size;
    }

    /// Shows another page from the buffer when it holds a full one, or
    /// whatever is left once the source is exhausted. Returns false when a
    /// fetch is needed first or nothing is left to show.
    pub fn reveal_buffered(&mut self, source_has_more: bool) -> bool {
        if !self.has_hidden() && !source_has_more {
            return false;
        }
        let next = self.display_count + self.page_size;
        if next <= self.buffer.len() || !source_has_more {
            self.display_count = next.min(self.buffer.len()).max(self.page_size);
            return true;
        }
        false
    }

    /// Adds a fetched page to the buffer without showing it.
    pub fn extend(&mut self, incoming: Vec<EventItem>, policy: AppendPolicy, tz: Tz) -> usize {
        merge_page(&mut self.buffer, incoming, policy, tz)
    }

    /// Shows one more page after a fetch, as far as the buffer reaches.
    pub fn reveal_next(&mut self) {
        self.display_count = (self.display_count + self.page_size).min(self.buffer.len().max(self.page_size));
    }

    /// Whether a background fetch should start now: enough events shown and
    /// no more than two pages left in the buffer.
    pub fn wants_prefetch(&self, threshold: usize) -> bool {
        let remaining = self.buffer.len().saturating_sub(self.display_count);
        self.display_count >= threshold && remaining <= self.page_size * 2
    }

    /// Applies `update` to every buffered event with `event_id`.
    pub fn update_event<F>(&mut self, event_id: &str, mut update: F)
    where
        F: FnMut(&mut EventItem),
    {
        for event in self.buffer.iter_mut().filter(|e| e.event_id == event_id) {
            update(event);
        }
    }
}

/// Infinite-scroll trigger: the bottom of the viewport is within `margin`
/// of the end of the content.
pub fn scroll_near_bottom(scroll_offset: f32, viewport: f32, content: f32, margin: f32) -> bool {
    scroll_offset + viewport >= content - margin
}
