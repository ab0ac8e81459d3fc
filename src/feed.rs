//! Feed sections: the state the presentation layer renders and the
//! operations it calls.
//!
//! A [`FeedEngine`] owns the shared pieces (backend, snapshot cache and
//! config). Each [`FeedSection`] keeps one section's filters, pager, display
//! window and interest set behind a mutex. The lock is never held across an
//! `.await`: every operation takes a ticket under the lock, fetches without
//! it, and re-locks to apply the result if the ticket is still current.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{
    feed_cache, CacheStorage, FeedCache, FeedKey, MemoryStorage, SqliteStorage, SystemClock,
};
use crate::config::FeedConfig;
use crate::error::{FeedError, Result};
use crate::filters::FeedFilters;
use crate::interest::{self, InterestTracker, Notice};
use crate::merge::{merge_sources, OrderingPolicy};
use crate::models::EventItem;
use crate::pager::{AppendPolicy, DisplayWindow, PageOutcome, PageTicket, PagerState, Phase};
use crate::sources::{
    self, http::HttpBackend, FeedBackend, NetworkDegree, SourceBatch, SourceKind, SourceRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    /// Every source, shuffled, cached.
    Unified,
    Trending,
    Network,
    Recommendations,
}

impl SectionKind {
    /// Trending keeps the backend's ranking; the other sections are dated
    /// lists.
    pub fn ordering(&self) -> OrderingPolicy {
        match self {
            SectionKind::Unified => OrderingPolicy::Shuffled,
            SectionKind::Trending => OrderingPolicy::FetchOrder,
            SectionKind::Network | SectionKind::Recommendations => OrderingPolicy::Chronological,
        }
    }

    pub fn append_policy(&self) -> AppendPolicy {
        match self {
            SectionKind::Unified | SectionKind::Trending => AppendPolicy::AppendAtEnd,
            SectionKind::Network | SectionKind::Recommendations => AppendPolicy::Chronological,
        }
    }

    fn is_cached(&self) -> bool {
        matches!(self, SectionKind::Unified)
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SectionKind::Unified => "unified",
            SectionKind::Trending => "trending",
            SectionKind::Network => "network",
            SectionKind::Recommendations => "recommendations",
        };
        f.write_str(name)
    }
}

/// What a load call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Fetched and applied; `added` new events reached the buffer.
    Loaded { added: usize },
    /// Showed another page that was already buffered.
    Revealed,
    /// Nothing to do: already loading, exhausted, or not needed yet.
    Skipped,
    /// The section was reset while fetching; the result was dropped.
    Stale,
}

/// Read-only copy of a section for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct SectionSnapshot {
    pub kind: SectionKind,
    pub events: Vec<EventItem>,
    pub page: usize,
    pub has_more: bool,
    pub loading: bool,
    pub loading_more: bool,
    pub refreshing: bool,
    pub phase: Phase,
    pub from_cache: bool,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct FeedEngine {
    backend: Arc<dyn FeedBackend>,
    cache: FeedCache,
    config: Arc<FeedConfig>,
}

impl FeedEngine {
    pub fn new(backend: Arc<dyn FeedBackend>, cache: FeedCache, config: FeedConfig) -> Self {
        Self {
            backend,
            cache,
            config: Arc::new(config),
        }
    }

    pub fn with_storage(
        backend: Arc<dyn FeedBackend>,
        storage: Arc<dyn CacheStorage>,
        config: FeedConfig,
    ) -> Self {
        let cache = feed_cache(storage, config.cache_ttl(), Arc::new(SystemClock));
        Self::new(backend, cache, config)
    }

    /// HTTP backend plus the on-disk cache. An unusable cache file degrades
    /// to an in-memory cache.
    pub fn from_config(config: FeedConfig) -> Result<Self> {
        let backend = HttpBackend::from_config(&config)
            .map_err(|err| FeedError::Config(format!("{err:#}")))?;
        let storage: Arc<dyn CacheStorage> = match SqliteStorage::open_default() {
            Ok(storage) => Arc::new(storage),
            Err(err) => {
                warn!(%err, "feed cache unavailable on disk, keeping it in memory");
                Arc::new(MemoryStorage::new())
            }
        };
        Ok(Self::with_storage(Arc::new(backend), storage, config))
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn cache(&self) -> &FeedCache {
        &self.cache
    }

    pub fn section(&self, kind: SectionKind, user_id: impl Into<String>) -> FeedSection {
        FeedSection::new(self.clone(), kind, user_id.into())
    }
}

/// A page-0 fetch taken under the lock, finished without it.
struct FirstPage {
    ticket: PageTicket,
    request: SourceRequest,
    filters: FeedFilters,
}

struct SectionState {
    filters: FeedFilters,
    top_genres: Vec<String>,
    pager: PagerState,
    window: DisplayWindow,
    interests: InterestTracker,
    refreshing: bool,
    from_cache: bool,
    error: Option<String>,
}

/// One feed section. Clones share state.
#[derive(Clone)]
pub struct FeedSection {
    engine: FeedEngine,
    kind: SectionKind,
    user_id: String,
    state: Arc<Mutex<SectionState>>,
}

impl FeedSection {
    fn new(engine: FeedEngine, kind: SectionKind, user_id: String) -> Self {
        let window = DisplayWindow::new(engine.config.page_size);
        let state = SectionState {
            filters: FeedFilters::default(),
            top_genres: Vec::new(),
            pager: PagerState::new(),
            window,
            interests: InterestTracker::new(),
            refreshing: false,
            from_cache: false,
            error: None,
        };
        Self {
            engine,
            kind,
            user_id,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, SectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn filters(&self) -> FeedFilters {
        self.lock().filters.clone()
    }

    /// Genres used when the filters name none.
    pub fn set_top_genres(&self, genres: Vec<String>) {
        self.lock().top_genres = genres;
    }

    fn cache_key(&self, filters: &FeedFilters) -> FeedKey {
        FeedKey::new(self.user_id.clone(), filters.fingerprint())
    }

    /// Shows the cached snapshot for the current filters, if a fresh one
    /// exists. Only the unified section is cached.
    pub fn paint_from_cache(&self) -> bool {
        if !self.kind.is_cached() {
            return false;
        }
        let key = self.cache_key(&self.filters());
        let Some(mut events) = self.engine.cache.get(&key) else {
            return false;
        };
        let mut state = self.lock();
        if !state.window.is_empty() && !state.from_cache {
            return false;
        }
        state.interests.mark(&mut events);
        debug!(section = %self.kind, user_id = %self.user_id, count = events.len(), "painted from cache");
        state.window.replace(events);
        state.from_cache = true;
        true
    }

    /// Fetches page 0 and replaces the section's events. Anything still in
    /// flight from before becomes stale.
    pub async fn load_initial(&self) -> Result<LoadOutcome> {
        let start = {
            let mut state = self.lock();
            self.begin_first_page(&mut state)
        };
        self.finish_first_page(start).await
    }

    fn begin_first_page(&self, state: &mut SectionState) -> FirstPage {
        let ticket = state.pager.begin_reset();
        info!(section = %self.kind, user_id = %self.user_id, generation = ticket.generation, "loading feed");
        FirstPage {
            ticket,
            request: self.request(state, 0),
            filters: state.filters.clone(),
        }
    }

    async fn finish_first_page(&self, start: FirstPage) -> Result<LoadOutcome> {
        let FirstPage {
            ticket,
            request,
            filters,
        } = start;
        let fetched = self.fetch(&request).await;

        let mut state = self.lock();
        let (events, has_more) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => return self.record_failure(&mut state, ticket, err),
        };
        if state.pager.complete_with(ticket, has_more) == PageOutcome::Stale {
            return Ok(LoadOutcome::Stale);
        }
        let added = self.apply_first_page(&mut state, events);
        let snapshot = self
            .kind
            .is_cached()
            .then(|| state.window.buffered().to_vec());
        drop(state);

        if let Some(snapshot) = snapshot {
            self.engine.cache.put(&self.cache_key(&filters), &snapshot);
        }
        Ok(LoadOutcome::Loaded { added })
    }

    fn apply_first_page(&self, state: &mut SectionState, mut events: Vec<EventItem>) -> usize {
        state.interests.absorb(&events);
        state.interests.mark(&mut events);
        let added = events.len();
        state.window.replace(events);
        state.from_cache = false;
        state.error = None;
        info!(section = %self.kind, count = added, has_more = state.pager.has_more, "feed loaded");
        added
    }

    /// Infinite-scroll step: reveals a buffered page when there is one,
    /// otherwise fetches the next page and reveals it.
    pub async fn load_more(&self) -> Result<LoadOutcome> {
        let (ticket, request) = {
            let mut state = self.lock();
            if state.pager.loading {
                return Ok(LoadOutcome::Skipped);
            }
            let has_more = state.pager.has_more;
            if state.window.reveal_buffered(has_more) {
                return Ok(LoadOutcome::Revealed);
            }
            let Some(ticket) = state.pager.begin_load_more() else {
                return Ok(LoadOutcome::Skipped);
            };
            (ticket, self.request(&state, ticket.page))
        };
        self.fetch_next(ticket, request, true).await
    }

    /// Background fetch of the next page into the buffer, once enough of the
    /// current buffer has been shown.
    pub async fn prefetch(&self) -> Result<LoadOutcome> {
        let (ticket, request) = {
            let mut state = self.lock();
            if !state.window.wants_prefetch(self.engine.config.prefetch_threshold) {
                return Ok(LoadOutcome::Skipped);
            }
            let Some(ticket) = state.pager.begin_load_more() else {
                return Ok(LoadOutcome::Skipped);
            };
            (ticket, self.request(&state, ticket.page))
        };
        debug!(section = %self.kind, page = ticket.page, "prefetching");
        self.fetch_next(ticket, request, false).await
    }

    async fn fetch_next(
        &self,
        ticket: PageTicket,
        request: SourceRequest,
        reveal: bool,
    ) -> Result<LoadOutcome> {
        let fetched = self.fetch(&request).await;

        let mut state = self.lock();
        let (mut events, has_more) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => return self.record_failure(&mut state, ticket, err),
        };
        if state.pager.complete_with(ticket, has_more) == PageOutcome::Stale {
            return Ok(LoadOutcome::Stale);
        }
        state.interests.absorb(&events);
        state.interests.mark(&mut events);
        let tz = self.engine.config.tz();
        let added = state.window.extend(events, self.kind.append_policy(), tz);
        if reveal {
            state.window.reveal_next();
        }
        debug!(section = %self.kind, page = ticket.page, added, has_more, "page appended");
        Ok(LoadOutcome::Loaded { added })
    }

    fn record_failure(
        &self,
        state: &mut SectionState,
        ticket: PageTicket,
        err: FeedError,
    ) -> Result<LoadOutcome> {
        if state.pager.fail(ticket) == PageOutcome::Stale {
            return Ok(LoadOutcome::Stale);
        }
        warn!(section = %self.kind, page = ticket.page, "feed load failed: {err}");
        state.error = Some(err.to_string());
        Err(err)
    }

    /// Pull-to-refresh: clears the list and reloads page 0 with the current
    /// filters, skipping the cache read. Ignored while a refresh is already
    /// running.
    pub async fn refresh(&self) -> Result<LoadOutcome> {
        let start = {
            let mut state = self.lock();
            if state.refreshing {
                return Ok(LoadOutcome::Skipped);
            }
            state.refreshing = true;
            state.window.clear();
            state.from_cache = false;
            self.begin_first_page(&mut state)
        };
        let outcome = self.finish_first_page(start).await;
        self.lock().refreshing = false;
        outcome
    }

    /// Replaces the filters and reloads. The unified section shows a cached
    /// snapshot for the new filters first, if it has one.
    pub async fn set_filters(&self, filters: FeedFilters) -> Result<LoadOutcome> {
        let start = {
            let mut state = self.lock();
            if state.filters == filters && !state.window.is_empty() {
                return Ok(LoadOutcome::Skipped);
            }
            state.filters = filters;
            state.window.clear();
            state.from_cache = false;
            self.begin_first_page(&mut state)
        };
        self.paint_from_cache();
        self.finish_first_page(start).await
    }

    /// Loads the user's interested events into the section's set and flags
    /// the shown ones. Ids already tracked are kept.
    pub async fn sync_interests(&self) -> Result<()> {
        let loaded = InterestTracker::load(self.engine.backend.as_ref(), &self.user_id).await?;
        let mut state = self.lock();
        state.interests.merge(loaded);
        let mut events = state.window.buffered().to_vec();
        state.interests.mark(&mut events);
        for event in events.iter().filter(|e| e.user_is_interested) {
            state.window.update_event(&event.event_id, |shown| shown.user_is_interested = true);
        }
        Ok(())
    }

    /// Optimistic interest toggle. The shown events change at once; if the
    /// backend write fails the change is undone and an error notice returned.
    pub async fn toggle_interest(&self, event_id: &str) -> Notice {
        let change = {
            let mut state = self.lock();
            let mut change = state.interests.begin_toggle(event_id);
            state.window.update_event(event_id, |event| change.apply(event));
            change
        };

        match interest::persist(self.engine.backend.as_ref(), &self.user_id, &change).await {
            Ok(notice) => notice,
            Err(notice) => {
                let mut state = self.lock();
                state.interests.rollback(&change);
                state.window.update_event(event_id, |event| change.revert(event));
                notice
            }
        }
    }

    pub fn snapshot(&self) -> SectionSnapshot {
        let state = self.lock();
        SectionSnapshot {
            kind: self.kind,
            events: state.window.visible().to_vec(),
            page: state.pager.page,
            has_more: state.window.has_hidden() || state.pager.has_more,
            loading: state.pager.loading,
            loading_more: state.pager.loading_more,
            refreshing: state.refreshing,
            phase: state.pager.phase,
            from_cache: state.from_cache,
            error: state.error.clone(),
        }
    }

    fn request(&self, state: &SectionState, page: usize) -> SourceRequest {
        let config = &self.engine.config;
        let mut filters = state.filters.clone();
        filters.radius_miles.get_or_insert(config.default_radius_miles);
        filters
            .max_days_ahead
            .get_or_insert(config.default_max_days_ahead);
        let page_size = match self.kind {
            SectionKind::Unified => config.batch_size,
            _ => config.page_size,
        };
        SourceRequest {
            user_id: self.user_id.clone(),
            query: filters.to_query(&state.top_genres, Utc::now()),
            page,
            page_size,
            trending_limit: config.trending_limit,
            network_limit: config.network_limit,
            following_limit: config.following_limit,
            recommended_timeout: config.recommended_timeout(),
        }
    }

    /// Runs the fetch for this section's kind and merges the result. Returns
    /// the merged events and whether another page exists.
    async fn fetch(&self, request: &SourceRequest) -> Result<(Vec<EventItem>, bool)> {
        let backend = self.engine.backend.as_ref();
        let (batch, has_more) = match self.kind {
            SectionKind::Unified => {
                let batch = sources::fetch_all(backend, request).await;
                let has_more = batch.has_more(request);
                (batch, has_more)
            }
            SectionKind::Recommendations => {
                let events = sources::fetch_recommended(backend, request).await?;
                let has_more = request.page_size > 0 && events.len() == request.page_size;
                let batch = SourceBatch {
                    recommended: events,
                    ..SourceBatch::default()
                };
                (batch, has_more)
            }
            SectionKind::Trending => {
                let events = backend
                    .fetch_trending_events(
                        &request.user_id,
                        request.query.geo,
                        request.query.radius_miles,
                        request.trending_limit,
                        request.query.city.as_deref(),
                    )
                    .await?;
                let batch = SourceBatch {
                    trending: events,
                    ..SourceBatch::default()
                };
                (batch, false)
            }
            SectionKind::Network => {
                let (first, second) = futures::join!(
                    backend.fetch_network_events(
                        &request.user_id,
                        NetworkDegree::First,
                        request.network_limit
                    ),
                    backend.fetch_network_events(
                        &request.user_id,
                        NetworkDegree::Second,
                        request.network_limit
                    )
                );
                let mut failures = Vec::new();
                let network_first = sources::settle(SourceKind::Network, first, &mut failures);
                let network_second = sources::settle(SourceKind::Network, second, &mut failures);
                if network_first.is_empty() && network_second.is_empty() {
                    if let Some(err) = failures.pop() {
                        return Err(err.into());
                    }
                }
                let batch = SourceBatch {
                    network_first,
                    network_second,
                    failures,
                    ..SourceBatch::default()
                };
                (batch, false)
            }
        };
        let merged = merge_sources(batch, self.kind.ordering(), self.engine.config.tz());
        Ok((merged, has_more))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::ManualClock;
    use crate::sources::testing::StubBackend;

    fn upcoming(id: &str, days: i64) -> EventItem {
        EventItem {
            event_id: id.to_string(),
            event_date: (Utc::now() + chrono::Duration::days(days)).to_rfc3339(),
            ..Default::default()
        }
    }

    fn engine(backend: StubBackend, config: FeedConfig) -> (FeedEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = feed_cache(
            Arc::new(MemoryStorage::new()),
            config.cache_ttl(),
            clock.clone(),
        );
        (FeedEngine::new(Arc::new(backend), cache, config), clock)
    }

    fn small_pages() -> FeedConfig {
        FeedConfig {
            page_size: 2,
            batch_size: 4,
            prefetch_threshold: 4,
            ..FeedConfig::default()
        }
    }

    #[tokio::test]
    async fn recommendations_section_pages_chronologically() {
        let backend = StubBackend {
            recommended: vec![
                upcoming("d", 4),
                upcoming("b", 2),
                upcoming("c", 3),
                upcoming("a", 1),
            ],
            ..Default::default()
        };
        let (engine, _) = engine(backend, small_pages());
        let section = engine.section(SectionKind::Recommendations, "u1");

        assert_eq!(section.load_initial().await.unwrap(), LoadOutcome::Loaded { added: 2 });
        let ids: Vec<String> = section.snapshot().events.into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["b", "d"]);

        assert_eq!(section.load_more().await.unwrap(), LoadOutcome::Loaded { added: 2 });
        let snapshot = section.snapshot();
        let ids: Vec<String> = snapshot.events.into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(snapshot.page, 1);
        assert!(snapshot.has_more);

        assert_eq!(section.load_more().await.unwrap(), LoadOutcome::Loaded { added: 0 });
        assert!(!section.snapshot().has_more);
        assert_eq!(section.load_more().await.unwrap(), LoadOutcome::Skipped);
        assert_eq!(section.load_more().await.unwrap(), LoadOutcome::Skipped);
    }

    #[tokio::test]
    async fn unified_reveals_buffer_then_prefetches() {
        let backend = StubBackend {
            recommended: (0..8).map(|i| upcoming(&format!("r{i}"), i + 1)).collect(),
            ..Default::default()
        };
        let (engine, _) = engine(backend, small_pages());
        let section = engine.section(SectionKind::Unified, "u1");

        assert_eq!(section.load_initial().await.unwrap(), LoadOutcome::Loaded { added: 4 });
        assert_eq!(section.snapshot().events.len(), 2);
        assert_eq!(section.prefetch().await.unwrap(), LoadOutcome::Skipped);

        assert_eq!(section.load_more().await.unwrap(), LoadOutcome::Revealed);
        assert_eq!(section.snapshot().events.len(), 4);

        assert_eq!(section.prefetch().await.unwrap(), LoadOutcome::Loaded { added: 4 });
        assert_eq!(section.snapshot().events.len(), 4);
        assert_eq!(section.load_more().await.unwrap(), LoadOutcome::Revealed);
        assert_eq!(section.snapshot().events.len(), 6);
    }

    #[tokio::test]
    async fn unified_load_writes_cache_for_next_paint() {
        let backend = StubBackend {
            recommended: vec![upcoming("a", 1), upcoming("b", 2)],
            ..Default::default()
        };
        let (engine, clock) = engine(backend, FeedConfig::default());
        let first = engine.section(SectionKind::Unified, "u1");
        first.load_initial().await.unwrap();

        let second = engine.section(SectionKind::Unified, "u1");
        assert!(second.paint_from_cache());
        let snapshot = second.snapshot();
        assert!(snapshot.from_cache);
        assert_eq!(snapshot.events.len(), 2);

        clock.advance(Duration::from_secs(301));
        let third = engine.section(SectionKind::Unified, "u1");
        assert!(!third.paint_from_cache());
    }

    #[tokio::test]
    async fn single_source_failure_surfaces_as_error() {
        let backend = StubBackend {
            failing: vec![SourceKind::Trending],
            ..Default::default()
        };
        let (engine, _) = engine(backend, FeedConfig::default());
        let section = engine.section(SectionKind::Trending, "u1");
        assert!(section.load_initial().await.is_err());
        let snapshot = section.snapshot();
        assert!(snapshot.error.is_some());
        assert!(!snapshot.loading);
    }

    #[tokio::test]
    async fn network_section_lists_both_degrees() {
        let backend = StubBackend {
            network_first: vec![upcoming("friend", 5)],
            network_second: vec![upcoming("fof", 2), upcoming("friend", 5)],
            ..Default::default()
        };
        let (engine, _) = engine(backend, FeedConfig::default());
        let section = engine.section(SectionKind::Network, "u1");
        section.load_initial().await.unwrap();
        let ids: Vec<String> = section.snapshot().events.into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["fof", "friend"]);
        assert!(!section.snapshot().has_more);
    }

    #[tokio::test]
    async fn toggle_updates_shown_event() {
        let backend = StubBackend {
            trending: vec![upcoming("a", 1)],
            ..Default::default()
        };
        let (engine, _) = engine(backend, FeedConfig::default());
        let section = engine.section(SectionKind::Trending, "u1");
        section.load_initial().await.unwrap();

        let notice = section.toggle_interest("a").await;
        assert!(!notice.is_error());
        let event = &section.snapshot().events[0];
        assert!(event.user_is_interested);
        assert_eq!(event.interested_count, 1);
    }

    #[tokio::test]
    async fn sync_interests_flags_loaded_events() {
        let backend = StubBackend {
            trending: vec![upcoming("a", 1), upcoming("b", 2)],
            interested: ["b".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let (engine, _) = engine(backend, FeedConfig::default());
        let section = engine.section(SectionKind::Trending, "u1");
        section.load_initial().await.unwrap();
        section.sync_interests().await.unwrap();
        let flags: Vec<bool> = section
            .snapshot()
            .events
            .iter()
            .map(|e| e.user_is_interested)
            .collect();
        assert_eq!(flags, vec![false, true]);
    }

    #[tokio::test]
    async fn trending_keeps_backend_rank() {
        let backend = StubBackend {
            trending: vec![upcoming("hot", 20), upcoming("warm", 5), upcoming("cool", 1)],
            ..Default::default()
        };
        let (engine, _) = engine(backend, FeedConfig::default());
        let section = engine.section(SectionKind::Trending, "u1");
        section.load_initial().await.unwrap();
        let ids: Vec<String> = section.snapshot().events.into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["hot", "warm", "cool"]);
    }

    #[tokio::test]
    async fn load_more_on_exhausted_section_is_skipped() {
        let backend = StubBackend {
            recommended: vec![upcoming("only", 1)],
            ..Default::default()
        };
        let (engine, _) = engine(backend, small_pages());
        let section = engine.section(SectionKind::Recommendations, "u1");
        section.load_initial().await.unwrap();
        assert!(!section.snapshot().has_more);
        for _ in 0..3 {
            assert_eq!(section.load_more().await.unwrap(), LoadOutcome::Skipped);
        }
        assert_eq!(section.snapshot().events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_clears_list_while_reloading() {
        let backend = StubBackend {
            recommended: (0..10).map(|i| upcoming(&format!("r{i}"), i + 1)).collect(),
            recommended_delay: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let (engine, _) = engine(backend, small_pages());
        let section = engine.section(SectionKind::Recommendations, "u1");
        section.load_initial().await.unwrap();
        for _ in 0..3 {
            section.load_more().await.unwrap();
        }
        assert_eq!(section.snapshot().events.len(), 8);

        let (refreshed, during) = tokio::join!(section.refresh(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            section.snapshot()
        });
        assert!(during.events.is_empty());
        assert!(during.refreshing);
        assert!(during.loading);
        assert_eq!(during.page, 0);

        assert_eq!(refreshed.unwrap(), LoadOutcome::Loaded { added: 2 });
        let after = section.snapshot();
        assert_eq!(after.events.len(), 2);
        assert!(!after.refreshing);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_load_does_not_write_cache() {
        let backend = StubBackend {
            recommended: vec![upcoming("a", 1), upcoming("b", 2)],
            recommended_delay: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let (engine, _) = engine(backend, FeedConfig::default());
        let section = engine.section(SectionKind::Unified, "u1");

        let (first, second) = tokio::join!(section.load_initial(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            section.set_filters(FeedFilters::for_city("Boise")).await
        });
        assert_eq!(first.unwrap(), LoadOutcome::Stale);
        assert_eq!(second.unwrap(), LoadOutcome::Loaded { added: 2 });

        let default_key = FeedKey::new("u1", FeedFilters::default().fingerprint());
        assert!(engine.cache().get(&default_key).is_none());
        let boise_key = FeedKey::new("u1", FeedFilters::for_city("Boise").fingerprint());
        assert_eq!(engine.cache().get(&boise_key).map(|events| events.len()), Some(2));
    }

    #[tokio::test]
    async fn sync_interests_keeps_flags_absorbed_from_loads() {
        let mut flagged = upcoming("a", 1);
        flagged.user_is_interested = true;
        flagged.interested_count = 2;
        let backend = StubBackend {
            trending: vec![flagged],
            ..Default::default()
        };
        let (engine, _) = engine(backend, FeedConfig::default());
        let section = engine.section(SectionKind::Trending, "u1");
        section.load_initial().await.unwrap();
        section.sync_interests().await.unwrap();

        let notice = section.toggle_interest("a").await;
        assert_eq!(notice.title(), "Interest removed");
        let event = &section.snapshot().events[0];
        assert!(!event.user_is_interested);
        assert_eq!(event.interested_count, 1);
    }
}
