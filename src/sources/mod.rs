//! Source fetchers: the backend operations the feed consumes, and the
//! fan-out that runs all of them for one load.

pub mod http;

use std::{collections::HashSet, fmt, time::Duration};

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::filters::{FeedQuery, Geo};
use crate::models::{EventItem, Reason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Recommended,
    Trending,
    Network,
    Following,
}

impl SourceKind {
    pub fn reason(&self) -> Reason {
        match self {
            SourceKind::Recommended => Reason::Recommended,
            SourceKind::Trending => Reason::Trending,
            SourceKind::Network => Reason::FriendInterested,
            SourceKind::Following => Reason::Following,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Recommended => "recommended",
            SourceKind::Trending => "trending",
            SourceKind::Network => "network",
            SourceKind::Following => "following",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkDegree {
    First = 1,
    Second = 2,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("{kind} source unavailable: {message}")]
    Unavailable { kind: SourceKind, message: String },
    #[error("{kind} source timed out after {after:?}")]
    Timeout { kind: SourceKind, after: Duration },
    #[error("{kind} payload could not be decoded: {message}")]
    Decode { kind: SourceKind, message: String },
}

impl SourceError {
    pub fn unavailable(kind: SourceKind, message: impl Into<String>) -> Self {
        SourceError::Unavailable {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceError::Unavailable { kind, .. }
            | SourceError::Timeout { kind, .. }
            | SourceError::Decode { kind, .. } => *kind,
        }
    }
}

/// The backend collaborator. Transport and schema belong to the backend.
#[async_trait]
pub trait FeedBackend: Send + Sync {
    async fn fetch_recommended_events(
        &self,
        user_id: &str,
        query: &FeedQuery,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<EventItem>, SourceError>;

    async fn fetch_trending_events(
        &self,
        user_id: &str,
        geo: Option<Geo>,
        radius_miles: u32,
        limit: usize,
        city: Option<&str>,
    ) -> Result<Vec<EventItem>, SourceError>;

    async fn fetch_network_events(
        &self,
        user_id: &str,
        degree: NetworkDegree,
        limit: usize,
    ) -> Result<Vec<EventItem>, SourceError>;

    async fn fetch_following_events(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EventItem>, SourceError>;

    async fn set_event_interest(
        &self,
        user_id: &str,
        event_id: &str,
        interested: bool,
    ) -> Result<(), FeedError>;

    async fn get_user_interested_event_ids(
        &self,
        user_id: &str,
    ) -> Result<HashSet<String>, FeedError>;
}

/// Everything one load cycle needs to query every source.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub user_id: String,
    pub query: FeedQuery,
    pub page: usize,
    pub page_size: usize,
    pub trending_limit: usize,
    pub network_limit: usize,
    pub following_limit: usize,
    pub recommended_timeout: Duration,
}

impl SourceRequest {
    fn following_offset(&self) -> usize {
        self.page * self.following_limit
    }

    /// Trending and network lists are not paged; they only join page 0.
    fn includes_unpaged_sources(&self) -> bool {
        self.page == 0
    }
}

/// Settled results of one fan-out. Failed sources contribute empty lists.
#[derive(Debug, Default)]
pub struct SourceBatch {
    pub recommended: Vec<EventItem>,
    pub trending: Vec<EventItem>,
    pub network_first: Vec<EventItem>,
    pub network_second: Vec<EventItem>,
    pub following: Vec<EventItem>,
    pub failures: Vec<SourceError>,
}

impl SourceBatch {
    pub fn total(&self) -> usize {
        self.recommended.len()
            + self.trending.len()
            + self.network_first.len()
            + self.network_second.len()
            + self.following.len()
    }

    /// Whether any paged source returned a full page.
    pub fn has_more(&self, request: &SourceRequest) -> bool {
        (request.page_size > 0 && self.recommended.len() == request.page_size)
            || (request.following_limit > 0 && self.following.len() == request.following_limit)
    }
}

/// Issues every source fetch at once and waits for all of them to settle.
pub async fn fetch_all(backend: &dyn FeedBackend, request: &SourceRequest) -> SourceBatch {
    let user_id = request.user_id.as_str();
    let unpaged = request.includes_unpaged_sources();

    let recommended = fetch_recommended(backend, request);
    let trending = async {
        if unpaged {
            backend
                .fetch_trending_events(
                    user_id,
                    request.query.geo,
                    request.query.radius_miles,
                    request.trending_limit,
                    request.query.city.as_deref(),
                )
                .await
        } else {
            Ok(Vec::new())
        }
    };
    let network_first = async {
        if unpaged {
            backend
                .fetch_network_events(user_id, NetworkDegree::First, request.network_limit)
                .await
        } else {
            Ok(Vec::new())
        }
    };
    let network_second = async {
        if unpaged {
            backend
                .fetch_network_events(user_id, NetworkDegree::Second, request.network_limit)
                .await
        } else {
            Ok(Vec::new())
        }
    };
    let following = backend.fetch_following_events(
        user_id,
        request.following_limit,
        request.following_offset(),
    );

    let (recommended, trending, network_first, network_second, following) = futures::join!(
        recommended,
        trending,
        network_first,
        network_second,
        following
    );

    let mut failures = Vec::new();
    let batch = SourceBatch {
        recommended: settle(SourceKind::Recommended, recommended, &mut failures),
        trending: settle(SourceKind::Trending, trending, &mut failures),
        network_first: settle(SourceKind::Network, network_first, &mut failures),
        network_second: settle(SourceKind::Network, network_second, &mut failures),
        following: settle(SourceKind::Following, following, &mut failures),
        failures,
    };

    debug!(
        user_id,
        page = request.page,
        count = batch.total(),
        failures = batch.failures.len(),
        "sources settled"
    );
    batch
}

/// The recommended source is the only one with a deadline.
pub async fn fetch_recommended(
    backend: &dyn FeedBackend,
    request: &SourceRequest,
) -> Result<Vec<EventItem>, SourceError> {
    let call = backend.fetch_recommended_events(
        &request.user_id,
        &request.query,
        request.page,
        request.page_size,
    );
    match timeout(request.recommended_timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout {
            kind: SourceKind::Recommended,
            after: request.recommended_timeout,
        }),
    }
}

pub(crate) fn settle(
    kind: SourceKind,
    result: Result<Vec<EventItem>, SourceError>,
    failures: &mut Vec<SourceError>,
) -> Vec<EventItem> {
    match result {
        Ok(events) => events,
        Err(err) => {
            warn!(source = %kind, "source fetch failed: {err}");
            failures.push(err);
            Vec::new()
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Canned per-source responses, for tests.
    #[derive(Default)]
    pub struct StubBackend {
        pub recommended: Vec<EventItem>,
        pub trending: Vec<EventItem>,
        pub network_first: Vec<EventItem>,
        pub network_second: Vec<EventItem>,
        pub following: Vec<EventItem>,
        pub failing: Vec<SourceKind>,
        pub recommended_delay: Option<Duration>,
        pub reject_interest: bool,
        pub interested: HashSet<String>,
        pub interest_calls: Mutex<Vec<(String, bool)>>,
    }

    impl StubBackend {
        fn respond(
            &self,
            kind: SourceKind,
            events: &[EventItem],
        ) -> Result<Vec<EventItem>, SourceError> {
            if self.failing.contains(&kind) {
                return Err(SourceError::unavailable(kind, "stubbed failure"));
            }
            Ok(events.to_vec())
        }
    }

    #[async_trait]
    impl FeedBackend for StubBackend {
        async fn fetch_recommended_events(
            &self,
            _user_id: &str,
            _query: &FeedQuery,
            page: usize,
            page_size: usize,
        ) -> Result<Vec<EventItem>, SourceError> {
            if let Some(delay) = self.recommended_delay {
                tokio::time::sleep(delay).await;
            }
            let all = self.respond(SourceKind::Recommended, &self.recommended)?;
            Ok(all.into_iter().skip(page * page_size).take(page_size).collect())
        }

        async fn fetch_trending_events(
            &self,
            _user_id: &str,
            _geo: Option<Geo>,
            _radius_miles: u32,
            limit: usize,
            _city: Option<&str>,
        ) -> Result<Vec<EventItem>, SourceError> {
            let all = self.respond(SourceKind::Trending, &self.trending)?;
            Ok(all.into_iter().take(limit).collect())
        }

        async fn fetch_network_events(
            &self,
            _user_id: &str,
            degree: NetworkDegree,
            limit: usize,
        ) -> Result<Vec<EventItem>, SourceError> {
            let events = match degree {
                NetworkDegree::First => &self.network_first,
                NetworkDegree::Second => &self.network_second,
            };
            let all = self.respond(SourceKind::Network, events)?;
            Ok(all.into_iter().take(limit).collect())
        }

        async fn fetch_following_events(
            &self,
            _user_id: &str,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<EventItem>, SourceError> {
            let all = self.respond(SourceKind::Following, &self.following)?;
            Ok(all.into_iter().skip(offset).take(limit).collect())
        }

        async fn set_event_interest(
            &self,
            _user_id: &str,
            event_id: &str,
            interested: bool,
        ) -> Result<(), FeedError> {
            self.interest_calls
                .lock()
                .unwrap()
                .push((event_id.to_string(), interested));
            if self.reject_interest {
                return Err(FeedError::Persistence("rejected".to_string()));
            }
            Ok(())
        }

        async fn get_user_interested_event_ids(
            &self,
            _user_id: &str,
        ) -> Result<HashSet<String>, FeedError> {
            Ok(self.interested.clone())
        }
    }
}
