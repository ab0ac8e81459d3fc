pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod filters;
pub mod gesture;
pub mod interest;
pub mod merge;
pub mod models;
pub mod pager;
pub mod recommend;
pub mod sources;
pub mod utils;

pub use cache::{
    feed_cache, CacheStorage, Clock, FeedCache, FeedKey, ManualClock, MemoryStorage,
    SqliteStorage, SystemClock, TtlCache,
};
pub use config::{ConfigStore, FeedConfig};
pub use error::{FeedError, Result};
pub use feed::{FeedEngine, FeedSection, LoadOutcome, SectionKind, SectionSnapshot};
pub use filters::{DateRange, FeedFilters, FeedQuery, Geo};
pub use gesture::{PullGesture, PullIndicator, PullRelease};
pub use interest::{InterestTracker, Notice};
pub use merge::{merge_sources, OrderingPolicy};
pub use models::{EventImage, EventItem, Reason};
pub use pager::{scroll_near_bottom, AppendPolicy, DisplayWindow, PagerState, Phase};
pub use recommend::{explain, score_fallback, score_nearby, Candidate, ScoredEvent, TopArtist};
pub use sources::{
    http::HttpBackend, FeedBackend, NetworkDegree, SourceBatch, SourceError, SourceKind,
};
pub use utils::init_tracing;
