//! Feed filter input, the normalized query sent to the backend, and the cache
//! fingerprint derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::utils::clean_text;

pub const DEFAULT_RADIUS_MILES: u32 = 50;
pub const DEFAULT_MAX_DAYS_AHEAD: u32 = 90;

const FINGERPRINT_LEN: usize = 16;
const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Geo {
    pub latitude: f64,
    pub longitude: f64,
}

/// Filters as they arrive from the filter bar. Every field is optional.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct FeedFilters {
    pub city: Option<String>,
    pub selected_cities: Vec<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub genres: Vec<String>,
    pub radius_miles: Option<u32>,
    pub date_range: Option<DateRange>,
    pub include_past: Option<bool>,
    pub max_days_ahead: Option<u32>,
}

/// Filters after defaults and precedence rules have been applied.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FeedQuery {
    pub city: Option<String>,
    pub geo: Option<Geo>,
    pub genres: Vec<String>,
    pub radius_miles: u32,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub include_past: bool,
    pub max_days_ahead: u32,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LocationKey {
    City { name: String },
    Coordinates { lat_e2: i64, lng_e2: i64 },
    Anywhere,
}

// Field order here is the serialization order, which keeps the hash stable.
#[derive(Serialize, Debug, PartialEq)]
struct NormalizedFilters {
    location: LocationKey,
    genres: Vec<String>,
    radius_miles: u32,
    date_from_ms: Option<i64>,
    date_to_ms: Option<i64>,
    include_past: bool,
    max_days_ahead: u32,
}

impl FeedFilters {
    pub fn for_city(city: &str) -> Self {
        Self {
            city: Some(city.to_string()),
            ..Self::default()
        }
    }

    /// The first non-blank of `city` and `selected_cities`.
    pub fn primary_city(&self) -> Option<String> {
        self.city
            .iter()
            .chain(self.selected_cities.iter())
            .map(|c| clean_text(c))
            .find(|c| !c.is_empty())
    }

    pub fn geo(&self) -> Option<Geo> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Geo {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }

    /// Stable cache key component. Two filters that normalize to the same
    /// values share a fingerprint regardless of field order or omitted fields.
    pub fn fingerprint(&self) -> String {
        let normalized = self.normalized();
        let encoded = serde_json::to_vec(&normalized).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        let mut hex = format!("{digest:x}");
        hex.truncate(FINGERPRINT_LEN);
        hex
    }

    fn normalized(&self) -> NormalizedFilters {
        let location = match (self.primary_city(), self.geo()) {
            (Some(city), _) => LocationKey::City {
                name: city.to_lowercase(),
            },
            (None, Some(geo)) => LocationKey::Coordinates {
                lat_e2: (geo.latitude * 100.0).round() as i64,
                lng_e2: (geo.longitude * 100.0).round() as i64,
            },
            (None, None) => LocationKey::Anywhere,
        };
        let range = self.date_range.unwrap_or_default();
        NormalizedFilters {
            location,
            genres: normalize_genres(&self.genres),
            radius_miles: self.radius_miles.unwrap_or(DEFAULT_RADIUS_MILES),
            date_from_ms: range.from.map(|d| d.timestamp_millis()),
            date_to_ms: range.to.map(|d| d.timestamp_millis()),
            include_past: self.include_past.unwrap_or(false),
            max_days_ahead: self.max_days_ahead.unwrap_or(DEFAULT_MAX_DAYS_AHEAD),
        }
    }

    /// Resolves the query sent to the backend. A city wins over coordinates,
    /// an empty genre list falls back to `top_genres`, and a date range end
    /// sets `max_days_ahead`.
    pub fn to_query(&self, top_genres: &[String], now: DateTime<Utc>) -> FeedQuery {
        let city = self.primary_city();
        let geo = if city.is_some() { None } else { self.geo() };
        let genres = if self.genres.iter().any(|g| !g.trim().is_empty()) {
            normalize_genres(&self.genres)
        } else {
            normalize_genres(top_genres)
        };
        let range = self.date_range.unwrap_or_default();
        let max_days_ahead = match range.to {
            Some(to) => days_until_ceil(now, to),
            None => self.max_days_ahead.unwrap_or(DEFAULT_MAX_DAYS_AHEAD),
        };
        FeedQuery {
            city,
            geo,
            genres,
            radius_miles: self.radius_miles.unwrap_or(DEFAULT_RADIUS_MILES),
            date_from: range.from,
            date_to: range.to,
            include_past: self.include_past.unwrap_or(false),
            max_days_ahead,
        }
    }
}

fn normalize_genres(genres: &[String]) -> Vec<String> {
    let mut out: Vec<String> = genres
        .iter()
        .map(|g| clean_text(g).to_lowercase())
        .filter(|g| !g.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn days_until_ceil(now: DateTime<Utc>, to: DateTime<Utc>) -> u32 {
    let millis = (to - now).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    let days = (millis + MILLIS_PER_DAY - 1) / MILLIS_PER_DAY;
    u32::try_from(days).unwrap_or(u32::MAX)
}
