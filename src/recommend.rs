//! Artist-affinity scoring for recommended events.
//!
//! Nearby candidates are kept only when they match one of the user's top
//! artists, then ranked by popularity, how soon they start and how close they
//! are. When no nearby event matches, upcoming shows of the top artists are
//! ranked instead.
//!
//! Sections never call this on their own. It is a ranking helper for callers
//! that hold the user's top-artist data, applied to events they already
//! loaded, for example a section's [`crate::SectionSnapshot::events`].

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::models::EventItem;

const DEFAULT_POPULARITY: u32 = 50;
const UNKNOWN_DISTANCE_SCORE: f64 = 10.0;
const EXACT_MATCH_BONUS: f64 = 15.0;
const PARTIAL_MATCH_BONUS: f64 = 5.0;
pub const FALLBACK_ARTISTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopArtist {
    pub name: String,
    #[serde(default)]
    pub popularity: Option<u32>,
}

impl TopArtist {
    fn base_score(&self) -> f64 {
        f64::from(self.popularity.unwrap_or(DEFAULT_POPULARITY))
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub event: EventItem,
    pub distance_miles: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredEvent {
    pub event: EventItem,
    pub score: f64,
    pub reason: String,
    pub matched_artist: Option<String>,
    pub distance_miles: Option<f64>,
}

/// Bonus for events starting soon. Unparsable dates get nothing.
pub fn time_bonus(starts_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(start) = starts_at else {
        return 0.0;
    };
    let days = (start - now).num_seconds() as f64 / 86_400.0;
    match days {
        d if d <= 7.0 => 20.0,
        d if d <= 14.0 => 15.0,
        d if d <= 30.0 => 10.0,
        d if d <= 60.0 => 5.0,
        _ => 0.0,
    }
}

pub fn distance_score(distance_miles: Option<f64>) -> f64 {
    match distance_miles {
        Some(d) if d > 0.0 => (10.0 - d / 5.0).max(0.0),
        _ => UNKNOWN_DISTANCE_SCORE,
    }
}

fn matching_artist<'a>(artists: &'a [TopArtist], event: &EventItem) -> Option<&'a TopArtist> {
    let performer = event.artist_name.as_deref()?.trim().to_lowercase();
    if performer.is_empty() {
        return None;
    }
    artists.iter().find(|artist| {
        let name = artist.name.trim().to_lowercase();
        !name.is_empty()
            && (name == performer || performer.contains(&name) || name.contains(&performer))
    })
}

fn because(artist: &TopArtist) -> String {
    format!("Based on your listening - you love {}", artist.name)
}

/// Ranks nearby candidates that feature one of `artists`.
pub fn score_nearby(
    candidates: Vec<Candidate>,
    artists: &[TopArtist],
    limit: usize,
    now: DateTime<Utc>,
    tz: Tz,
) -> Vec<ScoredEvent> {
    let mut scored: Vec<ScoredEvent> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let artist = matching_artist(artists, &candidate.event)?;
            let score = artist.base_score()
                + time_bonus(candidate.event.starts_at(tz), now)
                + distance_score(candidate.distance_miles);
            Some(ScoredEvent {
                reason: because(artist),
                matched_artist: Some(artist.name.clone()),
                distance_miles: candidate.distance_miles,
                event: candidate.event,
                score,
            })
        })
        .collect();
    rank(&mut scored, limit);
    scored
}

pub fn artist_match_score(artist: &TopArtist, event: &EventItem, now: DateTime<Utc>, tz: Tz) -> f64 {
    let exact = event
        .artist_name
        .as_deref()
        .is_some_and(|name| name.trim().eq_ignore_ascii_case(artist.name.trim()));
    let bonus = if exact {
        EXACT_MATCH_BONUS
    } else {
        PARTIAL_MATCH_BONUS
    };
    artist.base_score() + time_bonus(event.starts_at(tz), now) + bonus
}

/// Ranks each artist's own upcoming shows, for when nothing nearby matched.
/// Only the first [`FALLBACK_ARTISTS`] artists are used.
pub fn score_fallback(
    shows: Vec<(TopArtist, Vec<EventItem>)>,
    limit: usize,
    max_days_ahead: u32,
    now: DateTime<Utc>,
    tz: Tz,
) -> Vec<ScoredEvent> {
    let horizon = now + Duration::days(i64::from(max_days_ahead));
    let mut scored = Vec::new();
    for (artist, events) in shows.into_iter().take(FALLBACK_ARTISTS) {
        for event in events {
            let upcoming = event
                .starts_at(tz)
                .is_some_and(|start| start >= now && start <= horizon);
            if !upcoming {
                continue;
            }
            scored.push(ScoredEvent {
                score: artist_match_score(&artist, &event, now, tz),
                reason: because(&artist),
                matched_artist: Some(artist.name.clone()),
                distance_miles: None,
                event,
            });
        }
    }
    rank(&mut scored, limit);
    scored
}

fn rank(scored: &mut Vec<ScoredEvent>, limit: usize) {
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(limit);
}

/// Human-readable reason a scored event was recommended.
pub fn explain(scored: &ScoredEvent) -> String {
    if !scored.reason.is_empty() {
        return scored.reason.clone();
    }
    if let Some(artist) = &scored.matched_artist {
        return format!("Recommended because you listen to {artist}");
    }
    match scored.distance_miles {
        Some(d) if d > 0.0 => format!("Recommended event near you ({} miles away)", d.round()),
        _ => "Recommended for you".to_string(),
    }
}
