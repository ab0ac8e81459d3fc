use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Why an event made it into the unified feed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Recommended,
    Trending,
    FriendInterested,
    Following,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Recommended => "recommended",
            Reason::Trending => "trending",
            Reason::FriendInterested => "friend_interested",
            Reason::Following => "following",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct EventImage {
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct EventItem {
    #[serde(alias = "id")]
    pub event_id: String,
    pub title: String,
    pub artist_name: Option<String>,
    pub venue_name: Option<String>,
    pub venue_city: Option<String>,
    pub event_date: String, // ISO-8601, may be date-only
    pub image_url: Option<String>,
    pub poster_image_url: Option<String>,
    pub event_media_url: Option<String>,
    pub images: Vec<EventImage>,
    pub interested_count: u32,
    pub user_is_interested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followed_artist_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followed_venue_id: Option<String>,
}

impl EventItem {
    pub fn display_title(&self) -> String {
        let title = self.title.trim();
        if !title.is_empty() {
            return title.to_string();
        }
        self.artist_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| "Event".to_string())
    }

    pub fn best_image_url(&self) -> Option<&str> {
        if let Some(url) = non_empty(&self.event_media_url) {
            return Some(url);
        }
        let preferred = self.images.iter().find(|img| {
            img.url.as_deref().is_some_and(|u| !u.is_empty())
                && (img.ratio.as_deref() == Some("16_9") || img.width.is_some_and(|w| w > 1000))
        });
        let any = || {
            self.images
                .iter()
                .find(|img| img.url.as_deref().is_some_and(|u| !u.is_empty()))
        };
        if let Some(image) = preferred.or_else(any) {
            return image.url.as_deref();
        }
        non_empty(&self.poster_image_url).or_else(|| non_empty(&self.image_url))
    }

    /// Start time of the event, or `None` when `event_date` cannot be parsed.
    /// Naive and date-only values are read in `tz`.
    pub fn starts_at(&self, tz: Tz) -> Option<DateTime<Utc>> {
        parse_event_date(&self.event_date, tz)
    }

    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

pub fn parse_event_date(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return localize(naive, tz);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .and_then(|naive| localize(naive, tz))
}

fn localize(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> EventItem {
        EventItem {
            event_id: id.to_string(),
            event_date: "2026-10-20T20:00:00Z".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn title_falls_back_to_artist_then_placeholder() {
        let mut item = event("a");
        item.artist_name = Some("Khruangbin".to_string());
        assert_eq!(item.display_title(), "Khruangbin");
        item.artist_name = None;
        assert_eq!(item.display_title(), "Event");
        item.title = "Night Show".to_string();
        assert_eq!(item.display_title(), "Night Show");
    }

    #[test]
    fn image_selection_prefers_media_then_wide_images() {
        let mut item = event("a");
        item.poster_image_url = Some("poster.jpg".to_string());
        item.images = vec![
            EventImage {
                url: Some("small.jpg".to_string()),
                ratio: Some("3_2".to_string()),
                width: Some(300),
            },
            EventImage {
                url: Some("wide.jpg".to_string()),
                ratio: None,
                width: Some(2048),
            },
        ];
        assert_eq!(item.best_image_url(), Some("wide.jpg"));

        item.images[1].width = Some(640);
        assert_eq!(item.best_image_url(), Some("small.jpg"));

        item.images.clear();
        assert_eq!(item.best_image_url(), Some("poster.jpg"));

        item.event_media_url = Some("media.jpg".to_string());
        assert_eq!(item.best_image_url(), Some("media.jpg"));
    }

    #[test]
    fn parses_supported_date_shapes() {
        let tz: Tz = "America/Chicago".parse().unwrap();
        let rfc = parse_event_date("2026-10-20T20:00:00-05:00", tz).unwrap();
        assert_eq!(rfc.to_rfc3339(), "2026-10-21T01:00:00+00:00");

        let naive = parse_event_date("2026-10-20T20:00:00", tz).unwrap();
        assert_eq!(naive, rfc);

        let date_only = parse_event_date("2026-10-20", tz).unwrap();
        assert_eq!(date_only.to_rfc3339(), "2026-10-20T05:00:00+00:00");

        assert!(parse_event_date("next friday", tz).is_none());
        assert!(parse_event_date("", tz).is_none());
    }

    #[test]
    fn reason_serializes_snake_case() {
        let item = event("a").with_reason(Reason::FriendInterested);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["reason"], "friend_interested");
        let back: EventItem = serde_json::from_value(json).unwrap();
        assert_eq!(back.reason, Some(Reason::FriendInterested));
    }
}
