use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
    time::Duration,
};

use anyhow::Context;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::utils;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:54321/rest/v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    pub backend_url: String,
    pub backend_api_key: Option<String>,
    pub page_size: usize,
    pub batch_size: usize,
    pub prefetch_threshold: usize,
    pub cache_ttl_secs: u64,
    pub recommended_timeout_secs: u64,
    pub default_radius_miles: u32,
    pub default_max_days_ahead: u32,
    pub trending_limit: usize,
    pub network_limit: usize,
    pub following_limit: usize,
    pub pull_refresh_threshold: f32,
    pub timezone: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            backend_api_key: None,
            page_size: 20,
            batch_size: 100,
            prefetch_threshold: 60,
            cache_ttl_secs: 300,
            recommended_timeout_secs: 30,
            default_radius_miles: 50,
            default_max_days_ahead: 90,
            trending_limit: 12,
            network_limit: 20,
            following_limit: 20,
            pull_refresh_threshold: 80.0,
            timezone: "UTC".to_string(),
        }
    }
}

impl FeedConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn recommended_timeout(&self) -> Duration {
        Duration::from_secs(self.recommended_timeout_secs)
    }

    /// Feed timezone, falling back to UTC on an unknown name.
    pub fn tz(&self) -> Tz {
        self.timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(timezone = %self.timezone, "unknown timezone, using UTC");
            Tz::UTC
        })
    }

    /// Applies `SHOW_FEED_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("SHOW_FEED_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Ok(key) = std::env::var("SHOW_FEED_BACKEND_KEY") {
            self.backend_api_key = Some(key);
        }
        if let Ok(tz) = std::env::var("SHOW_FEED_TIMEZONE") {
            self.timezone = tz;
        }
        override_parsed("SHOW_FEED_PAGE_SIZE", &mut self.page_size);
        override_parsed("SHOW_FEED_BATCH_SIZE", &mut self.batch_size);
        override_parsed("SHOW_FEED_CACHE_TTL_SECS", &mut self.cache_ttl_secs);
        override_parsed(
            "SHOW_FEED_RECOMMENDED_TIMEOUT_SECS",
            &mut self.recommended_timeout_secs,
        );
    }
}

fn override_parsed<T: FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            info!(key, "config override from environment");
            *slot = value;
        }
        Err(_) => warn!(key, value = %raw, "ignoring invalid environment override"),
    }
}

pub struct ConfigStore {
    path: PathBuf,
    data: Mutex<FeedConfig>,
}

impl ConfigStore {
    pub fn load() -> Self {
        Self::load_from(utils::config_path())
    }

    pub fn load_from(path: PathBuf) -> Self {
        let mut data = read_config(&path).unwrap_or_else(|err| {
            warn!(path = ?path, "failed to read config, using defaults: {err:#}");
            FeedConfig::default()
        });
        data.apply_env();
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn read(&self) -> FeedConfig {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update<F>(&self, transform: F) -> anyhow::Result<FeedConfig>
    where
        F: FnOnce(&mut FeedConfig),
    {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| anyhow::anyhow!("config mutex poisoned"))?;
        transform(&mut guard);
        write_config(&self.path, &guard)?;
        Ok(guard.clone())
    }
}

fn read_config(path: &Path) -> anyhow::Result<FeedConfig> {
    if !path.exists() {
        return Ok(FeedConfig::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

fn write_config(path: &Path, config: &FeedConfig) -> anyhow::Result<()> {
    utils::ensure_parent(path);
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}
