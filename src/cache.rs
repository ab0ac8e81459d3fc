//! Best-effort snapshot cache with a TTL, namespaced keys and eviction
//! under storage pressure. Storage is pluggable: an in-memory map or a
//! SQLite key-value table.

use std::{
    collections::HashMap,
    fmt,
    marker::PhantomData,
    path::Path,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::EventItem;
use crate::utils;

pub const FEED_NAMESPACE: &str = "recommendations_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheWriteFailure {
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        utils::now_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Raw string storage underneath a [`TtlCache`].
pub trait CacheStorage: Send + Sync {
    fn get_raw(&self, key: &str) -> Option<String>;
    fn put_raw(&self, key: &str, value: &str) -> Result<(), CacheWriteFailure>;
    fn remove(&self, key: &str);
    /// Removes every key starting with `prefix`, returning how many went.
    fn remove_prefix(&self, prefix: &str) -> usize;
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects writes that would push keys plus values past `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CacheStorage for MemoryStorage {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<(), CacheWriteFailure> {
        let mut entries = self.lock();
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used.saturating_add(key.len() + value.len()) > quota {
                return Err(CacheWriteFailure::QuotaExceeded);
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        before - entries.len()
    }
}

/// Single-table key-value store on SQLite.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    quota_bytes: Option<usize>,
}

impl SqliteStorage {
    pub fn open_default() -> rusqlite::Result<Self> {
        let path = utils::cache_database_path();
        utils::ensure_parent(&path);
        Self::open(&path)
    }

    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    fn from_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries(
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                written_at_ms INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            quota_bytes: None,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn write_failure(err: rusqlite::Error) -> CacheWriteFailure {
    match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => CacheWriteFailure::QuotaExceeded,
        _ => CacheWriteFailure::Unavailable(err.to_string()),
    }
}

impl CacheStorage for SqliteStorage {
    fn get_raw(&self, key: &str) -> Option<String> {
        let conn = self.lock();
        conn.query_row(
            "SELECT payload FROM cache_entries WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_else(|err| {
            warn!(key, %err, "cache read failed");
            None
        })
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<(), CacheWriteFailure> {
        let conn = self.lock();
        if let Some(quota) = self.quota_bytes {
            let used: i64 = conn
                .query_row(
                    "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(payload)), 0)
                     FROM cache_entries WHERE key <> ?1",
                    params![key],
                    |row| row.get(0),
                )
                .map_err(write_failure)?;
            let used = usize::try_from(used).unwrap_or(usize::MAX);
            if used.saturating_add(key.len() + value.len()) > quota {
                return Err(CacheWriteFailure::QuotaExceeded);
            }
        }
        conn.execute(
            "INSERT INTO cache_entries (key, payload, written_at_ms)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               payload = excluded.payload,
               written_at_ms = excluded.written_at_ms",
            params![key, value, utils::now_millis()],
        )
        .map_err(write_failure)?;
        Ok(())
    }

    fn remove(&self, key: &str) {
        let conn = self.lock();
        if let Err(err) = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]) {
            warn!(key, %err, "cache delete failed");
        }
    }

    fn remove_prefix(&self, prefix: &str) -> usize {
        let conn = self.lock();
        // substr instead of LIKE: the namespace itself contains '_'.
        conn.execute(
            "DELETE FROM cache_entries WHERE substr(key, 1, ?1) = ?2",
            params![prefix.chars().count() as i64, prefix],
        )
        .unwrap_or_else(|err| {
            warn!(prefix, %err, "cache prefix delete failed");
            0
        })
    }
}

/// Stored form of a cached value. The payload field is named `events` to
/// match the feed snapshot layout `{events, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry<V> {
    #[serde(rename = "events")]
    pub value: V,
    pub timestamp: i64,
}

pub struct TtlCache<K, V> {
    storage: Arc<dyn CacheStorage>,
    namespace: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn(&K) -> V>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            namespace: self.namespace.clone(),
            ttl: self.ttl,
            clock: Arc::clone(&self.clock),
            _marker: PhantomData,
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: fmt::Display,
    V: Serialize + DeserializeOwned,
{
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        namespace: impl Into<String>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
            ttl,
            clock,
            _marker: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn storage_key(&self, key: &K) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// The cached value if present and no older than the TTL. Stale or
    /// unreadable entries are removed.
    pub fn get(&self, key: &K) -> Option<V> {
        let storage_key = self.storage_key(key);
        let raw = self.storage.get_raw(&storage_key)?;
        let entry: CacheEntry<V> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(key = %storage_key, %err, "dropping unreadable cache entry");
                self.storage.remove(&storage_key);
                return None;
            }
        };
        let age = self.clock.now_millis() - entry.timestamp;
        let ttl = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        if age > ttl {
            debug!(key = %storage_key, age_ms = age, "cache entry expired");
            self.storage.remove(&storage_key);
            return None;
        }
        Some(entry.value)
    }

    /// Writes `value` stamped with the current time. On a quota failure the
    /// namespace is evicted and the write retried once; a second failure is
    /// dropped.
    pub fn put(&self, key: &K, value: &V) {
        let storage_key = self.storage_key(key);
        let entry = CacheEntry {
            value,
            timestamp: self.clock.now_millis(),
        };
        let payload = match serde_json::to_string(&entry) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key = %storage_key, %err, "cache entry could not be serialized");
                return;
            }
        };

        match self.storage.put_raw(&storage_key, &payload) {
            Ok(()) => {}
            Err(CacheWriteFailure::QuotaExceeded) => {
                let evicted = self.evict_namespace();
                debug!(key = %storage_key, evicted, "cache quota exceeded, evicted namespace");
                if let Err(err) = self.storage.put_raw(&storage_key, &payload) {
                    debug!(key = %storage_key, %err, "cache write dropped after retry");
                }
            }
            Err(err) => debug!(key = %storage_key, %err, "cache write dropped"),
        }
    }

    pub fn remove(&self, key: &K) {
        self.storage.remove(&self.storage_key(key));
    }

    pub fn evict_namespace(&self) -> usize {
        self.storage.remove_prefix(&self.namespace)
    }
}

/// Cache key for one user and filter fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub user_id: String,
    pub fingerprint: String,
}

impl FeedKey {
    pub fn new(user_id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.user_id, self.fingerprint)
    }
}

pub type FeedCache = TtlCache<FeedKey, Vec<EventItem>>;

pub fn feed_cache(storage: Arc<dyn CacheStorage>, ttl: Duration, clock: Arc<dyn Clock>) -> FeedCache {
    TtlCache::new(storage, FEED_NAMESPACE, ttl, clock)
}
