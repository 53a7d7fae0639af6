//! Whole-listing cache with cheap incremental refresh.
//!
//! A cached listing is refetched in full once it is older than `max_age`.
//! Younger entries are topped up by walking backward from the newest cached
//! item once `partial_after` has passed since the last fetch.
//!
//! Each listing has its own lock, held while that listing is fetched, so
//! concurrent requests for one listing share a fetch while other listings
//! stay available.

use futures::TryStreamExt;
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::client::error::ClientError;
use crate::client::listing::ListingOptions;
use crate::client::params::set_param;
use crate::client::RedditClient;

struct CacheEntry {
    cached_on_ms: i64,
    last_fetch_ms: i64,
    items: Vec<Value>,
}

impl CacheEntry {
    fn new(now_ms: i64, items: Vec<Value>) -> Self {
        Self {
            cached_on_ms: now_ms,
            last_fetch_ms: now_ms,
            items,
        }
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

enum Plan {
    Full,
    Cached(Vec<Value>),
    Partial(String),
}

pub struct ListingCache {
    max_age: Duration,
    partial_after: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

fn cache_key(path: &str, options: &ListingOptions) -> String {
    let mut key = path.to_string();
    for (name, value) in &options.params {
        key.push_str(&format!("&{}={}", name, value));
    }
    if options.oauth {
        key.push_str("&oauth");
    }
    key
}

fn fullname(item: &Value) -> Option<&str> {
    item.get("data")?.get("name")?.as_str()
}

impl ListingCache {
    pub fn new(max_age: Duration, partial_after: Duration) -> Self {
        Self {
            max_age,
            partial_after,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The complete listing at `path`, served from cache when possible.
    ///
    /// `options.limit` is ignored: the cache always holds the whole listing.
    pub async fn get(
        &self,
        client: &RedditClient,
        path: &str,
        options: ListingOptions,
    ) -> Result<Vec<Value>, ClientError> {
        let key = cache_key(path, &options);
        let slot = self.slot(&key);
        let mut entry = slot.lock().await;
        let now = client.now_ms();

        let plan = match entry.as_ref() {
            Some(cached) if !self.is_expired(cached, now) => {
                let stale = now - cached.last_fetch_ms > self.partial_after.as_millis() as i64;
                match cached.items.first().and_then(fullname) {
                    Some(newest) if stale => Plan::Partial(newest.to_string()),
                    _ => Plan::Cached(cached.items.clone()),
                }
            }
            _ => Plan::Full,
        };

        let newest = match plan {
            Plan::Cached(items) => return Ok(items),
            Plan::Full => {
                let items = Self::fetch(client, path, options.params, options.oauth).await?;
                info!("Cached {} items of listing {}", items.len(), path);
                *entry = Some(CacheEntry::new(now, items.clone()));
                drop(entry);
                self.prune(now);
                return Ok(items);
            }
            Plan::Partial(newest) => newest,
        };

        let mut params = options.params.clone();
        set_param(&mut params, "before", newest.clone());
        match Self::fetch(client, path, params, options.oauth).await {
            Ok(mut items) => {
                debug!("Listing {} has {} new items before {}", path, items.len(), newest);
                if let Some(cached) = entry.as_mut() {
                    items.append(&mut cached.items);
                    cached.items = items.clone();
                    cached.last_fetch_ms = now;
                }
                Ok(items)
            }
            Err(err) if err.has_code(400u16) => {
                // before= fails once the newest item is deleted or removed
                info!("Cursor {} vanished from {}, refetching", newest, path);
                *entry = None;
                let items = Self::fetch(client, path, options.params, options.oauth).await?;
                *entry = Some(CacheEntry::new(now, items.clone()));
                Ok(items)
            }
            Err(err) => Err(err),
        }
    }

    /// Forget every cached listing.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Number of listings currently tracked.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn is_expired(&self, entry: &CacheEntry, now: i64) -> bool {
        now - entry.cached_on_ms > self.max_age.as_millis() as i64
    }

    /// Drop listings that are empty or past `max_age`. Listings being fetched are kept.
    fn prune(&self, now: i64) {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(entry) => entry.as_ref().is_some_and(|e| !self.is_expired(e, now)),
            Err(_) => true,
        });
        let pruned = before - slots.len();
        if pruned > 0 {
            debug!("Pruned {} expired listings from the cache", pruned);
        }
    }

    async fn fetch(
        client: &RedditClient,
        path: &str,
        params: Vec<(String, String)>,
        oauth: bool,
    ) -> Result<Vec<Value>, ClientError> {
        client
            .listing::<Value>(path, ListingOptions::new(params).oauth(oauth))
            .try_collect()
            .await
    }
}
