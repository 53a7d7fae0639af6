//! Host capabilities used by credential sources: persisted key-value storage
//! and cookie reads.

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::RwLock;
use reqwest::cookie::{CookieStore as _, Jar};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Error type for storage and cookie operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed getting cookie '{name}' by fetching {ping_url}")]
    CookieMissing { name: String, ping_url: String },
}

/// Persistent string storage, keyed like the browser's local storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// JSON file backed storage. The whole map is rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        "Ignoring unreadable token store {}: {}",
                        path.display(),
                        e
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// `~/.redrust/storage.json`, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".redrust");
        path.push("storage.json");
        path
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, entries: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let json = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, json)?;
        debug!("Saved token store to {}", self.path.display());
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}

/// Read access to the session's cookies.
#[async_trait]
pub trait CookieStore: Send + Sync {
    fn cookie(&self, name: &str) -> Option<String>;

    /// Fetch `url` so that its `Set-Cookie` headers land in the store.
    async fn ping(&self, url: &str) -> Result<(), StoreError>;
}

/// Get a cookie, pinging `ping_url` once if it is not present yet.
pub async fn cookie_or_ping(
    cookies: &dyn CookieStore,
    name: &str,
    ping_url: &str,
) -> Result<String, StoreError> {
    if let Some(value) = cookies.cookie(name) {
        return Ok(value);
    }

    debug!("Cookie '{}' not found, pinging {}", name, ping_url);
    let separator = if ping_url.contains('?') { '&' } else { '?' };
    let busted = format!(
        "{}{}v={}",
        ping_url,
        separator,
        chrono::Utc::now().timestamp_millis()
    );
    cookies.ping(&busted).await?;

    cookies.cookie(name).ok_or_else(|| StoreError::CookieMissing {
        name: name.to_string(),
        ping_url: ping_url.to_string(),
    })
}

/// Parse a `Cookie:` header value (`a=b; c=d`) into pairs.
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.is_empty() || value.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Fixed cookie set, e.g. copied from a browser session.
#[derive(Debug, Default)]
pub struct StaticCookies {
    cookies: RwLock<HashMap<String, String>>,
}

impl StaticCookies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_header(header: &str) -> Self {
        Self {
            cookies: RwLock::new(parse_cookie_header(header)),
        }
    }

    pub fn insert(&self, name: &str, value: &str) {
        self.cookies
            .write()
            .insert(name.to_string(), value.to_string());
    }
}

#[async_trait]
impl CookieStore for StaticCookies {
    fn cookie(&self, name: &str) -> Option<String> {
        self.cookies.read().get(name).cloned()
    }

    async fn ping(&self, url: &str) -> Result<(), StoreError> {
        debug!("Static cookie set cannot ping {}", url);
        Ok(())
    }
}

/// Cookies held in a `reqwest` jar shared with the transport, so pings and
/// API responses both update it.
pub struct JarCookies {
    jar: Arc<Jar>,
    origin: Url,
    client: reqwest::Client,
}

impl JarCookies {
    pub fn new(jar: Arc<Jar>, origin: Url, user_agent: &str) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .cookie_provider(jar.clone())
            .build()?;

        Ok(Self {
            jar,
            origin,
            client,
        })
    }

    /// Seed the jar from a `Cookie:` header value for the origin.
    pub fn seed(&self, header: &str) {
        let domain = self.cookie_domain();
        for (name, value) in parse_cookie_header(header) {
            let cookie = match &domain {
                Some(domain) => format!("{}={}; Domain=.{}; Path=/", name, value, domain),
                None => format!("{}={}; Path=/", name, value),
            };
            self.jar.add_cookie_str(&cookie, &self.origin);
        }
    }

    // www.reddit.com -> reddit.com, so sh./mod. pings share the cookies
    fn cookie_domain(&self) -> Option<String> {
        match self.origin.host()? {
            url::Host::Domain(host) => match host.split_once('.') {
                Some((_, rest)) if rest.contains('.') => Some(rest.to_string()),
                _ => Some(host.to_string()),
            },
            _ => None,
        }
    }
}

#[async_trait]
impl CookieStore for JarCookies {
    fn cookie(&self, name: &str) -> Option<String> {
        let header = self.jar.cookies(&self.origin)?;
        let header = header.to_str().ok()?;
        parse_cookie_header(header).remove(name)
    }

    async fn ping(&self, url: &str) -> Result<(), StoreError> {
        // Only the Set-Cookie side effect matters; failures are ignored.
        match self.client.get(url).send().await {
            Ok(response) => debug!("Pinged {} ({})", url, response.status()),
            Err(e) => debug!("Ping to {} failed: {}", url, e),
        }
        Ok(())
    }
}
