//! Configuration module for handling environment variables and .env files

use crate::auth::sources::HostSession;
use crate::auth::store::{FileStore, JarCookies};
use crate::auth::jwt_expiry_ms;
use crate::client::{ClientConfig, ClientError, RedditClient, DEFAULT_USER_AGENT};
use crate::client::transport::ReqwestTransport;
use dotenv::dotenv;
use log::{info, warn};
use reqwest::cookie::Jar;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration derived from environment variables and .env file
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Endpoints
    pub origin: Option<String>,
    pub oauth_origin: Option<String>,
    pub gql_url: Option<String>,
    pub user_agent: String,

    // Credentials handed over directly
    pub access_token: Option<String>,
    /// Epoch milliseconds. Read from the token itself when unset.
    pub access_token_expires: Option<i64>,
    pub modhash: Option<String>,
    /// `Cookie:` header value, e.g. copied from a logged in browser.
    pub cookies: Option<String>,

    pub token_store: PathBuf,

    // Engine tuning
    pub ratelimit_ms: Option<u64>,
    pub ratelimit_jitter_ms: Option<u64>,
    pub error_parse_max_size: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            origin: None,
            oauth_origin: None,
            gql_url: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            access_token: None,
            access_token_expires: None,
            modhash: None,
            cookies: None,
            token_store: FileStore::default_path(),
            ratelimit_ms: None,
            ratelimit_jitter_ms: None,
            error_parse_max_size: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}: cannot parse {:?}", name, raw);
            None
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and .env file
    pub fn load() -> Self {
        // Try to load .env file, but continue even if it doesn't exist
        match dotenv() {
            Ok(_) => info!("Loaded environment from .env file"),
            Err(_) => info!("No .env file found, using system environment variables only"),
        }

        let mut config = Self::default();

        if let Ok(origin) = env::var("REDDIT_ORIGIN") {
            config.origin = Some(origin);
        }

        if let Ok(oauth_origin) = env::var("REDDIT_OAUTH_ORIGIN") {
            config.oauth_origin = Some(oauth_origin);
        }

        if let Ok(gql_url) = env::var("REDDIT_GQL_URL") {
            config.gql_url = Some(gql_url);
        }

        if let Ok(user_agent) = env::var("REDDIT_USER_AGENT") {
            config.user_agent = user_agent;
        }

        if let Ok(access_token) = env::var("REDDIT_ACCESS_TOKEN") {
            config.access_token = Some(access_token);
        }
        config.access_token_expires = parsed("REDDIT_ACCESS_TOKEN_EXPIRES");

        if let Ok(modhash) = env::var("REDDIT_MODHASH") {
            config.modhash = Some(modhash);
        }

        if let Ok(cookies) = env::var("REDDIT_COOKIES") {
            config.cookies = Some(cookies);
        }

        if let Ok(path) = env::var("REDDIT_TOKEN_STORE") {
            config.token_store = PathBuf::from(path);
        }

        config.ratelimit_ms = parsed("REDDIT_RATELIMIT_MS");
        config.ratelimit_jitter_ms = parsed("REDDIT_RATELIMIT_JITTER_MS");
        config.error_parse_max_size = parsed("REDDIT_ERROR_PARSE_MAX_SIZE");

        config
    }

    /// Engine settings with the configured overrides applied.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            user_agent: self.user_agent.clone(),
            ..ClientConfig::default()
        };

        if let Some(origin) = &self.origin {
            config.origin = origin.clone();
        }
        if let Some(oauth_origin) = &self.oauth_origin {
            config.oauth_origin = oauth_origin.clone();
        }
        if let Some(gql_url) = &self.gql_url {
            config.gql_url = gql_url.clone();
        }
        if let Some(ms) = self.ratelimit_ms {
            config.ratelimit_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.ratelimit_jitter_ms {
            config.ratelimit_jitter = Duration::from_millis(ms);
        }
        if let Some(size) = self.error_parse_max_size {
            config.error_parse_max_size = size;
        }

        config
    }

    /// Credentials from the configuration, as the first link of every chain.
    pub fn host_session(&self) -> HostSession {
        let session = HostSession::new();

        if let Some(token) = &self.access_token {
            match self.access_token_expires.map(Ok).unwrap_or_else(|| jwt_expiry_ms(token)) {
                Ok(expires) => session.set_access_token(token.clone(), expires),
                Err(e) => warn!("Ignoring REDDIT_ACCESS_TOKEN: {}", e),
            }
        }
        if let Some(modhash) = &self.modhash {
            session.set_modhash(modhash.clone());
        }

        session
    }

    /// Create a RedditClient with the standard credential sources wired up
    pub fn create_client(&self) -> Result<RedditClient, ClientError> {
        let config = self.client_config();
        let origin = url::Url::parse(&config.origin)?;

        let jar = Arc::new(Jar::default());
        let transport = ReqwestTransport::with_cookie_jar(&config.user_agent, jar.clone())?;
        let cookies = JarCookies::new(jar, origin, &config.user_agent)
            .map_err(|e| ClientError::Config(e.to_string()))?;
        if let Some(header) = &self.cookies {
            cookies.seed(header);
        }

        let store = FileStore::open(&self.token_store).map_err(|e| {
            ClientError::Config(format!(
                "cannot open token store {}: {}",
                self.token_store.display(),
                e
            ))
        })?;
        info!("Using token store at {}", store.path().display());

        RedditClient::builder(config)
            .transport(Arc::new(transport))
            .cookies(Arc::new(cookies))
            .store(Arc::new(store))
            .standard_sources(Arc::new(self.host_session()))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_overrides() {
        let app = AppConfig {
            origin: Some("https://sh.reddit.com".to_string()),
            ratelimit_ms: Some(250),
            error_parse_max_size: Some(1024),
            ..AppConfig::default()
        };

        let config = app.client_config();
        assert_eq!(config.origin, "https://sh.reddit.com");
        assert_eq!(config.oauth_origin, "https://oauth.reddit.com");
        assert_eq!(config.ratelimit_interval, Duration::from_millis(250));
        assert_eq!(config.ratelimit_jitter, Duration::from_millis(100));
        assert_eq!(config.error_parse_max_size, 1024);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
    }

    #[tokio::test]
    async fn test_session_uses_explicit_expiry() {
        let app = AppConfig {
            access_token: Some("opaque".to_string()),
            access_token_expires: Some(i64::MAX),
            modhash: Some("mh".to_string()),
            ..AppConfig::default()
        };

        let session = Arc::new(app.host_session());
        let client = RedditClient::builder(app.client_config())
            .standard_sources(session)
            .build()
            .unwrap();

        assert_eq!(client.access_token().await.unwrap(), "opaque");
        assert_eq!(client.modhash().await.unwrap(), "mh");
    }
}
