//! Request façade over Reddit's REST and GraphQL endpoints.

pub mod error;
pub mod listing;
pub mod listing_cache;
pub mod normalize;
pub mod params;
pub mod ratelimit;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use futures::stream::BoxStream;
use log::{debug, info};
use reqwest::cookie::Jar;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::auth::sources::{
    access_token_chain, matrix_chain, modhash_chain, HostSession, SourceChain, SourceContext,
};
use crate::auth::store::{
    cookie_or_ping, CookieStore, JarCookies, KeyValueStore, MemoryStore, StaticCookies,
};
use crate::auth::{Clock, CredentialCell, CredentialProvider, SystemClock};

pub use error::{ClientError, ErrorCode, RedditApiError, RedditError};
pub use listing::ListingOptions;
pub use normalize::Payload;
pub use params::Params;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, KillSwitch, RetryPolicy};

use listing_cache::ListingCache;
use params::{encode_form, set_param, set_query};
use ratelimit::RateLimiter;
use transport::{ReqwestTransport, ResilientTransport};

pub const DEFAULT_USER_AGENT: &str = "redrust/1.0 (by /u/Aggravating-Fix-3871)";

/// Engine settings. Every URL is absolute.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Site origin for non-OAuth calls, e.g. `https://www.reddit.com`.
    pub origin: String,
    pub oauth_origin: String,
    pub gql_url: String,
    /// Hosts where `/svc/shreddit/graphql` may be called.
    pub svc_hosts: Vec<String>,
    pub user_agent: String,
    pub ratelimit_interval: Duration,
    pub ratelimit_jitter: Duration,
    /// POST bodies larger than this are returned raw, without error parsing.
    pub error_parse_max_size: usize,
    pub retry: RetryPolicy,
    /// How often one POST may be resent after `RATELIMIT` errors.
    pub max_ratelimit_retries: u32,
    pub listing_max_age: Duration,
    pub listing_partial_after: Duration,
    pub csrf_ping_url: String,
    pub token_ping_url: String,
    pub matrix_login_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            origin: "https://www.reddit.com".to_string(),
            oauth_origin: "https://oauth.reddit.com".to_string(),
            gql_url: "https://gql-fed.reddit.com/".to_string(),
            svc_hosts: vec!["www.reddit.com".to_string(), "sh.reddit.com".to_string()],
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ratelimit_interval: Duration::from_millis(1000),
            ratelimit_jitter: Duration::from_millis(100),
            error_parse_max_size: 20_000_000,
            retry: RetryPolicy::default(),
            max_ratelimit_retries: 5,
            listing_max_age: Duration::from_secs(30 * 60),
            listing_partial_after: Duration::from_secs(2 * 60),
            csrf_ping_url: "https://sh.reddit.com/404".to_string(),
            token_ping_url: "https://mod.reddit.com/404".to_string(),
            matrix_login_url: "https://matrix.redditspace.com/_matrix/client/v3/login".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Form(Params),
    Json(Value),
}

/// Everything needed to send one request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub url: Url,
    pub method: Method,
    /// Authenticate with the OAuth bearer token instead of the session.
    pub oauth: bool,
    pub body: Option<RequestBody>,
    /// Wait for the shared rate limiter before sending.
    pub rate_limit: bool,
    /// Attach `x-modhash` to non-OAuth mutating requests.
    pub send_modhash: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            oauth: false,
            body: None,
            rate_limit: false,
            send_modhash: true,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn oauth(mut self, oauth: bool) -> Self {
        self.oauth = oauth;
        self
    }

    pub fn form(mut self, params: Params) -> Self {
        self.body = Some(RequestBody::Form(params));
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = Some(RequestBody::Json(value));
        self
    }

    pub fn rate_limit(mut self, rate_limit: bool) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn send_modhash(mut self, send_modhash: bool) -> Self {
        self.send_modhash = send_modhash;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub params: Params,
    pub oauth: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PostOptions {
    pub oauth: bool,
    /// Overrides [`ClientConfig::error_parse_max_size`].
    pub error_parse_max_size: Option<usize>,
}

struct ClientInner {
    config: ClientConfig,
    origin: Url,
    oauth_origin: Url,
    gql_url: Url,
    transport: Arc<ResilientTransport>,
    cookies: Arc<dyn CookieStore>,
    clock: Arc<dyn Clock>,
    ratelimiter: RateLimiter,
    modhash: Arc<CredentialCell>,
    access_token: Arc<CredentialCell>,
    matrix_token: Arc<CredentialCell>,
    listing_cache: ListingCache,
}

/// Reddit client. Clones share credentials, the rate limiter and the listing cache.
#[derive(Clone)]
pub struct RedditClient {
    inner: Arc<ClientInner>,
}

pub struct RedditClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    cookies: Option<Arc<dyn CookieStore>>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    kill_switch: KillSwitch,
    session: Option<Arc<HostSession>>,
    access_token: Option<Arc<dyn CredentialProvider>>,
    modhash: Option<Arc<dyn CredentialProvider>>,
    matrix_token: Option<Arc<dyn CredentialProvider>>,
}

impl RedditClientBuilder {
    /// Send requests through `transport` instead of a fresh `reqwest` client.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cookies(mut self, cookies: Arc<dyn CookieStore>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    /// Persistent storage for tokens. Defaults to memory.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn kill_switch(mut self, kill_switch: KillSwitch) -> Self {
        self.kill_switch = kill_switch;
        self
    }

    /// Acquire credentials the standard way, starting from `session`.
    pub fn standard_sources(mut self, session: Arc<HostSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn access_token_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.access_token = Some(provider);
        self
    }

    pub fn modhash_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.modhash = Some(provider);
        self
    }

    pub fn matrix_token_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.matrix_token = Some(provider);
        self
    }

    pub fn build(self) -> Result<RedditClient, ClientError> {
        let config = self.config;
        let origin = Url::parse(&config.origin)?;
        let oauth_origin = Url::parse(&config.oauth_origin)?;
        let gql_url = Url::parse(&config.gql_url)?;
        let matrix_login_url = Url::parse(&config.matrix_login_url)?;

        let (inner_transport, cookies): (Arc<dyn HttpTransport>, Arc<dyn CookieStore>) =
            match (self.transport, self.cookies) {
                (Some(transport), Some(cookies)) => (transport, cookies),
                (Some(transport), None) => {
                    let cookies: Arc<dyn CookieStore> = Arc::new(StaticCookies::new());
                    (transport, cookies)
                }
                (None, cookies) => {
                    let jar = Arc::new(Jar::default());
                    let transport: Arc<dyn HttpTransport> = Arc::new(
                        ReqwestTransport::with_cookie_jar(&config.user_agent, jar.clone())?,
                    );
                    let cookies: Arc<dyn CookieStore> = match cookies {
                        Some(cookies) => cookies,
                        None => Arc::new(
                            JarCookies::new(jar, origin.clone(), &config.user_agent)
                                .map_err(|e| ClientError::Config(e.to_string()))?,
                        ),
                    };
                    (transport, cookies)
                }
            };

        let transport = Arc::new(ResilientTransport::new(
            inner_transport,
            config.retry,
            self.kill_switch,
        ));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let ctx = SourceContext {
            origin: origin.clone(),
            transport: transport.clone(),
            cookies: cookies.clone(),
            store,
            clock: clock.clone(),
            csrf_ping_url: config.csrf_ping_url.clone(),
            token_ping_url: config.token_ping_url.clone(),
            matrix_login_url,
        };

        let session = self.session;
        let access_provider = provider_or(
            self.access_token,
            || {
                let chain = access_token_chain(&ctx, session.clone()?);
                Some(Arc::new(chain) as Arc<dyn CredentialProvider>)
            },
            "access token",
        );
        let modhash_provider = provider_or(
            self.modhash,
            || {
                let chain = modhash_chain(&ctx, session.clone()?);
                Some(Arc::new(chain) as Arc<dyn CredentialProvider>)
            },
            "modhash",
        );

        let access_token = Arc::new(CredentialCell::new(
            "access token",
            access_provider,
            clock.clone(),
        ));
        let modhash = Arc::new(CredentialCell::new("modhash", modhash_provider, clock.clone()));

        let matrix_provider = provider_or(
            self.matrix_token,
            || {
                session.as_ref()?;
                let chain = matrix_chain(&ctx, access_token.clone());
                Some(Arc::new(chain) as Arc<dyn CredentialProvider>)
            },
            "matrix token",
        );
        let matrix_token = Arc::new(CredentialCell::new(
            "matrix token",
            matrix_provider,
            clock.clone(),
        ));

        debug!("Creating RedditClient for {} with user_agent: {}", origin, config.user_agent);

        Ok(RedditClient {
            inner: Arc::new(ClientInner {
                ratelimiter: RateLimiter::with_clock(
                    config.ratelimit_interval,
                    config.ratelimit_jitter,
                    clock.clone(),
                ),
                listing_cache: ListingCache::new(
                    config.listing_max_age,
                    config.listing_partial_after,
                ),
                config,
                origin,
                oauth_origin,
                gql_url,
                transport,
                cookies,
                clock,
                modhash,
                access_token,
                matrix_token,
            }),
        })
    }
}

/// `explicit`, else the standard chain, else a chain with no sources.
fn provider_or(
    explicit: Option<Arc<dyn CredentialProvider>>,
    standard: impl FnOnce() -> Option<Arc<dyn CredentialProvider>>,
    name: &str,
) -> Arc<dyn CredentialProvider> {
    explicit
        .or_else(standard)
        .unwrap_or_else(|| Arc::new(SourceChain::new(name)))
}

impl RedditClient {
    pub fn builder(config: ClientConfig) -> RedditClientBuilder {
        RedditClientBuilder {
            config,
            transport: None,
            cookies: None,
            store: None,
            clock: None,
            kill_switch: KillSwitch::new(),
            session: None,
            access_token: None,
            modhash: None,
            matrix_token: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn origin(&self) -> &Url {
        &self.inner.origin
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        self.inner.transport.kill_switch()
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    /// Current OAuth bearer token, refreshed if needed.
    pub async fn access_token(&self) -> Result<String, ClientError> {
        Ok(self.inner.access_token.get().await?)
    }

    pub async fn modhash(&self) -> Result<String, ClientError> {
        Ok(self.inner.modhash.get().await?)
    }

    /// Bearer token for Reddit's Matrix chat server.
    pub async fn matrix_token(&self) -> Result<String, ClientError> {
        Ok(self.inner.matrix_token.get().await?)
    }

    /// Drop all cached credentials so the next use refreshes them.
    pub async fn invalidate_credentials(&self) {
        self.inner.access_token.invalidate().await;
        self.inner.modhash.invalidate().await;
        self.inner.matrix_token.invalidate().await;
    }

    /// Resolve `path` against the OAuth or site origin. Absolute URLs are kept.
    pub fn resolve(&self, path: &str, oauth: bool) -> Result<Url, ClientError> {
        if let Ok(url) = Url::parse(path) {
            return Ok(url);
        }
        let base = if oauth { &self.inner.oauth_origin } else { &self.inner.origin };
        Ok(base.join(path)?)
    }

    /// Send one request with the credentials and rate limiting it asks for.
    pub async fn request(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<HttpResponse, ClientError> {
        let RequestDescriptor {
            url,
            method,
            oauth,
            body,
            rate_limit,
            send_modhash,
        } = descriptor;

        let mutating = !(method == Method::GET || method == Method::HEAD);
        let mut request = HttpRequest::new(method.clone(), url);

        if mutating {
            request = match body {
                Some(RequestBody::Json(value)) => request.json(&value),
                Some(RequestBody::Form(params)) => request
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(encode_form(&params)),
                None => {
                    return Err(ClientError::Config(format!(
                        "{} {} needs a form or JSON body",
                        method, request.url
                    )))
                }
            };

            if !oauth && send_modhash {
                request = request.header("x-modhash", self.modhash().await?);
            }
        }

        if oauth {
            let bearer = format!("Bearer {}", self.access_token().await?);
            request = request.header("authorization", bearer);
        }
        if rate_limit {
            self.inner.ratelimiter.wait().await;
        }

        Ok(self.inner.transport.send(request).await?)
    }

    /// GET JSON from an endpoint. Non-OAuth paths get a `.json` suffix.
    pub async fn get(&self, path: &str, options: GetOptions) -> Result<Payload, ClientError> {
        let mut url = self.resolve(path, options.oauth)?;
        for (name, value) in &options.params {
            set_query(&mut url, name, value);
        }
        if !options.oauth && !url.path().ends_with(".json") {
            let path = format!("{}.json", url.path());
            url.set_path(&path);
        }
        set_query(&mut url, "raw_json", "1");

        let response = self
            .request(RequestDescriptor::get(url.clone()).oauth(options.oauth))
            .await?;
        normalize::get_response(&response, &url)
    }

    /// Form POST with `api_type=json`, resent after `RATELIMIT` errors.
    pub async fn post(
        &self,
        url: &str,
        params: Params,
        options: PostOptions,
    ) -> Result<Payload, ClientError> {
        let url = self.resolve(url, options.oauth)?;
        let max_size = options
            .error_parse_max_size
            .unwrap_or(self.inner.config.error_parse_max_size);

        let mut body = params;
        set_param(&mut body, "api_type", "json");

        let mut retries = 0;
        loop {
            self.inner.ratelimiter.wait().await;
            let descriptor = RequestDescriptor::post(url.clone())
                .oauth(options.oauth)
                .form(body.clone());
            let response = self.request(descriptor).await?;

            match normalize::post_response(&response, &url, max_size) {
                Err(ClientError::Api(err)) if retries < self.inner.config.max_ratelimit_retries => {
                    let Some(delay) = normalize::ratelimit_delay(&err) else {
                        return Err(err.into());
                    };
                    retries += 1;
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// Run a persisted GraphQL query against the federated endpoint.
    pub async fn gql(
        &self,
        operation_name: &str,
        sha256_hash: &str,
        variables: Value,
    ) -> Result<Value, ClientError> {
        let body = json!({
            "operationName": operation_name,
            "variables": variables,
            "extensions": {
                "persistedQuery": {
                    "sha256Hash": sha256_hash,
                    "version": 1,
                },
            },
        });

        debug!("GraphQL {} ({})", operation_name, sha256_hash);
        let response = self
            .request(RequestDescriptor::post(self.inner.gql_url.clone()).oauth(true).json(body))
            .await?;
        normalize::gql_response(&response)
    }

    /// Same-origin GraphQL call authenticated by the `csrf_token` cookie.
    pub async fn svc_gql(&self, operation: &str, variables: Value) -> Result<Value, ClientError> {
        let host = self.inner.origin.host_str().unwrap_or_default();
        if !self.inner.config.svc_hosts.iter().any(|allowed| allowed == host) {
            return Err(ClientError::Config(format!(
                "SVC GraphQL is only available on {}, not {}",
                self.inner.config.svc_hosts.join(", "),
                host
            )));
        }

        let ping_url = &self.inner.config.csrf_ping_url;
        let csrf_token = cookie_or_ping(self.inner.cookies.as_ref(), "csrf_token", ping_url)
            .await
            .map_err(|e| ClientError::Csrf(e.to_string()))?;

        let body = json!({
            "operation": operation,
            "variables": variables,
            "csrf_token": csrf_token,
        });
        let url = self.inner.origin.join("/svc/shreddit/graphql")?;
        let response = self
            .request(RequestDescriptor::post(url).json(body).send_modhash(false))
            .await?;
        normalize::svc_gql_response(&response, operation)
    }

    /// Lazily stream the children of a listing.
    pub fn listing<T>(
        &self,
        path: &str,
        options: ListingOptions,
    ) -> BoxStream<'static, Result<T, ClientError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        listing::listing_stream(self.clone(), path.to_string(), options)
    }

    /// The whole listing at `path`, from the client's listing cache when fresh.
    pub async fn listing_cached(
        &self,
        path: &str,
        options: ListingOptions,
    ) -> Result<Vec<Value>, ClientError> {
        info!("Fetching cached listing {}", path);
        self.inner.listing_cache.get(self, path, options).await
    }
}
