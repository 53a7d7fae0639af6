//! Where credentials come from.
//!
//! Each credential kind is served by a [`SourceChain`]: an ordered list of
//! [`CredentialSource`]s tried until one produces a value. Sources that do
//! not apply to the current origin report [`CredentialError::Unavailable`]
//! and are skipped quietly; other failures are logged and the next source is
//! tried.

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::RwLock;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;

use crate::auth::store::{cookie_or_ping, CookieStore, KeyValueStore};
use crate::auth::{
    decode_base64_segment, jwt_expiry_ms, Clock, CredentialCell, CredentialError,
    CredentialProvider, IssuedCredential,
};
use crate::client::transport::{HttpRequest, HttpTransport};

/// Lifetime assumed for a modhash, which carries no expiry of its own.
pub const MODHASH_LIFETIME_MS: i64 = 2 * 60 * 60 * 1000;

pub const ACCESS_TOKEN_KEY: &str = "rAPI:accessToken";
pub const ACCESS_TOKEN_EXPIRY_KEY: &str = "rAPI:accessTokenExpiry";
pub const MATRIX_TOKEN_KEY: &str = "chat:access-token";
pub const MATRIX_DEVICE_ID_KEY: &str = "chat:matrix-device-id";
pub const MATRIX_ACCESS_TOKEN_KEY: &str = "chat:matrix-access-token";

/// Hosts where the shreddit token exchange is served.
const TOKEN_EXCHANGE_HOSTS: &[&str] = &["www.reddit.com", "sh.reddit.com"];

/// One way of obtaining a credential.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when the source simply has nothing to offer.
    async fn acquire(&self) -> Result<Option<IssuedCredential>, CredentialError>;

    /// Whether values from this source are written back to the chain's token slot.
    fn persists(&self) -> bool {
        true
    }
}

/// Storage location of a persisted bearer token and its expiry.
#[derive(Clone)]
pub struct TokenSlot {
    store: Arc<dyn KeyValueStore>,
    value_key: String,
    expiry_key: String,
}

impl TokenSlot {
    pub fn new(store: Arc<dyn KeyValueStore>, value_key: &str, expiry_key: &str) -> Self {
        Self {
            store,
            value_key: value_key.to_string(),
            expiry_key: expiry_key.to_string(),
        }
    }

    pub fn access_token(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, ACCESS_TOKEN_KEY, ACCESS_TOKEN_EXPIRY_KEY)
    }

    pub fn load(&self) -> Option<(String, i64)> {
        let value = self.store.get(&self.value_key).filter(|v| !v.is_empty())?;
        let expiry = self.store.get(&self.expiry_key)?.trim().parse().ok()?;
        Some((value, expiry))
    }

    pub fn save(&self, value: &str, expires_at_ms: i64) -> Result<(), CredentialError> {
        self.store.set(&self.value_key, value)?;
        self.store.set(&self.expiry_key, &expires_at_ms.to_string())?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CredentialError> {
        self.store.remove(&self.value_key)?;
        self.store.remove(&self.expiry_key)?;
        Ok(())
    }
}

/// Tries sources in order and persists what it finds.
pub struct SourceChain {
    name: String,
    sources: Vec<Box<dyn CredentialSource>>,
    persist: Option<TokenSlot>,
}

impl SourceChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            persist: None,
        }
    }

    pub fn with_source(mut self, source: impl CredentialSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn persist_to(mut self, slot: TokenSlot) -> Self {
        self.persist = Some(slot);
        self
    }

    fn persist(&self, source: &dyn CredentialSource, issued: &IssuedCredential) {
        let Some(slot) = self.persist.as_ref().filter(|_| source.persists()) else {
            return;
        };
        let expires_at_ms = match issued.expires_at_ms {
            Some(expires_at_ms) => expires_at_ms,
            None => match jwt_expiry_ms(&issued.value) {
                Ok(expires_at_ms) => expires_at_ms,
                Err(e) => {
                    warn!("Not persisting {} from {}: {}", self.name, source.name(), e);
                    return;
                }
            },
        };
        if let Err(e) = slot.save(&issued.value, expires_at_ms) {
            warn!("Failed to persist {}: {}", self.name, e);
        }
    }
}

#[async_trait]
impl CredentialProvider for SourceChain {
    async fn provide(&self) -> Result<Option<IssuedCredential>, CredentialError> {
        let mut last_error = None;

        for source in &self.sources {
            match source.acquire().await {
                Ok(Some(issued)) if !issued.value.is_empty() => {
                    debug!("Got {} from {}", self.name, source.name());
                    self.persist(source.as_ref(), &issued);
                    return Ok(Some(issued));
                }
                Ok(_) => debug!("{} has no {}", source.name(), self.name),
                Err(CredentialError::Unavailable(reason)) => {
                    debug!("Skipping {}: {}", source.name(), reason)
                }
                Err(e) => {
                    warn!("{} failed to provide {}: {}", source.name(), self.name, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

/// Everything a source may need to reach Reddit.
#[derive(Clone)]
pub struct SourceContext {
    pub origin: Url,
    pub transport: Arc<dyn HttpTransport>,
    pub cookies: Arc<dyn CookieStore>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    /// Page fetched to get a `csrf_token` cookie set.
    pub csrf_ping_url: String,
    /// Page fetched to get a `token` cookie set.
    pub token_ping_url: String,
    pub matrix_login_url: Url,
}

impl SourceContext {
    fn host(&self) -> &str {
        self.origin.host_str().unwrap_or_default()
    }

    fn endpoint(&self, path: &str) -> Result<Url, CredentialError> {
        self.origin
            .join(path)
            .map_err(|e| CredentialError::source_failure("origin", e.to_string()))
    }
}

/// Credentials handed over by the embedding host, e.g. from configuration.
#[derive(Debug, Default)]
pub struct HostSession {
    access_token: RwLock<Option<(String, i64)>>,
    modhash: RwLock<Option<String>>,
}

impl HostSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_access_token(&self, token: impl Into<String>, expires_at_ms: i64) {
        *self.access_token.write() = Some((token.into(), expires_at_ms));
    }

    pub fn set_modhash(&self, modhash: impl Into<String>) {
        *self.modhash.write() = Some(modhash.into());
    }

    pub fn clear(&self) {
        *self.access_token.write() = None;
        *self.modhash.write() = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionValue {
    AccessToken,
    Modhash,
}

pub struct SessionSource {
    session: Arc<HostSession>,
    value: SessionValue,
    clock: Arc<dyn Clock>,
}

impl SessionSource {
    pub fn new(session: Arc<HostSession>, value: SessionValue, clock: Arc<dyn Clock>) -> Self {
        Self {
            session,
            value,
            clock,
        }
    }
}

#[async_trait]
impl CredentialSource for SessionSource {
    fn name(&self) -> &str {
        "host session"
    }

    async fn acquire(&self) -> Result<Option<IssuedCredential>, CredentialError> {
        let now = self.clock.now_ms();
        Ok(match self.value {
            SessionValue::AccessToken => self
                .session
                .access_token
                .read()
                .clone()
                .filter(|(token, expires)| !token.is_empty() && *expires > now)
                .map(|(token, expires)| IssuedCredential::new(token, expires)),
            SessionValue::Modhash => self
                .session
                .modhash
                .read()
                .clone()
                .filter(|modhash| !modhash.is_empty())
                .map(|modhash| IssuedCredential::new(modhash, now + MODHASH_LIFETIME_MS)),
        })
    }

    fn persists(&self) -> bool {
        false
    }
}

/// A token persisted by an earlier run. Stale entries are removed.
pub struct StoredTokenSource {
    slot: TokenSlot,
    clock: Arc<dyn Clock>,
}

impl StoredTokenSource {
    pub fn new(slot: TokenSlot, clock: Arc<dyn Clock>) -> Self {
        Self { slot, clock }
    }
}

#[async_trait]
impl CredentialSource for StoredTokenSource {
    fn name(&self) -> &str {
        "token store"
    }

    async fn acquire(&self) -> Result<Option<IssuedCredential>, CredentialError> {
        match self.slot.load() {
            Some((token, expires)) if expires > self.clock.now_ms() => {
                debug!("Using previously cached access token from storage");
                Ok(Some(IssuedCredential::new(token, expires)))
            }
            _ => {
                self.slot.clear()?;
                debug!("No valid access token in storage, deleted cached token");
                Ok(None)
            }
        }
    }

    fn persists(&self) -> bool {
        false
    }
}

#[derive(Deserialize)]
struct ExchangedToken {
    #[serde(default)]
    token: String,
    expires: Option<Value>,
}

/// Trades the `csrf_token` cookie for a bearer token at `/svc/shreddit/token`.
pub struct CsrfExchangeSource {
    ctx: SourceContext,
}

impl CsrfExchangeSource {
    pub fn new(ctx: SourceContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CredentialSource for CsrfExchangeSource {
    fn name(&self) -> &str {
        "csrf token exchange"
    }

    async fn acquire(&self) -> Result<Option<IssuedCredential>, CredentialError> {
        let host = self.ctx.host();
        if !TOKEN_EXCHANGE_HOSTS.contains(&host) {
            return Err(CredentialError::Unavailable(format!(
                "token exchange is not served on {}",
                host
            )));
        }

        let csrf_token =
            cookie_or_ping(self.ctx.cookies.as_ref(), "csrf_token", &self.ctx.csrf_ping_url).await?;
        let request = HttpRequest::new(Method::POST, self.ctx.endpoint("/svc/shreddit/token")?)
            .json(&json!({ "csrf_token": csrf_token }));
        let response = self.ctx.transport.send(request).await?;
        let text = response.text();
        debug!("Got data from /svc/shreddit/token, response: {}", text);

        let exchanged: ExchangedToken = serde_json::from_str(&text)?;
        if exchanged.token.is_empty() {
            return Ok(None);
        }
        let expires = exchanged.expires.as_ref().and_then(expiry_ms);
        Ok(Some(IssuedCredential {
            value: exchanged.token,
            expires_at_ms: expires,
        }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenCookie {
    access_token: String,
    expires: Value,
}

/// Expiry as epoch milliseconds or an RFC 3339 timestamp.
fn expiry_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|t| t.timestamp_millis())
            }),
        _ => None,
    }
}

/// Decodes the bearer token embedded in the `token` cookie.
pub struct TokenCookieSource {
    ctx: SourceContext,
}

impl TokenCookieSource {
    pub fn new(ctx: SourceContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CredentialSource for TokenCookieSource {
    fn name(&self) -> &str {
        "token cookie"
    }

    async fn acquire(&self) -> Result<Option<IssuedCredential>, CredentialError> {
        debug!("Falling back to 'token' cookie for access token");
        let cookies = self.ctx.cookies.as_ref();
        let cookie = cookie_or_ping(cookies, "token", &self.ctx.token_ping_url).await?;
        let segment = cookie.split('.').next().unwrap_or_default();
        let decoded = decode_base64_segment(segment)
            .ok_or_else(|| CredentialError::source_failure(self.name(), "cookie is not base64"))?;
        let parsed: TokenCookie = serde_json::from_slice(&decoded)?;
        let expires = expiry_ms(&parsed.expires)
            .ok_or_else(|| CredentialError::source_failure(self.name(), "unreadable expiry"))?;

        Ok(Some(IssuedCredential::new(parsed.access_token, expires)))
    }
}

/// Reads the modhash from `/api/me.json`.
pub struct MeModhashSource {
    ctx: SourceContext,
}

impl MeModhashSource {
    pub fn new(ctx: SourceContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CredentialSource for MeModhashSource {
    fn name(&self) -> &str {
        "/api/me.json"
    }

    async fn acquire(&self) -> Result<Option<IssuedCredential>, CredentialError> {
        if self.ctx.host() == "sh.reddit.com" {
            return Err(CredentialError::Unavailable(
                "modhash unavailable on sh.reddit.com".to_string(),
            ));
        }

        let request = HttpRequest::new(Method::GET, self.ctx.endpoint("/api/me.json")?);
        let response = self.ctx.transport.send(request).await?;
        if !response.is_success() {
            return Err(CredentialError::source_failure(
                self.name(),
                format!("HTTP {} {}", response.status, response.status_text),
            ));
        }

        let me: Value = serde_json::from_slice(&response.body)?;
        let expires = self.ctx.clock.now_ms() + MODHASH_LIFETIME_MS;
        Ok(me["data"]["modhash"]
            .as_str()
            .filter(|modhash| !modhash.is_empty())
            .map(|modhash| IssuedCredential::new(modhash, expires)))
    }
}

#[derive(Serialize, Deserialize)]
struct StoredMatrixToken {
    token: String,
    expires: i64,
}

#[derive(Deserialize)]
struct MatrixLogin {
    errcode: Option<String>,
    error: Option<String>,
    access_token: Option<String>,
    device_id: Option<String>,
}

/// Logs into Reddit's Matrix chat server with the OAuth bearer token.
pub struct MatrixTokenSource {
    ctx: SourceContext,
    access_token: Arc<CredentialCell>,
}

impl MatrixTokenSource {
    pub fn new(ctx: SourceContext, access_token: Arc<CredentialCell>) -> Self {
        Self { ctx, access_token }
    }

    fn stored(&self) -> Option<StoredMatrixToken> {
        let raw = self.ctx.store.get(MATRIX_TOKEN_KEY)?;
        serde_json::from_str::<StoredMatrixToken>(&raw)
            .ok()
            .filter(|stored| stored.expires > self.ctx.clock.now_ms())
    }

    fn device_id(&self) -> Option<String> {
        let raw = self.ctx.store.get(MATRIX_DEVICE_ID_KEY)?;
        serde_json::from_str::<String>(&raw).ok()
    }
}

#[async_trait]
impl CredentialSource for MatrixTokenSource {
    fn name(&self) -> &str {
        "matrix login"
    }

    async fn acquire(&self) -> Result<Option<IssuedCredential>, CredentialError> {
        if let Some(stored) = self.stored() {
            debug!("Using previously cached Matrix access token from storage");
            return Ok(Some(IssuedCredential::new(stored.token, stored.expires)));
        }

        info!("Fetching new Matrix access token from {}", self.ctx.matrix_login_url);
        let mut payload = json!({
            "type": "com.reddit.token",
            "token": self.access_token.get().await?,
            "initial_device_display_name": "Reddit Web Client",
        });
        if let Some(device_id) = self.device_id() {
            payload["device_id"] = Value::String(device_id);
        }

        let request =
            HttpRequest::new(Method::POST, self.ctx.matrix_login_url.clone()).json(&payload);
        let response = self.ctx.transport.send(request).await?;
        let login: MatrixLogin = serde_json::from_slice(&response.body)?;

        if let Some(errcode) = login.errcode {
            return Err(CredentialError::source_failure(
                self.name(),
                format!(
                    "error logging into Matrix with Reddit token: {}: {}",
                    errcode,
                    login.error.unwrap_or_default()
                ),
            ));
        }

        if let Some(device_id) = &login.device_id {
            self.ctx
                .store
                .set(MATRIX_DEVICE_ID_KEY, &serde_json::to_string(device_id)?)?;
        }

        let Some(token) = login.access_token.filter(|token| !token.is_empty()) else {
            return Ok(None);
        };
        let expires = jwt_expiry_ms(&token)?;
        self.ctx
            .store
            .set(MATRIX_ACCESS_TOKEN_KEY, &serde_json::to_string(&token)?)?;
        self.ctx.store.set(
            MATRIX_TOKEN_KEY,
            &serde_json::to_string(&StoredMatrixToken {
                token: token.clone(),
                expires,
            })?,
        )?;

        Ok(Some(IssuedCredential::new(token, expires)))
    }

    fn persists(&self) -> bool {
        false
    }
}

/// Host session, then storage, then the CSRF exchange, then the `token` cookie.
pub fn access_token_chain(ctx: &SourceContext, session: Arc<HostSession>) -> SourceChain {
    let slot = TokenSlot::access_token(ctx.store.clone());
    SourceChain::new("access token")
        .with_source(SessionSource::new(session, SessionValue::AccessToken, ctx.clock.clone()))
        .with_source(StoredTokenSource::new(slot.clone(), ctx.clock.clone()))
        .with_source(CsrfExchangeSource::new(ctx.clone()))
        .with_source(TokenCookieSource::new(ctx.clone()))
        .persist_to(slot)
}

/// Host session, then `/api/me.json`.
pub fn modhash_chain(ctx: &SourceContext, session: Arc<HostSession>) -> SourceChain {
    SourceChain::new("modhash")
        .with_source(SessionSource::new(session, SessionValue::Modhash, ctx.clock.clone()))
        .with_source(MeModhashSource::new(ctx.clone()))
}

pub fn matrix_chain(ctx: &SourceContext, access_token: Arc<CredentialCell>) -> SourceChain {
    SourceChain::new("matrix token").with_source(MatrixTokenSource::new(ctx.clone(), access_token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::{MemoryStore, StaticCookies};
    use crate::auth::ManualClock;
    use crate::client::testing::{json_response, ScriptedTransport};

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        ctx: SourceContext,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryStore>,
        cookies: Arc<StaticCookies>,
    }

    fn fixture(origin: &str) -> Fixture {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        let cookies = Arc::new(StaticCookies::new());
        let ctx = SourceContext {
            origin: Url::parse(origin).unwrap(),
            transport: transport.clone(),
            cookies: cookies.clone(),
            store: store.clone(),
            clock: Arc::new(ManualClock::new(NOW)),
            csrf_ping_url: "https://sh.reddit.com/404".to_string(),
            token_ping_url: "https://mod.reddit.com/404".to_string(),
            matrix_login_url: Url::parse(
                "https://matrix.redditspace.com/_matrix/client/v3/login",
            )
            .unwrap(),
        };
        Fixture {
            ctx,
            transport,
            store,
            cookies,
        }
    }

    fn jwt_with_exp(exp_secs: i64) -> String {
        let claims = format!("{{\"exp\":{}}}", exp_secs);
        let payload = base64::encode_config(claims, base64::URL_SAFE_NO_PAD);
        format!("eyJhbGciOiJIUzI1NiJ9.{}.sig", payload)
    }

    #[tokio::test]
    async fn test_session_token_wins() {
        let f = fixture("https://www.reddit.com");
        let session = Arc::new(HostSession::new());
        session.set_access_token("session-token", NOW + 60_000);

        let chain = access_token_chain(&f.ctx, session);
        let issued = chain.provide().await.unwrap().unwrap();

        assert_eq!(issued, IssuedCredential::new("session-token", NOW + 60_000));
        assert!(f.transport.requests().is_empty());
        assert!(f.store.get(ACCESS_TOKEN_KEY).is_none());
    }

    #[tokio::test]
    async fn test_stored_token_reused_and_stale_one_removed() {
        let f = fixture("https://www.reddit.com");
        let slot = TokenSlot::access_token(f.store.clone());

        slot.save("stored", NOW + 1000).unwrap();
        let source = StoredTokenSource::new(slot.clone(), f.ctx.clock.clone());
        assert_eq!(
            source.acquire().await.unwrap(),
            Some(IssuedCredential::new("stored", NOW + 1000))
        );

        slot.save("stale", NOW - 1).unwrap();
        assert_eq!(source.acquire().await.unwrap(), None);
        assert!(f.store.get(ACCESS_TOKEN_KEY).is_none());
        assert!(f.store.get(ACCESS_TOKEN_EXPIRY_KEY).is_none());
    }

    #[tokio::test]
    async fn test_csrf_exchange_persists_token() {
        let f = fixture("https://www.reddit.com");
        f.cookies.insert("csrf_token", "c5rf");
        f.transport
            .push(json_response(200, json!({"token": "exchanged", "expires": NOW + 86_400_000})));

        let chain = access_token_chain(&f.ctx, Arc::new(HostSession::new()));
        let issued = chain.provide().await.unwrap().unwrap();

        assert_eq!(issued.value, "exchanged");
        let requests = f.transport.requests();
        assert_eq!(requests[0].url.as_str(), "https://www.reddit.com/svc/shreddit/token");
        assert_eq!(
            requests[0].body.as_deref(),
            Some(br#"{"csrf_token":"c5rf"}"#.as_slice())
        );
        assert_eq!(f.store.get(ACCESS_TOKEN_KEY).as_deref(), Some("exchanged"));
        assert_eq!(
            f.store.get(ACCESS_TOKEN_EXPIRY_KEY),
            Some((NOW + 86_400_000).to_string())
        );
    }

    #[tokio::test]
    async fn test_token_cookie_fallback_off_site() {
        let f = fixture("https://mod.reddit.com");
        let cookie_payload = base64::encode(
            json!({"accessToken": "from-cookie", "expires": "2030-01-01T00:00:00.000Z"})
                .to_string(),
        );
        f.cookies.insert("token", &format!("{}.c2ln", cookie_payload));

        let chain = access_token_chain(&f.ctx, Arc::new(HostSession::new()));
        let issued = chain.provide().await.unwrap().unwrap();

        assert_eq!(issued.value, "from-cookie");
        assert_eq!(issued.expires_at_ms, Some(1_893_456_000_000));
        assert!(f.transport.requests().is_empty());
        assert_eq!(f.store.get(ACCESS_TOKEN_KEY).as_deref(), Some("from-cookie"));
    }

    #[tokio::test]
    async fn test_chain_reports_last_failure() {
        let f = fixture("https://mod.reddit.com");
        let chain = access_token_chain(&f.ctx, Arc::new(HostSession::new()));

        let err = chain.provide().await.unwrap_err();
        assert!(matches!(err, CredentialError::Store(_)));
    }

    #[tokio::test]
    async fn test_modhash_from_me_endpoint() {
        let f = fixture("https://old.reddit.com");
        f.transport
            .push(json_response(200, json!({"kind": "t2", "data": {"modhash": "mh123"}})));

        let chain = modhash_chain(&f.ctx, Arc::new(HostSession::new()));
        let issued = chain.provide().await.unwrap().unwrap();

        assert_eq!(issued, IssuedCredential::new("mh123", NOW + MODHASH_LIFETIME_MS));
        assert_eq!(f.transport.requests()[0].url.path(), "/api/me.json");
    }

    #[tokio::test]
    async fn test_modhash_unavailable_on_sh() {
        let f = fixture("https://sh.reddit.com");
        let chain = modhash_chain(&f.ctx, Arc::new(HostSession::new()));
        assert_eq!(chain.provide().await.unwrap(), None);
        assert!(f.transport.requests().is_empty());
    }

    struct FixedProvider(&'static str);

    #[async_trait]
    impl CredentialProvider for FixedProvider {
        async fn provide(&self) -> Result<Option<IssuedCredential>, CredentialError> {
            Ok(Some(IssuedCredential::new(self.0, NOW + 3_600_000)))
        }
    }

    #[tokio::test]
    async fn test_matrix_login_stores_tokens() {
        let f = fixture("https://www.reddit.com");
        f.store.set(MATRIX_DEVICE_ID_KEY, "\"DEV1\"").unwrap();
        let matrix_token = jwt_with_exp(NOW / 1000 + 3600);
        f.transport.push(json_response(
            200,
            json!({
                "access_token": matrix_token,
                "device_id": "DEV2",
                "user_id": "@t2_x:reddit.com",
            }),
        ));

        let bearer = Arc::new(CredentialCell::new(
            "access token",
            Arc::new(FixedProvider("bearer")),
            f.ctx.clock.clone(),
        ));
        let chain = matrix_chain(&f.ctx, bearer);
        let issued = chain.provide().await.unwrap().unwrap();

        assert_eq!(issued.value, matrix_token);
        assert_eq!(issued.expires_at_ms, Some((NOW / 1000 + 3600) * 1000));

        let requests = f.transport.requests();
        let sent: Value = serde_json::from_slice(requests[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(sent["token"], "bearer");
        assert_eq!(sent["device_id"], "DEV1");
        assert_eq!(sent["type"], "com.reddit.token");

        assert_eq!(f.store.get(MATRIX_DEVICE_ID_KEY).as_deref(), Some("\"DEV2\""));
        let stored: StoredMatrixToken =
            serde_json::from_str(&f.store.get(MATRIX_TOKEN_KEY).unwrap()).unwrap();
        assert_eq!(stored.token, matrix_token);

        // Second call is served from storage
        let again = chain.provide().await.unwrap().unwrap();
        assert_eq!(again.value, matrix_token);
        assert_eq!(f.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_matrix_errcode_is_fatal() {
        let f = fixture("https://www.reddit.com");
        f.transport.push(json_response(
            403,
            json!({"errcode": "M_FORBIDDEN", "error": "Invalid login token"}),
        ));

        let bearer = Arc::new(CredentialCell::new(
            "access token",
            Arc::new(FixedProvider("bearer")),
            f.ctx.clock.clone(),
        ));
        let err = matrix_chain(&f.ctx, bearer).provide().await.unwrap_err();
        assert!(err.to_string().contains("M_FORBIDDEN"));
    }

    #[test]
    fn test_expiry_formats() {
        assert_eq!(expiry_ms(&json!(1_700_000_000_000i64)), Some(1_700_000_000_000));
        assert_eq!(expiry_ms(&json!("1700000000000")), Some(1_700_000_000_000));
        assert_eq!(expiry_ms(&json!("2023-11-14T22:13:20Z")), Some(1_700_000_000_000));
        assert_eq!(expiry_ms(&json!(null)), None);
    }
}
