//! Lazily refreshed credentials (modhash, OAuth bearer, Matrix bearer).
//!
//! A [`CredentialCell`] owns one credential and refreshes it through an
//! injected [`CredentialProvider`] whenever the cached value is about to
//! expire. Where the value comes from is the provider's business; see
//! [`sources`] for the chains used against Reddit.

pub mod sources;
pub mod store;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::auth::store::StoreError;
use crate::client::transport::TransportError;

/// Tolerance applied when deciding whether a cached credential is still usable.
pub const EXPIRY_SKEW_MS: i64 = 60;

/// Error raised while acquiring or validating a credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential provider for {0} returned no value")]
    Empty(String),

    #[error("invalid JWT: {0}")]
    InvalidJwt(String),

    #[error("credential generated at {refreshed_at} expired on {expired_at}")]
    Expired {
        refreshed_at: String,
        expired_at: String,
    },

    #[error("credential source {0} is not usable here")]
    Unavailable(String),

    #[error("{name}: {message}")]
    Source { name: String, message: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CredentialError {
    pub(crate) fn source_failure(name: &str, message: impl Into<String>) -> Self {
        CredentialError::Source {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock backed by `chrono`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Useful for hosts that replay time and for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: i64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// A credential value with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub value: String,
    pub expires_at_ms: i64,
}

impl Credential {
    /// Whether the credential can still be handed out at `now_ms`.
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms - EXPIRY_SKEW_MS
    }
}

/// What a provider hands back. A missing expiry is read from the value's JWT `exp` claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub value: String,
    pub expires_at_ms: Option<i64>,
}

impl IssuedCredential {
    pub fn new(value: impl Into<String>, expires_at_ms: i64) -> Self {
        Self {
            value: value.into(),
            expires_at_ms: Some(expires_at_ms),
        }
    }

    /// A bearer token whose expiry is embedded in its JWT payload.
    pub fn jwt(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at_ms: None,
        }
    }
}

/// Produces fresh credentials for a [`CredentialCell`].
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` means no value could be obtained.
    async fn provide(&self) -> Result<Option<IssuedCredential>, CredentialError>;
}

/// Cached credential that refreshes itself on demand.
///
/// Concurrent callers of [`get`](Self::get) while a refresh is in flight wait
/// for that refresh and all observe its result.
pub struct CredentialCell {
    name: String,
    provider: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<Credential>>,
}

impl CredentialCell {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            clock,
            state: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the cached value, refreshing it first if it is missing or about to expire.
    pub async fn get(&self) -> Result<String, CredentialError> {
        let mut state = self.state.lock().await;
        if let Some(credential) = state.as_ref() {
            if credential.is_fresh(self.clock.now_ms()) {
                return Ok(credential.value.clone());
            }
        }

        *state = None;
        let credential = self.fetch().await?;
        let value = credential.value.clone();
        *state = Some(credential);
        Ok(value)
    }

    /// Force a refresh regardless of the cached expiry.
    pub async fn refresh(&self) -> Result<(), CredentialError> {
        let mut state = self.state.lock().await;
        *state = None;
        *state = Some(self.fetch().await?);
        Ok(())
    }

    /// Drop the cached value so the next `get` refreshes.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }

    /// The cached credential, if any, without refreshing.
    pub async fn cached(&self) -> Option<Credential> {
        self.state.lock().await.clone()
    }

    async fn fetch(&self) -> Result<Credential, CredentialError> {
        let issued = self
            .provider
            .provide()
            .await?
            .filter(|issued| !issued.value.is_empty())
            .ok_or_else(|| CredentialError::Empty(self.name.clone()))?;

        let expires_at_ms = match issued.expires_at_ms {
            Some(expires_at_ms) => expires_at_ms,
            None => jwt_expiry_ms(&issued.value)?,
        };

        let credential = Credential {
            value: issued.value,
            expires_at_ms,
        };
        let now = self.clock.now_ms();
        if !credential.is_fresh(now) {
            // caching it would only force another refresh on the next get
            return Err(CredentialError::Expired {
                refreshed_at: format_epoch_ms(now),
                expired_at: format_epoch_ms(expires_at_ms),
            });
        }

        debug!(
            "Refreshed {} credential, valid until {}",
            self.name,
            format_epoch_ms(expires_at_ms)
        );

        Ok(credential)
    }
}

/// Read the `exp` claim of a JWT and convert it to epoch milliseconds.
pub fn jwt_expiry_ms(token: &str) -> Result<i64, CredentialError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(CredentialError::InvalidJwt(
            "token does not have 3 parts".to_string(),
        ));
    }

    let payload = decode_base64_segment(parts[1])
        .ok_or_else(|| CredentialError::InvalidJwt("payload is not base64".to_string()))?;
    let claims: serde_json::Value = serde_json::from_slice(&payload)
        .map_err(|e| CredentialError::InvalidJwt(format!("payload is not JSON: {}", e)))?;

    claims["exp"]
        .as_f64()
        .filter(|exp| *exp > 0.0)
        .map(|exp| (exp * 1000.0) as i64)
        .ok_or_else(|| CredentialError::InvalidJwt("missing 'exp' field".to_string()))
}

/// Decode a base64 segment that may use either alphabet and may lack padding.
pub(crate) fn decode_base64_segment(segment: &str) -> Option<Vec<u8>> {
    let trimmed = segment.trim_end_matches('=');
    base64::decode_config(trimmed, base64::URL_SAFE_NO_PAD)
        .or_else(|_| base64::decode_config(trimmed, base64::STANDARD_NO_PAD))
        .ok()
}

pub(crate) fn format_epoch_ms(epoch_ms: i64) -> String {
    Utc.timestamp_millis_opt(epoch_ms)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| epoch_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingProvider {
        calls: AtomicUsize,
        lifetime_ms: i64,
        clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn provide(&self) -> Result<Option<IssuedCredential>, CredentialError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Some(IssuedCredential::new(
                format!("token-{}", call),
                self.clock.now_ms() + self.lifetime_ms,
            )))
        }
    }

    fn counting_cell(
        lifetime_ms: i64,
    ) -> (Arc<CredentialCell>, Arc<CountingProvider>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            lifetime_ms,
            clock: clock.clone(),
        });
        let cell = Arc::new(CredentialCell::new("test", provider.clone(), clock.clone()));
        (cell, provider, clock)
    }

    fn jwt_with_exp(exp: i64) -> String {
        let payload = base64::encode_config(
            format!("{{\"exp\":{}}}", exp),
            base64::URL_SAFE_NO_PAD,
        );
        format!("eyJhbGciOiJIUzI1NiJ9.{}.signature", payload)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_value_is_reused_until_expiry() {
        let (cell, provider, clock) = counting_cell(10_000);

        assert_eq!(cell.get().await.unwrap(), "token-1");
        assert_eq!(cell.get().await.unwrap(), "token-1");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        clock.advance(10_001);
        assert_eq!(cell.get().await.unwrap(), "token-2");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_inside_skew_window() {
        let (cell, provider, clock) = counting_cell(10_000);

        cell.get().await.unwrap();
        clock.advance(10_000 - EXPIRY_SKEW_MS);
        assert_eq!(cell.get().await.unwrap(), "token-2");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_share_one_refresh() {
        let (cell, provider, _clock) = counting_cell(10_000);

        let (a, b, c) = tokio::join!(cell.get(), cell.get(), cell.get());
        assert_eq!(a.unwrap(), "token-1");
        assert_eq!(b.unwrap(), "token-1");
        assert_eq!(c.unwrap(), "token-1");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_refresh_replaces_value() {
        let (cell, provider, _clock) = counting_cell(10_000);

        cell.get().await.unwrap();
        cell.refresh().await.unwrap();
        assert_eq!(cell.get().await.unwrap(), "token-2");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_already_expired_credential_is_rejected() {
        struct StaleProvider;

        #[async_trait]
        impl CredentialProvider for StaleProvider {
            async fn provide(&self) -> Result<Option<IssuedCredential>, CredentialError> {
                Ok(Some(IssuedCredential::new("stale", 500)))
            }
        }

        let clock = Arc::new(ManualClock::new(1_000));
        let cell = CredentialCell::new("stale", Arc::new(StaleProvider), clock);
        let err = cell.get().await.unwrap_err();
        assert!(matches!(err, CredentialError::Expired { .. }));
        assert!(cell.cached().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_expiring_inside_skew_is_rejected() {
        let (cell, provider, _clock) = counting_cell(EXPIRY_SKEW_MS / 2);

        let err = cell.get().await.unwrap_err();
        assert!(matches!(err, CredentialError::Expired { .. }));
        assert!(cell.cached().await.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_provider_is_an_error() {
        struct NothingProvider;

        #[async_trait]
        impl CredentialProvider for NothingProvider {
            async fn provide(&self) -> Result<Option<IssuedCredential>, CredentialError> {
                Ok(None)
            }
        }

        let cell = CredentialCell::new("modhash", Arc::new(NothingProvider), Arc::new(SystemClock));
        assert!(matches!(cell.get().await, Err(CredentialError::Empty(name)) if name == "modhash"));
    }

    #[tokio::test]
    async fn test_expiry_is_read_from_jwt_when_missing() {
        struct JwtProvider(String);

        #[async_trait]
        impl CredentialProvider for JwtProvider {
            async fn provide(&self) -> Result<Option<IssuedCredential>, CredentialError> {
                Ok(Some(IssuedCredential::jwt(self.0.clone())))
            }
        }

        let token = jwt_with_exp(2_000);
        let provider = Arc::new(JwtProvider(token.clone()));
        let cell = CredentialCell::new("jwt", provider, Arc::new(ManualClock::new(1_000_000)));
        assert_eq!(cell.get().await.unwrap(), token);
        assert_eq!(cell.cached().await.unwrap().expires_at_ms, 2_000_000);
    }

    #[test]
    fn test_jwt_expiry() {
        assert_eq!(jwt_expiry_ms(&jwt_with_exp(1_700_000_000)).unwrap(), 1_700_000_000_000);
        assert!(matches!(jwt_expiry_ms("not-a-jwt"), Err(CredentialError::InvalidJwt(_))));

        let claims = base64::encode_config("{\"sub\":\"x\"}", base64::URL_SAFE_NO_PAD);
        let no_exp = format!("a.{}.c", claims);
        assert!(matches!(jwt_expiry_ms(&no_exp), Err(CredentialError::InvalidJwt(_))));
    }
}
