//! Bearer tokens for authenticated ingestion.
//!
//! Each authenticated publisher owns one [`BearerTokenProvider`]. The provider
//! caches the last token and refreshes it once `now >= expires_on`. The cache
//! sits behind an async mutex that is held across the fetch, so concurrent
//! callers on an expired token wait for a single acquisition.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{CoreResult, TelemetryError};

/// Scope requested for the ingestion endpoint.
pub const INGESTION_AUTH_SCOPE: &str = "https://monitor.azure.com//.default";

#[derive(Clone)]
pub struct BearerToken {
    value: Arc<SecretString>,
    expires_on: DateTime<Utc>,
}

impl BearerToken {
    pub fn new(value: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        let value: String = value.into();
        Self {
            value: Arc::new(SecretString::new(value.into())),
            expires_on,
        }
    }

    pub fn secret(&self) -> &SecretString {
        &self.value
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_on
    }

    /// `Bearer <token>` header value.
    pub(crate) fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value.expose_secret())
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"[REDACTED]")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// External identity service. Called only on a cache miss or expiry.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(
        &self,
        scopes: &[String],
        identity: Option<Uuid>,
    ) -> anyhow::Result<BearerToken>;
}

/// Yields one fixed token value, stamped with a fresh expiry on each acquire.
pub struct StaticTokenSource {
    value: SecretString,
    lifetime: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl StaticTokenSource {
    pub fn new(value: impl Into<String>) -> Self {
        let value: String = value.into();
        Self {
            value: SecretString::new(value.into()),
            lifetime: chrono::Duration::hours(24),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn acquire(
        &self,
        _scopes: &[String],
        _identity: Option<Uuid>,
    ) -> anyhow::Result<BearerToken> {
        Ok(BearerToken::new(
            self.value.expose_secret(),
            self.clock.wall() + self.lifetime,
        ))
    }
}

struct Cached {
    scopes: Vec<String>,
    token: BearerToken,
}

pub struct BearerTokenProvider {
    owner: String,
    source: Arc<dyn TokenSource>,
    identity: Option<Uuid>,
    clock: Arc<dyn Clock>,
    cache: Mutex<Option<Cached>>,
}

impl BearerTokenProvider {
    /// `owner` names the publisher in errors and logs.
    pub fn new(
        owner: impl Into<String>,
        source: Arc<dyn TokenSource>,
        identity: Option<Uuid>,
    ) -> Self {
        Self {
            owner: owner.into(),
            source,
            identity,
            clock: Arc::new(SystemClock),
            cache: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn identity(&self) -> Option<Uuid> {
        self.identity
    }

    /// Return the cached token, or acquire a new one when there is none, it
    /// has expired, or it was issued for different scopes.
    pub async fn get_token(&self, scopes: &[&str]) -> CoreResult<BearerToken> {
        let mut cache = self.cache.lock().await;
        let now = self.clock.wall();

        if let Some(cached) = cache.as_ref()
            && !cached.token.is_expired_at(now)
            && cached.scopes.iter().map(String::as_str).eq(scopes.iter().copied())
        {
            return Ok(cached.token.clone());
        }

        let scopes: Vec<String> = scopes.iter().map(|s| s.to_string()).collect();
        tracing::debug!(publisher = %self.owner, identity = ?self.identity, "acquiring bearer token");
        let token = self
            .source
            .acquire(&scopes, self.identity)
            .await
            .map_err(|e| TelemetryError::Auth {
                publisher: self.owner.clone(),
                message: format!("{e:#}"),
            })?;

        if token.is_expired_at(now) {
            tracing::warn!(
                publisher = %self.owner,
                expires_on = %token.expires_on(),
                "identity service returned an already expired token"
            );
        }

        *cache = Some(Cached {
            scopes,
            token: token.clone(),
        });
        Ok(token)
    }
}

impl fmt::Debug for BearerTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerTokenProvider")
            .field("owner", &self.owner)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::CountingSource;
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[tokio::test]
    async fn reuses_token_within_validity_window() {
        let clock = Arc::new(ManualClock::default());
        let source = Arc::new(CountingSource::new(clock.clone()));
        let provider = BearerTokenProvider::new("p", source.clone(), None).with_clock(clock.clone());

        let a = provider.get_token(&[INGESTION_AUTH_SCOPE]).await.unwrap();
        clock.advance(Duration::from_secs(30 * 60));
        let b = provider.get_token(&[INGESTION_AUTH_SCOPE]).await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(a.secret().expose_secret(), b.secret().expose_secret());
    }

    #[tokio::test]
    async fn refreshes_exactly_once_after_expiry() {
        let clock = Arc::new(ManualClock::default());
        let source = Arc::new(CountingSource::new(clock.clone()));
        let provider = BearerTokenProvider::new("p", source.clone(), None).with_clock(clock.clone());

        provider.get_token(&[INGESTION_AUTH_SCOPE]).await.unwrap();
        clock.advance(Duration::from_secs(60 * 60));
        let t = provider.get_token(&[INGESTION_AUTH_SCOPE]).await.unwrap();
        provider.get_token(&[INGESTION_AUTH_SCOPE]).await.unwrap();

        assert_eq!(source.calls(), 2);
        assert_eq!(t.secret().expose_secret(), "token-2");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let clock = Arc::new(ManualClock::default());
        let mut source = CountingSource::new(clock.clone());
        source.delay = Duration::from_millis(50);
        let source = Arc::new(source);
        let provider = BearerTokenProvider::new("p", source.clone(), None).with_clock(clock);

        let (a, b, c) = tokio::join!(
            provider.get_token(&[INGESTION_AUTH_SCOPE]),
            provider.get_token(&[INGESTION_AUTH_SCOPE]),
            provider.get_token(&[INGESTION_AUTH_SCOPE]),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn different_scopes_refetch() {
        let clock = Arc::new(ManualClock::default());
        let source = Arc::new(CountingSource::new(clock.clone()));
        let provider = BearerTokenProvider::new("p", source.clone(), None).with_clock(clock);

        provider.get_token(&["a"]).await.unwrap();
        provider.get_token(&["b"]).await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn failure_maps_to_auth_error_and_is_not_cached() {
        let clock = Arc::new(ManualClock::default());
        let mut source = CountingSource::new(clock.clone());
        source.fail = true;
        let source = Arc::new(source);
        let provider = BearerTokenProvider::new("ingest-a", source.clone(), None).with_clock(clock);

        let err = provider.get_token(&[INGESTION_AUTH_SCOPE]).await.unwrap_err();
        match err {
            TelemetryError::Auth { publisher, message } => {
                assert_eq!(publisher, "ingest-a");
                assert!(message.contains("unreachable"));
            }
            other => panic!("expected Auth error, got {other:?}"),
        }
        let _ = provider.get_token(&[INGESTION_AUTH_SCOPE]).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn static_source_uses_configured_lifetime() {
        let clock = Arc::new(ManualClock::default());
        let source = StaticTokenSource::new("fixed")
            .with_lifetime(chrono::Duration::minutes(5))
            .with_clock(clock.clone());
        let token = source.acquire(&[], None).await.unwrap();
        assert_eq!(token.expires_on(), clock.wall() + chrono::Duration::minutes(5));
        assert_eq!(token.authorization_header(), "Bearer fixed");
        assert!(!format!("{token:?}").contains("fixed"));
    }
}
