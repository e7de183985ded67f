use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    clock::{Clock, SystemClock},
    TokenProvider,
};
use crate::config::DEFAULT_EXPIRY_BUFFER;

/// Caches the token handed out by `Provider` and refreshes it once it comes
/// within `expiry_buffer` seconds of expiring.
///
/// At most one refresh is in flight at a time: callers that miss the cache
/// queue on the refresh gate and reuse whatever the first of them stored.
pub struct TokenManager<Provider>
where
    Provider: TokenProvider,
{
    provider: Provider,
    clock: Arc<dyn Clock>,
    expiry_buffer: u64,
    cached_token: RwLock<Option<Record>>,
    refresh: Mutex<()>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error<RenewalError> {
    #[error("token fetch: {0}")]
    Provider(#[source] RenewalError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub access_token: String,
    /// Seconds since the Unix epoch.
    pub expires_at: u64,
}

impl Record {
    pub fn from_expiring_token<T: super::ExpiringToken>(token: T, issued_at: u64) -> Self {
        Self {
            access_token: token.access_token().to_owned(),
            expires_at: issued_at.saturating_add(token.expires_in()),
        }
    }

    /// Whether the token outlives `now` by more than `buffer` seconds.
    pub fn is_valid(&self, now: u64, buffer: u64) -> bool {
        self.expires_at.saturating_sub(now) > buffer
    }

    /// Seconds left until expiry, negative once expired.
    pub fn expires_in(&self, now: u64) -> i64 {
        let expires_at = i64::try_from(self.expires_at).unwrap_or(i64::MAX);
        let now = i64::try_from(now).unwrap_or(i64::MAX);
        expires_at.saturating_sub(now)
    }
}

/// Snapshot of the cache state, for logging and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub has_token: bool,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_seconds: Option<i64>,
    /// RFC 3339 timestamp in UTC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl<Provider> TokenManager<Provider>
where
    Provider: TokenProvider,
    <Provider as TokenProvider>::Token: super::ExpiringToken,
{
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            clock: Arc::new(SystemClock),
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
            cached_token: RwLock::new(None),
            refresh: Mutex::const_new(()),
        }
    }

    #[must_use]
    pub fn with_expiry_buffer(mut self, seconds: u64) -> Self {
        self.expiry_buffer = seconds;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn expiry_buffer(&self) -> u64 {
        self.expiry_buffer
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Record>> {
        self.cached_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Record>> {
        self.cached_token
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn valid_record(&self, now: u64) -> Option<Record> {
        self.read()
            .as_ref()
            .filter(|record| record.is_valid(now, self.expiry_buffer))
            .cloned()
    }

    /// Whether a token is cached and does not expire within the buffer.
    pub fn is_valid(&self, now: u64) -> bool {
        self.valid_record(now).is_some()
    }

    async fn fetch_new_token(&self) -> Result<Record, Error<Provider::Error>> {
        let token = self
            .provider
            .get_auth_token()
            .await
            .map_err(Error::Provider)?;
        let record = Record::from_expiring_token(token, self.clock.now());
        Ok(record)
    }

    pub async fn get_token(&self) -> Result<Record, Error<Provider::Error>> {
        if let Some(record) = self.valid_record(self.clock.now()) {
            debug!(message = "Using preexisting token", token_expires_at = record.expires_at);
            return Ok(record);
        }

        let _refresh = self.refresh.lock().await;

        // Whoever held the gate before us may have refreshed already.
        if let Some(record) = self.valid_record(self.clock.now()) {
            debug!(
                message = "Using token refreshed by a concurrent caller",
                token_expires_at = record.expires_at,
            );
            return Ok(record);
        }

        info!(
            message = "No active token found, about to get a new one",
            token_is_stale = self.read().is_some(),
        );

        let new_record = self.fetch_new_token().await?;
        if !new_record.is_valid(self.clock.now(), self.expiry_buffer) {
            warn!(
                message = "Token expires within the expiry buffer, refetching on every use",
                token_expires_at = new_record.expires_at,
                expiry_buffer = self.expiry_buffer,
            );
        }
        self.write().replace(new_record.clone());

        debug!(message = "Got new token", token_expires_at = new_record.expires_at);

        Ok(new_record)
    }

    /// Drop the cached token so the next [`TokenManager::get_token`] fetches.
    pub fn clear_cache(&self) {
        let previous = self.write().take();
        info!(message = "Token cache cleared", had_token = previous.is_some());
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let Some(record) = self.read().clone() else {
            return Diagnostics {
                has_token: false,
                is_valid: false,
                expires_in_seconds: None,
                expires_at: None,
            };
        };

        let now = self.clock.now();
        let expires_at = i64::try_from(record.expires_at)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true));

        Diagnostics {
            has_token: true,
            is_valid: record.is_valid(now, self.expiry_buffer),
            expires_in_seconds: Some(record.expires_in(now)),
            expires_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::auth::{client_credentials::Token, clock::manual::ManualClock};

    #[derive(Debug, thiserror::Error)]
    #[error("authorization server unavailable")]
    pub struct Unavailable;

    /// Hands out numbered tokens and counts how often it was asked.
    #[derive(Default)]
    pub struct Scripted {
        pub calls: AtomicUsize,
        pub expires_in: u64,
        pub failing: AtomicBool,
        pub delay: Duration,
    }

    impl Scripted {
        pub fn expiring_in(expires_in: u64) -> Self {
            Self {
                expires_in,
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TokenProvider for Scripted {
        type Token = Token;
        type Error = Unavailable;

        async fn get_auth_token(&self) -> Result<Self::Token, Self::Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(Unavailable);
            }
            Ok(Token {
                access_token: format!("token-{call}"),
                expires_in: self.expires_in,
            })
        }
    }

    fn manager(provider: Scripted, clock: &ManualClock) -> TokenManager<Scripted> {
        TokenManager::new(provider)
            .with_expiry_buffer(60)
            .with_clock(Arc::new(clock.clone()))
    }

    #[test]
    fn record_validity_window() {
        let record = Record {
            access_token: "abc123".into(),
            expires_at: 1120,
        };
        assert!(record.is_valid(1000, 60));
        assert!(record.is_valid(1059, 60));
        assert!(!record.is_valid(1060, 60));
        assert!(!record.is_valid(2000, 60));
        assert!(record.is_valid(1119, 0));
        assert!(!record.is_valid(1120, 0));
        assert_eq!(record.expires_in(1000), 120);
        assert_eq!(record.expires_in(1200), -80);
    }

    #[tokio::test]
    async fn validity_follows_expiry_minus_buffer() {
        let clock = ManualClock::at(1000);
        let manager = manager(Scripted::expiring_in(120), &clock);

        assert!(!manager.is_valid(1000));

        let record = manager.get_token().await.unwrap();
        assert_eq!(record.expires_at, 1120);
        assert!(manager.is_valid(1000));
        assert!(manager.is_valid(1059));
        assert!(!manager.is_valid(1060));

        clock.set(1059);
        assert_eq!(manager.get_token().await.unwrap().access_token, "token-1");
        assert_eq!(manager.provider().calls(), 1);

        clock.set(1060);
        assert_eq!(manager.get_token().await.unwrap().access_token, "token-2");
        assert_eq!(manager.provider().calls(), 2);
    }

    #[tokio::test]
    async fn cached_token_is_reused() {
        let clock = ManualClock::at(1000);
        let manager = manager(Scripted::expiring_in(3600), &clock);

        let first = manager.get_token().await.unwrap();
        let second = manager.get_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.provider().calls(), 1);
    }

    #[tokio::test]
    async fn clear_cache_forces_one_fetch() {
        let clock = ManualClock::at(1000);
        let manager = manager(Scripted::expiring_in(3600), &clock);

        manager.clear_cache();
        manager.get_token().await.unwrap();
        manager.clear_cache();
        assert!(!manager.diagnostics().has_token);

        assert_eq!(manager.get_token().await.unwrap().access_token, "token-2");
        manager.get_token().await.unwrap();
        assert_eq!(manager.provider().calls(), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let clock = ManualClock::at(1000);
        let provider = Scripted::expiring_in(3600);
        provider.failing.store(true, Ordering::SeqCst);
        let manager = manager(provider, &clock);

        let err = manager.get_token().await.unwrap_err();
        assert_eq!(err.to_string(), "token fetch: authorization server unavailable");
        assert!(!manager.diagnostics().has_token);

        assert!(manager.get_token().await.is_err());
        assert_eq!(manager.provider().calls(), 2);

        manager.provider().failing.store(false, Ordering::SeqCst);
        assert_eq!(manager.get_token().await.unwrap().access_token, "token-3");
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_record() {
        let clock = ManualClock::at(1000);
        let manager = manager(Scripted::expiring_in(120), &clock);
        manager.get_token().await.unwrap();

        clock.set(1100);
        manager.provider().failing.store(true, Ordering::SeqCst);
        assert!(manager.get_token().await.is_err());

        let diagnostics = manager.diagnostics();
        assert!(diagnostics.has_token);
        assert!(!diagnostics.is_valid);
        assert_eq!(diagnostics.expires_in_seconds, Some(20));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let clock = ManualClock::at(1000);
        let provider = Scripted {
            expires_in: 3600,
            delay: Duration::from_millis(50),
            ..Default::default()
        };
        let manager = Arc::new(manager(provider, &clock));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.get_token().await })
            })
            .collect();

        for handle in handles {
            let record = handle.await.unwrap().unwrap();
            assert_eq!(record.access_token, "token-1");
        }
        assert_eq!(manager.provider().calls(), 1);
    }

    #[tokio::test]
    async fn short_lived_token_is_still_returned() {
        let clock = ManualClock::at(1000);
        let manager = manager(Scripted::expiring_in(30), &clock);

        assert_eq!(manager.get_token().await.unwrap().access_token, "token-1");
        assert!(!manager.is_valid(1000));
        assert_eq!(manager.get_token().await.unwrap().access_token, "token-2");
    }

    #[tokio::test]
    async fn diagnostics_never_fetch() {
        let clock = ManualClock::at(1000);
        let manager = manager(Scripted::expiring_in(120), &clock);

        assert_eq!(
            manager.diagnostics(),
            Diagnostics {
                has_token: false,
                is_valid: false,
                expires_in_seconds: None,
                expires_at: None,
            }
        );
        assert_eq!(manager.provider().calls(), 0);

        manager.get_token().await.unwrap();
        assert_eq!(
            manager.diagnostics(),
            Diagnostics {
                has_token: true,
                is_valid: true,
                expires_in_seconds: Some(120),
                expires_at: Some("1970-01-01T00:18:40Z".to_owned()),
            }
        );
        assert_eq!(
            serde_json::to_value(manager.diagnostics()).unwrap(),
            serde_json::json!({
                "hasToken": true,
                "isValid": true,
                "expiresInSeconds": 120,
                "expiresAt": "1970-01-01T00:18:40Z",
            })
        );
        assert_eq!(manager.provider().calls(), 1);
    }
}
