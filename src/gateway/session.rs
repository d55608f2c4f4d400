//! Connection/session lifecycle manager for direct-gateway execution.
//!
//! Holds at most one cached bearer token, bound to exactly one account. The
//! invariant it defends: a token never authenticates a call for an account
//! other than the one whose credentials produced it. Rebinding to a different
//! account drops the cached token before any call can be made for the new
//! one; restores from the persistent store are accepted only for the exact
//! account, matching credentials, and tokens younger than 30 minutes.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::AccountCredentials;
use crate::domain::account::owner_digest;
use crate::domain::SessionToken;
use crate::error::{MtLinkError, Result};
use crate::persistence::Store;

use super::traits::BrokerGateway;

const RESTORE_MAX_AGE_SECS: i64 = 30 * 60;
const REVALIDATE_AFTER_SECS: i64 = 60;

#[derive(Clone)]
struct CachedToken {
    token: SessionToken,
    last_validated: DateTime<Utc>,
}

pub struct SessionManager {
    store: Arc<dyn Store>,
    gateway: Arc<dyn BrokerGateway>,
    /// Single slot: the manager serves one bound account at a time
    cached: RwLock<Option<CachedToken>>,
    bound: RwLock<Option<String>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<dyn BrokerGateway>) -> Self {
        Self {
            store,
            gateway,
            cached: RwLock::new(None),
            bound: RwLock::new(None),
        }
    }

    /// Bind the manager to an account. A cached token owned by any other
    /// account is discarded here, before any call can be made for the new
    /// binding.
    pub async fn bind(&self, account: &AccountCredentials) {
        let mut bound = self.bound.write().await;
        if bound.as_deref() != Some(account.id.as_str()) {
            let mut cached = self.cached.write().await;
            if let Some(old) = cached.take() {
                debug!(
                    "Rebinding {} -> {}: dropped cached token for {}",
                    old.token.account_id, account.id, old.token.account_id
                );
            }
            *bound = Some(account.id.clone());
        }
    }

    pub async fn bound_account(&self) -> Option<String> {
        self.bound.read().await.clone()
    }

    /// Re-verify, immediately before a mutating call, that the binding still
    /// matches the intended account. On mismatch the caller aborts without
    /// touching the gateway.
    pub async fn verify_bound(&self, account_id: &str) -> Result<()> {
        match self.bound.read().await.as_deref() {
            Some(bound) if bound == account_id => Ok(()),
            Some(bound) => Err(MtLinkError::AccountMismatch {
                bound: bound.to_string(),
                expected: account_id.to_string(),
            }),
            None => Err(MtLinkError::AccountMismatch {
                bound: "<unbound>".to_string(),
                expected: account_id.to_string(),
            }),
        }
    }

    /// Current bearer token for the bound account: cached if fresh, restored
    /// from the store if the stored token belongs to this exact account and
    /// credentials and is young enough, otherwise a fresh connect.
    pub async fn token(&self, account: &AccountCredentials) -> Result<String> {
        self.verify_bound(&account.id).await?;

        // Cached token owned by a different account is never served
        {
            let mut cached = self.cached.write().await;
            if let Some(entry) = cached.as_ref() {
                if entry.token.account_id != account.id {
                    *cached = None;
                }
            }
        }

        if let Some(token) = self.cached_if_valid(account).await? {
            return Ok(token);
        }

        if let Some(token) = self.restore(account).await? {
            return Ok(token);
        }

        self.connect_fresh(account).await
    }

    /// Run a gateway call with a session token; on explicit invalidation the
    /// token is cleared, a single reconnect happens, and the original call is
    /// retried exactly once.
    pub async fn with_token<T, F, Fut>(&self, account: &AccountCredentials, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.token(account).await?;
        match call(token).await {
            Err(MtLinkError::TokenInvalid(reason)) => {
                info!(
                    "Token for {} invalidated ({}); reconnecting once",
                    account.id, reason
                );
                self.invalidate(&account.id).await?;
                let token = self.token(account).await?;
                call(token).await
            }
            other => other,
        }
    }

    /// Drop the cached and stored token for an account
    pub async fn invalidate(&self, account_id: &str) -> Result<()> {
        {
            let mut cached = self.cached.write().await;
            if cached
                .as_ref()
                .is_some_and(|c| c.token.account_id == account_id)
            {
                *cached = None;
            }
        }
        self.store.delete_token(account_id).await
    }

    /// Scheduled force-refresh: reconnect every account regardless of use,
    /// bounding how stale any stored token can get
    pub async fn refresh_all(&self, accounts: &[AccountCredentials]) {
        for account in accounts {
            match self.gateway.connect(account).await {
                Ok(raw) => {
                    let token = SessionToken::new(&account.id, &raw, &account.login);
                    if let Err(e) = self.store.save_token(&token).await {
                        warn!("Failed to persist refreshed token for {}: {}", account.id, e);
                        continue;
                    }
                    let mut cached = self.cached.write().await;
                    if cached
                        .as_ref()
                        .is_some_and(|c| c.token.account_id == account.id)
                    {
                        *cached = Some(CachedToken {
                            token,
                            last_validated: Utc::now(),
                        });
                    }
                    debug!("Force-refreshed token for {}", account.id);
                }
                Err(e) => warn!("Token refresh failed for {}: {}", account.id, e),
            }
        }
    }

    async fn cached_if_valid(&self, account: &AccountCredentials) -> Result<Option<String>> {
        let entry = {
            let cached = self.cached.read().await;
            match cached.as_ref() {
                Some(entry) if entry.token.account_id == account.id => entry.clone(),
                _ => return Ok(None),
            }
        };

        let age = (Utc::now() - entry.last_validated).num_seconds();
        if age < REVALIDATE_AFTER_SECS {
            return Ok(Some(entry.token.token));
        }

        // Periodic revalidation via the lightweight status call
        match self.gateway.validate(&entry.token.token).await {
            Ok(true) => {
                let mut cached = self.cached.write().await;
                if let Some(inner) = cached.as_mut() {
                    inner.last_validated = Utc::now();
                }
                Ok(Some(entry.token.token))
            }
            Ok(false) => {
                info!("Cached token for {} no longer valid", account.id);
                self.invalidate(&account.id).await?;
                Ok(None)
            }
            Err(e) => {
                // Revalidation is best effort; a flaky status call should not
                // force a reconnect storm
                warn!("Token revalidation for {} errored: {}", account.id, e);
                Ok(Some(entry.token.token))
            }
        }
    }

    async fn restore(&self, account: &AccountCredentials) -> Result<Option<String>> {
        let Some(stored) = self.store.load_token(&account.id).await? else {
            return Ok(None);
        };

        if stored.account_id != account.id
            || stored.owner_digest != owner_digest(&account.login)
            || stored.age_secs(Utc::now()) >= RESTORE_MAX_AGE_SECS
        {
            debug!("Stored token for {} not restorable", account.id);
            return Ok(None);
        }

        let raw = stored.token.clone();
        let mut cached = self.cached.write().await;
        *cached = Some(CachedToken {
            token: stored,
            last_validated: Utc::now(),
        });
        debug!("Restored session token for {} from store", account.id);
        Ok(Some(raw))
    }

    async fn connect_fresh(&self, account: &AccountCredentials) -> Result<String> {
        let raw = self.gateway.connect(account).await?;
        let token = SessionToken::new(&account.id, &raw, &account.login);
        self.store.save_token(&token).await?;

        let mut cached = self.cached.write().await;
        *cached = Some(CachedToken {
            token,
            last_validated: Utc::now(),
        });
        info!("Opened fresh gateway session for {}", account.id);
        Ok(raw)
    }
}

/// Spawn helper used by the scheduler: refresh every account's token on a
/// fixed period
pub async fn run_token_refresh_loop(
    sessions: Arc<SessionManager>,
    accounts: Vec<AccountCredentials>,
    period: std::time::Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sessions.refresh_all(&accounts).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::traits::MockBrokerGateway;
    use crate::persistence::MemoryStore;
    use mockall::predicate::*;

    fn account(id: &str) -> AccountCredentials {
        AccountCredentials {
            id: id.to_string(),
            login: format!("login-{id}"),
            password: "pw".into(),
            server: "Broker-Demo".into(),
            symbol: "XAUUSD".into(),
        }
    }

    #[tokio::test]
    async fn test_fresh_connect_and_cache() {
        let store = Arc::new(MemoryStore::new());
        let mut gateway = MockBrokerGateway::new();
        gateway
            .expect_connect()
            .times(1)
            .returning(|_| Ok("tok-1".to_string()));

        let manager = SessionManager::new(store.clone(), Arc::new(gateway));
        let acc = account("A");
        manager.bind(&acc).await;

        assert_eq!(manager.token(&acc).await.unwrap(), "tok-1");
        // Second call hits the cache, no second connect
        assert_eq!(manager.token(&acc).await.unwrap(), "tok-1");
        // And the token was persisted
        assert!(store.load_token("A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_token_isolation_on_rebind() {
        let store = Arc::new(MemoryStore::new());
        let mut gateway = MockBrokerGateway::new();
        gateway.expect_connect().returning(|creds| {
            let creds_id = creds.id.clone();
            Ok(format!("tok-{creds_id}"))
        });

        let manager = SessionManager::new(store, Arc::new(gateway));
        let a = account("A");
        let b = account("B");

        manager.bind(&a).await;
        assert_eq!(manager.token(&a).await.unwrap(), "tok-A");

        // Rebinding invalidates A's cached token before any call for B
        manager.bind(&b).await;
        assert_eq!(manager.token(&b).await.unwrap(), "tok-B");

        // A call for A while bound to B is refused outright
        let err = manager.token(&a).await.unwrap_err();
        assert!(matches!(err, MtLinkError::AccountMismatch { .. }));
    }

    #[tokio::test]
    async fn test_restore_rejects_stale_token() {
        let store = Arc::new(MemoryStore::new());
        let acc = account("A");

        let mut stale = SessionToken::new("A", "tok-old", &acc.login);
        stale.issued_at = Utc::now() - chrono::Duration::minutes(31);
        store.save_token(&stale).await.unwrap();

        let mut gateway = MockBrokerGateway::new();
        gateway
            .expect_connect()
            .times(1)
            .returning(|_| Ok("tok-new".to_string()));

        let manager = SessionManager::new(store, Arc::new(gateway));
        manager.bind(&acc).await;
        assert_eq!(manager.token(&acc).await.unwrap(), "tok-new");
    }

    #[tokio::test]
    async fn test_restore_accepts_fresh_token() {
        let store = Arc::new(MemoryStore::new());
        let acc = account("A");
        store
            .save_token(&SessionToken::new("A", "tok-stored", &acc.login))
            .await
            .unwrap();

        // connect must never be called
        let gateway = MockBrokerGateway::new();
        let manager = SessionManager::new(store, Arc::new(gateway));
        manager.bind(&acc).await;
        assert_eq!(manager.token(&acc).await.unwrap(), "tok-stored");
    }

    #[tokio::test]
    async fn test_restore_rejects_changed_credentials() {
        let store = Arc::new(MemoryStore::new());
        let acc = account("A");
        store
            .save_token(&SessionToken::new("A", "tok-stored", "other-login"))
            .await
            .unwrap();

        let mut gateway = MockBrokerGateway::new();
        gateway
            .expect_connect()
            .times(1)
            .returning(|_| Ok("tok-new".to_string()));

        let manager = SessionManager::new(store, Arc::new(gateway));
        manager.bind(&acc).await;
        assert_eq!(manager.token(&acc).await.unwrap(), "tok-new");
    }

    #[tokio::test]
    async fn test_with_token_retries_once_after_invalidation() {
        let store = Arc::new(MemoryStore::new());
        let mut gateway = MockBrokerGateway::new();
        gateway
            .expect_connect()
            .times(2)
            .returning(|_| Ok("tok".to_string()));

        let manager = SessionManager::new(store, Arc::new(gateway));
        let acc = account("A");
        manager.bind(&acc).await;

        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = manager
            .with_token(&acc, |_token| {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(MtLinkError::TokenInvalid("expired".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_verify_bound_mismatch() {
        let manager = SessionManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockBrokerGateway::new()),
        );
        manager.bind(&account("A")).await;

        assert!(manager.verify_bound("A").await.is_ok());
        let err = manager.verify_bound("B").await.unwrap_err();
        assert!(matches!(
            err,
            MtLinkError::AccountMismatch { bound, expected }
                if bound == "A" && expected == "B"
        ));
    }
}
