//! # Refresh Coordinator
//!
//! Single-flight token refresh. However many callers ask for a refresh at the
//! same time, at most one refresh call is outstanding and every caller that
//! asked while it was outstanding receives the same result.
//!
//! ## Lifecycle of a refresh
//!
//! ```text
//!   idle ──(first caller, refresh token present)──> active(id) ──(resolved)──> idle
//!    │                                                 ▲
//!    └──(no refresh token)──> SessionExpired           └── later callers join
//! ```
//!
//! The refresh call runs in its own task. Waiters hold a shared handle to that
//! task's result, so dropping a waiter (e.g. a cancelled request) never leaves
//! the coordinator stuck in the active state.

use crate::api::AuthApi;
use crate::error::{AuthError, Result};
use crate::token_store::TokenStore;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

type SharedRefresh = Shared<BoxFuture<'static, Result<String>>>;

struct ActiveRefresh {
    id: u64,
    result: SharedRefresh,
}

enum Begin {
    Join(SharedRefresh),
    Current(String),
}

struct Inner {
    store: TokenStore,
    api: AuthApi,
    event_bus: EventBus,
    refresh_timeout: Duration,
    active: Mutex<Option<ActiveRefresh>>,
    next_id: AtomicU64,
}

/// Owner of the at-most-one outstanding refresh operation.
///
/// Cloning is cheap; clones share the same operation slot.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    /// `refresh_timeout` bounds one refresh call; expiry counts as a failed
    /// refresh.
    pub fn new(
        store: TokenStore,
        api: AuthApi,
        event_bus: EventBus,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                api,
                event_bus,
                refresh_timeout,
                active: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Returns an access token that is safe to send.
    ///
    /// Joins the outstanding refresh if there is one, otherwise returns the
    /// stored access token. Refreshes only when there is no access token.
    ///
    /// # Errors
    ///
    /// [`AuthError::SessionExpired`] if a refresh was needed and failed, or
    /// there is no refresh token to refresh with.
    pub async fn get_valid_access_token(&self) -> Result<String> {
        let begin = {
            let mut active = self.lock_active();
            match active.as_ref() {
                Some(refresh) => Begin::Join(refresh.result.clone()),
                None => match self.inner.store.read().access_token {
                    Some(access) => Begin::Current(access),
                    None => Begin::Join(self.start(&mut active)?),
                },
            }
        };
        self.finish(begin).await
    }

    /// Obtains a new access token regardless of the stored one.
    ///
    /// Starts a refresh, or joins the outstanding one.
    ///
    /// # Errors
    ///
    /// [`AuthError::SessionExpired`] if the refresh token is missing or the
    /// refresh failed. Tokens have been cleared in the latter case.
    pub async fn force_refresh(&self) -> Result<String> {
        let shared = {
            let mut active = self.lock_active();
            match active.as_ref() {
                Some(refresh) => refresh.result.clone(),
                None => self.start(&mut active)?,
            }
        };
        shared.await
    }

    /// Like [`force_refresh`](Self::force_refresh), but if `rejected` has
    /// already been replaced by an earlier refresh the current token is
    /// returned without refreshing again.
    pub(crate) async fn force_refresh_after(&self, rejected: &str) -> Result<String> {
        let begin = {
            let mut active = self.lock_active();
            match active.as_ref() {
                Some(refresh) => Begin::Join(refresh.result.clone()),
                None => match self.inner.store.read().access_token {
                    Some(access) if access != rejected => Begin::Current(access),
                    _ => Begin::Join(self.start(&mut active)?),
                },
            }
        };

        if matches!(begin, Begin::Current(_)) {
            debug!("Rejected token was already replaced, skipping refresh");
        }
        self.finish(begin).await
    }

    /// Whether a refresh call is outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.lock_active().is_some()
    }

    async fn finish(&self, begin: Begin) -> Result<String> {
        match begin {
            Begin::Join(shared) => shared.await,
            Begin::Current(access) => Ok(access),
        }
    }

    /// Starts a refresh and records it in `active`. Caller holds the slot lock.
    fn start(&self, active: &mut Option<ActiveRefresh>) -> Result<SharedRefresh> {
        let refresh_token = self.inner.store.read().refresh_token.ok_or_else(|| {
            warn!("No refresh token stored, cannot refresh");
            AuthError::SessionExpired {
                reason: "no refresh token".to_string(),
            }
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.store.set_refreshing(true);
        let _ = self
            .inner
            .event_bus
            .emit(CoreEvent::Auth(AuthEvent::TokenRefreshing { operation_id: id }));

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(id, refresh_token).await });

        let result = async move {
            handle.await.unwrap_or_else(|e| {
                Err(AuthError::SessionExpired {
                    reason: format!("refresh task failed: {}", e),
                })
            })
        }
        .boxed()
        .shared();

        *active = Some(ActiveRefresh {
            id,
            result: result.clone(),
        });
        Ok(result)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRefresh>> {
        self.inner.lock_active()
    }
}

impl Inner {
    #[instrument(name = "token_refresh", skip(self, refresh_token))]
    async fn run(&self, id: u64, refresh_token: String) -> Result<String> {
        let outcome = self.refresh(&refresh_token).await;

        self.release(id);
        let _ = self
            .event_bus
            .emit(CoreEvent::Auth(AuthEvent::TokenRefreshed { operation_id: id }));

        outcome
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String> {
        debug!("Calling token refresh endpoint");

        let response = match timeout(self.refresh_timeout, self.api.refresh(refresh_token)).await {
            Ok(response) => response,
            Err(_) => Err(AuthError::Network(format!(
                "refresh timed out after {:?}",
                self.refresh_timeout
            ))),
        };

        match response {
            Ok(token) => {
                let (access, update) = token.refresh_update();
                let applied = self
                    .store
                    .apply_refresh(refresh_token, access.clone(), update)
                    .await?;

                if applied {
                    info!("Access token refreshed");
                    return Ok(access);
                }

                // Signed out or in again while the call was outstanding.
                self.store.read().access_token.ok_or_else(|| AuthError::SessionExpired {
                    reason: "signed out during refresh".to_string(),
                })
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, clearing session");
                if let Err(clear_err) = self.store.expire_if_current(refresh_token).await {
                    warn!(error = %clear_err, "Failed to clear tokens after refresh failure");
                }
                Err(match e {
                    expired @ AuthError::SessionExpired { .. } => expired,
                    other => AuthError::SessionExpired {
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Frees the slot held by refresh `id`. The refreshing flag belongs to
    /// whichever refresh holds the slot, so a finished refresh that lost it
    /// leaves both untouched.
    fn release(&self, id: u64) {
        let mut active = self.lock_active();
        if active.as_ref().map(|refresh| refresh.id) == Some(id) {
            *active = None;
            self.store.set_refreshing(false);
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRefresh>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refreshing", &self.is_refreshing())
            .field("refresh_timeout", &self.inner.refresh_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{endpoints, signed_in_store};
    use crate::types::{ClearReason, RefreshUpdate, SessionStatus};
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Refresh endpoint that blocks until released, counting calls.
    struct GatedRefreshClient {
        calls: AtomicUsize,
        gate: Notify,
        status: u16,
        body: &'static str,
    }

    impl GatedRefreshClient {
        fn new(status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                status,
                body,
            })
        }
    }

    #[async_trait]
    impl HttpClient for GatedRefreshClient {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(HttpResponse::new(self.status, self.body))
        }
    }

    struct FailingClient;

    #[async_trait]
    impl HttpClient for FailingClient {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            Err(BridgeError::Network("connection reset".to_string()))
        }
    }

    fn coordinator(store: &TokenStore, client: Arc<dyn HttpClient>) -> RefreshCoordinator {
        coordinator_with_timeout(store, client, Duration::from_secs(5))
    }

    fn coordinator_with_timeout(
        store: &TokenStore,
        client: Arc<dyn HttpClient>,
        refresh_timeout: Duration,
    ) -> RefreshCoordinator {
        RefreshCoordinator::new(
            store.clone(),
            AuthApi::new(client, endpoints()),
            EventBus::new(16),
            refresh_timeout,
        )
    }

    async fn wait_for_calls(client: &GatedRefreshClient, expected: usize) {
        while client.calls.load(Ordering::SeqCst) < expected {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_network() {
        let store = signed_in_store(None).await;
        let client = GatedRefreshClient::new(200, r#"{"access":"A2"}"#);
        let coordinator = coordinator(&store, client.clone());

        let err = coordinator.force_refresh().await.unwrap_err();

        assert!(matches!(err, AuthError::SessionExpired { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let store = signed_in_store(Some("R1")).await;
        let client = GatedRefreshClient::new(200, r#"{"access":"A2"}"#);
        let coordinator = coordinator(&store, client.clone());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.force_refresh().await })
            })
            .collect();

        wait_for_calls(&client, 1).await;
        assert_eq!(store.read().status, SessionStatus::Refreshing);
        client.gate.notify_one();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), "A2");
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(store.read().access_token(), Some("A2"));
        assert_eq!(store.read().refresh_token(), Some("R1"));
        assert_eq!(store.read().status, SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn test_get_valid_access_token_uses_stored_token() {
        let store = signed_in_store(Some("R1")).await;
        let client = GatedRefreshClient::new(200, r#"{"access":"A2"}"#);
        let coordinator = coordinator(&store, client.clone());

        assert_eq!(coordinator.get_valid_access_token().await.unwrap(), "A1");
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_refresh_after_replaced_token_skips_refresh() {
        let store = signed_in_store(Some("R1")).await;
        let client = GatedRefreshClient::new(200, r#"{"access":"A2"}"#);
        let coordinator = coordinator(&store, client.clone());

        store.set_tokens("A2", RefreshUpdate::Keep).await.unwrap();

        assert_eq!(coordinator.force_refresh_after("A1").await.unwrap(), "A2");
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_clears_tokens() {
        let store = signed_in_store(Some("R1")).await;
        let coordinator = coordinator(&store, Arc::new(FailingClient));

        let err = coordinator.force_refresh().await.unwrap_err();

        assert!(matches!(err, AuthError::SessionExpired { reason } if reason.contains("connection reset")));
        let session = store.read();
        assert_eq!(session.status, SessionStatus::Expired);
        assert!(session.access_token.is_none());
        assert!(session.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_stored() {
        let store = signed_in_store(Some("R1")).await;
        let client = GatedRefreshClient::new(200, r#"{"access":"A2","refresh":"R2"}"#);
        let coordinator = coordinator(&store, client.clone());

        let refresh = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.force_refresh().await }
        });
        wait_for_calls(&client, 1).await;
        client.gate.notify_one();

        assert_eq!(refresh.await.unwrap().unwrap(), "A2");
        assert_eq!(store.read().refresh_token(), Some("R2"));
    }

    #[tokio::test]
    async fn test_sign_out_during_refresh_wins() {
        let store = signed_in_store(Some("R1")).await;
        let client = GatedRefreshClient::new(200, r#"{"access":"A2"}"#);
        let coordinator = coordinator(&store, client.clone());

        let refresh = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.force_refresh().await }
        });
        wait_for_calls(&client, 1).await;
        store.clear(ClearReason::SignedOut).await.unwrap();
        client.gate.notify_one();

        assert!(refresh.await.unwrap().is_err());
        assert!(store.read().access_token.is_none());
        assert_eq!(store.read().status, SessionStatus::Anonymous);
    }

    #[tokio::test]
    async fn test_stale_refresh_keeps_refreshing_status_of_next() {
        let store = signed_in_store(Some("R1")).await;
        let client = GatedRefreshClient::new(200, r#"{"access":"A2"}"#);
        let coordinator = coordinator(&store, client.clone());

        let refresh = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.force_refresh().await }
        });
        wait_for_calls(&client, 1).await;
        let current = coordinator
            .lock_active()
            .as_ref()
            .map(|refresh| refresh.id)
            .unwrap();

        // An earlier refresh finishing late must not touch the running one.
        coordinator.inner.release(current - 1);

        assert!(coordinator.is_refreshing());
        assert_eq!(store.read().status, SessionStatus::Refreshing);

        client.gate.notify_one();
        assert_eq!(refresh.await.unwrap().unwrap(), "A2");
        assert!(!coordinator.is_refreshing());
        assert_eq!(store.read().status, SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_stall_refresh() {
        let store = signed_in_store(Some("R1")).await;
        let client = GatedRefreshClient::new(200, r#"{"access":"A2"}"#);
        let coordinator = coordinator(&store, client.clone());

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.force_refresh().await }
        });
        wait_for_calls(&client, 1).await;
        first.abort();

        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.force_refresh().await }
        });
        tokio::task::yield_now().await;
        client.gate.notify_one();

        assert_eq!(second.await.unwrap().unwrap(), "A2");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_timeout_is_a_failure() {
        let store = signed_in_store(Some("R1")).await;
        let client = GatedRefreshClient::new(200, r#"{"access":"A2"}"#);
        let coordinator =
            coordinator_with_timeout(&store, client.clone(), Duration::from_millis(20));

        let err = coordinator.force_refresh().await.unwrap_err();

        assert!(matches!(err, AuthError::SessionExpired { reason } if reason.contains("timed out")));
        assert_eq!(store.read().status, SessionStatus::Expired);
    }
}
