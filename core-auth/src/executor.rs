//! # Authenticated Request Executor
//!
//! The only entry point domain code uses to call protected endpoints.
//!
//! Every call is a bounded state machine:
//!
//! ```text
//! INITIAL ──401──> REFRESHING ──token──> RETRIED ──any──> done
//!    │                 │
//!    └──other──> done  └──expired──> logout, done
//! ```
//!
//! There is no edge out of `RETRIED` back to `REFRESHING`, so a server that
//! rejects every token costs one refresh and one retry per call, never a loop.

use crate::error::{AuthError, Result};
use crate::refresh::RefreshCoordinator;
use crate::session::SessionLifecycle;
use crate::token_store::TokenStore;
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Sends requests with the session's access token and recovers from an
/// expired token with one coordinated refresh and one retry.
#[derive(Clone)]
pub struct AuthenticatedRequestExecutor {
    http_client: Arc<dyn HttpClient>,
    store: TokenStore,
    coordinator: RefreshCoordinator,
    lifecycle: SessionLifecycle,
    request_timeout: Duration,
}

impl AuthenticatedRequestExecutor {
    /// `request_timeout` applies to each send unless the request carries its
    /// own timeout.
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        store: TokenStore,
        coordinator: RefreshCoordinator,
        lifecycle: SessionLifecycle,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            store,
            coordinator,
            lifecycle,
            request_timeout,
        }
    }

    /// Sends `request` with the current access token.
    ///
    /// Any `Authorization` header already on the request is replaced.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Unauthorized`] if there is no access token (nothing is
    ///   sent) or the retried request was rejected again
    /// - [`AuthError::SessionExpired`] if the token could not be refreshed;
    ///   the session has been cleared and the logout signal emitted
    /// - [`AuthError::Network`] on transport failure or timeout; never
    ///   triggers a refresh
    /// - [`AuthError::Server`] for any other non-2xx status, including 403
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let span = info_span!(
            "authenticated_request",
            request_id = %Uuid::new_v4(),
            method = request.method.as_str(),
            url = %request.url,
        );
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: HttpRequest) -> Result<HttpResponse> {
        if self.store.read().access_token.is_none() {
            debug!("No access token, not sending");
            return Err(AuthError::Unauthorized);
        }

        // Joins an outstanding refresh instead of sending a token that is
        // about to be replaced.
        let epoch = self.store.epoch();
        let token = match self.coordinator.get_valid_access_token().await {
            Ok(token) => token,
            Err(e) => return Err(self.refresh_failed(epoch, e).await),
        };

        let response = self.send(&request, &token).await?;
        if !response.is_unauthorized() {
            return into_result(response);
        }

        debug!("Access token rejected, refreshing");
        let epoch = self.store.epoch();
        let token = match self.coordinator.force_refresh_after(&token).await {
            Ok(token) => token,
            Err(e) => return Err(self.refresh_failed(epoch, e).await),
        };

        let response = self.send(&request, &token).await?;
        if response.is_unauthorized() {
            warn!("Retried request rejected, giving up");
            return Err(AuthError::Unauthorized);
        }
        into_result(response)
    }

    async fn send(&self, request: &HttpRequest, token: &str) -> Result<HttpResponse> {
        let limit = request.timeout.unwrap_or(self.request_timeout);
        let request = request.clone().bearer_token(token).timeout(limit);

        match timeout(limit, self.http_client.execute(request)).await {
            Ok(result) => result.map_err(AuthError::from_transport),
            Err(_) => Err(AuthError::Network(format!(
                "Request timed out after {:?}",
                limit
            ))),
        }
    }

    /// Expires the session seen at `epoch`; a newer sign-in or a sign-out
    /// is left alone.
    async fn refresh_failed(&self, epoch: u64, error: AuthError) -> AuthError {
        match error {
            AuthError::SessionExpired { reason } => {
                self.lifecycle.expire_session(epoch, &reason).await;
                AuthError::SessionExpired { reason }
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for AuthenticatedRequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedRequestExecutor")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

fn into_result(response: HttpResponse) -> Result<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .unwrap_or_else(|_| "Unable to read error response".to_string());
    Err(AuthError::Server {
        status: response.status,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AuthApi;
    use crate::test_support::{endpoints, signed_in_store};
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use crate::types::{ClearReason, RefreshUpdate, SessionStatus};
    use bridge_traits::http::HttpMethod;
    use core_runtime::events::EventBus;
    use std::sync::Mutex;

    /// Returns queued responses in order and records each request.
    #[derive(Default)]
    struct ScriptedClient {
        responses: Mutex<Vec<BridgeResult<HttpResponse>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedClient {
        fn new(mut responses: Vec<BridgeResult<HttpResponse>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(HttpResponse::new(500, "unscripted")))
        }
    }

    async fn executor(
        refresh: Option<&str>,
        client: Arc<ScriptedClient>,
    ) -> (AuthenticatedRequestExecutor, TokenStore) {
        let store = signed_in_store(refresh).await;
        let bus = EventBus::new(16);
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            AuthApi::new(client.clone(), endpoints()),
            bus.clone(),
            Duration::from_secs(5),
        );
        let lifecycle = SessionLifecycle::new(store.clone(), bus);
        let executor = AuthenticatedRequestExecutor::new(
            client,
            store.clone(),
            coordinator,
            lifecycle,
            Duration::from_secs(5),
        );
        (executor, store)
    }

    fn bookmarks() -> HttpRequest {
        HttpRequest::new(HttpMethod::Get, "http://127.0.0.1:8000/api/bookmarks/")
    }

    #[tokio::test]
    async fn test_attaches_access_token() {
        let client = ScriptedClient::new(vec![Ok(HttpResponse::new(200, "[]"))]);
        let (executor, _) = executor(Some("R1"), client.clone()).await;

        let response = executor.execute(bookmarks()).await.unwrap();

        assert_eq!(response.status, 200);
        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].bearer(), Some("A1"));
    }

    #[tokio::test]
    async fn test_no_access_token_sends_nothing() {
        let client = ScriptedClient::new(vec![]);
        let (executor, store) = executor(Some("R1"), client.clone()).await;
        store.clear(ClearReason::SignedOut).await.unwrap();

        let err = executor.execute(bookmarks()).await.unwrap_err();

        assert_eq!(err, AuthError::Unauthorized);
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_passes_through() {
        let client = ScriptedClient::new(vec![Ok(HttpResponse::new(403, "forbidden"))]);
        let (executor, store) = executor(Some("R1"), client.clone()).await;

        let err = executor.execute(bookmarks()).await.unwrap_err();

        assert_eq!(
            err,
            AuthError::Server {
                status: 403,
                body: "forbidden".to_string()
            }
        );
        assert_eq!(client.requests().len(), 1);
        assert_eq!(store.read().access_token(), Some("A1"));
    }

    #[tokio::test]
    async fn test_network_error_does_not_refresh() {
        let client = ScriptedClient::new(vec![Err(BridgeError::Timeout("30s".to_string()))]);
        let (executor, store) = executor(Some("R1"), client.clone()).await;

        let err = executor.execute(bookmarks()).await.unwrap_err();

        assert!(matches!(err, AuthError::Network(_)));
        assert_eq!(client.requests().len(), 1);
        assert_eq!(store.read().access_token(), Some("A1"));
    }

    #[tokio::test]
    async fn test_refresh_and_retry_once() {
        let client = ScriptedClient::new(vec![
            Ok(HttpResponse::new(401, "")),
            Ok(HttpResponse::new(200, r#"{"access":"A2"}"#)),
            Ok(HttpResponse::new(201, "{}")),
        ]);
        let (executor, store) = executor(Some("R1"), client.clone()).await;

        let response = executor.execute(bookmarks()).await.unwrap();

        assert_eq!(response.status, 201);
        let requests = client.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].url.ends_with("api/token/refresh/"));
        assert_eq!(requests[2].bearer(), Some("A2"));
        assert_eq!(requests[2].url, requests[0].url);
        assert_eq!(store.read().access_token(), Some("A2"));
    }

    #[tokio::test]
    async fn test_retry_rejected_again_is_unauthorized() {
        let client = ScriptedClient::new(vec![
            Ok(HttpResponse::new(401, "")),
            Ok(HttpResponse::new(200, r#"{"access":"A2"}"#)),
            Ok(HttpResponse::new(401, "")),
        ]);
        let (executor, store) = executor(Some("R1"), client.clone()).await;

        let err = executor.execute(bookmarks()).await.unwrap_err();

        assert_eq!(err, AuthError::Unauthorized);
        assert_eq!(client.requests().len(), 3);
        // No session side effect.
        assert_eq!(store.read().access_token(), Some("A2"));
        assert_eq!(store.read().refresh_token(), Some("R1"));
    }

    #[tokio::test]
    async fn test_retry_server_error_is_returned() {
        let client = ScriptedClient::new(vec![
            Ok(HttpResponse::new(401, "")),
            Ok(HttpResponse::new(200, r#"{"access":"A2"}"#)),
            Ok(HttpResponse::new(500, "boom")),
        ]);
        let (executor, _) = executor(Some("R1"), client.clone()).await;

        let err = executor.execute(bookmarks()).await.unwrap_err();

        assert!(matches!(err, AuthError::Server { status: 500, .. }));
        assert_eq!(client.requests().len(), 3);
    }

    /// Rejects every domain request; holds the refresh call until released,
    /// then rejects it too.
    #[derive(Default)]
    struct HeldRefreshClient {
        refresh_started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl HttpClient for HeldRefreshClient {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
            if request.url.ends_with("api/token/refresh/") {
                self.refresh_started.notify_one();
                self.release.notified().await;
                return Ok(HttpResponse::new(
                    401,
                    r#"{"detail":"Token is invalid or expired"}"#,
                ));
            }
            Ok(HttpResponse::new(401, ""))
        }
    }

    async fn held_executor() -> (
        AuthenticatedRequestExecutor,
        TokenStore,
        Arc<HeldRefreshClient>,
        tokio::sync::broadcast::Receiver<core_runtime::events::CoreEvent>,
    ) {
        let store = signed_in_store(Some("R1")).await;
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        let client = Arc::new(HeldRefreshClient::default());
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            AuthApi::new(client.clone(), endpoints()),
            bus.clone(),
            Duration::from_secs(5),
        );
        let executor = AuthenticatedRequestExecutor::new(
            client.clone(),
            store.clone(),
            coordinator,
            SessionLifecycle::new(store.clone(), bus),
            Duration::from_secs(5),
        );
        (executor, store, client, rx)
    }

    fn session_expired_signals(
        rx: &mut tokio::sync::broadcast::Receiver<core_runtime::events::CoreEvent>,
    ) -> usize {
        use core_runtime::events::{AuthEvent, CoreEvent};

        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CoreEvent::Auth(AuthEvent::SessionExpired { .. })) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_sign_in_during_failing_refresh_keeps_new_session() {
        let (executor, store, client, mut rx) = held_executor().await;

        let request = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute(bookmarks()).await }
        });
        client.refresh_started.notified().await;
        store
            .set_tokens("B1", RefreshUpdate::Replace("S1".to_string()))
            .await
            .unwrap();
        client.release.notify_one();

        let err = request.await.unwrap().unwrap_err();

        assert!(matches!(err, AuthError::SessionExpired { .. }));
        let session = store.read();
        assert_eq!(session.access_token(), Some("B1"));
        assert_eq!(session.refresh_token(), Some("S1"));
        assert_eq!(session.status, SessionStatus::Authenticated);
        assert_eq!(session_expired_signals(&mut rx), 0);
    }

    #[tokio::test]
    async fn test_sign_out_during_failing_refresh_stays_signed_out() {
        let (executor, store, client, mut rx) = held_executor().await;

        let request = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute(bookmarks()).await }
        });
        client.refresh_started.notified().await;
        store.clear(ClearReason::SignedOut).await.unwrap();
        client.release.notify_one();

        assert!(request.await.unwrap().is_err());
        assert_eq!(store.read().status, SessionStatus::Anonymous);
        assert_eq!(session_expired_signals(&mut rx), 0);
    }

    #[tokio::test]
    async fn test_failing_refresh_of_current_session_signals_once() {
        let (executor, store, client, mut rx) = held_executor().await;

        let request = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute(bookmarks()).await }
        });
        client.refresh_started.notified().await;
        client.release.notify_one();

        let err = request.await.unwrap().unwrap_err();

        assert!(matches!(err, AuthError::SessionExpired { .. }));
        assert_eq!(store.read().status, SessionStatus::Expired);
        assert_eq!(session_expired_signals(&mut rx), 1);
    }

    #[tokio::test]
    async fn test_request_timeout_is_network_error() {
        struct Hanging;

        #[async_trait]
        impl HttpClient for Hanging {
            async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
                std::future::pending().await
            }
        }

        let store = signed_in_store(Some("R1")).await;
        let bus = EventBus::new(16);
        let client: Arc<dyn HttpClient> = Arc::new(Hanging);
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            AuthApi::new(client.clone(), endpoints()),
            bus.clone(),
            Duration::from_secs(5),
        );
        let executor = AuthenticatedRequestExecutor::new(
            client,
            store.clone(),
            coordinator.clone(),
            SessionLifecycle::new(store.clone(), bus),
            Duration::from_millis(20),
        );

        let err = executor.execute(bookmarks()).await.unwrap_err();

        assert!(matches!(err, AuthError::Network(msg) if msg.contains("timed out")));
        assert!(!coordinator.is_refreshing());
        assert_eq!(store.read().access_token(), Some("A1"));
    }
}
