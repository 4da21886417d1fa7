//! # Authentication Manager
//!
//! Façade over the session components for host and UI code.
//!
//! ## Overview
//!
//! `AuthManager` wires together:
//!
//! - [`TokenStore`]: the durable session tokens
//! - [`RefreshCoordinator`]: single-flight token refresh
//! - [`AuthenticatedRequestExecutor`]: token attachment, 401 recovery and one retry
//! - [`SessionLifecycle`]: logout on unrecoverable failure
//!
//! and adds the account operations the UI needs (sign-in, sign-out,
//! registration) together with a filtered stream of auth events.
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::{AuthManager, Credentials};
//! use bridge_traits::http::{HttpMethod, HttpRequest};
//! # use core_runtime::config::ClientConfig;
//! # use core_runtime::events::EventBus;
//! # use bridge_traits::http::HttpClient;
//! # use std::sync::Arc;
//! # async fn example(config: ClientConfig, http_client: Arc<dyn HttpClient>) -> core_auth::Result<()> {
//! let manager = AuthManager::from_config(&config, http_client, EventBus::new(100)).await?;
//!
//! manager.sign_in(Credentials::new("alice", "hunter2")).await?;
//!
//! let response = manager
//!     .execute(HttpRequest::new(
//!         HttpMethod::Get,
//!         "http://127.0.0.1:8000/api/bookmarks/",
//!     ))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::api::AuthApi;
use crate::error::{AuthError, Result};
use crate::executor::AuthenticatedRequestExecutor;
use crate::refresh::RefreshCoordinator;
use crate::session::SessionLifecycle;
use crate::token_store::TokenStore;
use crate::types::{ClearReason, Credentials, RefreshUpdate, Registration, Session};
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use core_runtime::config::ClientConfig;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus, EventStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Entry point for everything session related.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct AuthManager {
    store: TokenStore,
    api: AuthApi,
    coordinator: RefreshCoordinator,
    lifecycle: SessionLifecycle,
    executor: AuthenticatedRequestExecutor,
    event_bus: EventBus,
}

impl AuthManager {
    /// Creates the manager over an already loaded token store.
    ///
    /// # Arguments
    ///
    /// * `store` - Session tokens
    /// * `api` - Client for the token endpoints
    /// * `http_client` - Client used for authenticated requests
    /// * `event_bus` - Bus receiving auth events
    /// * `request_timeout` - Per-send bound for authenticated requests
    /// * `refresh_timeout` - Bound for one refresh call
    pub fn new(
        store: TokenStore,
        api: AuthApi,
        http_client: Arc<dyn HttpClient>,
        event_bus: EventBus,
        request_timeout: Duration,
        refresh_timeout: Duration,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            api.clone(),
            event_bus.clone(),
            refresh_timeout,
        );
        let lifecycle = SessionLifecycle::new(store.clone(), event_bus.clone());
        let executor = AuthenticatedRequestExecutor::new(
            http_client,
            store.clone(),
            coordinator.clone(),
            lifecycle.clone(),
            request_timeout,
        );

        Self {
            store,
            api,
            coordinator,
            lifecycle,
            executor,
            event_bus,
        }
    }

    /// Loads the token store from the configured settings store and builds
    /// every component from `config`.
    pub async fn from_config(
        config: &ClientConfig,
        http_client: Arc<dyn HttpClient>,
        event_bus: EventBus,
    ) -> Result<Self> {
        let store = TokenStore::load(Arc::clone(&config.settings_store)).await?;
        let api = AuthApi::from_config(config, Arc::clone(&http_client))?;

        Ok(Self::new(
            store,
            api,
            http_client,
            event_bus,
            config.request_timeout,
            config.refresh_timeout,
        ))
    }

    /// Exchanges credentials for a token pair and starts a new session.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] if the server rejected the credentials
    /// - [`AuthError::Network`] if the token endpoint could not be reached
    /// - [`AuthError::Storage`] if the tokens could not be persisted
    #[instrument(skip(self, credentials), fields(username = %credentials.username))]
    pub async fn sign_in(&self, credentials: Credentials) -> Result<()> {
        let pair = match self.api.obtain_tokens(&credentials).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Sign-in failed");
                self.emit(AuthEvent::AuthError {
                    message: e.to_string(),
                    recoverable: e.is_recoverable(),
                });
                return Err(e);
            }
        };

        self.store
            .set_tokens(pair.access, RefreshUpdate::Replace(pair.refresh))
            .await?;

        info!("Signed in");
        self.emit(AuthEvent::SignedIn {
            username: credentials.username,
        });
        Ok(())
    }

    /// Ends the session. Succeeds when already signed out.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<()> {
        self.store.clear(ClearReason::SignedOut).await?;

        info!("Signed out");
        self.emit(AuthEvent::SignedOut);
        Ok(())
    }

    /// Creates an account. The new user still has to sign in.
    pub async fn register(&self, registration: Registration) -> Result<()> {
        self.api.register(&registration).await
    }

    pub fn is_signed_in(&self) -> bool {
        self.store.read().is_authenticated()
    }

    pub fn session(&self) -> Session {
        self.store.read()
    }

    /// Sends `request` with the session's access token.
    ///
    /// See [`AuthenticatedRequestExecutor::execute`].
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.executor.execute(request).await
    }

    /// Stream of auth events. The logout signal is
    /// [`AuthEvent::SessionExpired`] or [`AuthEvent::SignedOut`].
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.event_bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Auth(_)))
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    pub fn executor(&self) -> &AuthenticatedRequestExecutor {
        &self.executor
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.event_bus.emit(CoreEvent::Auth(event));
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("session", &self.store.read())
            .field("api", &self.api)
            .finish_non_exhaustive()
    }
}
