//! Session Token Storage
//!
//! Holds the access/refresh token pair for the running client and mirrors it
//! into the host's durable [`SettingsStore`].
//!
//! ## Guarantees
//!
//! - `read()` is synchronous and never fails; it returns the in-memory snapshot.
//! - Every mutation is committed to durable storage in one transaction before
//!   the snapshot changes, so a reload sees either the old pair or the new pair.
//! - Mutations are serialized, so the in-memory order matches the durable order.
//! - Token values are never logged.
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::{ClearReason, RefreshUpdate, TokenStore};
//! # use bridge_traits::storage::SettingsStore;
//! # use std::sync::Arc;
//! # async fn example(settings: Arc<dyn SettingsStore>) -> core_auth::Result<()> {
//! let store = TokenStore::load(settings).await?;
//!
//! store
//!     .set_tokens("access", RefreshUpdate::Replace("refresh".to_string()))
//!     .await?;
//! assert!(store.read().is_authenticated());
//!
//! store.clear(ClearReason::SignedOut).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::types::{ClearReason, RefreshUpdate, Session, SessionStatus};
use bridge_traits::storage::SettingsStore;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Durable key of the access token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Durable key of the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

#[derive(Default)]
struct TokenState {
    access: Option<String>,
    refresh: Option<String>,
    refreshing: bool,
    expired: bool,
    epoch: u64,
}

impl TokenState {
    fn snapshot(&self) -> Session {
        Session {
            access_token: self.access.clone(),
            refresh_token: self.refresh.clone(),
            status: SessionStatus::derive(
                self.access.is_some(),
                self.refresh.is_some(),
                self.refreshing,
                self.expired,
            ),
        }
    }
}

struct Inner {
    settings: Arc<dyn SettingsStore>,
    state: RwLock<TokenState>,
    write_lock: Mutex<()>,
}

/// Single owner of the session tokens.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<Inner>,
}

impl TokenStore {
    /// Hydrate the store from durable storage.
    ///
    /// A refresh token stored without an access token is erased, so the
    /// session starts anonymous instead of in an undefined state.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the settings store cannot be read.
    pub async fn load(settings: Arc<dyn SettingsStore>) -> Result<Self> {
        let access = settings
            .get_string(ACCESS_TOKEN_KEY)
            .await
            .map_err(AuthError::from_storage)?;
        let mut refresh = settings
            .get_string(REFRESH_TOKEN_KEY)
            .await
            .map_err(AuthError::from_storage)?;

        if access.is_none() && refresh.is_some() {
            warn!("Discarding stored refresh token without an access token");
            let mut tx = settings
                .begin_transaction()
                .await
                .map_err(AuthError::from_storage)?;
            tx.delete(REFRESH_TOKEN_KEY)
                .await
                .map_err(AuthError::from_storage)?;
            tx.commit().await.map_err(AuthError::from_storage)?;
            refresh = None;
        }

        info!(
            has_access_token = access.is_some(),
            has_refresh_token = refresh.is_some(),
            "Token store loaded"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                state: RwLock::new(TokenState {
                    access,
                    refresh,
                    ..TokenState::default()
                }),
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Current tokens and derived status. Never blocks on I/O, never fails.
    pub fn read(&self) -> Session {
        self.state().snapshot()
    }

    /// Session generation. Bumped whenever a new refresh token is stored and
    /// on sign-out, so a refresh outcome can tell whether its session is
    /// still the current one.
    pub fn epoch(&self) -> u64 {
        self.state().epoch
    }

    /// Durably store a new access token, and a new refresh token if supplied.
    ///
    /// On error the in-memory session is left unchanged.
    pub async fn set_tokens(&self, access: impl Into<String>, refresh: RefreshUpdate) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        self.write_tokens(access.into(), refresh).await
    }

    /// Durably remove both tokens.
    ///
    /// `ClearReason::Expired` leaves the session `Expired`, `SignedOut` leaves
    /// it `Anonymous`. Clearing an already empty store only updates the status.
    pub async fn clear(&self, reason: ClearReason) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        self.remove_tokens(reason).await
    }

    /// Store a refreshed access token only if `used_refresh` is still the
    /// current refresh token.
    ///
    /// Returns `false` (and writes nothing) when the session changed while
    /// the refresh was in flight, e.g. the user signed out or in again.
    pub(crate) async fn apply_refresh(
        &self,
        used_refresh: &str,
        access: String,
        refresh: RefreshUpdate,
    ) -> Result<bool> {
        let _guard = self.inner.write_lock.lock().await;
        if !self.is_current_refresh(used_refresh) {
            debug!("Session changed during refresh, discarding refreshed token");
            return Ok(false);
        }
        self.write_tokens(access, refresh).await?;
        Ok(true)
    }

    /// Clear the session as expired only if `used_refresh` is still current.
    pub(crate) async fn expire_if_current(&self, used_refresh: &str) -> Result<bool> {
        let _guard = self.inner.write_lock.lock().await;
        if !self.is_current_refresh(used_refresh) {
            debug!("Session changed during refresh, keeping current tokens");
            return Ok(false);
        }
        self.remove_tokens(ClearReason::Expired).await?;
        Ok(true)
    }

    pub(crate) fn set_refreshing(&self, refreshing: bool) {
        self.state_mut().refreshing = refreshing;
    }

    fn is_current_refresh(&self, used_refresh: &str) -> bool {
        self.state().refresh.as_deref() == Some(used_refresh)
    }

    async fn write_tokens(&self, access: String, refresh: RefreshUpdate) -> Result<()> {
        let mut tx = self
            .inner
            .settings
            .begin_transaction()
            .await
            .map_err(AuthError::from_storage)?;

        tx.set_string(ACCESS_TOKEN_KEY, &access)
            .await
            .map_err(AuthError::from_storage)?;
        if let RefreshUpdate::Replace(token) = &refresh {
            tx.set_string(REFRESH_TOKEN_KEY, token)
                .await
                .map_err(AuthError::from_storage)?;
        }

        tx.commit().await.map_err(|e| {
            warn!(error = %e, "Failed to persist tokens");
            AuthError::from_storage(e)
        })?;

        let refresh_replaced = matches!(refresh, RefreshUpdate::Replace(_));
        let mut state = self.state_mut();
        state.access = Some(access);
        if let RefreshUpdate::Replace(token) = refresh {
            state.refresh = Some(token);
            state.epoch += 1;
        }
        state.expired = false;

        info!(refresh_replaced, epoch = state.epoch, "Tokens stored");
        Ok(())
    }

    async fn remove_tokens(&self, reason: ClearReason) -> Result<()> {
        let mut tx = self
            .inner
            .settings
            .begin_transaction()
            .await
            .map_err(AuthError::from_storage)?;

        tx.delete(ACCESS_TOKEN_KEY)
            .await
            .map_err(AuthError::from_storage)?;
        tx.delete(REFRESH_TOKEN_KEY)
            .await
            .map_err(AuthError::from_storage)?;

        tx.commit().await.map_err(|e| {
            warn!(error = %e, "Failed to clear tokens");
            AuthError::from_storage(e)
        })?;

        let mut state = self.state_mut();
        state.access = None;
        state.refresh = None;
        state.expired = reason == ClearReason::Expired;
        if reason == ClearReason::SignedOut {
            state.epoch += 1;
        }

        info!(reason = ?reason, epoch = state.epoch, "Tokens cleared");
        Ok(())
    }

    // Nothing panics while holding the lock, but recover from poisoning anyway.
    fn state(&self) -> RwLockReadGuard<'_, TokenState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, TokenState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("session", &self.read())
            .finish()
    }
}
