//! Logout path for unrecoverable authentication failures.

use crate::token_store::TokenStore;
use crate::types::{ClearReason, SessionStatus};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_REASON: &str = "session expired";

/// Clears the session and tells the UI to return to sign-in.
///
/// The logout signal ([`AuthEvent::SessionExpired`]) is emitted at most once
/// per signed-in session, however many callers report the expiry.
#[derive(Clone)]
pub struct SessionLifecycle {
    store: TokenStore,
    event_bus: EventBus,
    // Token store epoch for which the signal was last emitted.
    signalled_epoch: Arc<Mutex<Option<u64>>>,
}

impl SessionLifecycle {
    pub fn new(store: TokenStore, event_bus: EventBus) -> Self {
        Self {
            store,
            event_bus,
            signalled_epoch: Arc::new(Mutex::new(None)),
        }
    }

    /// Ensures the tokens are cleared and emits the logout signal.
    ///
    /// Idempotent: concurrent or repeated calls for the same session have the
    /// effect of one call.
    pub async fn on_session_expired(&self) {
        self.expire(DEFAULT_REASON).await;
    }

    /// Same as [`on_session_expired`](Self::on_session_expired), with the
    /// reason carried by the emitted event.
    pub async fn expire(&self, reason: &str) {
        let mut signalled = self.signalled_epoch.lock().await;
        self.expire_locked(&mut signalled, reason).await;
    }

    /// Expires the session identified by `epoch`, if it is still current.
    ///
    /// A sign-in or sign-out since `epoch` was read wins: nothing is cleared
    /// and no signal is emitted.
    pub(crate) async fn expire_session(&self, epoch: u64, reason: &str) {
        let mut signalled = self.signalled_epoch.lock().await;
        let current = self.store.epoch();
        if current != epoch {
            debug!(epoch, current, "Session replaced since the failure, not expiring");
            return;
        }
        self.expire_locked(&mut signalled, reason).await;
    }

    async fn expire_locked(&self, signalled: &mut Option<u64>, reason: &str) {
        let session = self.store.read();
        if session.access_token.is_some()
            || session.refresh_token.is_some()
            || session.status != SessionStatus::Expired
        {
            if let Err(e) = self.store.clear(ClearReason::Expired).await {
                warn!(error = %e, "Failed to clear tokens on session expiry");
            }
        }

        let epoch = self.store.epoch();
        if *signalled == Some(epoch) {
            return;
        }

        *signalled = Some(epoch);
        info!(reason, "Session expired, signalling logout");
        let _ = self
            .event_bus
            .emit(CoreEvent::Auth(AuthEvent::SessionExpired {
                reason: reason.to_string(),
            }));
    }
}

impl std::fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycle").finish_non_exhaustive()
    }
}
