//! # Authentication Module
//!
//! Session layer of the bookmarks client: holds the access/refresh token pair,
//! attaches it to outgoing requests and recovers from expired access tokens.
//!
//! ## Overview
//!
//! - [`TokenStore`] is the single owner of the tokens and persists every change
//!   through the host's `SettingsStore` before it becomes visible.
//! - [`RefreshCoordinator`] makes sure that any number of concurrent callers
//!   needing a new access token share one refresh call.
//! - [`AuthenticatedRequestExecutor`] sends a request, and on a 401 refreshes
//!   through the coordinator and retries exactly once.
//! - [`SessionLifecycle`] clears the session and emits the logout signal when
//!   the refresh token is missing or rejected.
//! - [`AuthManager`] puts these together with sign-in, sign-out and
//!   registration against the token endpoints ([`AuthApi`]).

pub mod api;
pub mod error;
pub mod executor;
pub mod manager;
pub mod refresh;
pub mod session;
pub mod token_store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use api::{AuthApi, AuthEndpoints};
pub use error::{AuthError, FieldErrors, Result};
pub use executor::AuthenticatedRequestExecutor;
pub use manager::AuthManager;
pub use refresh::RefreshCoordinator;
pub use session::SessionLifecycle;
pub use token_store::TokenStore;
pub use types::{
    ClearReason, Credentials, RefreshUpdate, RefreshedToken, Registration, Session,
    SessionStatus, TokenPair,
};
