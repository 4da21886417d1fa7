use serde::{Deserialize, Serialize};
use std::fmt;

const REDACTED: &str = "[REDACTED]";

/// Derived state of the process-wide session.
///
/// Never set directly; [`TokenStore`](crate::TokenStore) computes it from the
/// tokens it holds and whether a refresh is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// No tokens and no failed refresh since the last sign-in/out.
    Anonymous,
    /// An access token is present and no refresh is in flight.
    Authenticated,
    /// A refresh call is outstanding.
    Refreshing,
    /// The last refresh failed; tokens were cleared and the user must sign in.
    Expired,
}

impl SessionStatus {
    pub(crate) fn derive(has_access: bool, has_refresh: bool, refreshing: bool, expired: bool) -> Self {
        if refreshing && (has_access || has_refresh) {
            SessionStatus::Refreshing
        } else if has_access {
            SessionStatus::Authenticated
        } else if expired {
            SessionStatus::Expired
        } else {
            SessionStatus::Anonymous
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Anonymous => "anonymous",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Refreshing => "refreshing",
            SessionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the session returned by [`TokenStore::read`](crate::TokenStore::read).
///
/// # Security
///
/// The `Debug` implementation redacts both tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub status: SessionStatus,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            status: SessionStatus::Anonymous,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// True when requests can be sent with the current access token.
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &self.access_token.as_ref().map(|_| REDACTED))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| REDACTED))
            .field("status", &self.status)
            .finish()
    }
}

/// What to do with the stored refresh token when a new access token is stored.
#[derive(Clone, PartialEq, Eq)]
pub enum RefreshUpdate {
    /// Store a new refresh token (sign-in, or a server that rotates tokens).
    Replace(String),
    /// Keep the current refresh token.
    Keep,
}

impl fmt::Debug for RefreshUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshUpdate::Replace(_) => write!(f, "Replace({})", REDACTED),
            RefreshUpdate::Keep => f.write_str("Keep"),
        }
    }
}

/// Why the tokens are being cleared; selects the resulting status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// Explicit sign-out, status becomes `Anonymous`.
    SignedOut,
    /// Unrecoverable refresh failure, status becomes `Expired`.
    Expired,
}

/// Username/password pair posted to the token endpoint.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &REDACTED)
            .finish()
    }
}

/// Token pair issued at sign-in.
#[derive(Clone, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &REDACTED)
            .field("refresh", &REDACTED)
            .finish()
    }
}

/// Response of the refresh endpoint. `refresh` is present only when the
/// server rotates refresh tokens.
#[derive(Clone, Deserialize)]
pub struct RefreshedToken {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

impl RefreshedToken {
    pub(crate) fn refresh_update(self) -> (String, RefreshUpdate) {
        let update = match self.refresh {
            Some(refresh) => RefreshUpdate::Replace(refresh),
            None => RefreshUpdate::Keep,
        };
        (self.access, update)
    }
}

impl fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("access", &REDACTED)
            .field("rotated", &self.refresh.is_some())
            .finish()
    }
}

/// Account registration form.
#[derive(Clone, Serialize)]
pub struct Registration {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password1: String,
    pub password2: String,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("username", &self.username)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("email", &REDACTED)
            .field("password1", &REDACTED)
            .field("password2", &REDACTED)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derivation() {
        assert_eq!(
            SessionStatus::derive(false, false, false, false),
            SessionStatus::Anonymous
        );
        assert_eq!(
            SessionStatus::derive(true, false, false, false),
            SessionStatus::Authenticated
        );
        assert_eq!(
            SessionStatus::derive(true, true, true, false),
            SessionStatus::Refreshing
        );
        assert_eq!(
            SessionStatus::derive(false, false, false, true),
            SessionStatus::Expired
        );
        // A stale refreshing flag never outlives the tokens.
        assert_eq!(
            SessionStatus::derive(false, false, true, true),
            SessionStatus::Expired
        );
    }

    #[test]
    fn test_session_debug_redacts_tokens() {
        let session = Session {
            access_token: Some("A1-secret".to_string()),
            refresh_token: Some("R1-secret".to_string()),
            status: SessionStatus::Authenticated,
        };

        let debug = format!("{:?}", session);
        assert!(!debug.contains("A1-secret"));
        assert!(!debug.contains("R1-secret"));
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("Authenticated"));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials::new("alice", "hunter2");
        let debug = format!("{:?}", credentials);

        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_refreshed_token_without_rotation_keeps_refresh() {
        let token: RefreshedToken = serde_json::from_str(r#"{"access":"A2"}"#).unwrap();
        let (access, update) = token.refresh_update();

        assert_eq!(access, "A2");
        assert_eq!(update, RefreshUpdate::Keep);
    }

    #[test]
    fn test_refreshed_token_with_rotation_replaces_refresh() {
        let token: RefreshedToken =
            serde_json::from_str(r#"{"access":"A2","refresh":"R2"}"#).unwrap();
        let (_, update) = token.refresh_update();

        assert_eq!(update, RefreshUpdate::Replace("R2".to_string()));
    }
}
