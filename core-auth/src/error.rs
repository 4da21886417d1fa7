use bridge_traits::BridgeError;
use std::collections::BTreeMap;
use thiserror::Error;

/// Field name to validation messages, as returned by the registration endpoint.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No usable access token; the caller must sign in.
    #[error("Not authorized, sign in required")]
    Unauthorized,

    /// The refresh token is missing or was rejected. Tokens have been cleared.
    #[error("Session expired: {reason}")]
    SessionExpired { reason: String },

    /// Transport failure or timeout. Never triggers a refresh.
    #[error("Network error: {0}")]
    Network(String),

    /// Any non-2xx response other than a first-attempt 401.
    #[error("Server returned HTTP {status}")]
    Server { status: u16, body: String },

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Registration rejected: {}", summarize(.errors))]
    RegistrationRejected { errors: FieldErrors },

    #[error("Token storage unavailable: {0}")]
    Storage(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Maps a transport failure from the HTTP bridge.
    pub fn from_transport(error: BridgeError) -> Self {
        AuthError::Network(error.to_string())
    }

    /// Maps a failure from the settings bridge.
    pub fn from_storage(error: BridgeError) -> Self {
        AuthError::Storage(error.to_string())
    }

    /// Whether retrying the same operation later can succeed without the user
    /// signing in again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AuthError::Network(_) | AuthError::Server { .. } | AuthError::Storage(_)
        )
    }

    /// Whether the caller has to go back to the sign-in screen.
    pub fn requires_sign_in(&self) -> bool {
        matches!(
            self,
            AuthError::Unauthorized | AuthError::SessionExpired { .. }
        )
    }
}

fn summarize(errors: &FieldErrors) -> String {
    if errors.is_empty() {
        return "no details".to_string();
    }

    errors
        .iter()
        .map(|(field, messages)| format!("{}: {}", field, messages.join(" ")))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, AuthError>;
