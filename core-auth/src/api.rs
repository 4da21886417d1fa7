//! Token Endpoint Client
//!
//! Thin client over the backend's authentication endpoints. Responses are
//! mapped onto [`AuthError`] so that the coordinator and the façade can
//! decide what a failure means for the session.
//!
//! | Endpoint        | Success            | Failure                                  |
//! |-----------------|--------------------|------------------------------------------|
//! | `token`         | `{access, refresh}`| non-2xx → `InvalidCredentials`           |
//! | `token_refresh` | `{access[, refresh]}` | 4xx → `SessionExpired`, 5xx → `Server` |
//! | `register`      | 201                | 400 → `RegistrationRejected`             |

use crate::error::{AuthError, FieldErrors, Result};
use crate::types::{Credentials, RefreshedToken, Registration, TokenPair};
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use core_runtime::config::ClientConfig;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fully resolved URLs of the authentication endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    pub token: Url,
    pub token_refresh: Url,
    pub register: Url,
}

impl AuthEndpoints {
    /// Resolves the configured endpoint paths against the API base URL.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let resolve = |path: &str| {
            config
                .endpoint_url(path)
                .map_err(|e| AuthError::Config(e.to_string()))
        };

        Ok(Self {
            token: resolve(&config.endpoints.token)?,
            token_refresh: resolve(&config.endpoints.token_refresh)?,
            register: resolve(&config.endpoints.register)?,
        })
    }
}

#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh: &'a str,
}

/// Client for the token, token refresh and registration endpoints.
#[derive(Clone)]
pub struct AuthApi {
    http_client: Arc<dyn HttpClient>,
    endpoints: AuthEndpoints,
    timeout: Duration,
}

impl AuthApi {
    pub fn new(http_client: Arc<dyn HttpClient>, endpoints: AuthEndpoints) -> Self {
        Self {
            http_client,
            endpoints,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Builds the client from the runtime configuration, using its refresh
    /// timeout for every call.
    pub fn from_config(config: &ClientConfig, http_client: Arc<dyn HttpClient>) -> Result<Self> {
        Ok(Self::new(http_client, AuthEndpoints::from_config(config)?)
            .with_timeout(config.refresh_timeout))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    /// Exchanges credentials for a fresh token pair.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] for any non-2xx response
    /// - [`AuthError::Network`] if the request could not be sent
    #[instrument(skip(self, credentials), fields(username = %credentials.username))]
    pub async fn obtain_tokens(&self, credentials: &Credentials) -> Result<TokenPair> {
        let response = self.post(&self.endpoints.token, credentials).await?;

        if !response.is_success() {
            let body = body_text(&response);
            warn!(status = response.status, "Token endpoint rejected credentials");
            return Err(AuthError::InvalidCredentials(body));
        }

        response.json().map_err(|e| {
            AuthError::Serialization(format!("Failed to parse token response: {}", e))
        })
    }

    /// Exchanges a refresh token for a new access token.
    ///
    /// Makes exactly one call; retry policy belongs to the caller.
    ///
    /// # Errors
    ///
    /// - [`AuthError::SessionExpired`] when the server rejects the refresh token (4xx)
    /// - [`AuthError::Server`] for 5xx responses
    /// - [`AuthError::Network`] if the request could not be sent
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken> {
        let body = RefreshBody {
            refresh: refresh_token,
        };
        let response = self.post(&self.endpoints.token_refresh, &body).await?;

        if response.is_success() {
            let token: RefreshedToken = response.json().map_err(|e| {
                AuthError::Serialization(format!("Failed to parse refresh response: {}", e))
            })?;
            debug!(rotated = token.refresh.is_some(), "Access token refreshed");
            return Ok(token);
        }

        let status = response.status;
        if response.is_client_error() {
            warn!(status, "Refresh token rejected");
            return Err(AuthError::SessionExpired {
                reason: format!("refresh token rejected (HTTP {})", status),
            });
        }

        warn!(status, "Token refresh failed");
        Err(AuthError::Server {
            status,
            body: body_text(&response),
        })
    }

    /// Creates a new account. Does not sign in.
    ///
    /// # Errors
    ///
    /// - [`AuthError::RegistrationRejected`] with per-field messages on HTTP 400
    /// - [`AuthError::Server`] for any other non-2xx response
    /// - [`AuthError::Network`] if the request could not be sent
    #[instrument(skip(self, registration), fields(username = %registration.username))]
    pub async fn register(&self, registration: &Registration) -> Result<()> {
        let response = self.post(&self.endpoints.register, registration).await?;

        if response.is_success() {
            debug!("Account created");
            return Ok(());
        }

        if response.status == 400 {
            let errors = parse_field_errors(&response);
            warn!(fields = errors.len(), "Registration rejected");
            return Err(AuthError::RegistrationRejected { errors });
        }

        Err(AuthError::Server {
            status: response.status,
            body: body_text(&response),
        })
    }

    async fn post<T: Serialize>(&self, url: &Url, body: &T) -> Result<HttpResponse> {
        let request = HttpRequest::new(HttpMethod::Post, url.as_str())
            .json(body)
            .map_err(|e| AuthError::Serialization(e.to_string()))?
            .timeout(self.timeout);

        self.http_client
            .execute(request)
            .await
            .map_err(AuthError::from_transport)
    }
}

impl std::fmt::Debug for AuthApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthApi")
            .field("endpoints", &self.endpoints)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn body_text(response: &HttpResponse) -> String {
    response
        .text()
        .unwrap_or_else(|_| "Unable to read error response".to_string())
}

/// Parses `{"errors": {"field": ["message", ...]}}`.
///
/// Plain string values are accepted as a single message. A body that does not
/// have this shape is reported under `non_field_errors`.
fn parse_field_errors(response: &HttpResponse) -> FieldErrors {
    let mut errors = FieldErrors::new();

    let parsed: Option<Value> = response.json().ok();
    let fields = parsed
        .as_ref()
        .and_then(|value| value.get("errors"))
        .and_then(Value::as_object);

    match fields {
        Some(fields) => {
            for (field, value) in fields {
                let messages = match value {
                    Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect(),
                    Value::String(s) => vec![s.clone()],
                    other => vec![other.to_string()],
                };
                errors.insert(field.clone(), messages);
            }
        }
        None => {
            errors.insert("non_field_errors".to_string(), vec![body_text(response)]);
        }
    }

    errors
}
