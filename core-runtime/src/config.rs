//! # Client Configuration Module
//!
//! Provides configuration management for the bookmarks client core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `ClientConfig`
//! instance that holds the API location, timeouts and the host bridges the core
//! needs. It enforces fail-fast validation so a misconfigured client never
//! reaches the network.
//!
//! ## Required Dependencies
//!
//! - `SettingsStore` - Durable storage for the session tokens
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `HttpClient` - HTTP transport (desktop default: reqwest)
//!
//! When the `desktop-shims` feature is enabled, a `ReqwestHttpClient` and a
//! `SqliteSettingsStore` are injected automatically if not provided.
//!
//! ## Usage
//!
//! ### Desktop Defaults
//!
//! ```ignore
//! use core_runtime::config::ClientConfig;
//!
//! let config = ClientConfig::builder()
//!     .from_env()
//!     .settings_path("/path/to/settings.db")
//!     .build()?;
//! ```
//!
//! ### Custom Bridges
//!
//! ```ignore
//! use core_runtime::config::ClientConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = ClientConfig::builder()
//!     .api_base_url("https://bookmarks.example.com/")
//!     .request_timeout(Duration::from_secs(10))
//!     .http_client(Arc::new(MyHttpClient))
//!     .settings_store(Arc::new(MySettingsStore))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{HttpClient, SettingsStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Base URL used when nothing else is configured.
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/";

/// Environment variable overriding the API base URL.
pub const API_BASE_URL_ENV: &str = "BOOKMARKS_API_BASE_URL";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Paths of the authentication endpoints, relative to the API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPaths {
    /// Exchanges credentials for an access/refresh pair
    pub token: String,
    /// Exchanges a refresh token for a new access token
    pub token_refresh: String,
    /// Creates a new account
    pub register: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            token: "api/token/".to_string(),
            token_refresh: "api/token/refresh/".to_string(),
            register: "accounts/register/".to_string(),
        }
    }
}

/// Configuration for the bookmarks client core.
///
/// Use [`ClientConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct ClientConfig {
    /// Root of the REST API; always ends with `/`
    pub api_base_url: Url,

    /// Authentication endpoint paths
    pub endpoints: EndpointPaths,

    /// Upper bound for a single authenticated request
    pub request_timeout: Duration,

    /// Upper bound for a single token refresh call
    pub refresh_timeout: Duration,

    /// Capacity of the event bus ring buffer
    pub event_buffer_size: usize,

    /// HTTP client for API requests (optional with desktop default)
    pub http_client: Option<Arc<dyn HttpClient>>,

    /// Durable token storage (required)
    pub settings_store: Arc<dyn SettingsStore>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_base_url", &self.api_base_url.as_str())
            .field("endpoints", &self.endpoints)
            .field("request_timeout", &self.request_timeout)
            .field("refresh_timeout", &self.refresh_timeout)
            .field("event_buffer_size", &self.event_buffer_size)
            .field(
                "http_client",
                &self.http_client.as_ref().map(|_| "HttpClient { ... }"),
            )
            .field("settings_store", &"SettingsStore { ... }")
            .finish()
    }
}

impl ClientConfig {
    /// Creates a new builder for constructing a `ClientConfig`.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Resolves an endpoint path against the API base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the joined URL is malformed.
    pub fn endpoint_url(&self, path: &str) -> Result<Url> {
        self.api_base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid endpoint path '{}': {}", path, e)))
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - The base URL uses http or https
    /// - Endpoint paths are not empty
    /// - Timeouts are non-zero and at most 10 minutes
    /// - The event buffer can hold at least one event
    pub fn validate(&self) -> Result<()> {
        match self.api_base_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::Config(format!(
                    "API base URL must use http or https, got '{}'",
                    other
                )))
            }
        }

        let paths = [
            ("token", &self.endpoints.token),
            ("token_refresh", &self.endpoints.token_refresh),
            ("register", &self.endpoints.register),
        ];
        for (name, path) in paths {
            if path.trim().is_empty() {
                return Err(Error::Config(format!(
                    "Endpoint path '{}' cannot be empty",
                    name
                )));
            }
        }

        validate_timeout("Request timeout", self.request_timeout)?;
        validate_timeout("Refresh timeout", self.refresh_timeout)?;

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_timeout(name: &str, timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        return Err(Error::Config(format!("{} must be greater than 0", name)));
    }

    if timeout > MAX_TIMEOUT {
        return Err(Error::Config(format!(
            "{} exceeds maximum of 10 minutes",
            name
        )));
    }

    Ok(())
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| Error::Config(format!("Invalid API base URL '{}': {}", raw, e)))?;

    // `Url::join` replaces the last path segment unless the base ends with '/'.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

#[cfg(not(feature = "desktop-shims"))]
fn settings_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SettingsStore".to_string(),
        message: "SettingsStore implementation is required for session token persistence. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default SqliteSettingsStore. \
                 Mobile: inject platform-native settings (UserDefaults/DataStore). \
                 Web: inject localStorage-based settings store."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(timeout: Duration) -> Result<Option<Arc<dyn HttpClient>>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::with_timeout(timeout)
        .map_err(|e| Error::Internal(format!("Failed to initialize default HttpClient: {}", e)))?;
    let client: Arc<dyn HttpClient> = Arc::new(client);
    Ok(Some(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_timeout: Duration) -> Result<Option<Arc<dyn HttpClient>>> {
    Ok(None)
}

#[cfg(feature = "desktop-shims")]
fn provide_default_settings_store(settings_path: Option<PathBuf>) -> Result<Arc<dyn SettingsStore>> {
    use bridge_desktop::SqliteSettingsStore;
    use std::thread;
    use tokio::runtime::{Builder, Handle};

    let path = settings_path
        .or_else(SqliteSettingsStore::default_path)
        .ok_or_else(|| Error::CapabilityMissing {
            capability: "SettingsStore".to_string(),
            message: "No platform data directory found for the default SqliteSettingsStore. \
                     Set .settings_path() or inject a SettingsStore."
                .to_string(),
        })?;

    let init_store = |path: PathBuf| -> Result<_> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                Error::Internal(format!(
                    "Failed to create Tokio runtime for default settings store: {}",
                    e
                ))
            })?;

        runtime
            .block_on(SqliteSettingsStore::new(path))
            .map_err(|e| {
                Error::Internal(format!("Failed to initialize default SettingsStore: {}", e))
            })
    };

    // block_on panics inside a runtime, so initialize on a helper thread there.
    let store = match Handle::try_current() {
        Ok(_) => thread::spawn(move || init_store(path))
            .join()
            .map_err(|_| {
                Error::Internal(
                    "Worker thread panicked while creating default SettingsStore".to_string(),
                )
            })??,
        Err(_) => init_store(path)?,
    };

    let store: Arc<dyn SettingsStore> = Arc::new(store);
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_settings_store(_settings_path: Option<PathBuf>) -> Result<Arc<dyn SettingsStore>> {
    Err(settings_store_missing_error())
}

/// Builder for constructing [`ClientConfig`] instances.
///
/// Every field has a default except the settings store, which falls back to
/// the desktop SQLite store only when `desktop-shims` is enabled.
#[derive(Default)]
pub struct ClientConfigBuilder {
    api_base_url: Option<String>,
    endpoints: Option<EndpointPaths>,
    request_timeout: Option<Duration>,
    refresh_timeout: Option<Duration>,
    event_buffer_size: Option<usize>,
    http_client: Option<Arc<dyn HttpClient>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    settings_path: Option<PathBuf>,
}

impl ClientConfigBuilder {
    /// Sets the API base URL.
    ///
    /// Default: `http://127.0.0.1:8000/`
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::ClientConfig;
    ///
    /// let builder = ClientConfig::builder()
    ///     .api_base_url("https://bookmarks.example.com/");
    /// ```
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Applies overrides from the process environment.
    ///
    /// Reads `BOOKMARKS_API_BASE_URL`; unset or blank values are ignored.
    pub fn from_env(self) -> Self {
        let value = std::env::var(API_BASE_URL_ENV).ok();
        self.apply_env_base_url(value)
    }

    fn apply_env_base_url(mut self, value: Option<String>) -> Self {
        if let Some(url) = value.filter(|v| !v.trim().is_empty()) {
            self.api_base_url = Some(url);
        }
        self
    }

    /// Overrides the authentication endpoint paths.
    pub fn endpoints(mut self, endpoints: EndpointPaths) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Sets the per-request timeout.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the token refresh timeout.
    ///
    /// Default: 30 seconds
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = Some(timeout);
        self
    }

    /// Sets the event bus buffer size.
    ///
    /// Default: 100
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default is used when the `desktop-shims`
    /// feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the durable settings store the session tokens live in.
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    /// Sets the database file used by the default desktop settings store.
    ///
    /// Ignored when a settings store is injected.
    pub fn settings_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    /// Builds the final `ClientConfig` instance.
    ///
    /// # Returns
    ///
    /// Returns `Ok(ClientConfig)` on success, or an error if:
    /// - The base URL cannot be parsed
    /// - The settings store is missing and no platform default exists
    /// - Configuration values are invalid
    pub fn build(self) -> Result<ClientConfig> {
        let api_base_url = parse_base_url(
            self.api_base_url
                .as_deref()
                .unwrap_or(DEFAULT_API_BASE_URL),
        )?;

        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_TIMEOUT);

        let http_client = match self.http_client {
            Some(client) => Some(client),
            None => provide_default_http_client(request_timeout)?,
        };

        let settings_store = match self.settings_store {
            Some(store) => store,
            None => provide_default_settings_store(self.settings_path)?,
        };

        let config = ClientConfig {
            api_base_url,
            endpoints: self.endpoints.unwrap_or_default(),
            request_timeout,
            refresh_timeout: self.refresh_timeout.unwrap_or(DEFAULT_TIMEOUT),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            http_client,
            settings_store,
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::storage::SettingsTransaction;
    use bridge_traits::{BridgeError, SettingsStore};
    use std::sync::Arc;

    struct MockSettingsStore;

    #[async_trait]
    impl SettingsStore for MockSettingsStore {
        async fn set_string(
            &self,
            _key: &str,
            _value: &str,
        ) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        async fn get_string(&self, _key: &str) -> std::result::Result<Option<String>, BridgeError> {
            Ok(None)
        }

        async fn delete(&self, _key: &str) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        async fn list_keys(&self) -> std::result::Result<Vec<String>, BridgeError> {
            Ok(Vec::new())
        }

        async fn clear_all(&self) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        async fn begin_transaction(
            &self,
        ) -> std::result::Result<Box<dyn SettingsTransaction + Send>, BridgeError> {
            Ok(Box::new(MockTransaction))
        }
    }

    struct MockTransaction;

    #[async_trait]
    impl SettingsTransaction for MockTransaction {
        async fn set_string(
            &mut self,
            _key: &str,
            _value: &str,
        ) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        async fn delete(&mut self, _key: &str) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        async fn commit(self: Box<Self>) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> std::result::Result<(), BridgeError> {
            Ok(())
        }
    }

    fn builder() -> ClientConfigBuilder {
        ClientConfig::builder().settings_store(Arc::new(MockSettingsStore))
    }

    #[test]
    fn test_builder_defaults() {
        let config = builder().build().unwrap();

        assert_eq!(config.api_base_url.as_str(), DEFAULT_API_BASE_URL);
        assert_eq!(config.endpoints, EndpointPaths::default());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.refresh_timeout, Duration::from_secs(30));
        assert_eq!(config.event_buffer_size, 100);
    }

    #[test]
    fn test_endpoint_urls_join_onto_base() {
        let config = builder().build().unwrap();

        assert_eq!(
            config.endpoint_url(&config.endpoints.token).unwrap().as_str(),
            "http://127.0.0.1:8000/api/token/"
        );
        assert_eq!(
            config
                .endpoint_url(&config.endpoints.token_refresh)
                .unwrap()
                .as_str(),
            "http://127.0.0.1:8000/api/token/refresh/"
        );
        assert_eq!(
            config
                .endpoint_url(&config.endpoints.register)
                .unwrap()
                .as_str(),
            "http://127.0.0.1:8000/accounts/register/"
        );
    }

    #[test]
    fn test_base_url_without_trailing_slash_keeps_prefix() {
        let config = builder()
            .api_base_url("https://example.com/bookmarks")
            .build()
            .unwrap();

        assert_eq!(config.api_base_url.as_str(), "https://example.com/bookmarks/");
        assert_eq!(
            config.endpoint_url("api/token/").unwrap().as_str(),
            "https://example.com/bookmarks/api/token/"
        );
    }

    #[test]
    fn test_env_override_applies_when_set() {
        let config = builder()
            .apply_env_base_url(Some("https://api.example.com/".to_string()))
            .build()
            .unwrap();
        assert_eq!(config.api_base_url.as_str(), "https://api.example.com/");

        let config = builder()
            .api_base_url("https://kept.example.com/")
            .apply_env_base_url(Some("   ".to_string()))
            .build()
            .unwrap();
        assert_eq!(config.api_base_url.as_str(), "https://kept.example.com/");
    }

    #[test]
    fn test_rejects_unparseable_base_url() {
        let result = builder().api_base_url("not a url").build();

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid API base URL"));
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let result = builder().api_base_url("ftp://example.com/").build();

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("http or https"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let result = builder().request_timeout(Duration::ZERO).build();

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("must be greater than 0"));
    }

    #[test]
    fn test_validate_rejects_excessive_refresh_timeout() {
        let result = builder()
            .refresh_timeout(Duration::from_secs(3600))
            .build();

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_rejects_zero_event_buffer() {
        let result = builder().event_buffer_size(0).build();

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Event buffer"));
    }

    #[test]
    fn test_validate_rejects_empty_endpoint_path() {
        let result = builder()
            .endpoints(EndpointPaths {
                token_refresh: String::new(),
                ..EndpointPaths::default()
            })
            .build();

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("token_refresh"));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_settings_store() {
        let result = ClientConfig::builder().build();

        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("SettingsStore"));
        assert!(err_msg.contains("token persistence"));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_http_client_optional_without_desktop_shims() {
        let config = builder().build().unwrap();
        assert!(config.http_client.is_none());
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_build_with_desktop_defaults() {
        let base = std::env::temp_dir().join(format!("core-runtime-test-{}", uuid::Uuid::new_v4()));
        let config = ClientConfig::builder()
            .settings_path(base.join("settings.db"))
            .build()
            .expect("desktop defaults should succeed");

        assert!(config.http_client.is_some());

        let settings = config.settings_store.clone();
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            settings.set_string("access_token", "A1").await.unwrap();
            let value = settings.get_string("access_token").await.unwrap();
            assert_eq!(value.as_deref(), Some("A1"));
        });

        drop(config);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn test_debug_hides_bridges() {
        let config = builder().build().unwrap();
        let debug = format!("{:?}", config);

        assert!(debug.contains("127.0.0.1:8000"));
        assert!(debug.contains("SettingsStore { ... }"));
    }

    #[test]
    fn test_config_is_cloneable() {
        let config = builder().build().unwrap();

        let cloned = config.clone();
        assert_eq!(cloned.api_base_url, config.api_base_url);
        assert!(Arc::ptr_eq(&cloned.settings_store, &config.settings_store));
    }
}
