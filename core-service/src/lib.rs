//! Core service façade and bootstrap helpers.
//!
//! This crate wires the host-provided bridges from a [`ClientConfig`] into the
//! session layer and hands UI code a ready [`CoreService`]. Desktop apps
//! typically enable the `desktop-shims` feature, which lets the configuration
//! fall back to the reqwest HTTP client and the SQLite settings store from
//! `bridge-desktop`; other hosts inject their own bridges.
//!
//! ```no_run
//! use core_runtime::config::ClientConfig;
//! use core_service::CoreService;
//!
//! # async fn example() -> core_service::Result<()> {
//! let config = ClientConfig::builder().from_env().build()?;
//! let core = CoreService::bootstrap(config).await?;
//!
//! let mut events = core.auth().subscribe();
//! # Ok(())
//! # }
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;

use bridge_traits::http::HttpClient;
use core_auth::AuthManager;
use core_runtime::config::ClientConfig;
use core_runtime::events::EventBus;
use tracing::info;

/// Primary façade exposed to host applications.
///
/// Cloning is cheap; clones share the same session and event bus.
#[derive(Clone)]
pub struct CoreService {
    config: Arc<ClientConfig>,
    event_bus: EventBus,
    auth: AuthManager,
}

impl CoreService {
    /// Validate `config`, load the persisted session and build every component.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Runtime`] if the configuration is invalid
    /// - [`CoreError::CapabilityMissing`] if no HTTP client is configured and
    ///   no desktop default is available
    /// - [`CoreError::Auth`] if the stored session cannot be read
    pub async fn bootstrap(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let http_client = resolve_http_client(&config)?;
        let event_bus = EventBus::new(config.event_buffer_size);
        let auth = AuthManager::from_config(&config, http_client, event_bus.clone()).await?;

        info!(
            api_base_url = %config.api_base_url,
            signed_in = auth.is_signed_in(),
            "Core service initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            event_bus,
            auth,
        })
    }

    /// Session operations: sign-in/out, registration and authenticated requests.
    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for CoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreService")
            .field("config", &self.config)
            .field("auth", &self.auth)
            .finish()
    }
}

fn resolve_http_client(config: &ClientConfig) -> Result<Arc<dyn HttpClient>> {
    config
        .http_client
        .clone()
        .ok_or_else(|| CoreError::CapabilityMissing {
            capability: "HttpClient".to_string(),
            message: "No HTTP client configured. \
                     Desktop: enable the 'desktop-shims' feature to use the default ReqwestHttpClient. \
                     Other hosts: inject one with ClientConfig::builder().http_client(...)."
                .to_string(),
        })
}
