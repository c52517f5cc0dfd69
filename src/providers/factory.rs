//! Driver construction.
//!
//! [`DriverFactory`] resolves a provider identifier against a fixed registry
//! and builds a ready driver for one connection.

use std::sync::Arc;
use std::time::Duration;

use super::oauth::OAuthClient;
use super::token::{RefreshingTokenSupplier, TokenSupplier};
use super::{GmailDriver, MailDriver, OutlookDriver, ProviderError, Result};
use crate::config::{ProviderSettings, Settings};
use crate::domain::{Connection, ProviderId};
use crate::storage::ConnectionStore;

/// Per-connection inputs to [`DriverFactory::create`].
pub struct DriverConfig {
    /// The connection the driver acts for.
    pub connection: Connection,
    /// Store used to persist refreshed tokens and delete dead connections.
    pub store: Arc<dyn ConnectionStore>,
    /// Overrides the default refreshing supplier.
    pub token_supplier: Option<Arc<dyn TokenSupplier>>,
}

impl DriverConfig {
    pub fn new(connection: Connection, store: Arc<dyn ConnectionStore>) -> Self {
        Self {
            connection,
            store,
            token_supplier: None,
        }
    }

    /// Uses `supplier` instead of refreshing from the connection's tokens.
    pub fn with_token_supplier(mut self, supplier: Arc<dyn TokenSupplier>) -> Self {
        self.token_supplier = Some(supplier);
        self
    }
}

/// Everything a driver constructor receives.
pub struct DriverContext {
    pub provider: ProviderId,
    pub connection: Connection,
    pub store: Arc<dyn ConnectionStore>,
    pub settings: ProviderSettings,
    pub http: reqwest::Client,
    pub tokens: Arc<dyn TokenSupplier>,
    pub oauth: OAuthClient,
}

type Constructor = fn(DriverContext) -> Box<dyn MailDriver>;

fn gmail(ctx: DriverContext) -> Box<dyn MailDriver> {
    Box::new(GmailDriver::new(ctx))
}

fn outlook(ctx: DriverContext) -> Box<dyn MailDriver> {
    Box::new(OutlookDriver::new(ctx))
}

/// Supported providers, keyed by stored provider id.
const REGISTRY: &[(&str, ProviderId, Constructor)] = &[
    ("google", ProviderId::Google, gmail),
    ("microsoft", ProviderId::Microsoft, outlook),
];

/// Builds drivers from settings and per-connection config.
pub struct DriverFactory {
    settings: Settings,
    http: reqwest::Client,
}

impl DriverFactory {
    /// Creates a factory with one shared HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Internal`] if the HTTP client cannot be built.
    pub fn new(settings: Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http.timeout_secs))
            .user_agent(settings.http.user_agent.clone())
            .build()
            .map_err(|e| ProviderError::Internal(format!("build http client: {}", e)))?;
        Ok(Self { settings, http })
    }

    /// Returns the provider ids this factory can build.
    pub fn supported() -> impl Iterator<Item = &'static str> {
        REGISTRY.iter().map(|(id, _, _)| *id)
    }

    /// Returns the settings drivers are built from.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Builds a driver for `provider_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnsupportedProvider`] for an unknown id, before
    /// anything else is constructed.
    pub fn create(&self, provider_id: &str, config: DriverConfig) -> Result<Box<dyn MailDriver>> {
        let (_, provider, constructor) = REGISTRY
            .iter()
            .find(|(id, _, _)| *id == provider_id)
            .ok_or_else(|| ProviderError::UnsupportedProvider(provider_id.to_string()))?;

        let settings = self.settings.provider(*provider).clone();
        let oauth = OAuthClient::new(*provider, &settings, self.http.clone())?;
        let tokens = match config.token_supplier {
            Some(supplier) => supplier,
            None => Arc::new(RefreshingTokenSupplier::new(
                &config.connection,
                oauth.clone(),
                config.store.clone(),
                self.settings.http.token_refresh_skew_secs,
            )),
        };

        tracing::debug!(
            provider = %provider,
            connection_id = %config.connection.id,
            "creating driver"
        );

        Ok(constructor(DriverContext {
            provider: *provider,
            connection: config.connection,
            store: config.store,
            settings,
            http: self.http.clone(),
            tokens,
            oauth,
        }))
    }
}
