//! Mail provider drivers.
//!
//! This module contains the [`MailDriver`] trait and one implementation per
//! supported provider:
//!
//! - [`GmailDriver`] - Gmail REST API
//! - [`OutlookDriver`] - Microsoft Graph
//!
//! # Architecture
//!
//! A request handler resolves a [`Connection`](crate::domain::Connection) from
//! its store and asks the [`DriverFactory`] for a driver. Each driver:
//!
//! - obtains access tokens through a [`TokenSupplier`]
//! - translates between its vendor schema and the canonical model
//! - runs every operation through an [`ErrorGuard`], which deletes the
//!   connection when a failure means the credentials are unusable
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailbridge::config::Settings;
//! use mailbridge::providers::{DriverConfig, DriverFactory, ListParams};
//!
//! let factory = DriverFactory::new(Settings::default())?;
//! let driver = factory.create(&connection.provider_id, DriverConfig::new(connection, store))?;
//! let page = driver.list(&ListParams::folder("inbox").with_limit(50)).await?;
//! ```

mod batch;
mod classify;
mod factory;
mod gmail;
mod guard;
mod html;
mod http;
mod oauth;
mod outlook;
mod token;
mod traits;

pub use classify::{classify, ErrorKind};
pub use factory::{DriverConfig, DriverContext, DriverFactory};
pub use gmail::GmailDriver;
pub use guard::{redact, ErrorGuard, REDACTED};
pub use html::{decode_entities, sanitize, text_to_html};
pub use http::ApiClient;
pub use oauth::OAuthClient;
pub use outlook::OutlookDriver;
pub use token::{
    DelegatedTokenSupplier, RefreshingTokenSupplier, SessionTokenSource, StaticTokenSupplier,
    TokenSupplier,
};
pub use traits::{
    strip_thread_prefix, DraftListParams, DriverError, DriverResult, ListParams, MailDriver,
    ProviderError, Result, THREAD_PREFIX,
};
