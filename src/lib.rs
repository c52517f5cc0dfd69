//! mailbridge - Provider-agnostic mail driver layer
//!
//! This crate presents one canonical mail API over Gmail REST and Microsoft
//! Graph, including token refresh, error classification and invalidation of
//! connections whose credentials stop working.

pub mod config;
pub mod domain;
pub mod providers;
pub mod storage;

pub use providers::{DriverConfig, DriverFactory, MailDriver};
