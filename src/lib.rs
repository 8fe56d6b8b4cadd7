//! ACL Gateway - an authenticating API gateway
//!
//! This is a gateway service that provides:
//! - Bearer-credential verification with remote-key caching
//! - Per-service ACL authorization fed by registry snapshots
//! - Identity-parameter enforcement against impersonation
//! - Round-robin load-balanced request proxying
//! - Prometheus metrics and health checks

pub mod audit;
pub mod auth;
pub mod config;
pub mod enforce;
pub mod gateway;
pub mod health;
pub mod jsend;
pub mod metrics;
pub mod permission;
pub mod registry;

pub use config::GatewayConfig;
pub use permission::Permission;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
