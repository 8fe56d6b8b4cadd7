//! Configuration module for the gateway service
//!
//! This module handles loading and parsing configuration from TOML files.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
        }
    }
}

/// Dispatch policy and routing surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Path prefix for the authenticated service surface
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Path prefix for the public user-script surface
    #[serde(default = "default_script_prefix")]
    pub script_prefix: String,
    /// Reject requests without a valid credential (unless the target service
    /// is exempt). A `require_jwt` entry in the registry snapshot overrides
    /// this default.
    #[serde(default)]
    pub require_jwt: bool,
    /// Rewrite identity-bearing request parameters. An `enforce` entry in the
    /// registry snapshot overrides this default.
    #[serde(default)]
    pub enforce: bool,
    /// Services reachable without a credential even when `require_jwt` is on
    #[serde(default)]
    pub exempt_services: HashSet<String>,
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_script_prefix() -> String {
    "/script".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            api_prefix: default_api_prefix(),
            script_prefix: default_script_prefix(),
            require_jwt: false,
            enforce: false,
            exempt_services: HashSet::new(),
        }
    }
}

/// Credential verification configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Remote key-set endpoint used to resolve signing keys by key id
    #[serde(default)]
    pub jwks_url: String,
}

/// Audit event delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether access events are delivered to the remote logging service
    #[serde(default)]
    pub enabled: bool,
    /// Endpoint of the logging service
    #[serde(default)]
    pub endpoint: String,
    /// Service identifier reported in each event
    #[serde(default = "default_audit_service")]
    pub service: String,
}

fn default_audit_service() -> String {
    "acl-gateway".to_string()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            service: default_audit_service(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path to expose metrics
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_enabled() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether health check is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path for health check endpoint
    #[serde(default = "default_health_path")]
    pub path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_health_path(),
        }
    }
}

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Dispatch policy configuration
    #[serde(default)]
    pub gateway: DispatchConfig,
    /// Credential verification configuration
    #[serde(default)]
    pub auth: AuthConfig,
    /// Audit event delivery configuration
    #[serde(default)]
    pub audit: AuditConfig,
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Health check configuration
    #[serde(default)]
    pub health: HealthConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.gateway.api_prefix.starts_with('/') {
            anyhow::bail!(
                "gateway.api_prefix '{}' must start with '/'",
                self.gateway.api_prefix
            );
        }
        if !self.gateway.script_prefix.starts_with('/') {
            anyhow::bail!(
                "gateway.script_prefix '{}' must start with '/'",
                self.gateway.script_prefix
            );
        }
        if self.gateway.api_prefix == self.gateway.script_prefix {
            anyhow::bail!("gateway.api_prefix and gateway.script_prefix must differ");
        }

        // A credential requirement cannot be met without a key source.
        if self.gateway.require_jwt && self.auth.jwks_url.is_empty() {
            anyhow::bail!("gateway.require_jwt is enabled but auth.jwks_url is not configured");
        }

        if self.audit.enabled && self.audit.endpoint.is_empty() {
            anyhow::bail!("audit delivery is enabled but audit.endpoint is not configured");
        }

        if self.server.timeout == 0 {
            anyhow::bail!("server.timeout must be at least 1 second");
        }

        Ok(())
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
