//! Audit event delivery
//!
//! Records one access event per gateway request with a remote logging
//! service. Delivery is fire-and-forget: it runs as a detached task after
//! the response decision, never blocks or fails the response path, and its
//! own failures are swallowed (logged locally at debug level).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Numeric severity levels understood by the logging service.
pub const LOG_LVL_WARN: i32 = 900;
pub const LOG_LVL_INFO: i32 = 800;
pub const LOG_LVL_FINEST: i32 = 300;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// One access event, covering success and every failure branch.
#[derive(Debug, Clone, Serialize)]
pub struct AccessEvent {
    /// Source address of the caller.
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub original_url: String,
    /// Upstream URL, when the pipeline got far enough to build one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxied_url: Option<String>,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

/// Wire format of the logging service.
#[derive(Debug, Serialize)]
struct LogEntry {
    service: String,
    level: i32,
    info: String,
}

/// Fire-and-forget access-event sink.
pub struct AuditLogger {
    endpoint: Option<String>,
    service: String,
    http: reqwest::Client,
}

impl AuditLogger {
    pub fn new(endpoint: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            service: service.into(),
            http: reqwest::Client::builder()
                .timeout(DELIVERY_TIMEOUT)
                .build()
                .expect("failed to build audit HTTP client"),
        }
    }

    /// A sink that only traces locally, used when delivery is not configured.
    pub fn disabled(service: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service: service.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Record an access event. Returns immediately; delivery happens on a
    /// detached task. Must be called from within a tokio runtime.
    pub fn record(&self, level: i32, event: AccessEvent) {
        debug!(
            ip = %event.ip,
            original_url = %event.original_url,
            outcome = %event.outcome,
            "access event"
        );

        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        let info = match serde_json::to_string(&event) {
            Ok(info) => info,
            Err(e) => {
                debug!("unable to serialize access event: {e}");
                return;
            }
        };
        let entry = LogEntry {
            service: self.service.clone(),
            level,
            info,
        };

        let http = self.http.clone();
        tokio::spawn(async move {
            if let Err(e) = http.post(&endpoint).json(&entry).send().await {
                debug!("audit delivery failed: {e}");
            }
        });
    }
}
