//! ACL Gateway - CLI Application
//!
//! An authenticating API gateway with:
//! - Bearer-credential verification against a remote key set
//! - Per-service ACL authorization fed by registry snapshots
//! - Identity-parameter enforcement
//! - Round-robin load-balanced proxying
//! - Prometheus metrics

use acl_gateway::{
    audit::AuditLogger,
    auth::TokenVerifier,
    config::GatewayConfig,
    gateway::Gateway,
    health::HealthChecker,
    jsend::{JSend, Status},
    metrics::GatewayMetrics,
    registry::{AclEntry, Registry, UserLevel},
};
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::value::RawValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// ACL Gateway - An authenticating, load-balancing API gateway
#[derive(Parser)]
#[command(name = "acl-gateway")]
#[command(version, about = "An authenticating ACL gateway service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    gateway: Arc<Gateway>,
    metrics: Arc<GatewayMetrics>,
    health: Arc<HealthChecker>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_server(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::Init { output } => generate_sample_config(&output)?,
    }

    Ok(())
}

/// Start the gateway server
async fn start_server(config_path: &str) -> anyhow::Result<()> {
    // Setup logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration
    let config = GatewayConfig::from_file(config_path)?;
    info!("Loaded configuration from {}", config_path);

    // Shared state: the registry and the verifier's key cache are the only
    // concurrently-mutated aggregates.
    let registry = Arc::new(Registry::new());
    let verifier = Arc::new(TokenVerifier::new(config.auth.jwks_url.clone()));
    let audit = Arc::new(if config.audit.enabled {
        AuditLogger::new(config.audit.endpoint.clone(), config.audit.service.clone())
    } else {
        AuditLogger::disabled(config.audit.service.clone())
    });
    let metrics = Arc::new(GatewayMetrics::new());
    let health = Arc::new(HealthChecker::new());

    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        verifier,
        audit,
        metrics.clone(),
        config.gateway.clone(),
        Duration::from_secs(config.server.timeout),
    ));

    let state = AppState {
        registry,
        gateway,
        metrics,
        health,
    };

    // The original response surface set permissive CORS headers on every
    // response; a CORS layer does the same here.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_route = format!("{}/*path", config.gateway.api_prefix);
    let script_route = format!("{}/*path", config.gateway.script_prefix);

    // Build router
    let app = Router::new()
        .route(&config.health.path, get(health_handler))
        .route(&config.metrics.path, get(metrics_handler))
        .route("/configuration", get(configuration_handler))
        .route("/registry/snapshot", post(snapshot_handler))
        .route(&api_route, any(api_handler))
        .route(&script_route, any(script_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    if config.health.enabled {
        info!("Health endpoint enabled at {}", config.health.path);
    }
    if config.metrics.enabled {
        info!("Metrics endpoint enabled at {}", config.metrics.path);
    }

    // Start server
    let addr: SocketAddr = config.server_addr().parse()?;
    info!("Starting gateway server on {}", addr);
    info!("API surface at {}, scripts at {}", api_route, script_route);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Validate configuration file
fn validate_config(config_path: &str) -> anyhow::Result<()> {
    match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid!");
            println!();
            println!("Server: {}:{}", config.server.host, config.server.port);
            println!("API prefix: {}", config.gateway.api_prefix);
            println!("Script prefix: {}", config.gateway.script_prefix);
            println!("Require credential: {}", config.gateway.require_jwt);
            println!("Enforce identity parameters: {}", config.gateway.enforce);
            if !config.gateway.exempt_services.is_empty() {
                println!("Exempt services:");
                for service in &config.gateway.exempt_services {
                    println!("  {}", service);
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &str) -> anyhow::Result<()> {
    let sample_config = r#"# ACL Gateway Configuration

[server]
host = "0.0.0.0"
port = 8080
timeout = 30

[gateway]
api_prefix = "/api"
script_prefix = "/script"
# Reject requests without a valid credential (snapshot config can override)
require_jwt = false
# Rewrite identity-bearing request parameters (snapshot config can override)
enforce = false
# Services reachable without a credential even when require_jwt is on
exempt_services = []

[auth]
# Remote key-set endpoint for credential verification
jwks_url = ""

[audit]
enabled = false
endpoint = "http://logger:8888/set"
service = "acl-gateway"

[metrics]
enabled = true
path = "/metrics"

[health]
enabled = true
path = "/health"
"#;

    std::fs::write(output_path, sample_config)?;
    println!("Sample configuration written to {}", output_path);
    Ok(())
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.health.liveness()))
}

/// Metrics handler
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.prometheus_output())
}

/// Permission-level defaults and the effective ACL table
#[derive(Serialize)]
struct AclInfo {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    user_levels: Vec<UserLevel>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    acl_endpoints: Vec<AclEntry>,
}

/// Configuration handler: the known permission levels plus every service's
/// effective ACL entry (open entries for services without one)
async fn configuration_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (user_levels, acl_endpoints) = state.registry.acl_overview();
    let info = AclInfo {
        user_levels,
        acl_endpoints,
    };

    match serde_json::to_string(&info).and_then(RawValue::from_string) {
        Ok(data) => JSend::ok(data),
        Err(e) => JSend::error(
            format!("unable to serialize ACL overview: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

/// Snapshot ingestion handler: replaces the registry content wholesale.
/// Malformed documents leave the prior state intact.
async fn snapshot_handler(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    match state.registry.apply_snapshot(&body) {
        Ok(()) => JSend {
            status: Status::Success,
            data: None,
            message: Some("snapshot applied".to_string()),
            http_code: StatusCode::OK.as_u16(),
            internal_http_code: None,
        },
        Err(e) => JSend::fail(e.to_string(), StatusCode::BAD_REQUEST),
    }
}

/// Gateway handler - the authenticated, ACL-checked proxy surface
async fn api_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> impl IntoResponse {
    state.gateway.dispatch(client_addr, req).await
}

/// Script handler - the public user-script proxy surface
async fn script_handler(State(state): State<AppState>, req: Request<Body>) -> impl IntoResponse {
    state.gateway.dispatch_script(req).await
}
