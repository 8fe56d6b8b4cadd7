//! Gateway dispatcher
//!
//! Drives each inbound request through the authorization-and-dispatch
//! pipeline: resolve service → authenticate → authorize → enforce → select
//! backend → proxy → respond, with an access event recorded after the
//! response decision regardless of outcome.
//!
//! A second, simpler path serves the user-script table: scripts are public
//! once registered, so it skips the authentication, authorization and
//! enforcement stages and relays the upstream response verbatim.

use crate::audit::{AccessEvent, AuditLogger, LOG_LVL_INFO, LOG_LVL_WARN};
use crate::auth::{bearer_token, AuthError, Identity, TokenVerifier};
use crate::config::DispatchConfig;
use crate::enforce::{enforce_json_body, enforce_query, EnforceError};
use crate::jsend::{data_from_body, JSend, Status};
use crate::metrics::GatewayMetrics;
use crate::registry::Registry;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Terminal per-request failures. None of these are fatal to the process.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),
    #[error("service was not found or does not exist as an endpoint yet")]
    ServiceNotFound,
    #[error("missing credential. Supported fields: 'Authorization: Bearer <jwt>', 'jwt: <jwt>'")]
    AuthenticationRequired,
    #[error(transparent)]
    Credential(#[from] AuthError),
    #[error("you do not have access to this service")]
    AccessDenied,
    #[error(transparent)]
    Enforcement(#[from] EnforceError),
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("upstream request timed out")]
    UpstreamTimeout,
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) | GatewayError::Enforcement(_) => StatusCode::BAD_REQUEST,
            GatewayError::ServiceNotFound => StatusCode::NOT_FOUND,
            GatewayError::AuthenticationRequired | GatewayError::Credential(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::AccessDenied => StatusCode::FORBIDDEN,
            GatewayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn to_jsend(&self) -> JSend {
        match self {
            GatewayError::UpstreamUnreachable(_)
            | GatewayError::UpstreamTimeout
            | GatewayError::Internal(_) => JSend::error(self.to_string(), self.status()),
            _ => JSend::fail(self.to_string(), self.status()),
        }
    }
}

/// Extract the service name from the path remainder after the routing
/// prefix: the first segment before '/' or '?'.
fn service_name(suffix: &str) -> Result<&str, GatewayError> {
    let trimmed = suffix.strip_prefix('/').unwrap_or(suffix);
    let end = trimmed.find(['/', '?']).unwrap_or(trimmed.len());
    let service = &trimmed[..end];
    if service.is_empty() {
        return Err(GatewayError::BadRequest(
            "unable to get service name from your request: missing service name".to_string(),
        ));
    }

    Ok(service)
}

/// Path remainder after the leading service-name segment.
fn path_after_segment<'a>(suffix: &'a str, segment: &str) -> &'a str {
    let skip = if suffix.starts_with('/') {
        1 + segment.len()
    } else {
        segment.len()
    };
    suffix.get(skip..).unwrap_or("")
}

/// Rebuild the outbound URL from the selected backend address, the path
/// remainder after the service segment, and the (possibly rewritten) query.
fn outbound_url(address: &str, rest: &str, query: &str) -> String {
    let mut url = format!("http://{address}{rest}");
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Hop-by-hop headers never forwarded between the caller and the upstream.
///
/// Host is included because the proxy sets it from the selected backend
/// address instead of forwarding the caller's value.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

/// Headers the gateway owns on the outbound request: Accept is pinned to
/// JSON, Accept-Encoding is stripped so the upstream does not compress a
/// body the gateway must re-wrap, and Content-Length is recomputed for
/// rewritten bodies.
fn is_gateway_managed_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "accept" | "accept-encoding" | "content-length"
    )
}

/// Per-request pipeline orchestrator over the shared registry and verifier.
pub struct Gateway {
    registry: Arc<Registry>,
    verifier: Arc<TokenVerifier>,
    audit: Arc<AuditLogger>,
    metrics: Arc<GatewayMetrics>,
    policy: DispatchConfig,
    client: Client<HttpConnector, ProxyBody>,
    upstream_timeout: Duration,
}

impl Gateway {
    pub fn new(
        registry: Arc<Registry>,
        verifier: Arc<TokenVerifier>,
        audit: Arc<AuditLogger>,
        metrics: Arc<GatewayMetrics>,
        policy: DispatchConfig,
        upstream_timeout: Duration,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();

        Self {
            registry,
            verifier,
            audit,
            metrics,
            policy,
            client,
            upstream_timeout,
        }
    }

    /// Effective policy toggle: a registry snapshot entry overrides the
    /// static default from the configuration file.
    fn policy_enabled(&self, key: &str, default: bool) -> bool {
        match self.registry.lookup_config(key) {
            Some(value) => value == "true",
            None => default,
        }
    }

    /// Handle one request on the authenticated `/api` surface.
    ///
    /// The response is always a JSend envelope; an access event is recorded
    /// after the response decision for success and every failure branch.
    pub async fn dispatch(&self, client_addr: SocketAddr, req: Request<Body>) -> Response {
        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let original_url = req.uri().to_string();

        let mut identity = Identity::anonymous();
        let mut proxied_url = None;

        let (envelope, upstream_headers) = match self
            .run_pipeline(req, &mut identity, &mut proxied_url)
            .await
        {
            Ok((envelope, headers)) => (envelope, Some(headers)),
            Err(e) => {
                warn!(%path, "request rejected: {e}");
                (e.to_jsend(), None)
            }
        };

        self.metrics
            .record_request(&method, &path, envelope.http_code, start.elapsed());

        let level = if envelope.status == Status::Success {
            LOG_LVL_INFO
        } else {
            LOG_LVL_WARN
        };
        self.audit.record(
            level,
            AccessEvent {
                ip: client_addr.to_string(),
                user_id: (!identity.id.is_empty()).then(|| identity.id.clone()),
                original_url,
                proxied_url,
                outcome: envelope.outcome(),
                at: Utc::now(),
            },
        );

        let mut response = envelope.into_response();
        if let Some(headers) = upstream_headers {
            relay_headers(&headers, response.headers_mut());
        }
        response
    }

    async fn run_pipeline(
        &self,
        req: Request<Body>,
        identity: &mut Identity,
        proxied_url: &mut Option<String>,
    ) -> Result<(JSend, HeaderMap), GatewayError> {
        let (parts, body) = req.into_parts();

        // ResolveService
        let path = parts.uri.path();
        let suffix = path.strip_prefix(self.policy.api_prefix.as_str()).unwrap_or(path);
        let service = service_name(suffix)?.to_string();
        let entry = self
            .registry
            .lookup(&service)
            .ok_or(GatewayError::ServiceNotFound)?;

        // Authenticate. With the requirement policy off, a missing or failing
        // credential degrades to the anonymous identity instead of blocking.
        let required = self.policy_enabled("require_jwt", self.policy.require_jwt)
            && !self.policy.exempt_services.contains(&service);
        *identity = match bearer_token(&parts.headers) {
            Some(raw) => match self.verifier.authenticate(raw).await {
                Ok(identity) => identity,
                Err(e) if required => return Err(e.into()),
                Err(_) => Identity::anonymous(),
            },
            None if required => return Err(GatewayError::AuthenticationRequired),
            None => Identity::anonymous(),
        };

        // Authorize. No ACL entry for the service means open access.
        if let Some(acl) = self.registry.acl_for(&service) {
            if !acl.allows(identity) {
                return Err(GatewayError::AccessDenied);
            }
        }

        // Enforce
        let mut body_bytes = read_body(body).await?;
        let mut query = parts.uri.query().unwrap_or_default().to_string();
        if self.policy_enabled("enforce", self.policy.enforce) {
            query = enforce_query(&query, identity);
            if !body_bytes.is_empty() {
                if let Some(rewritten) = enforce_json_body(&body_bytes, identity)? {
                    body_bytes = Bytes::from(rewritten);
                }
            }
        }

        // SelectBackend
        let address = entry.select_address().to_string();
        let rest = path_after_segment(suffix, &service);
        let target = outbound_url(&address, rest, &query);
        *proxied_url = Some(target.clone());

        // Proxy
        let uri: Uri = target
            .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid upstream url: {e}")))?;

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (key, value) in parts.headers.iter() {
                if !is_hop_by_hop_header(key.as_str()) && !is_gateway_managed_header(key.as_str())
                {
                    headers.insert(key.clone(), value.clone());
                }
            }
            if let Ok(host) = address.parse::<HeaderValue>() {
                headers.insert(header::HOST, host);
            }
            headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        }

        let outbound = builder
            .body(full_body(body_bytes))
            .map_err(|e| GatewayError::Internal(format!("failed to build upstream request: {e}")))?;

        let response = tokio::time::timeout(self.upstream_timeout, self.client.request(outbound))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout)?
            .map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;

        let upstream_status = response.status();
        let (response_parts, response_body) = response.into_parts();
        let payload = response_body
            .collect()
            .await
            .map_err(|e| GatewayError::UpstreamUnreachable(format!("reading response: {e}")))?
            .to_bytes();

        Ok((
            JSend::success(data_from_body(&payload), upstream_status),
            response_parts.headers,
        ))
    }

    /// Handle one request on the public user-script surface.
    ///
    /// No authentication, authorization or enforcement; the inbound body is
    /// buffered so the outbound copy is byte-identical, and the upstream
    /// status, headers and body are relayed verbatim.
    pub async fn dispatch_script(&self, req: Request<Body>) -> Response {
        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let response = match self.run_script(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%path, "script request rejected: {e}");
                (e.status(), e.to_string()).into_response()
            }
        };

        self.metrics
            .record_request(&method, &path, response.status().as_u16(), start.elapsed());
        response
    }

    async fn run_script(&self, req: Request<Body>) -> Result<Response, GatewayError> {
        let (parts, body) = req.into_parts();

        let path = parts.uri.path();
        let suffix = path
            .strip_prefix(self.policy.script_prefix.as_str())
            .unwrap_or(path);
        let name = service_name(suffix)?.to_string();
        let entry = self
            .registry
            .user_script(&name)
            .ok_or(GatewayError::ServiceNotFound)?;

        let address = entry.select_address().to_string();
        let rest = path_after_segment(suffix, &name);
        let target = outbound_url(&address, rest, parts.uri.query().unwrap_or_default());
        let uri: Uri = target
            .parse()
            .map_err(|e| GatewayError::BadRequest(format!("invalid upstream url: {e}")))?;

        let body_bytes = read_body(body).await?;

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (key, value) in parts.headers.iter() {
                if !is_hop_by_hop_header(key.as_str()) {
                    headers.insert(key.clone(), value.clone());
                }
            }
            if let Ok(host) = address.parse::<HeaderValue>() {
                headers.insert(header::HOST, host);
            }
        }

        let outbound = builder
            .body(full_body(body_bytes))
            .map_err(|e| GatewayError::Internal(format!("failed to build upstream request: {e}")))?;

        let response = tokio::time::timeout(self.upstream_timeout, self.client.request(outbound))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout)?
            .map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;

        let (response_parts, response_body) = response.into_parts();
        let payload = response_body
            .collect()
            .await
            .map_err(|e| GatewayError::UpstreamUnreachable(format!("reading response: {e}")))?
            .to_bytes();

        let mut relayed = Response::builder().status(response_parts.status);
        if let Some(headers) = relayed.headers_mut() {
            for (key, value) in response_parts.headers.iter() {
                if !is_hop_by_hop_header(key.as_str()) {
                    headers.insert(key.clone(), value.clone());
                }
            }
        }
        relayed
            .body(Body::from(payload))
            .map_err(|e| GatewayError::Internal(format!("failed to build response: {e}")))
    }
}

async fn read_body(body: Body) -> Result<Bytes, GatewayError> {
    axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("failed to read request body: {e}")))
}

fn full_body(bytes: Bytes) -> ProxyBody {
    http_body_util::Full::new(bytes).map_err(|e| match e {}).boxed()
}

/// Copy upstream response headers onto the envelope response, keeping the
/// envelope's own content metadata.
fn relay_headers(upstream: &HeaderMap, response: &mut HeaderMap) {
    for (key, value) in upstream.iter() {
        let name = key.as_str().to_lowercase();
        if is_hop_by_hop_header(&name)
            || matches!(name.as_str(), "content-type" | "content-length" | "content-encoding")
        {
            continue;
        }
        response.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_extraction() {
        assert_eq!(service_name("/test").unwrap(), "test");
        assert_eq!(service_name("/test-api").unwrap(), "test-api");
        assert_eq!(service_name("/test-api/param1/param2").unwrap(), "test-api");
        assert_eq!(service_name("/test-api?p=true").unwrap(), "test-api");
        assert_eq!(service_name("/test-api?p=true/p2").unwrap(), "test-api");
    }

    #[test]
    fn test_service_name_missing() {
        assert!(service_name("/").is_err());
        assert!(service_name("").is_err());
        assert!(service_name("/?p=true").is_err());
    }

    #[test]
    fn test_path_after_segment() {
        assert_eq!(path_after_segment("/billing/invoices/1", "billing"), "/invoices/1");
        assert_eq!(path_after_segment("/billing", "billing"), "");
        assert_eq!(path_after_segment("/billing/", "billing"), "/");
    }

    #[test]
    fn test_outbound_url() {
        assert_eq!(
            outbound_url("10.0.0.1:80", "/invoices/1", "x=1"),
            "http://10.0.0.1:80/invoices/1?x=1"
        );
        assert_eq!(outbound_url("10.0.0.1:80", "", ""), "http://10.0.0.1:80");
        assert_eq!(
            outbound_url("10.0.0.1:80", "/", ""),
            "http://10.0.0.1:80/"
        );
    }

    #[test]
    fn test_hop_by_hop_headers_include_host() {
        assert!(is_hop_by_hop_header("host"));
        assert!(is_hop_by_hop_header("Host"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
    }

    #[test]
    fn test_gateway_managed_headers() {
        assert!(is_gateway_managed_header("Accept-Encoding"));
        assert!(is_gateway_managed_header("content-length"));
        assert!(!is_gateway_managed_header("x-request-id"));
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                GatewayError::BadRequest("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (GatewayError::ServiceNotFound, StatusCode::NOT_FOUND),
            (
                GatewayError::AuthenticationRequired,
                StatusCode::UNAUTHORIZED,
            ),
            (
                GatewayError::Credential(AuthError::InvalidCredential("x".into())),
                StatusCode::UNAUTHORIZED,
            ),
            (GatewayError::AccessDenied, StatusCode::FORBIDDEN),
            (
                GatewayError::UpstreamUnreachable("x".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (GatewayError::UpstreamTimeout, StatusCode::GATEWAY_TIMEOUT),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status(), expected, "{err}");
        }
    }

    #[test]
    fn test_failure_envelopes_classify_fault_side() {
        // Request-side rejections are "fail", gateway/upstream faults "error".
        let rejected = GatewayError::AccessDenied.to_jsend();
        assert_eq!(rejected.status, Status::Fail);

        let fault = GatewayError::UpstreamTimeout.to_jsend();
        assert_eq!(fault.status, Status::Error);
    }

    #[test]
    fn test_relay_headers_keeps_envelope_content_metadata() {
        let mut upstream = HeaderMap::new();
        upstream.insert("x-request-id", HeaderValue::from_static("abc"));
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        upstream.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let mut response = HeaderMap::new();
        response.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        relay_headers(&upstream, &mut response);

        assert_eq!(response.get("x-request-id").unwrap(), "abc");
        assert_eq!(
            response.get(header::CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
        assert!(response.get(header::CONTENT_LENGTH).is_none());
        assert!(response.get(header::TRANSFER_ENCODING).is_none());
    }
}
