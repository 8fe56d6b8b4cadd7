//! JSend response envelope
//!
//! Every response on the gateway's `/api` surface is wrapped in a JSend-style
//! envelope: an outcome status, an optional payload, an optional
//! human-readable message, and the relayed upstream status code when a proxy
//! call was made.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::value::RawValue;

/// Outcome classification of a gateway response.
///
/// `Fail` is a request-side rejection (bad input, missing credential, no
/// access); `Error` is a gateway or upstream fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Fail,
    Error,
}

/// The response envelope written back to the caller.
#[derive(Debug, Serialize)]
pub struct JSend {
    pub status: Status,
    /// Relayed upstream payload, embedded without re-encoding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Status code of this response, repeated in the body.
    pub http_code: u16,
    /// Status code returned by the upstream service, when one was reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_http_code: Option<u16>,
}

impl JSend {
    /// Successful proxy outcome relaying an upstream payload.
    pub fn success(data: Box<RawValue>, upstream_status: StatusCode) -> Self {
        Self {
            status: Status::Success,
            data: Some(data),
            message: None,
            http_code: StatusCode::OK.as_u16(),
            internal_http_code: Some(upstream_status.as_u16()),
        }
    }

    /// Successful local outcome for endpoints that do not proxy anywhere.
    pub fn ok(data: Box<RawValue>) -> Self {
        Self {
            status: Status::Success,
            data: Some(data),
            message: None,
            http_code: StatusCode::OK.as_u16(),
            internal_http_code: None,
        }
    }

    /// Request rejected before reaching an upstream.
    pub fn fail(message: impl Into<String>, code: StatusCode) -> Self {
        Self {
            status: Status::Fail,
            data: None,
            message: Some(message.into()),
            http_code: code.as_u16(),
            internal_http_code: None,
        }
    }

    /// Gateway or upstream fault.
    pub fn error(message: impl Into<String>, code: StatusCode) -> Self {
        Self {
            status: Status::Error,
            data: None,
            message: Some(message.into()),
            http_code: code.as_u16(),
            internal_http_code: None,
        }
    }

    /// Human-readable outcome for audit events: the failure message, or "ok".
    pub fn outcome(&self) -> String {
        self.message.clone().unwrap_or_else(|| "ok".to_string())
    }
}

/// Wrap an upstream body for the `data` field. Valid JSON is embedded
/// verbatim; anything else is carried as a JSON string so the envelope
/// itself stays well-formed.
pub fn data_from_body(body: &[u8]) -> Box<RawValue> {
    let text = String::from_utf8_lossy(body).into_owned();
    match RawValue::from_string(text.clone()) {
        Ok(raw) => raw,
        Err(_) => {
            let quoted = serde_json::to_string(&text).unwrap_or_else(|_| "null".to_string());
            RawValue::from_string(quoted).expect("quoted string is valid JSON")
        }
    }
}

impl IntoResponse for JSend {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(self.http_code).unwrap_or(StatusCode::OK);
        let body = serde_json::to_string(&self).unwrap_or_else(|_| {
            r#"{"status":"error","message":"unable to serialize response","http_code":500}"#
                .to_string()
        });
        (
            code,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            body,
        )
            .into_response()
    }
}
