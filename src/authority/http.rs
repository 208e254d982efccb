//! HTTP client for the download authority.
//!
//! The backend speaks JSON over two endpoints: `POST /grants` to request a
//! signed download and `POST /entitlements/delete` for admin resets. Both
//! report failures as `{ "code": "...", "message": "..." }`; responses
//! without a code are classified by HTTP status.
//!
//! The client is blocking (ureq) and runs on the blocking pool; the async
//! wrappers are what the engine sees.

use std::time::Duration;

use async_trait::async_trait;

use super::{
    AuthorityError, AuthorityErrorCode, DownloadAuthority, DownloadGrant, RemoteEntitlements,
};

const USER_AGENT: &str = concat!("tollgate/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpAuthority {
    endpoint: String,
    timeout: Duration,
}

impl HttpAuthority {
    /// Client for the authority at `endpoint`. The timeout bounds each
    /// HTTP call; callers typically wrap requests in their own deadline
    /// as well, which this keeps the blocking pool honest about.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DownloadAuthority for HttpAuthority {
    async fn request_grant(&self, product_key: &str) -> Result<DownloadGrant, AuthorityError> {
        let endpoint = self.endpoint.clone();
        let timeout = self.timeout;
        let key = product_key.to_string();
        tokio::task::spawn_blocking(move || grant_request(&endpoint, timeout, &key))
            .await
            .map_err(|err| {
                AuthorityError::new(
                    AuthorityErrorCode::Unknown,
                    format!("grant task aborted: {err}"),
                )
            })?
    }
}

#[async_trait]
impl RemoteEntitlements for HttpAuthority {
    async fn delete_entitlement(&self, product_key: &str) -> Result<(), AuthorityError> {
        let endpoint = self.endpoint.clone();
        let timeout = self.timeout;
        let key = product_key.to_string();
        tokio::task::spawn_blocking(move || delete_request(&endpoint, timeout, &key))
            .await
            .map_err(|err| {
                AuthorityError::new(
                    AuthorityErrorCode::Unknown,
                    format!("delete task aborted: {err}"),
                )
            })?
    }
}

fn grant_request(
    endpoint: &str,
    timeout: Duration,
    product_key: &str,
) -> Result<DownloadGrant, AuthorityError> {
    let url = format!("{}/grants", endpoint.trim_end_matches('/'));
    let response = ureq::post(&url)
        .timeout(timeout)
        .set("User-Agent", USER_AGENT)
        .send_json(serde_json::json!({ "productKey": product_key }));

    match response {
        Ok(resp) => {
            let body: serde_json::Value = resp.into_json().map_err(|err| {
                AuthorityError::new(
                    AuthorityErrorCode::Unknown,
                    format!("malformed grant response: {err}"),
                )
            })?;
            parse_grant(&body)
        }
        Err(ureq::Error::Status(status, resp)) => {
            let body: serde_json::Value = resp.into_json().unwrap_or(serde_json::Value::Null);
            Err(error_from_response(status, &body))
        }
        Err(ureq::Error::Transport(transport)) => {
            Err(AuthorityError::unavailable(transport.to_string()))
        }
    }
}

fn delete_request(
    endpoint: &str,
    timeout: Duration,
    product_key: &str,
) -> Result<(), AuthorityError> {
    let url = format!("{}/entitlements/delete", endpoint.trim_end_matches('/'));
    let response = ureq::post(&url)
        .timeout(timeout)
        .set("User-Agent", USER_AGENT)
        .send_json(serde_json::json!({ "productKey": product_key }));

    match response {
        Ok(_) => Ok(()),
        Err(ureq::Error::Status(status, resp)) => {
            let body: serde_json::Value = resp.into_json().unwrap_or(serde_json::Value::Null);
            Err(error_from_response(status, &body))
        }
        Err(ureq::Error::Transport(transport)) => {
            Err(AuthorityError::unavailable(transport.to_string()))
        }
    }
}

/// A 200 response still carries `success: false` when the authority
/// refuses inside an otherwise-healthy function call.
fn parse_grant(body: &serde_json::Value) -> Result<DownloadGrant, AuthorityError> {
    if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
        return Err(error_from_body(body, AuthorityErrorCode::Unknown));
    }
    serde_json::from_value(body.clone()).map_err(|err| {
        AuthorityError::new(
            AuthorityErrorCode::Unknown,
            format!("malformed grant response: {err}"),
        )
    })
}

fn error_from_body(body: &serde_json::Value, fallback: AuthorityErrorCode) -> AuthorityError {
    let code = body
        .get("code")
        .and_then(|v| v.as_str())
        .map(AuthorityErrorCode::parse)
        .unwrap_or(fallback);
    let message = body
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("authority refused the request")
        .to_string();
    AuthorityError::new(code, message)
}

fn error_from_response(status: u16, body: &serde_json::Value) -> AuthorityError {
    if body.get("code").and_then(|v| v.as_str()).is_some() {
        return error_from_body(body, code_for_status(status));
    }
    AuthorityError::new(
        code_for_status(status),
        body.get("message")
            .and_then(|v| v.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| format!("authority returned HTTP {status}")),
    )
}

fn code_for_status(status: u16) -> AuthorityErrorCode {
    match status {
        401 => AuthorityErrorCode::Unauthenticated,
        403 => AuthorityErrorCode::PermissionDenied,
        404 => AuthorityErrorCode::NotFound,
        412 => AuthorityErrorCode::FailedPrecondition,
        429 => AuthorityErrorCode::ResourceExhausted,
        500..=599 => AuthorityErrorCode::Unavailable,
        _ => AuthorityErrorCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(code_for_status(401), AuthorityErrorCode::Unauthenticated);
        assert_eq!(code_for_status(403), AuthorityErrorCode::PermissionDenied);
        assert_eq!(code_for_status(404), AuthorityErrorCode::NotFound);
        assert_eq!(code_for_status(412), AuthorityErrorCode::FailedPrecondition);
        assert_eq!(code_for_status(429), AuthorityErrorCode::ResourceExhausted);
        assert_eq!(code_for_status(500), AuthorityErrorCode::Unavailable);
        assert_eq!(code_for_status(503), AuthorityErrorCode::Unavailable);
        assert_eq!(code_for_status(418), AuthorityErrorCode::Unknown);
    }

    #[test]
    fn test_error_body_code_wins_over_status() {
        let body = serde_json::json!({
            "code": "resource-exhausted",
            "message": "limit reached"
        });
        let err = error_from_response(403, &body);
        assert_eq!(err.code, AuthorityErrorCode::ResourceExhausted);
        assert_eq!(err.message, "limit reached");
    }

    #[test]
    fn test_bodyless_error_falls_back_to_status() {
        let err = error_from_response(503, &serde_json::Value::Null);
        assert_eq!(err.code, AuthorityErrorCode::Unavailable);
        assert!(err.message.contains("503"));
    }

    #[test]
    fn test_parse_grant_success() {
        let body = serde_json::json!({
            "success": true,
            "downloadUrl": "https://cdn.example.com/x",
            "fileName": "x.zip",
            "remainingDownloads": 1,
            "expiresIn": 300
        });
        let grant = parse_grant(&body).unwrap();
        assert_eq!(grant.remaining_downloads, 1);
    }

    #[test]
    fn test_parse_grant_soft_failure() {
        let body = serde_json::json!({
            "success": false,
            "code": "failed-precondition",
            "message": "window expired"
        });
        let err = parse_grant(&body).unwrap_err();
        assert_eq!(err.code, AuthorityErrorCode::FailedPrecondition);
    }

    #[test]
    fn test_parse_grant_malformed() {
        let body = serde_json::json!({ "success": true, "downloadUrl": 7 });
        let err = parse_grant(&body).unwrap_err();
        assert_eq!(err.code, AuthorityErrorCode::Unknown);
    }
}
