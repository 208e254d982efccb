//! Boundary to the remote download authority.
//!
//! Two seams live here: [`DownloadAuthority`], which grants signed
//! downloads and reports the true remaining count, and
//! [`RemoteEntitlements`], the authoritative purchase store an admin reset
//! deletes from. The HTTP client implements both against one backend;
//! tests and the demo mode use the scripted implementation.
//!
//! Contract the engine depends on: a failed or timed-out call performs no
//! local mutation anywhere, and failures carry a classified code rather
//! than free text.

mod http;
mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpAuthority;
pub use scripted::ScriptedAuthority;

/// Failure classification reported by the authority, mirroring its wire
/// codes (`unauthenticated`, `permission-denied`, ...). `Unavailable`
/// additionally covers local network failures and timeouts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorityErrorCode {
    Unauthenticated,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    NotFound,
    Unavailable,
    Unknown,
}

impl AuthorityErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorityErrorCode::Unauthenticated => "unauthenticated",
            AuthorityErrorCode::PermissionDenied => "permission-denied",
            AuthorityErrorCode::ResourceExhausted => "resource-exhausted",
            AuthorityErrorCode::FailedPrecondition => "failed-precondition",
            AuthorityErrorCode::NotFound => "not-found",
            AuthorityErrorCode::Unavailable => "unavailable",
            AuthorityErrorCode::Unknown => "unknown",
        }
    }

    /// Parse a wire code; anything unrecognized is `Unknown`.
    pub fn parse(code: &str) -> Self {
        match code {
            "unauthenticated" => AuthorityErrorCode::Unauthenticated,
            "permission-denied" => AuthorityErrorCode::PermissionDenied,
            "resource-exhausted" => AuthorityErrorCode::ResourceExhausted,
            "failed-precondition" => AuthorityErrorCode::FailedPrecondition,
            "not-found" => AuthorityErrorCode::NotFound,
            "unavailable" => AuthorityErrorCode::Unavailable,
            _ => AuthorityErrorCode::Unknown,
        }
    }
}

impl std::fmt::Display for AuthorityErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified authority failure.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct AuthorityError {
    pub code: AuthorityErrorCode,
    pub message: String,
}

impl AuthorityError {
    pub fn new(code: AuthorityErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(AuthorityErrorCode::Unavailable, message)
    }

    /// Network-level failure (unreachable, timed out) as opposed to an
    /// authoritative refusal.
    pub fn is_unavailable(&self) -> bool {
        self.code == AuthorityErrorCode::Unavailable
    }
}

/// A signed download grant as returned by the authority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadGrant {
    pub download_url: String,
    pub file_name: String,
    /// Downloads left after this one, as counted by the server. This is
    /// the authoritative number the local record reconciles against.
    pub remaining_downloads: u32,
    /// Seconds the signed URL stays valid.
    pub expires_in: u64,
}

/// Remote service that authorizes and signs downloads.
#[async_trait]
pub trait DownloadAuthority: Send + Sync {
    async fn request_grant(&self, product_key: &str) -> Result<DownloadGrant, AuthorityError>;
}

/// Authoritative purchase store an admin reset deletes from, one call per
/// alias key.
#[async_trait]
pub trait RemoteEntitlements: Send + Sync {
    async fn delete_entitlement(&self, product_key: &str) -> Result<(), AuthorityError>;
}

/// Remote store that drops every delete. Used when no endpoint is
/// configured or the caller asked to skip the remote side.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRemote;

#[async_trait]
impl RemoteEntitlements for NullRemote {
    async fn delete_entitlement(&self, _product_key: &str) -> Result<(), AuthorityError> {
        Ok(())
    }
}

/// Run a grant request under a caller-supplied deadline. A timeout is
/// indistinguishable from a network failure to the caller and, like every
/// failure, mutates nothing.
pub async fn request_grant_with_timeout(
    authority: &dyn DownloadAuthority,
    product_key: &str,
    deadline: Duration,
) -> Result<DownloadGrant, AuthorityError> {
    match tokio::time::timeout(deadline, authority.request_grant(product_key)).await {
        Ok(result) => result,
        Err(_) => Err(AuthorityError::unavailable(format!(
            "grant request timed out after {}ms",
            deadline.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_roundtrip_wire_names() {
        let codes = [
            AuthorityErrorCode::Unauthenticated,
            AuthorityErrorCode::PermissionDenied,
            AuthorityErrorCode::ResourceExhausted,
            AuthorityErrorCode::FailedPrecondition,
            AuthorityErrorCode::NotFound,
            AuthorityErrorCode::Unavailable,
            AuthorityErrorCode::Unknown,
        ];
        for code in codes {
            assert_eq!(AuthorityErrorCode::parse(code.as_str()), code);
        }
        assert_eq!(
            AuthorityErrorCode::parse("something-new"),
            AuthorityErrorCode::Unknown
        );
    }

    #[test]
    fn test_error_display_leads_with_code() {
        let err = AuthorityError::new(AuthorityErrorCode::PermissionDenied, "no purchase on file");
        assert_eq!(err.to_string(), "permission-denied: no purchase on file");
    }

    #[test]
    fn test_grant_wire_shape() {
        let json = r#"{
            "downloadUrl": "https://cdn.example.com/signed/abc",
            "fileName": "bundle.zip",
            "remainingDownloads": 2,
            "expiresIn": 300
        }"#;
        let grant: DownloadGrant = serde_json::from_str(json).unwrap();
        assert_eq!(grant.file_name, "bundle.zip");
        assert_eq!(grant.remaining_downloads, 2);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_unavailable() {
        let authority = ScriptedAuthority::new();
        authority.set_delay(Duration::from_millis(200)).await;
        authority
            .push_grant(DownloadGrant {
                download_url: "u".into(),
                file_name: "f".into(),
                remaining_downloads: 2,
                expires_in: 60,
            })
            .await;

        let err = request_grant_with_timeout(&authority, "bundle", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
