//! Engine-level error taxonomy.
//!
//! The pure evaluation paths (eligibility, cooldown) never produce these;
//! they return classified structs. Errors here come from the imperative
//! surface: validation, guarded download requests, and resets.

use crate::authority::{AuthorityError, AuthorityErrorCode};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    /// Malformed or missing product key.
    #[error("invalid product key: {0}")]
    Validation(String),

    #[error("no entitlement found for {product_key}")]
    NoEntitlement { product_key: String },

    #[error("the download window for {product_key} has expired")]
    Expired { product_key: String },

    #[error("all downloads for {product_key} have been used")]
    LimitReached { product_key: String },

    #[error("cooldown active, retry in {seconds_left}s")]
    CooldownActive { seconds_left: u32 },

    /// A grant request for the key is still in flight; the duplicate
    /// trigger is dropped rather than queued.
    #[error("a download request for {product_key} is already in flight")]
    GrantInFlight { product_key: String },

    /// Network failure, timeout, or unclassified remote failure.
    #[error("download authority unavailable: {0}")]
    AuthorityUnavailable(AuthorityError),

    /// The authority understood the request and refused it.
    #[error("download authority refused: {0}")]
    AuthorityDenied(AuthorityError),

    #[error("reset completed locally but {failed} of {attempted} remote deletes failed")]
    PartialReset { failed: usize, attempted: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AuthorityError> for TollgateError {
    fn from(err: AuthorityError) -> Self {
        match err.code {
            AuthorityErrorCode::Unavailable | AuthorityErrorCode::Unknown => {
                TollgateError::AuthorityUnavailable(err)
            }
            _ => TollgateError::AuthorityDenied(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_failures_split_by_code() {
        let unavailable: TollgateError = AuthorityError::unavailable("connection refused").into();
        assert!(matches!(
            unavailable,
            TollgateError::AuthorityUnavailable(_)
        ));

        let unknown: TollgateError =
            AuthorityError::new(AuthorityErrorCode::Unknown, "???").into();
        assert!(matches!(unknown, TollgateError::AuthorityUnavailable(_)));

        let denied: TollgateError =
            AuthorityError::new(AuthorityErrorCode::PermissionDenied, "no purchase").into();
        assert!(matches!(denied, TollgateError::AuthorityDenied(_)));
    }

    #[test]
    fn test_messages_carry_actionable_detail() {
        let err = TollgateError::CooldownActive { seconds_left: 20 };
        assert!(err.to_string().contains("20s"));

        let err = TollgateError::PartialReset {
            failed: 1,
            attempted: 3,
        };
        assert!(err.to_string().contains("1 of 3"));
    }
}
