//! Token refreshers

use std::fmt;

use async_trait::async_trait;

use crate::{TokenFields, TokenRecord};

#[cfg(feature = "oauth2")]
pub mod oauth2;

#[cfg(feature = "oauth2")]
pub use self::oauth2::OAuth2Refresher;

/// The outcome of exchanging a refresh token
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshResult {
    /// The issuer granted new tokens
    ///
    /// The fields carry the refresh token to keep going forward, which is the
    /// previous one when the issuer does not rotate it.
    Success(TokenFields),
    /// The exchange failed for a reason that may clear up on its own
    ///
    /// The stored record should be left untouched and retried later.
    TransientFailure(String),
    /// The issuer refused the grant; the user must authorize again
    PermanentFailure(String),
}

impl RefreshResult {
    /// A short label for the outcome, suitable for logging
    pub fn outcome(&self) -> &'static str {
        match self {
            RefreshResult::Success(_) => "success",
            RefreshResult::TransientFailure(_) => "transient_failure",
            RefreshResult::PermanentFailure(_) => "permanent_failure",
        }
    }
}

impl fmt::Display for RefreshResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RefreshResult::Success(fields) => {
                write!(f, "refreshed until {}", fields.expires_at)
            }
            RefreshResult::TransientFailure(reason) => write!(f, "transient failure: {reason}"),
            RefreshResult::PermanentFailure(reason) => write!(f, "permanent failure: {reason}"),
        }
    }
}

/// Exchanges a stored refresh token for fresh tokens
///
/// Implementations perform the exchange only; persisting the result is the
/// caller's job, so a failed save after a successful exchange can be told apart
/// from a failed exchange.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Attempts to refresh the tokens held in `record`
    async fn refresh(&self, record: &TokenRecord) -> RefreshResult;
}

#[async_trait]
impl<R: TokenRefresher + ?Sized> TokenRefresher for std::sync::Arc<R> {
    async fn refresh(&self, record: &TokenRecord) -> RefreshResult {
        (**self).refresh(record).await
    }
}
