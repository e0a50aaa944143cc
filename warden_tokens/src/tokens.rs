use std::fmt;

use serde::{Deserialize, Serialize};
use warden_clock::{Clock, DurationSecs, System, UnixTime};

use super::{AccessToken, AccessTokenRef, Provider, ProviderRef, RefreshToken, RefreshTokenRef};

/// The default presentation scheme for access tokens
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// The identifier of the user that authorized a connection
///
/// Owned by the identity layer; referenced here by value only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The caller-supplied contents of a token record
///
/// This is everything that a save replaces; the key and audit timestamps are
/// owned by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFields {
    /// The short-lived access token
    pub access_token: AccessToken,
    /// The long-lived refresh token, if the issuer granted one
    pub refresh_token: Option<RefreshToken>,
    /// The presentation scheme for the access token
    pub token_type: String,
    /// The instant after which the access token must not be presented
    pub expires_at: UnixTime,
    /// Space-delimited granted scopes, advisory only
    pub scope: Option<String>,
}

impl TokenFields {
    /// Constructs bearer token fields
    pub fn bearer(
        access_token: AccessToken,
        refresh_token: Option<RefreshToken>,
        expires_at: UnixTime,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type: DEFAULT_TOKEN_TYPE.to_owned(),
            expires_at,
            scope: None,
        }
    }

    /// Sets the granted scopes
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// A stored token for one (user, provider) connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    user_id: UserId,
    provider: Provider,
    #[serde(flatten)]
    fields: TokenFields,
    created_at: UnixTime,
    updated_at: UnixTime,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and will remain so for longer than the skew margin
    Valid,
    /// The token is still valid, but will expire within the skew margin
    ExpiringSoon,
    /// The token is no longer valid
    Expired,
}

impl TokenStatus {
    /// Whether a token with this status should be refreshed
    #[inline]
    pub fn needs_refresh(self) -> bool {
        !matches!(self, TokenStatus::Valid)
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            TokenStatus::Valid => "valid",
            TokenStatus::ExpiringSoon => "expiring_soon",
            TokenStatus::Expired => "expired",
        })
    }
}

/// Classifies a token record as of `now`
///
/// A record is expired once `now` reaches `expires_at`, and expiring soon when
/// no more than `skew_margin` remains until then.
pub fn classify(record: &TokenRecord, now: UnixTime, skew_margin: DurationSecs) -> TokenStatus {
    let expires_at = record.expires_at();
    if now >= expires_at {
        TokenStatus::Expired
    } else if expires_at - now <= skew_margin {
        TokenStatus::ExpiringSoon
    } else {
        TokenStatus::Valid
    }
}

impl TokenRecord {
    pub(crate) fn new(
        user_id: UserId,
        provider: Provider,
        fields: TokenFields,
        created_at: UnixTime,
        updated_at: UnixTime,
    ) -> Self {
        Self {
            user_id,
            provider,
            fields,
            created_at,
            updated_at,
        }
    }

    /// Gets the user that authorized this connection
    #[inline]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Gets the issuer tag
    #[inline]
    pub fn provider(&self) -> &ProviderRef {
        &self.provider
    }

    /// Gets the current access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.fields.access_token
    }

    /// Gets the refresh token, if one was granted
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.fields.refresh_token.as_deref()
    }

    /// Gets the access token's presentation scheme
    #[inline]
    pub fn token_type(&self) -> &str {
        &self.fields.token_type
    }

    /// Gets the time that the access token expires
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.fields.expires_at
    }

    /// Gets the granted scopes
    #[inline]
    pub fn scope(&self) -> Option<&str> {
        self.fields.scope.as_deref()
    }

    /// Gets the time that the connection was first stored
    #[inline]
    pub fn created_at(&self) -> UnixTime {
        self.created_at
    }

    /// Gets the time of the most recent save
    #[inline]
    pub fn updated_at(&self) -> UnixTime {
        self.updated_at
    }

    /// Gets the caller-supplied fields
    #[inline]
    pub fn fields(&self) -> &TokenFields {
        &self.fields
    }

    /// Whether the access token can ever be renewed without the user
    #[inline]
    pub fn is_refreshable(&self) -> bool {
        self.fields
            .refresh_token
            .as_deref()
            .map_or(false, |rt| !rt.as_str().is_empty())
    }

    /// Gets the token's lifecycle status as of the provided time
    #[inline]
    pub fn status_at(&self, time: UnixTime, skew_margin: DurationSecs) -> TokenStatus {
        classify(self, time, skew_margin)
    }

    /// Whether `other` is the same write of this connection
    pub(crate) fn is_same_revision(&self, other: &TokenRecord) -> bool {
        self.user_id == other.user_id
            && self.provider == other.provider
            && self.updated_at == other.updated_at
            && self.fields.access_token == other.fields.access_token
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expires_at().saturating_duration_since(time)
    }
}

/// Configuration for deciding when a token should be refreshed
#[derive(Clone, Debug)]
pub struct ValidatorConfig<C = System> {
    skew_margin: DurationSecs,
    clock: C,
}

impl Default for ValidatorConfig {
    /// Default validator configuration
    ///
    /// Uses a skew margin of 20 minutes, enough to cover one default maintenance
    /// interval of 15 minutes, and the system clock.
    fn default() -> Self {
        Self {
            skew_margin: DurationSecs::from_mins(20),
            clock: System,
        }
    }
}

impl ValidatorConfig {
    /// Constructs a validator that treats tokens within `skew_margin` of expiry
    /// as expiring soon
    pub fn new(skew_margin: DurationSecs) -> Self {
        Self {
            skew_margin,
            clock: System,
        }
    }
}

impl<C> ValidatorConfig<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ValidatorConfig<D> {
        ValidatorConfig {
            skew_margin: self.skew_margin,
            clock,
        }
    }

    /// Gets the skew margin
    #[inline]
    pub fn skew_margin(&self) -> DurationSecs {
        self.skew_margin
    }

    /// Gets the clock
    #[inline]
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<C: Clock> ValidatorConfig<C> {
    /// Gets the current time according to the configured clock
    #[inline]
    pub fn now(&self) -> UnixTime {
        self.clock.now()
    }

    /// Classifies a record using the configured clock
    #[inline]
    pub fn status(&self, record: &TokenRecord) -> TokenStatus {
        classify(record, self.clock.now(), self.skew_margin)
    }
}
