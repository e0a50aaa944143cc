//! DTOs for interacting with an OAuth2 token endpoint

use serde::{Deserialize, Serialize, Serializer};
use warden_clock::DurationSecs;

use crate::{AccessToken, ClientId, ClientSecret, RefreshToken, RefreshTokenRef};

/// Client credentials
#[derive(Debug, Serialize)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

/// The form body of a refresh token grant
#[derive(Debug)]
pub(super) struct RefreshTokenGrant<'a> {
    pub credentials: &'a ClientCredentials,
    pub refresh_token: &'a RefreshTokenRef,
}

impl Serialize for RefreshTokenGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshTokenGrant", 4)?;
        ser.serialize_field("grant_type", "refresh_token")?;
        ser.serialize_field("client_id", &self.credentials.client_id)?;
        ser.serialize_field("client_secret", &self.credentials.client_secret)?;
        ser.serialize_field("refresh_token", self.refresh_token)?;
        ser.end()
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub expires_in: Option<DurationSecs>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    /// Whether the issuer has permanently refused the refresh token
    pub fn is_invalid_grant(&self) -> bool {
        self.error == "invalid_grant"
    }
}
