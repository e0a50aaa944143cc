//! A refresher that uses an OAuth2 server as an authority

use std::sync::Arc;

use async_trait::async_trait;
use warden_clock::{Clock, DurationSecs, System};

use super::{RefreshResult, TokenRefresher};
use crate::{TokenFields, TokenRecord};

pub mod dto;

/// Token lifetime assumed when the authority omits `expires_in`
pub const DEFAULT_LIFETIME: DurationSecs = DurationSecs(3_600);

/// Exchanges refresh tokens at an OAuth2 token endpoint
///
/// Sends the `refresh_token` grant as form data along with the client
/// credentials. The new expiry is computed from the time the request was sent,
/// so time spent waiting on the authority only ever makes the token look
/// older than it is.
#[derive(Debug)]
pub struct OAuth2Refresher<C = System> {
    client: reqwest::Client,
    token_url: reqwest::Url,
    credentials: Arc<dto::ClientCredentials>,
    default_lifetime: DurationSecs,
    clock: C,
}

impl OAuth2Refresher<System> {
    /// Constructs a new refresher
    ///
    /// Any request timeout should be configured on `client`; a timed out
    /// request is reported as a transient failure.
    pub fn new(
        client: reqwest::Client,
        token_url: reqwest::Url,
        credentials: dto::ClientCredentials,
    ) -> Self {
        Self {
            client,
            token_url,
            credentials: Arc::new(credentials),
            default_lifetime: DEFAULT_LIFETIME,
            clock: System,
        }
    }
}

impl<C> OAuth2Refresher<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> OAuth2Refresher<D> {
        OAuth2Refresher {
            client: self.client,
            token_url: self.token_url,
            credentials: self.credentials,
            default_lifetime: self.default_lifetime,
            clock,
        }
    }

    /// Sets the lifetime assumed when the authority does not report one
    pub fn with_default_lifetime(mut self, lifetime: DurationSecs) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    /// Gets the token endpoint
    pub fn token_url(&self) -> &reqwest::Url {
        &self.token_url
    }
}

impl<C: Clock> OAuth2Refresher<C> {
    #[tracing::instrument(
        skip(self, record),
        fields(
            user_id = %record.user_id(),
            provider = %record.provider(),
            token_url = %self.token_url,
            client_id = %self.credentials.client_id,
        ),
    )]
    async fn request_refresh(&self, record: &TokenRecord) -> RefreshResult {
        let refresh_token = match record.refresh_token() {
            Some(rt) if !rt.as_str().is_empty() => rt,
            _ => return RefreshResult::PermanentFailure("no refresh token stored".to_owned()),
        };

        tracing::trace!("requesting token refresh from authority");

        let requested_at = self.clock.now();
        let grant = dto::RefreshTokenGrant {
            credentials: &self.credentials,
            refresh_token,
        };

        let resp = match self
            .client
            .post(self.token_url.clone())
            .form(&grant)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(error) => return RefreshResult::TransientFailure(describe_send_error(&error)),
        };

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from issuing authority"
        );

        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(error) => {
                return RefreshResult::TransientFailure(format!(
                    "error reading response body: {error}"
                ))
            }
        };

        if !status.is_success() {
            return classify_error_response(status, &body);
        }

        let resp: dto::TokenResponse = match serde_json::from_slice(&body) {
            Ok(resp) => resp,
            Err(error) => {
                return RefreshResult::TransientFailure(format!(
                    "error deserializing token body from authority: {error}"
                ))
            }
        };

        let rotated = resp.refresh_token.filter(|rt| !rt.as_str().is_empty());
        let has_new_refresh_token = rotated.is_some();
        let lifetime = resp.expires_in.unwrap_or(self.default_lifetime);

        let fields = TokenFields {
            access_token: resp.access_token,
            refresh_token: Some(rotated.unwrap_or_else(|| refresh_token.to_owned())),
            token_type: resp
                .token_type
                .unwrap_or_else(|| record.token_type().to_owned()),
            expires_at: requested_at + lifetime,
            scope: resp.scope.or_else(|| record.scope().map(str::to_owned)),
        };

        tracing::info!(
            has_new_refresh_token,
            lifetime = lifetime.0,
            expires_at = fields.expires_at.0,
            "received new tokens"
        );

        RefreshResult::Success(fields)
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenRefresher for OAuth2Refresher<C> {
    async fn refresh(&self, record: &TokenRecord) -> RefreshResult {
        self.request_refresh(record).await
    }
}

fn describe_send_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request to authority timed out".to_owned()
    } else if error.is_connect() {
        format!("unable to connect to authority: {error}")
    } else {
        format!("error sending request to authority: {error}")
    }
}

fn classify_error_response(status: reqwest::StatusCode, body: &[u8]) -> RefreshResult {
    match serde_json::from_slice::<dto::ErrorResponse>(body) {
        Ok(err) if err.is_invalid_grant() => RefreshResult::PermanentFailure(format!(
            "authority rejected refresh token ({status}): {}",
            err.error_description.as_deref().unwrap_or(&err.error)
        )),
        Ok(err) => RefreshResult::TransientFailure(format!(
            "authority returned {status}: {}",
            err.error
        )),
        Err(_) => RefreshResult::TransientFailure(format!("authority returned {status}")),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use axum::{http::StatusCode, routing::post, Form, Json, Router};
    use serde_json::{json, Value};
    use warden_clock::{TestClock, UnixTime};

    use super::*;
    use crate::{AccessToken, ClientId, ClientSecret, Provider, RefreshToken, UserId};

    const T0: UnixTime = UnixTime(1_700_000_000);

    async fn spawn_authority(app: Router) -> reqwest::Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        reqwest::Url::parse(&format!("http://{addr}/token")).unwrap()
    }

    fn authority_replying(status: StatusCode, body: Value) -> Router {
        Router::new().route(
            "/token",
            post(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        )
    }

    fn refresher(token_url: reqwest::Url) -> OAuth2Refresher<TestClock> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();

        OAuth2Refresher::new(
            client,
            token_url,
            dto::ClientCredentials {
                client_id: ClientId::from_static("client-1"),
                client_secret: ClientSecret::from_static("secret-1"),
            },
        )
        .with_clock(TestClock::new(T0))
    }

    fn record(refresh_token: Option<&'static str>) -> TokenRecord {
        TokenRecord::new(
            UserId(5),
            Provider::default_tag(),
            TokenFields::bearer(
                AccessToken::from_static("old-access"),
                refresh_token.map(RefreshToken::from_static),
                T0 + DurationSecs(300),
            )
            .with_scope("calendar.read"),
            T0,
            T0,
        )
    }

    #[tokio::test]
    async fn sends_refresh_grant_and_computes_expiry_from_request_time() {
        let app = Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                let expected = [
                    ("grant_type", "refresh_token"),
                    ("client_id", "client-1"),
                    ("client_secret", "secret-1"),
                    ("refresh_token", "refresh-1"),
                ];
                if expected
                    .iter()
                    .all(|(k, v)| form.get(*k).map(String::as_str) == Some(*v))
                {
                    (
                        StatusCode::OK,
                        Json(json!({
                            "access_token": "new-access",
                            "refresh_token": "refresh-2",
                            "expires_in": 3600,
                            "scope": "calendar.read calendar.write",
                            "token_type": "Bearer",
                        })),
                    )
                } else {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "error": "invalid_request" })),
                    )
                }
            }),
        );
        let url = spawn_authority(app).await;

        let result = refresher(url).refresh(&record(Some("refresh-1"))).await;

        let RefreshResult::Success(fields) = result else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(fields.access_token.as_str(), "new-access");
        assert_eq!(
            fields.refresh_token.as_ref().map(|rt| rt.as_str()),
            Some("refresh-2")
        );
        assert_eq!(fields.expires_at, T0 + DurationSecs(3_600));
        assert_eq!(fields.scope.as_deref(), Some("calendar.read calendar.write"));
    }

    #[tokio::test]
    async fn keeps_refresh_token_and_scope_when_not_rotated() {
        let url = spawn_authority(authority_replying(
            StatusCode::OK,
            json!({ "access_token": "new-access", "expires_in": 600 }),
        ))
        .await;

        let result = refresher(url).refresh(&record(Some("refresh-1"))).await;

        let RefreshResult::Success(fields) = result else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(
            fields.refresh_token.as_ref().map(|rt| rt.as_str()),
            Some("refresh-1")
        );
        assert_eq!(fields.scope.as_deref(), Some("calendar.read"));
        assert_eq!(fields.token_type, "Bearer");
        assert_eq!(fields.expires_at, T0 + DurationSecs(600));
    }

    #[tokio::test]
    async fn missing_expires_in_uses_default_lifetime() {
        let url = spawn_authority(authority_replying(
            StatusCode::OK,
            json!({ "access_token": "new-access" }),
        ))
        .await;

        let result = refresher(url)
            .with_default_lifetime(DurationSecs(120))
            .refresh(&record(Some("refresh-1")))
            .await;

        let RefreshResult::Success(fields) = result else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(fields.expires_at, T0 + DurationSecs(120));
    }

    #[tokio::test]
    async fn invalid_grant_is_permanent() {
        let url = spawn_authority(authority_replying(
            StatusCode::BAD_REQUEST,
            json!({ "error": "invalid_grant", "error_description": "Token has been revoked." }),
        ))
        .await;

        let result = refresher(url).refresh(&record(Some("refresh-1"))).await;

        assert!(
            matches!(&result, RefreshResult::PermanentFailure(reason) if reason.contains("revoked")),
            "got {result:?}"
        );
    }

    #[tokio::test]
    async fn other_error_responses_are_transient() {
        for (status, body) in [
            (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": "temporarily_unavailable" })),
            (StatusCode::TOO_MANY_REQUESTS, json!({ "error": "slow_down" })),
            (StatusCode::BAD_REQUEST, json!({ "error": "invalid_request" })),
            (StatusCode::INTERNAL_SERVER_ERROR, json!("oops")),
        ] {
            let url = spawn_authority(authority_replying(status, body)).await;
            let result = refresher(url).refresh(&record(Some("refresh-1"))).await;
            assert_eq!(result.outcome(), "transient_failure", "{status}: {result:?}");
        }
    }

    #[tokio::test]
    async fn malformed_success_body_is_transient() {
        let url = spawn_authority(authority_replying(
            StatusCode::OK,
            json!({ "token": "not what we asked for" }),
        ))
        .await;

        let result = refresher(url).refresh(&record(Some("refresh-1"))).await;
        assert_eq!(result.outcome(), "transient_failure");
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let app = Router::new().route(
            "/token",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        );
        let url = spawn_authority(app).await;

        let result = refresher(url).refresh(&record(Some("refresh-1"))).await;
        assert_eq!(
            result,
            RefreshResult::TransientFailure("request to authority timed out".to_owned())
        );
    }

    #[tokio::test]
    async fn unreachable_authority_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = reqwest::Url::parse(&format!("http://{addr}/token")).unwrap();

        let result = refresher(url).refresh(&record(Some("refresh-1"))).await;
        assert_eq!(result.outcome(), "transient_failure");
    }

    #[tokio::test]
    async fn missing_refresh_token_is_permanent_without_a_request() {
        let url = reqwest::Url::parse("http://127.0.0.1:9/token").unwrap();

        assert_eq!(
            refresher(url.clone()).refresh(&record(None)).await.outcome(),
            "permanent_failure"
        );
        assert_eq!(
            refresher(url).refresh(&record(Some(""))).await.outcome(),
            "permanent_failure"
        );
    }
}
