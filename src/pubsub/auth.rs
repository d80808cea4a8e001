//! Access tokens for the upstream REST API
//!
//! Supports service account keys (signed JWT grant), user credentials
//! (refresh-token exchange) and the compute metadata server. The emulator
//! needs no token at all.

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::SubscriptionError;
use crate::core::{ForwarderError, ForwarderResult, UpstreamEnvironment};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for a signed assertion, the maximum Google accepts
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the token actually expires
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct CredentialsFile {
    #[serde(rename = "type")]
    kind: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
    token_uri: Option<String>,
    client_email: Option<String>,
    private_key: Option<String>,
    private_key_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Clone)]
enum TokenSource {
    Anonymous,
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        token_uri: String,
    },
    ServiceAccount {
        client_email: String,
        key_id: Option<String>,
        signing_key: EncodingKey,
        token_uri: String,
    },
    Metadata {
        url: String,
    },
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Hands out bearer tokens, caching each until shortly before expiry
pub struct AccessTokenProvider {
    source: TokenSource,
    http_client: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl AccessTokenProvider {
    fn with_source(source: TokenSource, http_client: Client) -> Self {
        Self {
            source,
            http_client,
            cached: Mutex::new(None),
        }
    }

    /// No authentication, for the emulator
    pub fn anonymous(http_client: Client) -> Self {
        Self::with_source(TokenSource::Anonymous, http_client)
    }

    /// Tokens from a metadata server at `url`
    pub fn metadata(url: impl Into<String>, http_client: Client) -> Self {
        Self::with_source(TokenSource::Metadata { url: url.into() }, http_client)
    }

    pub fn from_environment(
        environment: &UpstreamEnvironment,
        http_client: Client,
    ) -> ForwarderResult<Self> {
        match environment {
            UpstreamEnvironment::Emulator { .. } => Ok(Self::anonymous(http_client)),
            UpstreamEnvironment::Credentials { path } => Self::from_credentials_file(path, http_client),
        }
    }

    pub fn from_credentials_file(path: &Path, http_client: Client) -> ForwarderResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ForwarderError::credentials(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_credentials_json(&raw, http_client)
    }

    pub fn from_credentials_json(raw: &str, http_client: Client) -> ForwarderResult<Self> {
        let file: CredentialsFile = serde_json::from_str(raw)
            .map_err(|e| ForwarderError::credentials(format!("invalid credentials file: {}", e)))?;

        match file.kind.as_str() {
            "authorized_user" => {
                let (Some(client_id), Some(client_secret), Some(refresh_token)) =
                    (file.client_id, file.client_secret, file.refresh_token)
                else {
                    return Err(ForwarderError::credentials(
                        "authorized_user credentials need client_id, client_secret and refresh_token",
                    ));
                };
                Ok(Self::with_source(
                    TokenSource::RefreshToken {
                        client_id,
                        client_secret,
                        refresh_token,
                        token_uri: file.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
                    },
                    http_client,
                ))
            }
            "service_account" => {
                let (Some(client_email), Some(private_key)) = (file.client_email, file.private_key)
                else {
                    return Err(ForwarderError::credentials(
                        "service_account credentials need client_email and private_key",
                    ));
                };
                let signing_key = EncodingKey::from_rsa_pem(private_key.as_bytes()).map_err(|e| {
                    ForwarderError::credentials(format!("invalid service account private_key: {}", e))
                })?;
                Ok(Self::with_source(
                    TokenSource::ServiceAccount {
                        client_email,
                        key_id: file.private_key_id,
                        signing_key,
                        token_uri: file.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
                    },
                    http_client,
                ))
            }
            other => {
                warn!(
                    credentials_type = other,
                    "credentials type is not exchanged locally, using the metadata server"
                );
                Ok(Self::metadata(METADATA_TOKEN_URL, http_client))
            }
        }
    }

    /// Current bearer token, `None` when running unauthenticated
    pub async fn token(&self) -> Result<Option<String>, SubscriptionError> {
        if matches!(self.source, TokenSource::Anonymous) {
            return Ok(None);
        }

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(Some(token.value.clone()));
        }

        let fresh = self.fetch().await?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(EXPIRY_MARGIN);
        debug!(expires_in = fresh.expires_in, "obtained access token");
        *cached = Some(CachedToken {
            value: fresh.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(Some(fresh.access_token))
    }

    async fn fetch(&self) -> Result<TokenResponse, SubscriptionError> {
        let request = match &self.source {
            TokenSource::Anonymous => {
                return Err(SubscriptionError::auth("anonymous source has no token"));
            }
            TokenSource::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
                token_uri,
            } => self.http_client.post(token_uri).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ]),
            TokenSource::ServiceAccount {
                client_email,
                key_id,
                signing_key,
                token_uri,
            } => {
                let assertion =
                    build_assertion(client_email, key_id.as_deref(), signing_key, token_uri, SystemTime::now())?;
                self.http_client.post(token_uri).form(&[
                    ("grant_type", JWT_BEARER_GRANT),
                    ("assertion", assertion.as_str()),
                ])
            }
            TokenSource::Metadata { url } => self
                .http_client
                .get(url)
                .header("Metadata-Flavor", "Google"),
        };

        let response = request
            .send()
            .await
            .map_err(|e| SubscriptionError::auth(format!("token request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(SubscriptionError::auth(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                body
            )));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| SubscriptionError::auth(format!("invalid token response: {}", e)))
    }
}

/// RS256-signed assertion for the JWT bearer grant
fn build_assertion(
    client_email: &str,
    key_id: Option<&str>,
    signing_key: &EncodingKey,
    token_uri: &str,
    now: SystemTime,
) -> Result<String, SubscriptionError> {
    let iat = now
        .duration_since(UNIX_EPOCH)
        .map_err(|e| SubscriptionError::auth(format!("system clock before epoch: {}", e)))?
        .as_secs();
    let claims = AssertionClaims {
        iss: client_email.to_string(),
        scope: PUBSUB_SCOPE.to_string(),
        aud: token_uri.to_string(),
        iat,
        exp: iat + ASSERTION_LIFETIME.as_secs(),
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = key_id.map(str::to_string);
    encode(&header, &claims, signing_key)
        .map_err(|e| SubscriptionError::auth(format!("could not sign assertion: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_anonymous_has_no_token() {
        let provider = AccessTokenProvider::anonymous(Client::new());
        assert_eq!(provider.token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_token_exchange_is_cached() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "r-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"tok-1","expires_in":3600,"token_type":"Bearer"}"#)
            .expect(1)
            .create_async()
            .await;

        let creds = format!(
            r#"{{"type":"authorized_user","client_id":"c","client_secret":"s","refresh_token":"r-1","token_uri":"{}/token"}}"#,
            server.url()
        );
        let provider = AccessTokenProvider::from_credentials_json(&creds, Client::new()).unwrap();

        assert_eq!(provider.token().await.unwrap().as_deref(), Some("tok-1"));
        assert_eq!(provider.token().await.unwrap().as_deref(), Some("tok-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_metadata_server() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/token")
            .match_header("Metadata-Flavor", "Google")
            .with_status(200)
            .with_body(r#"{"access_token":"meta","expires_in":30}"#)
            .expect(2)
            .create_async()
            .await;

        // 30s lifetime is inside the refresh margin, so every call refetches
        let provider = AccessTokenProvider::metadata(format!("{}/token", server.url()), Client::new());
        assert_eq!(provider.token().await.unwrap().as_deref(), Some("meta"));
        assert_eq!(provider.token().await.unwrap().as_deref(), Some("meta"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_endpoint_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/token")
            .with_status(403)
            .with_body("denied")
            .create_async()
            .await;

        let provider = AccessTokenProvider::metadata(format!("{}/token", server.url()), Client::new());
        let err = provider.token().await.unwrap_err();
        assert!(err.to_string().contains("403"));
    }

    const TEST_PRIVATE_KEY: &str = include_str!("../../testdata/service_account_key.pem");
    const TEST_PUBLIC_KEY: &str = include_str!("../../testdata/service_account_key.pub.pem");

    fn service_account_json(token_uri: &str) -> String {
        serde_json::json!({
            "type": "service_account",
            "client_email": "forwarder@proj.iam.gserviceaccount.com",
            "private_key_id": "key-1",
            "private_key": TEST_PRIVATE_KEY,
            "token_uri": token_uri,
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_service_account_jwt_grant() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded(
                    "grant_type".into(),
                    "urn:ietf:params:oauth:grant-type:jwt-bearer".into(),
                ),
                Matcher::Regex(r"assertion=[\w-]+\.[\w-]+\.[\w-]+".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"sa-tok","expires_in":3600,"token_type":"Bearer"}"#)
            .expect(1)
            .create_async()
            .await;

        let creds = service_account_json(&format!("{}/token", server.url()));
        let provider = AccessTokenProvider::from_credentials_json(&creds, Client::new()).unwrap();

        assert_eq!(provider.token().await.unwrap().as_deref(), Some("sa-tok"));
        assert_eq!(provider.token().await.unwrap().as_deref(), Some("sa-tok"));
        mock.assert_async().await;
    }

    #[test]
    fn test_assertion_claims() {
        use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};

        let signing_key = EncodingKey::from_rsa_pem(TEST_PRIVATE_KEY.as_bytes()).unwrap();
        let now = UNIX_EPOCH + Duration::from_secs(1_709_629_623);
        let assertion = build_assertion(
            "forwarder@proj.iam.gserviceaccount.com",
            Some("key-1"),
            &signing_key,
            DEFAULT_TOKEN_URI,
            now,
        )
        .unwrap();

        let header = decode_header(&assertion).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.kid.as_deref(), Some("key-1"));

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.set_audience(&[DEFAULT_TOKEN_URI]);
        let decoded = decode::<AssertionClaims>(
            &assertion,
            &DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims.iss, "forwarder@proj.iam.gserviceaccount.com");
        assert_eq!(decoded.claims.scope, PUBSUB_SCOPE);
        assert_eq!(decoded.claims.iat, 1_709_629_623);
        assert_eq!(decoded.claims.exp, 1_709_629_623 + 3600);
    }

    #[test]
    fn test_invalid_service_account_key() {
        let creds = serde_json::json!({
            "type": "service_account",
            "client_email": "x@y",
            "private_key": "not a pem",
        })
        .to_string();
        assert!(matches!(
            AccessTokenProvider::from_credentials_json(&creds, Client::new()),
            Err(ForwarderError::Credentials { .. })
        ));
    }

    #[test]
    fn test_incomplete_user_credentials() {
        let err = AccessTokenProvider::from_credentials_json(
            r#"{"type":"authorized_user","client_id":"c"}"#,
            Client::new(),
        );
        assert!(err.is_err());
        assert!(AccessTokenProvider::from_credentials_json("not json", Client::new()).is_err());
    }
}
