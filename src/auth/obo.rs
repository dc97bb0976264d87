//! On-behalf-of token exchange (OAuth2 JWT-bearer assertion grant, RFC 7523).
//!
//! Trades the caller's inbound access token for a token scoped to a downstream
//! resource such as Microsoft Graph, without ever seeing the caller's credentials.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, error, info};

use super::retry;
use super::secure::SecureString;
use crate::config::{self, Config, EndpointVersion, TokenConfig};
use crate::error::{ConfigError, ExchangeError};
use crate::identity::InboundIdentity;

/// Assertion type for the on-behalf-of grant. Identity providers compare it literally.
pub const JWT_BEARER_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client credential of this service, registered with the identity provider.
#[derive(Debug, Clone)]
pub struct ClientCredential {
    client_id: String,
    client_secret: SecureString,
    authority_url: String,
}

impl ClientCredential {
    /// Create a credential, rejecting empty values and malformed authorities.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<SecureString>,
        authority_url: &str,
    ) -> Result<Self, ConfigError> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();

        if client_id.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: "Azure AD client_id",
                env: "AZURE_CLIENT_ID",
            });
        }
        if client_secret.is_empty() {
            return Err(ConfigError::Missing {
                field: "Azure AD client_secret",
                env: "AZURE_CLIENT_SECRET",
            });
        }
        config::parse_http_url("azure_ad.authority", authority_url)?;

        Ok(Self {
            client_id,
            client_secret,
            authority_url: authority_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn authority_url(&self) -> &str {
        &self.authority_url
    }
}

/// Assertion about the current caller, built fresh for every exchange.
#[derive(Debug, Clone)]
pub struct AssertionRequest {
    pub inbound_token: SecureString,
    pub assertion_type: &'static str,
    pub subject_hint: Option<String>,
}

impl AssertionRequest {
    /// Build the assertion for `identity`. The hint is the UPN, else the email.
    pub fn new(inbound_token: SecureString, identity: &InboundIdentity) -> Self {
        Self {
            inbound_token,
            assertion_type: JWT_BEARER_ASSERTION_TYPE,
            subject_hint: identity.subject_hint().map(String::from),
        }
    }
}

/// Access token for a downstream resource, obtained on the caller's behalf.
#[derive(Debug, Clone)]
pub struct ExchangedToken {
    access_token: SecureString,
    token_type: String,
    expires_at: DateTime<Utc>,
}

impl ExchangedToken {
    pub fn new(
        access_token: impl Into<SecureString>,
        token_type: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: token_type.into(),
            expires_at,
        }
    }

    pub fn access_token(&self) -> &str {
        self.access_token.as_str()
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the token must not be used at `now`, treating the last `margin` as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin >= self.expires_at
    }

    /// Value for the outbound `Authorization` header, using the provider's token type.
    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token.as_str())
    }
}

/// Performs the on-behalf-of exchange against the authority's token endpoint.
pub struct OboExchanger {
    credential: ClientCredential,
    endpoint_version: EndpointVersion,
    http_client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl OboExchanger {
    /// Create an exchanger for `credential`.
    pub fn new(
        credential: ClientCredential,
        endpoint_version: EndpointVersion,
        token: &TokenConfig,
    ) -> Result<Self, ExchangeError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(token.exchange_timeout_seconds))
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "http client".into(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            credential,
            endpoint_version,
            http_client,
            max_retries: token.max_retries,
            retry_delay: retry::BASE_DELAY,
        })
    }

    /// Create an exchanger from the service configuration.
    pub fn from_config(config: &Config) -> Result<Self, ExchangeError> {
        let credential = ClientCredential::new(
            config.azure_ad.client_id.clone(),
            config.azure_ad.client_secret.clone(),
            &config.azure_ad.authority,
        )?;
        Self::new(credential, config.azure_ad.endpoint_version, &config.token)
    }

    /// Override the base retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The token endpoint this exchanger posts to.
    pub fn token_endpoint(&self) -> String {
        config::token_url(&self.credential.authority_url, self.endpoint_version)
    }

    /// Exchange the caller's assertion for a token scoped to `resource`.
    ///
    /// Provider outages are retried with backoff; rejections are returned as-is.
    pub async fn exchange(
        &self,
        assertion: &AssertionRequest,
        resource: &str,
    ) -> Result<ExchangedToken, ExchangeError> {
        if assertion.inbound_token.is_empty() {
            return Err(ExchangeError::MissingInboundToken);
        }

        debug!(
            resource,
            subject_hint = assertion.subject_hint.as_deref().unwrap_or("-"),
            "Exchanging assertion on behalf of caller"
        );

        retry::with_backoff(self.max_retries, self.retry_delay, || {
            self.exchange_once(assertion, resource)
        })
        .await
    }

    async fn exchange_once(
        &self,
        assertion: &AssertionRequest,
        resource: &str,
    ) -> Result<ExchangedToken, ExchangeError> {
        let scope;
        let mut params = vec![
            ("grant_type", assertion.assertion_type),
            ("assertion", assertion.inbound_token.as_str()),
            ("client_id", self.credential.client_id.as_str()),
            ("client_secret", self.credential.client_secret.as_str()),
            ("requested_token_use", "on_behalf_of"),
        ];
        match self.endpoint_version {
            EndpointVersion::V1 => params.push(("resource", resource)),
            EndpointVersion::V2 => {
                scope = v2_scope(resource);
                params.push(("scope", scope.as_str()));
            }
        }

        let response = self
            .http_client
            .post(self.token_endpoint())
            .form(&params)
            .send()
            .await
            .map_err(|e| ExchangeError::ProviderUnavailable {
                reason: e.to_string(),
                timed_out: e.is_timeout(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), &body));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        let token = body.into_exchanged_token(Utc::now())?;
        info!(
            resource,
            token_type = token.token_type(),
            expires_at = %token.expires_at(),
            "Acquired on-behalf-of token"
        );
        Ok(token)
    }
}

/// v2 endpoints take scopes; a bare resource becomes `<resource>/.default`.
fn v2_scope(resource: &str) -> String {
    if resource.contains("/.default") || resource.contains(' ') {
        resource.to_string()
    } else {
        format!("{}/.default", resource.trim_end_matches('/'))
    }
}

/// Map a non-success token endpoint response to an exchange error.
fn classify_failure(status: u16, body: &str) -> ExchangeError {
    let parsed: Option<TokenErrorResponse> = serde_json::from_str(body).ok();

    match status {
        400 | 401 | 403 => match parsed {
            Some(err) if is_transient_error_code(&err.error) => {
                error!(status, error = %err.error, "Identity provider temporarily unavailable");
                ExchangeError::ProviderUnavailable {
                    reason: err.error,
                    timed_out: false,
                }
            }
            Some(err) => {
                error!(
                    status,
                    error = %err.error,
                    description = err.error_description.as_deref().unwrap_or(""),
                    "Assertion rejected by identity provider"
                );
                ExchangeError::AssertionRejected {
                    error: err.error,
                    description: err.error_description,
                }
            }
            None => {
                error!(status, "Assertion rejected with an unparseable error body");
                ExchangeError::AssertionRejected {
                    error: format!("http_{status}"),
                    description: None,
                }
            }
        },
        408 | 429 | 500..=599 => {
            error!(status, "Token exchange failed: identity provider unavailable");
            ExchangeError::ProviderUnavailable {
                reason: format!("HTTP {status}"),
                timed_out: status == 408 || status == 504,
            }
        }
        _ => {
            error!(status, "Token exchange failed with unexpected status");
            ExchangeError::InvalidResponse(format!("HTTP {status}"))
        }
    }
}

fn is_transient_error_code(code: &str) -> bool {
    matches!(code, "temporarily_unavailable" | "server_error")
}

/// Token response from the identity provider.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<ExpiresIn>,
}

/// v1 endpoints send `expires_in` as a string, v2 as a number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(u64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> Option<u64> {
        match self {
            Self::Seconds(s) => Some(*s),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl TokenResponse {
    fn into_exchanged_token(self, now: DateTime<Utc>) -> Result<ExchangedToken, ExchangeError> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExchangeError::InvalidResponse("missing access_token".into()))?;
        let token_type = self
            .token_type
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExchangeError::InvalidResponse("missing token_type".into()))?;
        // Without a lifetime the token is usable once and never cached
        let expires_in = self.expires_in.and_then(|e| e.seconds()).unwrap_or(0);
        let expires_at = i64::try_from(expires_in)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                ExchangeError::InvalidResponse(format!("expires_in out of range: {expires_in}"))
            })?;

        Ok(ExchangedToken::new(access_token, token_type, expires_at))
    }
}

/// OAuth2 error response body.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}
