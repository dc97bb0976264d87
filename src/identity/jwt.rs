//! Inbound JWT bearer validation against the authority's JSON Web Key Set.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{JwkSet, PublicKeyUse};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use tracing::{debug, info, warn};

use super::Claims;
use crate::config::Config;
use crate::error::{AppError, AuthError};

/// How long fetched keys are trusted before the set is refreshed.
const KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Allowed clock skew when checking `exp` and `nbf`.
const LEEWAY_SECONDS: u64 = 300;

/// Validates an inbound bearer token and returns its claims.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Validates RS256 (or other configured) tokens with keys fetched from a JWKS endpoint.
pub struct JwksValidator {
    /// Cached keys: kid -> DecodingKey
    keys: RwLock<HashMap<String, DecodingKey>>,
    /// When the keys were last fetched
    last_refresh: RwLock<Option<Instant>>,
    jwks_uri: String,
    audiences: Vec<String>,
    issuer: String,
    algorithms: Vec<Algorithm>,
    http_client: reqwest::Client,
}

impl JwksValidator {
    /// Create a validator. Keys are fetched lazily on first use.
    pub fn new(
        jwks_uri: String,
        audiences: Vec<String>,
        issuer: String,
        algorithms: Vec<Algorithm>,
    ) -> Result<Self, AuthError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AuthError::KeysUnavailable(e.to_string()))?;

        Ok(Self {
            keys: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
            jwks_uri,
            audiences,
            issuer,
            algorithms,
            http_client,
        })
    }

    /// Create a validator for the configured authority, issuer and audiences.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        Ok(Self::new(
            config.jwks_uri(),
            config.audiences(),
            config.issuer()?,
            config.azure_ad.allowed_algorithms.clone(),
        )?)
    }

    /// Fetch the key set and replace the cached keys.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        debug!(url = %self.jwks_uri, "Fetching JWKS");

        let response = self
            .http_client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::KeysUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::KeysUnavailable(format!(
                "JWKS endpoint returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::KeysUnavailable(format!("Failed to parse JWKS: {e}")))?;

        let mut new_keys = HashMap::new();
        for jwk in &jwks.keys {
            // Skip encryption keys
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                continue;
            }

            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    let kid = jwk
                        .common
                        .key_id
                        .clone()
                        .unwrap_or_else(|| "default".to_string());
                    debug!(kid = %kid, "Loaded JWK");
                    new_keys.insert(kid, key);
                }
                Err(e) => {
                    warn!(kid = ?jwk.common.key_id, error = %e, "Failed to parse JWK, skipping");
                }
            }
        }

        if new_keys.is_empty() {
            return Err(AuthError::KeysUnavailable(
                "No valid signing keys found in JWKS".into(),
            ));
        }

        let key_count = new_keys.len();
        *self.keys.write().unwrap_or_else(|e| e.into_inner()) = new_keys;
        *self.last_refresh.write().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        info!(url = %self.jwks_uri, key_count, "JWKS cache refreshed");
        Ok(())
    }

    fn is_stale(&self) -> bool {
        match *self.last_refresh.read().unwrap_or_else(|e| e.into_inner()) {
            Some(at) => at.elapsed() >= KEY_REFRESH_INTERVAL,
            None => true,
        }
    }

    fn cached_key(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        match kid {
            Some(kid) => keys.get(kid).cloned(),
            None => keys.values().next().cloned(),
        }
    }

    /// Find the decoding key, refreshing once if it is unknown (key rotation).
    async fn find_key(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        let mut refreshed = false;
        if self.is_stale() {
            self.refresh().await?;
            refreshed = true;
        }

        if let Some(key) = self.cached_key(kid) {
            return Ok(key);
        }

        if !refreshed {
            debug!(kid = ?kid, "Key not found in cache, refreshing JWKS");
            self.refresh().await?;
            if let Some(key) = self.cached_key(kid) {
                return Ok(key);
            }
        }

        Err(AuthError::InvalidToken(format!(
            "signing key '{}' not found",
            kid.unwrap_or("default")
        )))
    }
}

#[async_trait]
impl TokenValidator for JwksValidator {
    async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let header =
            decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        if !self.algorithms.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "algorithm {:?} not allowed",
                header.alg
            )));
        }

        let key = self.find_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = LEEWAY_SECONDS;
        validation.set_audience(&self.audiences);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        debug!(kid = ?header.kid, "Inbound token validated");
        Ok(data.claims)
    }
}
