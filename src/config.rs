//! Configuration loading and management.
//!
//! Loads configuration from embedded config.toml with environment variable overrides.
//! Everything is read once at startup and treated as immutable afterwards.

use std::collections::BTreeMap;
use std::env;

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use url::Url;

use crate::auth::secure::SecureString;
use crate::error::ConfigError;

/// Embedded configuration file content.
const CONFIG_TOML: &str = include_str!("../config.toml");

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub azure_ad: AzureAdConfig,
    pub graph: GraphConfig,
    pub token: TokenConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureAdConfig {
    pub client_id: String,
    pub client_secret: SecureString,
    pub authority: String,
    #[serde(default)]
    pub endpoint_version: EndpointVersion,
    /// Accepted `aud` values. Defaults to the client id and `api://<client id>`.
    #[serde(default)]
    pub audiences: Vec<String>,
    /// Expected `iss`. Derived from the authority's tenant when unset.
    #[serde(default)]
    pub issuer: Option<String>,
    /// JWKS location. Derived from the authority when unset.
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default = "default_algorithms")]
    pub allowed_algorithms: Vec<Algorithm>,
    pub roles: RolesConfig,
}

/// Azure AD token endpoint flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointVersion {
    #[default]
    V1,
    V2,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RolesConfig {
    pub reader: String,
    pub writer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    pub base_url: String,
    /// Resource URI the exchanged token is scoped to.
    pub resource: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub refresh_before_expiry_seconds: u64,
    pub cache_enabled: bool,
    pub exchange_timeout_seconds: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub timeout_seconds: u64,
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Upper bound for `token.max_retries`; backoff doubles per attempt.
const MAX_RETRIES: u32 = 10;
/// Upper bound for `token.exchange_timeout_seconds`.
const MAX_EXCHANGE_TIMEOUT_SECONDS: u64 = 300;
/// Upper bound for `token.refresh_before_expiry_seconds` (one day).
const MAX_REFRESH_BEFORE_EXPIRY_SECONDS: u64 = 24 * 60 * 60;
/// Authority path segments that name no single tenant.
const MULTI_TENANT_AUTHORITIES: &[&str] = &["common", "organizations", "consumers"];

fn default_algorithms() -> Vec<Algorithm> {
    vec![Algorithm::RS256]
}

impl Config {
    /// Load configuration from embedded config.toml with environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_toml_str(CONFIG_TOML)?;
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration without overrides or validation.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind_address) = lookup("AZUREAPI_BIND_ADDRESS") {
            self.server.bind_address = bind_address;
        }

        if let Some(client_id) = lookup("AZURE_CLIENT_ID") {
            self.azure_ad.client_id = client_id;
        }

        if let Some(client_secret) = lookup("AZURE_CLIENT_SECRET") {
            self.azure_ad.client_secret = SecureString::new(client_secret);
        }

        if let Some(authority) = lookup("AZURE_AUTHORITY") {
            self.azure_ad.authority = authority;
        }

        if let Some(version) = lookup("AZURE_ENDPOINT_VERSION") {
            match version.to_ascii_lowercase().as_str() {
                "v1" => self.azure_ad.endpoint_version = EndpointVersion::V1,
                "v2" => self.azure_ad.endpoint_version = EndpointVersion::V2,
                other => tracing::warn!("Ignoring unknown AZURE_ENDPOINT_VERSION '{}'", other),
            }
        }

        if let Some(reader) = lookup("AZURE_ROLES_READER") {
            self.azure_ad.roles.reader = reader;
        }

        if let Some(writer) = lookup("AZURE_ROLES_WRITER") {
            self.azure_ad.roles.writer = writer;
        }

        if let Some(base_url) = lookup("GRAPH_BASE_URL") {
            self.graph.base_url = base_url;
        }

        if let Some(resource) = lookup("GRAPH_RESOURCE") {
            self.graph.resource = resource;
        }

        if let Some(log_level) = lookup("RUST_LOG") {
            self.logging.level = log_level;
        }

        self.azure_ad.authority = self.azure_ad.authority.trim_end_matches('/').to_string();
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ad = &self.azure_ad;

        if is_unset(&ad.client_id) {
            return Err(ConfigError::Missing {
                field: "Azure AD client_id",
                env: "AZURE_CLIENT_ID",
            });
        }

        if is_unset(ad.client_secret.as_str()) {
            return Err(ConfigError::Missing {
                field: "Azure AD client_secret",
                env: "AZURE_CLIENT_SECRET",
            });
        }

        if is_unset(&ad.authority) || ad.authority.contains("YOUR_TENANT_ID") {
            return Err(ConfigError::Missing {
                field: "Azure AD authority",
                env: "AZURE_AUTHORITY",
            });
        }
        parse_http_url("azure_ad.authority", &ad.authority)?;

        if ad.roles.reader.is_empty() || ad.roles.writer.is_empty() {
            return Err(ConfigError::Invalid {
                field: "azure_ad.roles".into(),
                reason: "reader and writer role names must not be empty".into(),
            });
        }

        if ad.allowed_algorithms.is_empty() {
            return Err(ConfigError::Invalid {
                field: "azure_ad.allowed_algorithms".into(),
                reason: "at least one algorithm is required".into(),
            });
        }

        self.issuer()?;

        let token = &self.token;
        if token.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid {
                field: "token.max_retries".into(),
                reason: format!("must be at most {MAX_RETRIES}"),
            });
        }
        if !(1..=MAX_EXCHANGE_TIMEOUT_SECONDS).contains(&token.exchange_timeout_seconds) {
            return Err(ConfigError::Invalid {
                field: "token.exchange_timeout_seconds".into(),
                reason: format!("must be between 1 and {MAX_EXCHANGE_TIMEOUT_SECONDS}"),
            });
        }
        if token.refresh_before_expiry_seconds > MAX_REFRESH_BEFORE_EXPIRY_SECONDS {
            return Err(ConfigError::Invalid {
                field: "token.refresh_before_expiry_seconds".into(),
                reason: format!("must be at most {MAX_REFRESH_BEFORE_EXPIRY_SECONDS}"),
            });
        }
        if self.health.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "health.timeout_seconds".into(),
                reason: "must be at least 1".into(),
            });
        }

        parse_http_url("graph.base_url", &self.graph.base_url)?;
        if self.graph.resource.is_empty() {
            return Err(ConfigError::Invalid {
                field: "graph.resource".into(),
                reason: "must not be empty".into(),
            });
        }

        for (name, url) in &self.health.urls {
            parse_http_url(&format!("health.urls.{name}"), url)?;
        }

        Ok(())
    }

    /// Get the token endpoint used for the on-behalf-of exchange.
    pub fn token_url(&self) -> String {
        token_url(&self.azure_ad.authority, self.azure_ad.endpoint_version)
    }

    /// Get the JWKS endpoint used to validate inbound tokens.
    pub fn jwks_uri(&self) -> String {
        if let Some(uri) = &self.azure_ad.jwks_uri {
            return uri.clone();
        }
        match self.azure_ad.endpoint_version {
            EndpointVersion::V1 => format!("{}/discovery/keys", self.azure_ad.authority),
            EndpointVersion::V2 => format!("{}/discovery/v2.0/keys", self.azure_ad.authority),
        }
    }

    /// Expected `iss` of inbound tokens.
    ///
    /// v1 tokens are issued by `https://sts.windows.net/<tenant>/`, v2 tokens by
    /// `<authority>/v2.0`. Multi-tenant authorities need an explicit issuer.
    pub fn issuer(&self) -> Result<String, ConfigError> {
        if let Some(issuer) = self.azure_ad.issuer.as_deref().filter(|i| !i.is_empty()) {
            return Ok(issuer.to_string());
        }

        let authority = parse_http_url("azure_ad.authority", &self.azure_ad.authority)?;
        let tenant = authority
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
            .filter(|t| !MULTI_TENANT_AUTHORITIES.contains(&t.to_ascii_lowercase().as_str()))
            .ok_or_else(|| ConfigError::Invalid {
                field: "azure_ad.issuer".into(),
                reason: "cannot be derived from a multi-tenant authority; set it explicitly"
                    .into(),
            })?;

        Ok(match self.azure_ad.endpoint_version {
            EndpointVersion::V1 => format!("https://sts.windows.net/{tenant}/"),
            EndpointVersion::V2 => format!("{}/v2.0", self.azure_ad.authority.trim_end_matches('/')),
        })
    }

    /// Audiences accepted on inbound tokens.
    pub fn audiences(&self) -> Vec<String> {
        if !self.azure_ad.audiences.is_empty() {
            return self.azure_ad.audiences.clone();
        }
        vec![
            self.azure_ad.client_id.clone(),
            format!("api://{}", self.azure_ad.client_id),
        ]
    }
}

/// Token endpoint for an authority and endpoint version.
pub fn token_url(authority: &str, version: EndpointVersion) -> String {
    let authority = authority.trim_end_matches('/');
    match version {
        EndpointVersion::V1 => format!("{authority}/oauth2/token"),
        EndpointVersion::V2 => format!("{authority}/oauth2/v2.0/token"),
    }
}

fn is_unset(value: &str) -> bool {
    value.trim().is_empty() || value.starts_with("YOUR_")
}

pub(crate) fn parse_http_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
        field: field.to_string(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    Ok(url)
}
